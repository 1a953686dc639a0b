// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Opaque identifiers handed out by the event loop and multiplexer.

use std::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Identifies a suspendable task. Assigned by the event loop.
    TaskId,
    "task"
);
define_id!(
    /// Identifies a connection registered with the multiplexer.
    ConnectionId,
    "conn"
);
define_id!(
    /// Identifies one request/response exchange (or connect exchange).
    RequestId,
    "req"
);

/// Monotonic id source. Ids are never reused within one allocator.
#[derive(Debug)]
pub(crate) struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_raw(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_with_prefix() {
        assert_eq!(TaskId::new(3).to_string(), "task#3");
        assert_eq!(ConnectionId::new(7).to_string(), "conn#7");
        assert_eq!(RequestId::new(11).to_string(), "req#11");
    }

    #[test]
    fn allocator_is_monotonic() {
        let mut ids = IdAllocator::new();
        let a = ids.next_raw();
        let b = ids.next_raw();
        assert!(b > a);
        assert_ne!(a, 0);
    }
}
