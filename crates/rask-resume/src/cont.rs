// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Continuation boxes.
//!
//! A task that suspends keeps one `ContinuationBox` per awaited
//! expression. The multiplexer's result (or a failure) is parked in the
//! box while the task is off the CPU; on resume the task loads it back
//! with the type the await site expects.
//!
//! Values are type-erased behind `Box<dyn Any>` and tagged with a
//! `TypeTag`. Tags come from `TypeId`, so they are unique per type and
//! stable for the life of the program without any registration step.
//!
//! Misuse (double save, loading the wrong type, loading an empty box)
//! means the task body and the box disagree about what was awaited. That
//! is a bug in the task, so it panics instead of returning an error.

use std::any::{self, Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use tracing::{debug, trace};

use crate::error::RtError;
use crate::id::RequestId;

/// Identity of a concrete result type.
#[derive(Clone, Copy)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: any::type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.id
    }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeTag {}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A tagged, type-erased value. Responses hand their payload over as one.
pub struct Erased {
    tag: TypeTag,
    value: Box<dyn Any>,
}

impl Erased {
    pub fn new<T: Any>(value: T) -> Self {
        Self {
            tag: TypeTag::of::<T>(),
            value: Box::new(value),
        }
    }

    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    pub fn is<T: Any>(&self) -> bool {
        self.tag.id == TypeId::of::<T>()
    }

    /// Take the value out as `T`, or give the erased value back.
    pub fn downcast<T: Any>(self) -> Result<T, Erased> {
        let tag = self.tag;
        match self.value.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(value) => Err(Erased { tag, value }),
        }
    }
}

impl fmt::Debug for Erased {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Erased").field("tag", &self.tag).finish()
    }
}

enum Slot {
    Empty,
    /// Nothing stored yet, but the owning task waits on this request.
    Awaiting(RequestId),
    Value(Erased),
    Failure(RtError),
}

/// Single-slot carrier for one awaited result across a suspension point.
pub struct ContinuationBox {
    slot: Slot,
}

impl ContinuationBox {
    pub const fn new() -> Self {
        Self { slot: Slot::Empty }
    }

    /// True when no value, failure, or pending await is held.
    pub fn is_empty(&self) -> bool {
        matches!(self.slot, Slot::Empty)
    }

    pub fn has_value(&self) -> bool {
        matches!(self.slot, Slot::Value(_))
    }

    pub fn has_failure(&self) -> bool {
        matches!(self.slot, Slot::Failure(_))
    }

    /// The request this box is waiting on, if armed and not yet filled.
    pub fn awaited(&self) -> Option<RequestId> {
        match self.slot {
            Slot::Awaiting(id) => Some(id),
            _ => None,
        }
    }

    /// Tag of the stored value, if any.
    pub fn tag(&self) -> Option<TypeTag> {
        match &self.slot {
            Slot::Value(erased) => Some(erased.tag),
            _ => None,
        }
    }

    /// Mark the box as the destination of `request`.
    ///
    /// Panics if the box still holds something: awaiting twice on the
    /// same box without loading it first would lose a result.
    pub(crate) fn arm(&mut self, request: RequestId) {
        match &self.slot {
            Slot::Empty => self.slot = Slot::Awaiting(request),
            Slot::Awaiting(prev) => panic!(
                "continuation box already awaits {prev}; cannot await {request} on it"
            ),
            Slot::Value(erased) => panic!(
                "continuation box still holds an unloaded `{}`; cannot await {request} on it",
                erased.tag.name
            ),
            Slot::Failure(err) => panic!(
                "continuation box still holds an unloaded failure ({err}); \
                 cannot await {request} on it"
            ),
        }
    }

    /// Store `value`.
    ///
    /// If the box already holds a failure the failure is kept and `value`
    /// is dropped: a task that both failed and produced a value always
    /// surfaces the failure. Saving over an unloaded value panics.
    pub fn save<T: Any>(&mut self, value: T) {
        self.save_erased(Erased::new(value));
    }

    /// Store an already-erased value. Same rules as [`save`](Self::save).
    pub fn save_erased(&mut self, value: Erased) {
        match &self.slot {
            Slot::Empty | Slot::Awaiting(_) => {
                trace!(ty = value.tag.name, "continuation saved");
                self.slot = Slot::Value(value);
            }
            Slot::Failure(err) => {
                debug!(ty = value.tag.name, %err, "value dropped, box already holds a failure");
            }
            Slot::Value(prev) => panic!(
                "double save into continuation box: holds unloaded `{}`, tried to save `{}`",
                prev.tag.name, value.tag.name
            ),
        }
    }

    /// Store a deferred failure. Replaces any stored value; an earlier
    /// failure wins over a later one.
    pub fn save_failure(&mut self, err: RtError) {
        match &self.slot {
            Slot::Failure(first) => {
                debug!(%first, dropped = %err, "box already holds a failure");
            }
            Slot::Value(prev) => {
                debug!(ty = prev.tag.name, %err, "failure replaces stored value");
                self.slot = Slot::Failure(err);
            }
            Slot::Empty | Slot::Awaiting(_) => {
                trace!(%err, "continuation failure saved");
                self.slot = Slot::Failure(err);
            }
        }
    }

    /// Move the stored value out as `T` and clear the box.
    ///
    /// A stored failure is returned as `Err` (and cleared). Loading an
    /// empty box or a value of another type panics.
    pub fn load<T: Any>(&mut self) -> Result<T, RtError> {
        match std::mem::replace(&mut self.slot, Slot::Empty) {
            Slot::Failure(err) => Err(err),
            Slot::Value(erased) => {
                let stored = erased.tag;
                match erased.downcast::<T>() {
                    Ok(value) => Ok(value),
                    Err(_) => panic!(
                        "continuation type mismatch: box holds `{}`, load expected `{}`",
                        stored.name,
                        any::type_name::<T>()
                    ),
                }
            }
            Slot::Awaiting(request) => panic!(
                "load from continuation box before {request} delivered its result"
            ),
            Slot::Empty => panic!(
                "load of `{}` from an empty continuation box",
                any::type_name::<T>()
            ),
        }
    }

    /// Load into a wider type `W` through `registry`.
    ///
    /// Used when the await site only knows the dynamic holder type. A value
    /// already of type `W` is returned as is; anything else goes through
    /// the converter registered for its tag. A missing converter panics.
    pub fn load_as<W: Any>(&mut self, registry: &ConverterRegistry<W>) -> Result<W, RtError> {
        match std::mem::replace(&mut self.slot, Slot::Empty) {
            Slot::Failure(err) => Err(err),
            Slot::Value(erased) => {
                let erased = match erased.downcast::<W>() {
                    Ok(value) => return Ok(value),
                    Err(erased) => erased,
                };
                match registry.convert(erased) {
                    Ok(value) => Ok(value),
                    Err(erased) => panic!(
                        "no converter from `{}` to `{}`",
                        erased.tag.name,
                        any::type_name::<W>()
                    ),
                }
            }
            Slot::Awaiting(request) => panic!(
                "load from continuation box before {request} delivered its result"
            ),
            Slot::Empty => panic!(
                "load of `{}` from an empty continuation box",
                any::type_name::<W>()
            ),
        }
    }

    /// Drop whatever the box holds. Used when the owning task is torn
    /// down. Returns true if a value or failure was discarded.
    pub fn clear(&mut self) -> bool {
        !matches!(
            std::mem::replace(&mut self.slot, Slot::Empty),
            Slot::Empty | Slot::Awaiting(_)
        )
    }
}

impl Default for ContinuationBox {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ContinuationBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.slot {
            Slot::Empty => f.write_str("ContinuationBox(empty)"),
            Slot::Awaiting(id) => write!(f, "ContinuationBox(awaiting {id})"),
            Slot::Value(erased) => write!(f, "ContinuationBox({:?})", erased.tag),
            Slot::Failure(err) => write!(f, "ContinuationBox(failure: {err})"),
        }
    }
}

type Converter<W> = Box<dyn Fn(Erased) -> W>;

/// Per-type conversions into a wider result type `W`, keyed by tag.
pub struct ConverterRegistry<W> {
    converters: HashMap<TypeId, Converter<W>>,
}

impl<W: Any> ConverterRegistry<W> {
    pub fn new() -> Self {
        Self {
            converters: HashMap::new(),
        }
    }

    /// Register the conversion used for values of type `T`.
    pub fn register<T, F>(&mut self, convert: F) -> &mut Self
    where
        T: Any,
        F: Fn(T) -> W + 'static,
    {
        self.converters.insert(
            TypeId::of::<T>(),
            Box::new(move |erased: Erased| match erased.downcast::<T>() {
                Ok(value) => convert(value),
                Err(_) => unreachable!("converter table is keyed by TypeId"),
            }),
        );
        self
    }

    /// Register `T` through its `Into<W>` impl.
    pub fn register_into<T>(&mut self) -> &mut Self
    where
        T: Any + Into<W>,
    {
        self.register::<T, _>(Into::into)
    }

    pub fn contains(&self, tag: TypeTag) -> bool {
        self.converters.contains_key(&tag.id)
    }

    /// Convert `erased`, or return it untouched if no converter exists.
    pub fn convert(&self, erased: Erased) -> Result<W, Erased> {
        match self.converters.get(&erased.tag.id) {
            Some(convert) => Ok(convert(erased)),
            None => Err(erased),
        }
    }
}

impl<W: Any> Default for ConverterRegistry<W> {
    fn default() -> Self {
        Self::new()
    }
}

/// Dynamic result holder for await sites typed as "any result".
#[derive(Debug, Clone, PartialEq)]
pub enum Mixed {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Mixed>),
}

impl From<()> for Mixed {
    fn from(_: ()) -> Self {
        Mixed::Null
    }
}

impl From<bool> for Mixed {
    fn from(v: bool) -> Self {
        Mixed::Bool(v)
    }
}

impl From<i64> for Mixed {
    fn from(v: i64) -> Self {
        Mixed::Int(v)
    }
}

impl From<f64> for Mixed {
    fn from(v: f64) -> Self {
        Mixed::Float(v)
    }
}

impl From<String> for Mixed {
    fn from(v: String) -> Self {
        Mixed::Str(v)
    }
}

impl From<Vec<u8>> for Mixed {
    fn from(v: Vec<u8>) -> Self {
        Mixed::Bytes(v)
    }
}

impl From<Vec<String>> for Mixed {
    fn from(v: Vec<String>) -> Self {
        Mixed::List(v.into_iter().map(Mixed::Str).collect())
    }
}

impl ConverterRegistry<Mixed> {
    /// Registry covering every payload the stock responses produce.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register_into::<()>()
            .register_into::<bool>()
            .register_into::<i64>()
            .register_into::<f64>()
            .register_into::<String>()
            .register_into::<Vec<u8>>()
            .register_into::<Vec<String>>();
        registry
    }
}
