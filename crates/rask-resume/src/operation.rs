// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! One request/response exchange on a connection.
//!
//! Both halves are driven by the connection one non-blocking step at a
//! time. A step that hits `WouldBlock` returns `Progress::Pending` and
//! keeps enough state to continue exactly where it stopped the next time
//! the socket is ready.

use std::fmt;
use std::io::{self, Read, Write};

use crate::config::DEFAULT_READ_CHUNK;
use crate::cont::Erased;
use crate::error::StepError;
use crate::id::RequestId;

/// Outcome of one successful step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Pending,
    Done,
}

/// Outbound half of an exchange, implemented by protocol backends.
pub trait Request {
    /// Perform one non-blocking write attempt.
    fn send_step(&mut self, out: &mut dyn Write) -> Result<Progress, StepError>;
}

/// Inbound half of an exchange, implemented by protocol backends.
pub trait Response {
    /// Perform one non-blocking read attempt.
    fn receive_step(&mut self, input: &mut dyn Read) -> Result<Progress, StepError>;

    /// Hand over the typed payload. Called once, after `receive_step`
    /// returned `Done`.
    fn take_payload(&mut self) -> Erased;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Sending,
    Receiving,
    Finished,
}

/// A request paired with the response it produces, bound to a request id.
pub struct Operation {
    id: RequestId,
    request: Box<dyn Request>,
    response: Box<dyn Response>,
    phase: Phase,
}

impl Operation {
    pub(crate) fn new(
        id: RequestId,
        request: Box<dyn Request>,
        response: Box<dyn Response>,
    ) -> Self {
        Self {
            id,
            request,
            response,
            phase: Phase::Sending,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub(crate) fn send_step(&mut self, out: &mut dyn Write) -> Result<Progress, StepError> {
        debug_assert_eq!(self.phase, Phase::Sending);
        let progress = self.request.send_step(out)?;
        if progress == Progress::Done {
            self.phase = Phase::Receiving;
        }
        Ok(progress)
    }

    pub(crate) fn receive_step(&mut self, input: &mut dyn Read) -> Result<Progress, StepError> {
        debug_assert_eq!(self.phase, Phase::Receiving);
        let progress = self.response.receive_step(input)?;
        if progress == Progress::Done {
            self.phase = Phase::Finished;
        }
        Ok(progress)
    }

    pub(crate) fn into_payload(mut self) -> Erased {
        debug_assert_eq!(self.phase, Phase::Finished);
        self.response.take_payload()
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .finish()
    }
}

/// Read once into `buf`. `None` means the socket has nothing for us yet.
fn read_some(input: &mut dyn Read, buf: &mut [u8]) -> Result<Option<usize>, StepError> {
    debug_assert!(!buf.is_empty());
    loop {
        match input.read(buf) {
            Ok(0) => return Err(StepError::Eof),
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Read until `buf` holds `want` bytes, growing it `chunk` bytes at a time.
fn read_exact_step(
    input: &mut dyn Read,
    buf: &mut Vec<u8>,
    want: usize,
    chunk: usize,
) -> Result<Progress, StepError> {
    while buf.len() < want {
        let start = buf.len();
        let room = (want - start).min(chunk);
        buf.resize(start + room, 0);
        match read_some(input, &mut buf[start..]) {
            Ok(Some(n)) => buf.truncate(start + n),
            Ok(None) => {
                buf.truncate(start);
                return Ok(Progress::Pending);
            }
            Err(e) => {
                buf.truncate(start);
                return Err(e);
            }
        }
    }
    Ok(Progress::Done)
}

/// Writes a byte buffer, resuming at the saved offset after a partial
/// write.
#[derive(Debug, Clone)]
pub struct BytesRequest {
    buf: Vec<u8>,
    written: usize,
}

impl BytesRequest {
    pub fn new(buf: impl Into<Vec<u8>>) -> Self {
        Self {
            buf: buf.into(),
            written: 0,
        }
    }

    /// Bytes already handed to the socket.
    pub fn written(&self) -> usize {
        self.written
    }
}

impl Request for BytesRequest {
    fn send_step(&mut self, out: &mut dyn Write) -> Result<Progress, StepError> {
        while self.written < self.buf.len() {
            match out.write(&self.buf[self.written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => self.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Progress::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Progress::Done)
    }
}

/// Longest line a `LineResponse` accepts before declaring the stream broken.
pub const MAX_LINE: usize = 64 * 1024;

/// Reads one `\n`-terminated line. Payload: `String` without the
/// terminator (a trailing `\r` is stripped too).
#[derive(Debug)]
pub struct LineResponse {
    buf: Vec<u8>,
    line: Option<String>,
    chunk: usize,
}

impl LineResponse {
    pub fn new() -> Self {
        Self::with_chunk(DEFAULT_READ_CHUNK)
    }

    pub fn with_chunk(chunk: usize) -> Self {
        Self {
            buf: Vec::new(),
            line: None,
            chunk: chunk.max(1),
        }
    }
}

impl Default for LineResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl Response for LineResponse {
    fn receive_step(&mut self, input: &mut dyn Read) -> Result<Progress, StepError> {
        loop {
            let start = self.buf.len();
            self.buf.resize(start + self.chunk, 0);
            let n = match read_some(input, &mut self.buf[start..]) {
                Ok(Some(n)) => n,
                Ok(None) => {
                    self.buf.truncate(start);
                    return Ok(Progress::Pending);
                }
                Err(e) => {
                    self.buf.truncate(start);
                    return Err(e);
                }
            };
            self.buf.truncate(start + n);

            if let Some(pos) = self.buf[start..].iter().position(|&b| b == b'\n') {
                let end = start + pos;
                if end + 1 != self.buf.len() {
                    return Err(StepError::Broken(
                        "unexpected bytes after response line".into(),
                    ));
                }
                self.buf.truncate(end);
                if self.buf.last() == Some(&b'\r') {
                    self.buf.pop();
                }
                let bytes = std::mem::take(&mut self.buf);
                return match String::from_utf8(bytes) {
                    Ok(line) => {
                        self.line = Some(line);
                        Ok(Progress::Done)
                    }
                    Err(_) => Err(StepError::Protocol("response line is not valid UTF-8".into())),
                };
            }

            if self.buf.len() > MAX_LINE {
                return Err(StepError::Broken(format!(
                    "response line exceeds {MAX_LINE} bytes"
                )));
            }
        }
    }

    fn take_payload(&mut self) -> Erased {
        Erased::new(self.line.take().unwrap_or_default())
    }
}

/// Reads exactly `len` bytes. Payload: `Vec<u8>`.
#[derive(Debug)]
pub struct ExactResponse {
    want: usize,
    buf: Vec<u8>,
    chunk: usize,
}

impl ExactResponse {
    pub fn new(len: usize) -> Self {
        Self {
            want: len,
            buf: Vec::with_capacity(len.min(DEFAULT_READ_CHUNK)),
            chunk: DEFAULT_READ_CHUNK,
        }
    }

    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }
}

impl Response for ExactResponse {
    fn receive_step(&mut self, input: &mut dyn Read) -> Result<Progress, StepError> {
        read_exact_step(input, &mut self.buf, self.want, self.chunk)
    }

    fn take_payload(&mut self) -> Erased {
        Erased::new(std::mem::take(&mut self.buf))
    }
}

/// Largest body a `FrameResponse` accepts.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Reads a 4-byte big-endian length, then that many bytes. Payload:
/// `Vec<u8>` (the body only).
#[derive(Debug)]
pub struct FrameResponse {
    header: Vec<u8>,
    body: Vec<u8>,
    len: Option<usize>,
    chunk: usize,
}

impl FrameResponse {
    pub fn new() -> Self {
        Self {
            header: Vec::with_capacity(4),
            body: Vec::new(),
            len: None,
            chunk: DEFAULT_READ_CHUNK,
        }
    }

    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }
}

impl Default for FrameResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl Response for FrameResponse {
    fn receive_step(&mut self, input: &mut dyn Read) -> Result<Progress, StepError> {
        let len = match self.len {
            Some(len) => len,
            None => {
                if read_exact_step(input, &mut self.header, 4, 4)? == Progress::Pending {
                    return Ok(Progress::Pending);
                }
                let raw = [self.header[0], self.header[1], self.header[2], self.header[3]];
                let len = u32::from_be_bytes(raw) as usize;
                if len > MAX_FRAME {
                    return Err(StepError::Broken(format!(
                        "frame of {len} bytes exceeds the {MAX_FRAME} byte limit"
                    )));
                }
                self.len = Some(len);
                len
            }
        };
        read_exact_step(input, &mut self.body, len, self.chunk)
    }

    fn take_payload(&mut self) -> Erased {
        Erased::new(std::mem::take(&mut self.body))
    }
}

/// Frame `body` with the 4-byte big-endian length prefix `FrameResponse`
/// expects. Bodies over `MAX_FRAME` are refused, since no peer reading
/// with `FrameResponse` would accept them.
pub fn frame(body: &[u8]) -> Result<Vec<u8>, StepError> {
    let len = match u32::try_from(body.len()) {
        Ok(len) if body.len() <= MAX_FRAME => len,
        _ => {
            return Err(StepError::Broken(format!(
                "frame of {} bytes exceeds the {MAX_FRAME} byte limit",
                body.len()
            )))
        }
    };
    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Reader handing out one scripted chunk per call.
    struct Chunks(VecDeque<io::Result<Vec<u8>>>);

    impl Chunks {
        fn new(items: Vec<io::Result<Vec<u8>>>) -> Self {
            Self(items.into())
        }
    }

    impl Read for Chunks {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                None => Err(io::ErrorKind::WouldBlock.into()),
                Some(Err(e)) => Err(e),
                Some(Ok(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.0.push_front(Ok(data.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }
    }

    /// Writer accepting at most `limit` bytes per call, then blocking.
    struct Throttled {
        limit: usize,
        calls: usize,
        blocked_every: usize,
        out: Vec<u8>,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            if self.calls % self.blocked_every == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.limit);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn bytes_request_resumes_after_partial_write() {
        let mut out = Throttled {
            limit: 3,
            calls: 0,
            blocked_every: 2,
            out: Vec::new(),
        };
        let mut req = BytesRequest::new("SELECT 1\n");
        let mut steps = 0;
        while req.send_step(&mut out).unwrap() == Progress::Pending {
            steps += 1;
            assert!(steps < 10);
        }
        assert_eq!(out.out, b"SELECT 1\n");
        assert_eq!(req.written(), 9);
        assert!(steps > 0);
    }

    #[test]
    fn line_response_across_steps() {
        let mut input = Chunks::new(vec![Ok(b"hel".to_vec())]);
        let mut resp = LineResponse::with_chunk(2);
        assert_eq!(resp.receive_step(&mut input).unwrap(), Progress::Pending);

        let mut input = Chunks::new(vec![Ok(b"lo\r\n".to_vec())]);
        assert_eq!(resp.receive_step(&mut input).unwrap(), Progress::Done);
        assert_eq!(resp.take_payload().downcast::<String>().unwrap(), "hello");
    }

    #[test]
    fn line_response_eof_is_error() {
        let mut input = Chunks::new(vec![Ok(b"par".to_vec()), Ok(Vec::new())]);
        let mut resp = LineResponse::new();
        assert!(matches!(resp.receive_step(&mut input), Err(StepError::Eof)));
    }

    #[test]
    fn line_response_rejects_trailing_bytes() {
        let mut input = Chunks::new(vec![Ok(b"a\nb".to_vec())]);
        let mut resp = LineResponse::new();
        assert!(matches!(resp.receive_step(&mut input), Err(StepError::Broken(_))));
    }

    #[test]
    fn line_response_invalid_utf8_is_protocol_error() {
        let mut input = Chunks::new(vec![Ok(vec![0xff, 0xfe, b'\n'])]);
        let mut resp = LineResponse::new();
        assert!(matches!(resp.receive_step(&mut input), Err(StepError::Protocol(_))));
    }

    #[test]
    fn exact_response_collects_chunks() {
        let mut input = Chunks::new(vec![Ok(vec![1, 2]), Ok(vec![3, 4, 5])]);
        let mut resp = ExactResponse::new(5).with_chunk(2);
        assert_eq!(resp.receive_step(&mut input).unwrap(), Progress::Done);
        assert_eq!(
            resp.take_payload().downcast::<Vec<u8>>().unwrap(),
            vec![1, 2, 3, 4, 5]
        );
    }

    #[test]
    fn exact_response_of_zero_is_done() {
        let mut input = Chunks::new(Vec::new());
        let mut resp = ExactResponse::new(0);
        assert_eq!(resp.receive_step(&mut input).unwrap(), Progress::Done);
    }

    #[test]
    fn frame_response_header_split_across_steps() {
        let wire = frame(b"payload").unwrap();
        let mut resp = FrameResponse::new();

        let mut input = Chunks::new(vec![Ok(wire[..2].to_vec())]);
        assert_eq!(resp.receive_step(&mut input).unwrap(), Progress::Pending);

        let mut input = Chunks::new(vec![Ok(wire[2..6].to_vec())]);
        assert_eq!(resp.receive_step(&mut input).unwrap(), Progress::Pending);

        let mut input = Chunks::new(vec![Ok(wire[6..].to_vec())]);
        assert_eq!(resp.receive_step(&mut input).unwrap(), Progress::Done);
        assert_eq!(
            resp.take_payload().downcast::<Vec<u8>>().unwrap(),
            b"payload".to_vec()
        );
    }

    #[test]
    fn frame_response_rejects_oversized_frame() {
        let header = ((MAX_FRAME + 1) as u32).to_be_bytes().to_vec();
        let mut input = Chunks::new(vec![Ok(header)]);
        let mut resp = FrameResponse::new();
        assert!(matches!(resp.receive_step(&mut input), Err(StepError::Broken(_))));
    }

    #[test]
    fn frame_refuses_oversized_body() {
        assert_eq!(frame(&[]).unwrap(), vec![0, 0, 0, 0]);
        let at_limit = frame(&vec![7u8; MAX_FRAME]).unwrap();
        assert_eq!(&at_limit[..4], &(MAX_FRAME as u32).to_be_bytes());
        assert!(matches!(frame(&vec![7u8; MAX_FRAME + 1]), Err(StepError::Broken(_))));
    }

    #[test]
    fn io_error_propagates() {
        let mut input = Chunks::new(vec![Err(io::ErrorKind::ConnectionReset.into())]);
        let mut resp = ExactResponse::new(3);
        match resp.receive_step(&mut input) {
            Err(StepError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("expected io error, got {other:?}"),
        }
    }
}
