//! Wire framing for the host/guest IPC channel.
//!
//! Every frame begins with a one-byte opcode. Values are encoded with a tag
//! byte followed by a type-specific payload; strings and arrays carry a
//! 4-byte native-endian length prefix bounded by `warden_value::MAX_STRING_LEN`
//! / `MAX_ARRAY_LEN`. A single recursion/fan-out counter is threaded through
//! one call to `decode_value*` so a maliciously large nested array can't
//! allocate proportional memory before the guard trips (a crafted array
//! header claiming billions of elements fails immediately, not after
//! exhausting memory).

use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use thiserror::Error;
use warden_value::{MAX_ARRAY_LEN, MAX_STRING_LEN, Value};

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("read timed out after {0:?}")]
    Timeout(Duration),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("string length {0} out of bounds (must be < {MAX_STRING_LEN})")]
    StringTooLong(u32),
    #[error("array length {0} out of bounds (must be < {MAX_ARRAY_LEN})")]
    ArrayTooLong(u32),
    #[error("decode exceeded the {MAX_ARRAY_LEN}-element fan-out guard")]
    FanOutExceeded,
    #[error("string payload was not valid utf-8")]
    InvalidUtf8,
    #[error("Value::Function cannot be serialized over the wire")]
    FunctionNotSerializable,
}

/// Host→guest command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    DefineConstant = 1,
    DefineFunction = 2,
    CompileScript = 3,
    /// Unlike every other command, `IsFunction`'s response is a bare boolean
    /// byte with no `RespReturn` wrapper — it never drives the guest, so no
    /// callback pump is needed. Kept asymmetric on purpose; `warden-proxy`
    /// and `warden-guest` both hardcode this.
    IsFunction = 4,
    CallFunction = 5,
    /// Guest→host: the guest is invoking a host-defined function mid-call.
    RespCallback = 10,
    /// Guest→host: the command's real result follows this frame.
    RespReturn = 11,
}

impl TryFrom<u8> for Opcode {
    type Error = ProtoError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        Ok(match b {
            1 => Opcode::DefineConstant,
            2 => Opcode::DefineFunction,
            3 => Opcode::CompileScript,
            4 => Opcode::IsFunction,
            5 => Opcode::CallFunction,
            10 => Opcode::RespCallback,
            11 => Opcode::RespReturn,
            other => return Err(ProtoError::UnknownOpcode(other)),
        })
    }
}

const TAG_VOID: u8 = 0;
const TAG_INT32: u8 = 1;
const TAG_FLOAT32: u8 = 2;
const TAG_BOOL: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_ARRAY: u8 = 5;

// ── Timed reads ──────────────────────────────────────────────────────────────

/// Abstraction over "read exactly N bytes, but give up after a deadline."
/// The parent-side proxy uses a real deadline; the child trusts its parent
/// and passes `None`, which never times out.
pub trait TimedRead {
    fn read_exact_timed(&mut self, buf: &mut [u8], deadline: Option<Instant>) -> Result<(), ProtoError>;
}

/// Wraps any blocking `Read` (a pipe fd, in this workspace) and polls in
/// small chunks so a deadline can be enforced without relying on socket-level
/// read timeouts, which anonymous pipes don't support portably.
pub struct TimedReader<R: Read> {
    inner: R,
}

impl<R: Read> TimedReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R: Read> TimedRead for TimedReader<R> {
    fn read_exact_timed(&mut self, buf: &mut [u8], deadline: Option<Instant>) -> Result<(), ProtoError> {
        // No deadline means no guest-side timeout either (the child trusts
        // its parent, §5) — an ordinary blocking read is correct here.
        // `FdTimedReader` below is what the parent actually uses whenever a
        // real deadline needs to interrupt a stalled read.
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(ProtoError::Timeout(Duration::ZERO));
            }
        }
        self.inner.read_exact(buf)?;
        Ok(())
    }
}

/// A timed reader over a raw, non-blocking pipe fd. This is what
/// `warden-proxy` actually reads through: a plain blocking `read()` cannot
/// be interrupted once issued, so a guest that is alive but silent (an
/// infinite compute loop making no syscalls is legal under strict seccomp,
/// which whitelists exactly `read`/`write`/`exit`/`sigreturn`) would hang
/// the parent forever regardless of the configured timeout. Putting the fd
/// in non-blocking mode and polling for readability with the remaining time
/// budget before each `read()` attempt makes the deadline actually bound the
/// wait, matching §4.3/§5's timeout guarantee.
pub struct FdTimedReader {
    fd: RawFd,
}

impl FdTimedReader {
    /// Wrap `fd`, switching it to non-blocking mode. Does not take
    /// ownership of `fd` — the caller closes it, same convention as
    /// `TimedReader`/`RawFdIo` elsewhere in this workspace.
    pub fn new(fd: RawFd) -> Self {
        // SAFETY: fd is a valid descriptor supplied by the caller for the
        // lifetime of this wrapper.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            if flags >= 0 {
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        Self { fd }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl TimedRead for FdTimedReader {
    fn read_exact_timed(&mut self, buf: &mut [u8], deadline: Option<Instant>) -> Result<(), ProtoError> {
        let mut filled = 0;
        while filled < buf.len() {
            let timeout_ms = match deadline {
                None => -1,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::trace!("timed read exceeded its deadline");
                        return Err(ProtoError::Timeout(Duration::ZERO));
                    }
                    (deadline - now).as_millis().min(i32::MAX as u128) as i32
                }
            };

            let mut pfd = libc::pollfd {
                fd: self.fd,
                events: libc::POLLIN,
                revents: 0,
            };
            // SAFETY: pfd is a valid single-element array for the duration
            // of this call.
            let ready = unsafe { libc::poll(&mut pfd as *mut libc::pollfd, 1, timeout_ms) };
            if ready == 0 {
                tracing::trace!(?deadline, "poll timed out waiting for the guest");
                return Err(ProtoError::Timeout(Duration::ZERO));
            }
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ProtoError::Io(err));
            }

            // SAFETY: `buf[filled..]` is a valid, writable slice of
            // `buf.len() - filled` bytes.
            let n = unsafe {
                libc::read(self.fd, buf[filled..].as_mut_ptr().cast(), buf.len() - filled)
            };
            if n > 0 {
                filled += n as usize;
            } else if n == 0 {
                return Err(ProtoError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "pipe closed",
                )));
            } else {
                let err = io::Error::last_os_error();
                if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) {
                    // poll said readable (or there's no deadline at all);
                    // either way, retry rather than treating this as fatal.
                    continue;
                }
                return Err(ProtoError::Io(err));
            }
        }
        Ok(())
    }
}

fn read_u8(r: &mut impl TimedRead, deadline: Option<Instant>) -> Result<u8, ProtoError> {
    let mut b = [0u8; 1];
    r.read_exact_timed(&mut b, deadline)?;
    Ok(b[0])
}

fn read_u32(r: &mut impl TimedRead, deadline: Option<Instant>) -> Result<u32, ProtoError> {
    let mut b = [0u8; 4];
    r.read_exact_timed(&mut b, deadline)?;
    Ok(u32::from_ne_bytes(b))
}

pub fn read_string(r: &mut impl TimedRead, deadline: Option<Instant>) -> Result<Vec<u8>, ProtoError> {
    let len = read_u32(r, deadline)?;
    if len as usize >= MAX_STRING_LEN {
        return Err(ProtoError::StringTooLong(len));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact_timed(&mut buf, deadline)?;
    Ok(buf)
}

pub fn read_string_utf8(r: &mut impl TimedRead, deadline: Option<Instant>) -> Result<String, ProtoError> {
    let bytes = read_string(r, deadline)?;
    String::from_utf8(bytes).map_err(|_| ProtoError::InvalidUtf8)
}

/// Decode one `Value`, threading `count` across nested array reads so the
/// total element count in this call stays under `MAX_ARRAY_LEN`.
fn decode_value_inner(r: &mut impl TimedRead, deadline: Option<Instant>, count: &mut u32) -> Result<Value, ProtoError> {
    let tag = read_u8(r, deadline)?;
    match tag {
        TAG_VOID => Ok(Value::Void),
        TAG_INT32 => {
            let mut b = [0u8; 4];
            r.read_exact_timed(&mut b, deadline)?;
            Ok(Value::Int32(i32::from_ne_bytes(b)))
        }
        TAG_FLOAT32 => {
            let mut b = [0u8; 4];
            r.read_exact_timed(&mut b, deadline)?;
            Ok(Value::Float32(f32::from_ne_bytes(b)))
        }
        TAG_BOOL => {
            let b = read_u8(r, deadline)?;
            Ok(Value::Bool(b != 0))
        }
        TAG_STRING => {
            let bytes = read_string(r, deadline)?;
            Ok(Value::String(bytes))
        }
        TAG_ARRAY => {
            let len = read_u32(r, deadline)?;
            if len as usize >= MAX_ARRAY_LEN {
                return Err(ProtoError::ArrayTooLong(len));
            }
            if len.saturating_add(*count) as usize >= MAX_ARRAY_LEN {
                return Err(ProtoError::FanOutExceeded);
            }
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                items.push(decode_value_inner(r, deadline, count)?);
            }
            *count += len;
            Ok(Value::Array(items))
        }
        other => Err(ProtoError::UnknownOpcode(other)),
    }
}

/// Decode a `Value` with a wall-clock deadline (parent side).
pub fn decode_value_timed(r: &mut impl TimedRead, timeout: Duration) -> Result<Value, ProtoError> {
    let deadline = Instant::now() + timeout;
    let mut count = 0u32;
    decode_value_inner(r, Some(deadline), &mut count)
}

/// Decode a `Value` with no deadline (child side, which trusts its parent
/// and blocks indefinitely).
pub fn decode_value_blocking(r: &mut impl TimedRead) -> Result<Value, ProtoError> {
    let mut count = 0u32;
    decode_value_inner(r, None, &mut count)
}

// ── Encoding ─────────────────────────────────────────────────────────────────

pub fn write_u8(w: &mut impl Write, b: u8) -> Result<(), ProtoError> {
    w.write_all(&[b])?;
    Ok(())
}

pub fn write_string(w: &mut impl Write, s: &[u8]) -> Result<(), ProtoError> {
    if s.len() >= MAX_STRING_LEN {
        return Err(ProtoError::StringTooLong(s.len() as u32));
    }
    w.write_all(&(s.len() as u32).to_ne_bytes())?;
    w.write_all(s)?;
    Ok(())
}

pub fn encode_value(w: &mut impl Write, v: &Value) -> Result<(), ProtoError> {
    match v {
        Value::Void => write_u8(w, TAG_VOID),
        Value::Int32(i) => {
            write_u8(w, TAG_INT32)?;
            w.write_all(&i.to_ne_bytes())?;
            Ok(())
        }
        Value::Float32(f) => {
            write_u8(w, TAG_FLOAT32)?;
            w.write_all(&f.to_ne_bytes())?;
            Ok(())
        }
        Value::Bool(b) => {
            write_u8(w, TAG_BOOL)?;
            w.write_all(&[*b as u8])?;
            Ok(())
        }
        Value::String(bytes) => {
            write_u8(w, TAG_STRING)?;
            write_string(w, bytes)
        }
        Value::Array(items) => {
            if items.len() >= MAX_ARRAY_LEN {
                return Err(ProtoError::ArrayTooLong(items.len() as u32));
            }
            write_u8(w, TAG_ARRAY)?;
            w.write_all(&(items.len() as u32).to_ne_bytes())?;
            for item in items {
                encode_value(w, item)?;
            }
            Ok(())
        }
        Value::Function(_) => Err(ProtoError::FunctionNotSerializable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(v: Value) -> Value {
        let mut buf = Vec::new();
        encode_value(&mut buf, &v).unwrap();
        let mut reader = TimedReader::new(Cursor::new(buf));
        decode_value_blocking(&mut reader).unwrap()
    }

    #[test]
    fn roundtrips_scalars() {
        assert_eq!(roundtrip(Value::Void), Value::Void);
        assert_eq!(roundtrip(Value::Int32(-7)), Value::Int32(-7));
        assert_eq!(roundtrip(Value::Float32(3.25)), Value::Float32(3.25));
        assert_eq!(roundtrip(Value::Bool(true)), Value::Bool(true));
        assert_eq!(
            roundtrip(Value::string("hello").unwrap()),
            Value::string("hello").unwrap()
        );
    }

    #[test]
    fn roundtrips_nested_arrays() {
        let nested = Value::Array(vec![
            Value::Int32(1),
            Value::Array(vec![Value::Bool(false), Value::string("x").unwrap()]),
        ]);
        let back = roundtrip(nested);
        match back {
            Value::Array(items) => assert_eq!(items.len(), 2),
            _ => panic!("expected array"),
        }
    }

    #[test]
    fn function_values_refuse_to_encode() {
        struct Noop;
        impl warden_value::GuestCallable for Noop {
            fn call(&mut self, _args: Value) -> Value {
                Value::Void
            }
        }
        let mut buf = Vec::new();
        let err = encode_value(&mut buf, &Value::Function(Box::new(Noop))).unwrap_err();
        assert!(matches!(err, ProtoError::FunctionNotSerializable));
    }

    #[test]
    fn string_length_guard_rejects_oversized_header() {
        let mut buf = Vec::new();
        write_u8(&mut buf, TAG_STRING).unwrap();
        buf.extend_from_slice(&(MAX_STRING_LEN as u32).to_ne_bytes());
        let mut reader = TimedReader::new(Cursor::new(buf));
        let err = decode_value_blocking(&mut reader).unwrap_err();
        assert!(matches!(err, ProtoError::StringTooLong(_)));
    }

    #[test]
    fn decode_bomb_array_header_fails_without_allocating() {
        let mut buf = Vec::new();
        write_u8(&mut buf, TAG_ARRAY).unwrap();
        buf.extend_from_slice(&2_000_000_000u32.to_ne_bytes());
        let mut reader = TimedReader::new(Cursor::new(buf));
        let err = decode_value_blocking(&mut reader).unwrap_err();
        assert!(matches!(err, ProtoError::ArrayTooLong(_)));
    }

    #[test]
    fn fan_out_guard_trips_across_nested_arrays() {
        // Each sub-array header claims just under the per-array limit, but
        // nested inside a few siblings the running total should still trip.
        let mut buf = Vec::new();
        write_u8(&mut buf, TAG_ARRAY).unwrap();
        buf.extend_from_slice(&2u32.to_ne_bytes());
        for _ in 0..2 {
            write_u8(&mut buf, TAG_ARRAY).unwrap();
            buf.extend_from_slice(&600u32.to_ne_bytes());
            for _ in 0..600 {
                write_u8(&mut buf, TAG_VOID).unwrap();
            }
        }
        let mut reader = TimedReader::new(Cursor::new(buf));
        let err = decode_value_blocking(&mut reader).unwrap_err();
        assert!(matches!(
            err,
            ProtoError::FanOutExceeded | ProtoError::ArrayTooLong(_)
        ));
    }

    #[test]
    fn opcode_round_trips_through_u8() {
        for op in [
            Opcode::DefineConstant,
            Opcode::DefineFunction,
            Opcode::CompileScript,
            Opcode::IsFunction,
            Opcode::CallFunction,
            Opcode::RespCallback,
            Opcode::RespReturn,
        ] {
            let byte = op as u8;
            assert_eq!(Opcode::try_from(byte).unwrap() as u8, byte);
        }
        assert!(Opcode::try_from(99).is_err());
    }

    fn make_pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn fd_timed_reader_times_out_on_a_silent_writer() {
        let (read_fd, write_fd) = make_pipe();
        let mut reader = FdTimedReader::new(read_fd);
        let start = Instant::now();
        let err = reader
            .read_exact_timed(&mut [0u8; 1], Some(Instant::now() + Duration::from_millis(100)))
            .unwrap_err();
        assert!(matches!(err, ProtoError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(2), "timeout should bound the wait, not hang");
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn fd_timed_reader_reads_data_written_after_a_delay() {
        let (read_fd, write_fd) = make_pipe();
        let mut reader = FdTimedReader::new(read_fd);
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            unsafe { libc::write(write_fd, [42u8].as_ptr().cast(), 1) };
            write_fd
        });
        let mut buf = [0u8; 1];
        reader
            .read_exact_timed(&mut buf, Some(Instant::now() + Duration::from_secs(2)))
            .unwrap();
        assert_eq!(buf[0], 42);
        let write_fd = writer.join().unwrap();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
