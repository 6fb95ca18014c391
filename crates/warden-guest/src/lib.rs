//! The guest-side read-dispatch loop. Runs inside the sandboxed child:
//! reads one opcode at a time, forever, dispatching to the in-child
//! backend. Any IPC failure exits the process — the child never reports an
//! error back to a desynchronized parent, it simply stops.

use std::io::{self, Read, Write};
use std::os::fd::RawFd;

use tracing::{debug, trace};
use warden_backend::Backend;
use warden_proto::{Opcode, ProtoError, TimedReader, decode_value_blocking, read_string, write_string, write_u8};
use warden_value::Value;

/// Minimal `Read`/`Write` over a raw fd using direct `libc::read`/`write`.
/// The child never uses buffered I/O here: every frame boundary matters and
/// `std::fs::File`'s buffering would blur "one opcode, one read" framing.
struct RawFdIo(RawFd);

impl Read for RawFdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is a valid, appropriately-sized buffer for the
        // duration of this call.
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Write for RawFdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: buf is a valid, appropriately-sized buffer for the
        // duration of this call.
        let n = unsafe { libc::write(self.0, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn read_u8_blocking(r: &mut TimedReader<RawFdIo>) -> Result<u8, ProtoError> {
    use warden_proto::TimedRead;
    let mut b = [0u8; 1];
    r.read_exact_timed(&mut b, None)?;
    Ok(b[0])
}

/// Build the `HostCallback` synthesized for a name the parent declared via
/// `DEFINE_FUNCTION`. Invoking it sends `RESP_CALLBACK` + name + args up
/// the wire and blocks for the reply.
fn make_callback(name: String, fd_r: RawFd, fd_w: RawFd) -> warden_backend::HostCallback {
    Box::new(move |args: Value| -> Value {
        let mut w = RawFdIo(fd_w);
        if write_u8(&mut w, Opcode::RespCallback as u8).is_err() {
            return Value::Void;
        }
        if write_string(&mut w, name.as_bytes()).is_err() {
            return Value::Void;
        }
        if warden_proto::encode_value(&mut w, &args).is_err() {
            return Value::Void;
        }
        let mut r = TimedReader::new(RawFdIo(fd_r));
        decode_value_blocking(&mut r).unwrap_or(Value::Void)
    })
}

/// Run the child's read-dispatch loop forever. Never returns: exits the
/// process on any decode/IO failure rather than reporting it upstream.
pub fn run_guest_loop(mut backend: impl Backend, fd_r: RawFd, fd_w: RawFd) -> ! {
    let mut reader = TimedReader::new(RawFdIo(fd_r));

    loop {
        let opcode_byte = match read_u8_blocking(&mut reader) {
            Ok(b) => b,
            Err(_) => std::process::exit(1),
        };
        let opcode = match Opcode::try_from(opcode_byte) {
            Ok(op) => op,
            Err(_) => std::process::exit(1),
        };

        trace!(?opcode, "guest dispatch");

        let result: Result<(), ProtoError> = (|| {
            match opcode {
                Opcode::DefineConstant => {
                    let name = read_string(&mut reader, None)?;
                    let name = String::from_utf8(name).map_err(|_| ProtoError::InvalidUtf8)?;
                    let value = decode_value_blocking(&mut reader)?;
                    debug!(%name, "define_constant");
                    backend.define_constant(&name, value);
                    Ok(())
                }
                Opcode::DefineFunction => {
                    let name = read_string(&mut reader, None)?;
                    let name = String::from_utf8(name).map_err(|_| ProtoError::InvalidUtf8)?;
                    debug!(%name, "define_function");
                    let callback = make_callback(name.clone(), fd_r, fd_w);
                    if backend.define_function(&name, callback).is_err() {
                        backend.report_error(format!("function {name} already defined"));
                    }
                    Ok(())
                }
                Opcode::CompileScript => {
                    let script = read_string(&mut reader, None)?;
                    debug!("compile_script");
                    let ok = backend.compile_script(&script).unwrap_or(false);
                    let mut w = RawFdIo(fd_w);
                    write_u8(&mut w, Opcode::RespReturn as u8)?;
                    write_u8(&mut w, ok as u8)?;
                    Ok(())
                }
                Opcode::IsFunction => {
                    let name = read_string(&mut reader, None)?;
                    let name = String::from_utf8(name).map_err(|_| ProtoError::InvalidUtf8)?;
                    let is_fn = backend.is_function(&name);
                    debug!(%name, is_fn, "is_function");
                    let mut w = RawFdIo(fd_w);
                    // No RESP_RETURN wrapper — is_function never drives the
                    // guest, so the parent never enters the callback pump
                    // for this command.
                    write_u8(&mut w, is_fn as u8)?;
                    Ok(())
                }
                Opcode::CallFunction => {
                    let name = read_string(&mut reader, None)?;
                    let name = String::from_utf8(name).map_err(|_| ProtoError::InvalidUtf8)?;
                    let args = decode_value_blocking(&mut reader)?;
                    debug!(%name, "call_function");
                    let ret = match backend.call_function(&name, args) {
                        Ok(v) => v,
                        Err(e) => {
                            backend.report_error(e.to_string());
                            Value::Void
                        }
                    };
                    let mut w = RawFdIo(fd_w);
                    write_u8(&mut w, Opcode::RespReturn as u8)?;
                    warden_proto::encode_value(&mut w, &ret)?;
                    Ok(())
                }
                Opcode::RespCallback | Opcode::RespReturn => {
                    // These only ever flow guest->host; seeing one here
                    // means the channel is desynchronized.
                    Err(ProtoError::UnknownOpcode(opcode_byte))
                }
            }
        })();

        if result.is_err() {
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_backend::BackendError;

    struct EchoBackend;

    impl Backend for EchoBackend {
        fn compile_script(&mut self, _script: &[u8]) -> Result<bool, BackendError> {
            Ok(true)
        }
        fn is_function(&mut self, name: &str) -> bool {
            name == "test"
        }
        fn call_function(&mut self, _name: &str, _args: Value) -> Result<Value, BackendError> {
            Ok(Value::string("ok").unwrap())
        }
        fn define_constant(&mut self, _name: &str, _value: Value) {}
        fn define_function(
            &mut self,
            _name: &str,
            _callback: warden_backend::HostCallback,
        ) -> Result<(), BackendError> {
            Ok(())
        }
        fn destroy(&mut self) {}
    }

    #[test]
    fn is_function_dispatch_matches_backend() {
        let mut backend = EchoBackend;
        assert!(backend.is_function("test"));
        assert!(!backend.is_function("nope"));
    }

    #[test]
    fn call_function_returns_backend_value() {
        let mut backend = EchoBackend;
        let v = backend.call_function("test", Value::empty_array()).unwrap();
        assert_eq!(v, Value::string("ok").unwrap());
    }
}
