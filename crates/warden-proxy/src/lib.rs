//! The parent-side proxy front-end: implements the `Backend` capability by
//! forwarding every operation to the sandboxed child over the wire,
//! pumping guest→host callbacks until a `RESP_RETURN` frame arrives.
//!
//! `warden-supervisor` owns the child's pid and lifecycle; this crate only
//! knows about the two pipe endpoints, so it can be unit-tested against a
//! pair of connected pipes without ever forking.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace, warn};
use warden_backend::{Backend, BackendError, HostCallback};
use warden_proto::{FdTimedReader, Opcode, ProtoError, TimedReader, decode_value_timed, encode_value, read_string, write_string, write_u8};
use warden_value::Value;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proto error: {0}")]
    Proto(#[from] ProtoError),
    #[error("function {name} is already defined")]
    DuplicateCallback { name: String },
    #[error("cannot invoke guest from within a host callback")]
    Reentrant,
    #[error("proxy is poisoned after a prior IPC failure")]
    Poisoned,
    #[error("callback {name} invoked by the guest but not registered on the host")]
    UnknownCallback { name: String },
}

impl From<ProxyError> for BackendError {
    fn from(e: ProxyError) -> Self {
        BackendError::Runtime {
            name: "<proxy>".into(),
            message: e.to_string(),
        }
    }
}

struct RawFdIo(RawFd);

impl Read for RawFdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for the duration of this call.
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 { Err(io::Error::last_os_error()) } else { Ok(n as usize) }
    }
}

impl Write for RawFdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for the duration of this call.
        let n = unsafe { libc::write(self.0, buf.as_ptr().cast(), buf.len()) };
        if n < 0 { Err(io::Error::last_os_error()) } else { Ok(n as usize) }
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The host-side implementation of the `Backend` capability, forwarding
/// every operation to a guest connected over `fd_r`/`fd_w`.
///
/// `!Sync`/single-threaded by construction: the re-entrancy guard is a
/// plain field, valid only because nothing else can touch `Proxy`
/// concurrently — both sides of the channel run single-threaded.
pub struct Proxy {
    fd_r: RawFd,
    fd_w: RawFd,
    timeout: Duration,
    callbacks: HashMap<String, HostCallback>,
    in_call: bool,
    poisoned: bool,
    last_error: Option<String>,
}

impl Proxy {
    /// Wrap a pair of already-connected pipe endpoints. `warden-supervisor`
    /// is the only expected caller outside tests.
    pub fn new(fd_r: RawFd, fd_w: RawFd, timeout: Duration) -> Self {
        Self {
            fd_r,
            fd_w,
            timeout,
            callbacks: HashMap::new(),
            in_call: false,
            poisoned: false,
            last_error: None,
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn poison(&mut self, err: ProxyError) -> ProxyError {
        warn!(error = %err, "proxy poisoned by IPC failure");
        self.poisoned = true;
        err
    }

    fn writer(&self) -> RawFdIo {
        RawFdIo(self.fd_w)
    }

    /// A poll-based, non-blocking reader over the child→parent fd. A plain
    /// blocking `read()` can't be interrupted once issued, so a guest that
    /// is alive but silent would hang this read forever regardless of
    /// `timeout`; `FdTimedReader` polls for readability against the
    /// remaining time budget instead.
    fn reader(&self) -> FdTimedReader {
        FdTimedReader::new(self.fd_r)
    }

    /// The callback pump: repeatedly read one opcode within the
    /// configured timeout. `RespCallback` frames are serviced by invoking
    /// the matching host callback and writing the result back; `RespReturn`
    /// ends the pump and hands control back to the caller's trailer read.
    fn pump_callbacks(&mut self) -> Result<(), ProxyError> {
        loop {
            let mut reader = self.reader();
            let opcode_byte = {
                use warden_proto::TimedRead;
                let deadline = std::time::Instant::now() + self.timeout;
                let mut b = [0u8; 1];
                reader.read_exact_timed(&mut b, Some(deadline))?;
                b[0]
            };
            let opcode = Opcode::try_from(opcode_byte)?;
            match opcode {
                Opcode::RespCallback => {
                    let name = read_string(&mut reader, Some(std::time::Instant::now() + self.timeout))?;
                    let name = String::from_utf8(name).map_err(|_| ProtoError::InvalidUtf8)?;
                    let args = decode_value_timed(&mut reader, self.timeout)?;
                    trace!(%name, "callback pump: guest invoked host callback");

                    let ret = match self.callbacks.get_mut(&name) {
                        Some(f) => f(args),
                        None => {
                            return Err(self.poison(ProxyError::UnknownCallback { name }));
                        }
                    };

                    let mut w = self.writer();
                    encode_value(&mut w, &ret)?;
                }
                Opcode::RespReturn => return Ok(()),
                other => return Err(ProtoError::UnknownOpcode(other as u8).into()),
            }
        }
    }

    /// Acquire the re-entrancy guard or fail per §4.3/§5/§8: a host callback
    /// may not launch a new top-level guest operation.
    fn enter_call(&mut self) -> Result<(), ProxyError> {
        if self.poisoned {
            return Err(ProxyError::Poisoned);
        }
        if self.in_call {
            return Err(ProxyError::Reentrant);
        }
        self.in_call = true;
        Ok(())
    }

    fn exit_call(&mut self) {
        self.in_call = false;
    }
}

impl Backend for Proxy {
    fn compile_script(&mut self, script: &[u8]) -> Result<bool, BackendError> {
        if let Err(e) = self.enter_call() {
            self.last_error = Some(e.to_string());
            return Ok(false);
        }

        let outcome = (|| -> Result<bool, ProxyError> {
            let mut w = self.writer();
            write_u8(&mut w, Opcode::CompileScript as u8)?;
            write_string(&mut w, script)?;

            self.pump_callbacks()?;

            let mut reader = self.reader();
            use warden_proto::TimedRead;
            let mut b = [0u8; 1];
            reader.read_exact_timed(&mut b, Some(std::time::Instant::now() + self.timeout))?;
            Ok(b[0] != 0)
        })();

        self.exit_call();

        match outcome {
            Ok(result) => Ok(result),
            Err(e) => {
                let message = e.to_string();
                self.poison(e);
                self.last_error = Some(message);
                Ok(false)
            }
        }
    }

    fn is_function(&mut self, name: &str) -> bool {
        if self.poisoned {
            return false;
        }
        let outcome = (|| -> Result<bool, ProxyError> {
            let mut w = self.writer();
            write_u8(&mut w, Opcode::IsFunction as u8)?;
            write_string(&mut w, name.as_bytes())?;

            // No RESP_RETURN wrapper for this command (§4.2/§4.3) — it
            // never drives the guest, so no callback pump is entered.
            let mut reader = self.reader();
            use warden_proto::TimedRead;
            let mut b = [0u8; 1];
            reader.read_exact_timed(&mut b, Some(std::time::Instant::now() + self.timeout))?;
            Ok(b[0] != 0)
        })();

        match outcome {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "is_function failed");
                self.poison(e);
                false
            }
        }
    }

    fn call_function(&mut self, name: &str, args: Value) -> Result<Value, BackendError> {
        if let Err(e) = self.enter_call() {
            self.last_error = Some(e.to_string());
            return Ok(Value::Void);
        }

        let outcome = (|| -> Result<Value, ProxyError> {
            let mut w = self.writer();
            write_u8(&mut w, Opcode::CallFunction as u8)?;
            write_string(&mut w, name.as_bytes())?;
            encode_value(&mut w, &args)?;

            self.pump_callbacks()?;

            let mut reader = self.reader();
            Ok(decode_value_timed(&mut reader, self.timeout)?)
        })();

        self.exit_call();

        match outcome {
            Ok(v) => Ok(v),
            Err(e) => {
                let message = e.to_string();
                self.poison(e);
                self.last_error = Some(message);
                // §7: a runtime/IPC error during call_function surfaces as
                // a null return, not an Err.
                Ok(Value::Void)
            }
        }
    }

    fn define_constant(&mut self, name: &str, value: Value) {
        if self.poisoned {
            return;
        }
        debug!(%name, "define_constant");
        let mut w = self.writer();
        let result = (|| -> Result<(), ProtoError> {
            write_u8(&mut w, Opcode::DefineConstant as u8)?;
            write_string(&mut w, name.as_bytes())?;
            encode_value(&mut w, &value)?;
            Ok(())
        })();
        if let Err(e) = result {
            self.poison(e.into());
        }
    }

    fn define_function(&mut self, name: &str, callback: HostCallback) -> Result<(), BackendError> {
        if self.poisoned {
            return Err(ProxyError::Poisoned.into());
        }
        if self.callbacks.contains_key(name) {
            return Err(ProxyError::DuplicateCallback { name: name.into() }.into());
        }

        debug!(%name, "define_function");
        let mut w = self.writer();
        let result = (|| -> Result<(), ProtoError> {
            write_u8(&mut w, Opcode::DefineFunction as u8)?;
            write_string(&mut w, name.as_bytes())?;
            Ok(())
        })();
        if let Err(e) = result {
            let e: ProxyError = e.into();
            let backend_err: BackendError = BackendError::Runtime {
                name: "<proxy>".into(),
                message: e.to_string(),
            };
            self.poison(e);
            return Err(backend_err);
        }

        self.callbacks.insert(name.to_string(), callback);
        Ok(())
    }

    fn destroy(&mut self) {
        self.callbacks.clear();
    }

    fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn report_error(&mut self, message: String) {
        self.last_error = Some(message);
    }
}
