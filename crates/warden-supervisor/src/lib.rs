//! The process supervisor: forks the parent/child pair, wires the two
//! anonymous pipes, installs sandbox lockdown and the guest loop in the
//! child, and tears everything down on `destroy`.

use std::os::fd::RawFd;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};
use warden_backend::Backend;
use warden_proxy::Proxy;
use warden_sandbox::default_blacklist_names;
use warden_value::Value;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to create pipe: {0}")]
    Pipe(std::io::Error),
    #[error("fork failed: {0}")]
    Fork(std::io::Error),
}

/// Knobs for a single spawned guest: process bring-up state rather than
/// wire forwarding. The timeout and memory budget live here; the callback
/// map and re-entrancy flag live in `warden_proxy::Proxy`.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub timeout: Duration,
    pub max_memory: usize,
    /// Syscall numbers to blacklist in the syscall gate. Resolved ahead of
    /// time by `warden-config` from symbolic names.
    pub syscall_blacklist: Vec<i64>,
    /// When `false`, skips `warden_sandbox::lockdown` entirely — useful for
    /// the CLI's `--unsandboxed` debug flag. Never set `false` for
    /// untrusted scripts.
    pub sandboxed: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_memory: 64 * 1024 * 1024,
            syscall_blacklist: default_blacklist_names()
                .into_iter()
                .filter_map(warden_sandbox::resolve_syscall_name)
                .collect(),
            sandboxed: true,
        }
    }
}

fn make_pipe() -> Result<(RawFd, RawFd), SupervisorError> {
    let mut fds = [0i32; 2];
    // SAFETY: fds is a valid 2-element buffer.
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret != 0 {
        return Err(SupervisorError::Pipe(std::io::Error::last_os_error()));
    }
    Ok((fds[0], fds[1]))
}

fn close_fd(fd: RawFd) {
    // SAFETY: fd is a valid, owned descriptor at the call site.
    unsafe {
        libc::close(fd);
    }
}

/// Fork a guest process running `backend`, returning a `WardenProcess`
/// handle the host drives through the `Backend` capability.
///
/// The child never execs: it runs `warden_sandbox::lockdown` then
/// `warden_guest::run_guest_loop` in the same image post-fork.
pub fn spawn<B>(backend: B, cfg: &ProcessConfig) -> Result<WardenProcess, SupervisorError>
where
    B: Backend + 'static,
{
    let (p_to_c_r, p_to_c_w) = make_pipe()?;
    let (c_to_p_r, c_to_p_w) = make_pipe()?;

    // SAFETY: fork() is async-signal-safe; both branches close the fds they
    // don't own before doing anything else.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        let err = std::io::Error::last_os_error();
        for fd in [p_to_c_r, p_to_c_w, c_to_p_r, c_to_p_w] {
            close_fd(fd);
        }
        return Err(SupervisorError::Fork(err));
    }

    if pid == 0 {
        // Child.
        close_fd(p_to_c_w);
        close_fd(c_to_p_r);
        let fd_r = p_to_c_r;
        let fd_w = c_to_p_w;

        if cfg.sandboxed {
            println!("[child] entering secure environment");
            // SAFETY: runs immediately post-fork, single-threaded, before
            // any guest code executes.
            unsafe { warden_sandbox::lockdown(cfg.max_memory, &cfg.syscall_blacklist) };
            println!("[child] running in seccomp mode");
        } else {
            warn!("sandbox lockdown skipped (ProcessConfig::sandboxed = false)");
        }

        warden_guest::run_guest_loop(backend, fd_r, fd_w);
    }

    // Parent.
    close_fd(p_to_c_r);
    close_fd(c_to_p_w);
    let fd_r = c_to_p_r;
    let fd_w = p_to_c_w;

    info!(child_pid = pid, "spawned guest process");

    Ok(WardenProcess {
        child_pid: pid,
        proxy: Proxy::new(fd_r, fd_w, cfg.timeout),
        fd_r,
        fd_w,
        destroyed: false,
    })
}

/// The parent-side handle to a running guest: the `Backend`-implementing
/// proxy plus the process/pipe state `warden_proxy::Proxy` doesn't own.
pub struct WardenProcess {
    child_pid: libc::pid_t,
    proxy: Proxy,
    fd_r: RawFd,
    fd_w: RawFd,
    destroyed: bool,
}

impl WardenProcess {
    pub fn child_pid(&self) -> i32 {
        self.child_pid
    }

    pub fn is_poisoned(&self) -> bool {
        self.proxy.is_poisoned()
    }

    /// Forward to the wrapped `Backend` implementation. Most callers should
    /// use `Backend`'s trait methods directly via `as_backend_mut` /
    /// `Backend` impl below instead of reaching in here.
    pub fn backend_mut(&mut self) -> &mut Proxy {
        &mut self.proxy
    }

    /// Tear the guest down: SIGKILL, a bounded non-blocking reap (a single
    /// `waitpid(WNOHANG)` immediately after `kill` can race and observe a
    /// stale `status`; this polls a few times with a short sleep first),
    /// close both pipe fds, then destroy the wrapped backend record.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        // SAFETY: child_pid is a still-valid pid owned by this process.
        unsafe {
            libc::kill(self.child_pid, libc::SIGKILL);
        }

        let mut reaped = false;
        for _ in 0..20 {
            let mut status = 0i32;
            // SAFETY: status is a valid out-pointer.
            let ret = unsafe { libc::waitpid(self.child_pid, &mut status, libc::WNOHANG) };
            if ret == self.child_pid {
                if libc::WIFSIGNALED(status) {
                    info!(signal = libc::WTERMSIG(status), "guest terminated by signal");
                } else if libc::WIFEXITED(status) {
                    info!(code = libc::WEXITSTATUS(status), "guest exited");
                }
                reaped = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        if !reaped {
            warn!(child_pid = self.child_pid, "guest process did not reap within the polling window");
        }

        close_fd(self.fd_r);
        close_fd(self.fd_w);

        self.proxy.destroy();
    }
}

impl Drop for WardenProcess {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Convenience re-exports so callers driving a `WardenProcess` through the
/// `Backend` capability don't need to depend on `warden-backend` directly
/// just to call these four methods.
impl WardenProcess {
    pub fn compile_script(&mut self, script: &[u8]) -> bool {
        self.proxy.compile_script(script).unwrap_or(false)
    }

    pub fn is_function(&mut self, name: &str) -> bool {
        self.proxy.is_function(name)
    }

    pub fn call_function(&mut self, name: &str, args: Value) -> Value {
        self.proxy.call_function(name, args).unwrap_or(Value::Void)
    }

    pub fn define_constant(&mut self, name: &str, value: Value) {
        self.proxy.define_constant(name, value);
    }

    pub fn define_function(&mut self, name: &str, callback: warden_backend::HostCallback) -> Result<(), warden_backend::BackendError> {
        self.proxy.define_function(name, callback)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.proxy.last_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_backend::BackendError;

    /// A trivial `Backend` used only to exercise `spawn`/`destroy` without
    /// depending on `warden-toybackend` (that crate depends on
    /// `warden-backend`/`warden-value`, not the other way around, but
    /// keeping the test backend local avoids an unnecessary dev-dependency).
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
        fn define_function(&mut self, _name: &str, _callback: warden_backend::HostCallback) -> Result<(), BackendError> {
            Ok(())
        }
        fn destroy(&mut self) {}
    }

    #[test]
    fn spawn_compile_call_and_destroy_roundtrip() {
        let cfg = ProcessConfig {
            timeout: Duration::from_secs(5),
            sandboxed: false,
            ..Default::default()
        };
        let mut process = spawn(EchoBackend, &cfg).expect("spawn should succeed");

        assert!(process.compile_script(b"whatever"));
        assert!(process.is_function("test"));
        assert!(!process.is_function("nope"));

        let ret = process.call_function("test", Value::empty_array());
        assert_eq!(ret, Value::string("ok").unwrap());

        process.destroy();
    }

    #[test]
    fn destroy_is_idempotent() {
        let cfg = ProcessConfig {
            sandboxed: false,
            ..Default::default()
        };
        let mut process = spawn(EchoBackend, &cfg).unwrap();
        process.destroy();
        process.destroy();
    }
}
