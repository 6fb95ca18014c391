//! Sandbox lockdown — bounded allocator, seccomp-BPF syscall gate, and
//! strict seccomp. Runs once in the child, before the guest loop starts.
//!
//! The in-process gate is a best-effort refinement layer; strict seccomp is
//! the actual security boundary. Nothing here depends on the gate for
//! correctness.
//!
//! Non-Linux targets compile the public surface to documented no-ops, the
//! way `aigent-exec::sandbox` does for platforms without seccomp.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("seccomp syscall filter installation failed: {0}")]
    FilterInstall(std::io::Error),
    #[error("could not enter strict seccomp mode: {0}")]
    StrictModeFailed(std::io::Error),
    #[error("sandbox lockdown is unsupported on this platform")]
    Unsupported,
}

// ── Bounded allocator ────────────────────────────────────────────────────────

static BUDGET_BYTES: AtomicUsize = AtomicUsize::new(usize::MAX);
static ALLOCATED_BYTES: AtomicUsize = AtomicUsize::new(0);

/// A `GlobalAlloc` wrapper that enforces a byte budget once
/// `set_memory_budget` has been called. Before that it behaves exactly
/// like `std::alloc::System`.
///
/// Install it once, process-wide, as `#[global_allocator]` in the binary
/// crate (`warden-cli`); both the parent and the forked child share the
/// same static, but only the child ever calls `set_memory_budget`.
pub struct BoundedAllocator;

impl BoundedAllocator {
    pub const fn new() -> Self {
        BoundedAllocator
    }
}

impl Default for BoundedAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: delegates every call to `System`, only adding budget bookkeeping
// around the size already validated by the caller's `Layout`.
unsafe impl GlobalAlloc for BoundedAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let budget = BUDGET_BYTES.load(Ordering::Relaxed);
        if budget != usize::MAX {
            let after = ALLOCATED_BYTES.fetch_add(layout.size(), Ordering::SeqCst) + layout.size();
            if after > budget {
                ALLOCATED_BYTES.fetch_sub(layout.size(), Ordering::SeqCst);
                return std::ptr::null_mut();
            }
        }
        // SAFETY: layout is the caller's validated layout, forwarded unchanged.
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: ptr/layout were produced by a matching `alloc` call above.
        unsafe { System.dealloc(ptr, layout) };
        if BUDGET_BYTES.load(Ordering::Relaxed) != usize::MAX {
            ALLOCATED_BYTES.fetch_sub(layout.size(), Ordering::SeqCst);
        }
    }
}

/// Seed the bounded allocator with a byte budget. Call once, post-fork, in
/// the child before any interpreter allocation happens.
pub fn set_memory_budget(max_memory: usize) {
    ALLOCATED_BYTES.store(0, Ordering::SeqCst);
    BUDGET_BYTES.store(max_memory, Ordering::SeqCst);
}

/// Bytes currently accounted as allocated against the budget. Exposed for
/// diagnostics/tests; not part of the enforcement path.
pub fn allocated_bytes() -> usize {
    ALLOCATED_BYTES.load(Ordering::Relaxed)
}

// ── Syscall blacklist resolution ────────────────────────────────────────────

/// Resolve a symbolic syscall name to its x86_64 syscall number. Used by
/// `warden-config` so the blacklist can be authored as names in TOML rather
/// than magic numbers.
///
/// Covers the default blacklist named in `SPEC_FULL.md` ("memory-map
/// variants, signal masking, thread-targeted kill").
pub fn resolve_syscall_name(name: &str) -> Option<i64> {
    Some(match name {
        "mmap" => 9,
        "mmap2" => 9, // x86_64 has no distinct mmap2; kept as an alias for portability of config files
        "mremap" => 25,
        "shmget" => 29,
        "shmat" => 30,
        "shmdt" => 67,
        "rt_sigprocmask" => 14,
        "sigprocmask" => 14,
        "tgkill" => 234,
        "tkill" => 200,
        _ => return None,
    })
}

pub fn default_blacklist_names() -> Vec<&'static str> {
    vec![
        "mmap",
        "mremap",
        "shmget",
        "shmat",
        "shmdt",
        "rt_sigprocmask",
        "tgkill",
        "tkill",
    ]
}

// ── Linux: seccomp-BPF gate + strict mode ───────────────────────────────────

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod linux {
    use super::SandboxError;
    use std::io;

    #[repr(C)]
    struct SockFilter {
        code: u16,
        jt: u8,
        jf: u8,
        k: u32,
    }

    #[repr(C)]
    struct SockFprog {
        len: u16,
        filter: *const SockFilter,
    }

    const BPF_LD: u16 = 0x00;
    const BPF_W: u16 = 0x00;
    const BPF_ABS: u16 = 0x20;
    const BPF_JMP: u16 = 0x05;
    const BPF_JEQ: u16 = 0x10;
    const BPF_K: u16 = 0x00;
    const BPF_RET: u16 = 0x06;

    const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
    const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
    const ENOMEM: u32 = 12;

    const SECCOMP_DATA_NR_OFFSET: u32 = 0;

    /// Install a seccomp-BPF filter that returns `-ENOMEM` for every syscall
    /// number in `blacklist` and lets everything else through unchanged.
    /// This is the "syscall gate" — a kernel-enforced interposition point,
    /// chosen over a raw vDSO-pointer rewrite because it is portable and
    /// safe without per-architecture assembly.
    ///
    /// # Safety
    /// Must run after `fork`, before `enter_strict_mode`, and only in the
    /// child process — it installs a process-wide filter.
    pub unsafe fn install_syscall_gate(blacklist: &[i64]) -> Result<(), SandboxError> {
        let n = blacklist.len();
        let prog_len = 1 + n + 2;
        let mut prog: Vec<SockFilter> = Vec::with_capacity(prog_len);

        prog.push(SockFilter {
            code: BPF_LD | BPF_W | BPF_ABS,
            jt: 0,
            jf: 0,
            k: SECCOMP_DATA_NR_OFFSET,
        });

        for (i, &nr) in blacklist.iter().enumerate() {
            let steps_to_deny = (n - i) as u8;
            prog.push(SockFilter {
                code: BPF_JMP | BPF_JEQ | BPF_K,
                jt: steps_to_deny,
                jf: 0,
                k: nr as u32,
            });
        }

        // default: allow
        prog.push(SockFilter {
            code: BPF_RET | BPF_K,
            jt: 0,
            jf: 0,
            k: SECCOMP_RET_ALLOW,
        });
        // matched: deny with ENOMEM
        prog.push(SockFilter {
            code: BPF_RET | BPF_K,
            jt: 0,
            jf: 0,
            k: SECCOMP_RET_ERRNO | (ENOMEM & 0xFFFF),
        });

        let fprog = SockFprog {
            len: prog.len() as u16,
            filter: prog.as_ptr(),
        };

        const SYS_SECCOMP: libc::c_long = 317;
        const SECCOMP_SET_MODE_FILTER: libc::c_ulong = 1;

        // SAFETY: fprog and its backing `prog` buffer are live for the
        // duration of this syscall.
        let ret = unsafe {
            libc::syscall(
                SYS_SECCOMP,
                SECCOMP_SET_MODE_FILTER,
                0u64,
                &fprog as *const SockFprog as *const libc::c_void,
            )
        };

        std::mem::forget(prog);

        if ret != 0 {
            return Err(SandboxError::FilterInstall(io::Error::last_os_error()));
        }
        tracing::trace!(blacklisted = n, "seccomp-bpf syscall gate installed");
        Ok(())
    }

    /// Enter `SECCOMP_MODE_STRICT`: only `read`, `write`, `_exit`/
    /// `exit_group`, and `sigreturn` remain legal; any other syscall kills
    /// the process.
    ///
    /// # Safety
    /// Irreversible — once entered there is no escaping strict mode short
    /// of process exit. Must be the last lockdown step.
    pub unsafe fn enter_strict_mode() -> Result<(), SandboxError> {
        const PR_SET_SECCOMP: libc::c_int = 22;
        const SECCOMP_MODE_STRICT: libc::c_ulong = 1;

        // SAFETY: prctl is async-signal-safe and takes no pointers here.
        let ret = unsafe { libc::prctl(PR_SET_SECCOMP, SECCOMP_MODE_STRICT, 0, 0, 0) };
        if ret != 0 {
            return Err(SandboxError::StrictModeFailed(io::Error::last_os_error()));
        }
        tracing::info!("entered strict seccomp mode");
        Ok(())
    }
}

// ── Public surface ───────────────────────────────────────────────────────────

/// Install the seccomp-BPF syscall gate. No-op returning `Ok(())` on
/// platforms other than Linux/x86_64 — the gate is a best-effort
/// refinement layer the core must not depend on for correctness.
///
/// # Safety
/// Must run post-fork, in the child, before `enter_strict_mode`.
pub unsafe fn install_syscall_gate(blacklist: &[i64]) -> Result<(), SandboxError> {
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        // SAFETY: forwarded from this function's own safety contract.
        return unsafe { linux::install_syscall_gate(blacklist) };
    }
    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    {
        let _ = blacklist;
        tracing::warn!("seccomp-bpf syscall gate is unavailable on this platform; skipping");
        Ok(())
    }
}

/// Enter the kernel's strict seccomp mode. No-op returning
/// `Err(SandboxError::Unsupported)` on platforms without strict seccomp;
/// callers must treat that as a lockdown failure and exit the child
/// nonzero.
///
/// # Safety
/// Irreversible, must run post-fork in the child, last in the lockdown
/// sequence.
pub unsafe fn enter_strict_mode() -> Result<(), SandboxError> {
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        // SAFETY: forwarded from this function's own safety contract.
        return unsafe { linux::enter_strict_mode() };
    }
    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    {
        Err(SandboxError::Unsupported)
    }
}

/// Compose the full lockdown sequence: seed the allocator budget, install
/// the syscall gate, then enter strict seccomp. Exits the process nonzero
/// if strict mode cannot be entered — callers that want to test the first
/// two steps in isolation should call
/// `set_memory_budget`/`install_syscall_gate` directly instead of this
/// function.
///
/// # Safety
/// Must run exactly once, post-fork, in the child, before any guest code
/// runs.
pub unsafe fn lockdown(max_memory: usize, blacklist: &[i64]) {
    set_memory_budget(max_memory);

    // SAFETY: forwarded from this function's own safety contract.
    if let Err(e) = unsafe { install_syscall_gate(blacklist) } {
        tracing::warn!(error = %e, "syscall gate unavailable; relying on strict seccomp alone");
    }

    // SAFETY: forwarded from this function's own safety contract.
    match unsafe { enter_strict_mode() } {
        Ok(()) => tracing::info!("sandbox lockdown complete"),
        Err(e) => {
            tracing::error!(error = %e, "could not enter secure computation mode");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_blacklist_names() {
        assert!(resolve_syscall_name("mmap").is_some());
        assert!(resolve_syscall_name("tgkill").is_some());
        assert!(resolve_syscall_name("not_a_syscall").is_none());
    }

    #[test]
    fn default_blacklist_all_resolve() {
        for name in default_blacklist_names() {
            assert!(
                resolve_syscall_name(name).is_some(),
                "default blacklist entry {name} must resolve"
            );
        }
    }

    #[test]
    fn budget_tracks_allocation_accounting() {
        set_memory_budget(usize::MAX);
        assert_eq!(allocated_bytes(), 0);
    }

    /// Exercises `BoundedAllocator::alloc` directly rather than going
    /// through `#[global_allocator]` (that's a whole-process choice made
    /// once in `warden-cli`, not something a library's test binary can
    /// install locally) — but `alloc`/`dealloc` are ordinary `unsafe` trait
    /// methods, so this calls them the same way the real global allocator
    /// dispatch would, and actually observes a failed allocation once the
    /// budget is exceeded rather than only checking the atomic bookkeeping.
    ///
    /// `BUDGET_BYTES`/`ALLOCATED_BYTES` are process-wide statics shared with
    /// every other test in this module, so this resets them to the
    /// unbounded default afterward.
    #[test]
    fn allocation_past_the_budget_fails() {
        let alloc = BoundedAllocator::new();
        set_memory_budget(64);

        let layout = Layout::from_size_align(32, 8).unwrap();
        // SAFETY: layout is well-formed and each pointer is deallocated
        // with the same layout it was allocated with, below.
        let p1 = unsafe { alloc.alloc(layout) };
        assert!(!p1.is_null(), "first 32-byte allocation fits the 64-byte budget");
        let p2 = unsafe { alloc.alloc(layout) };
        assert!(!p2.is_null(), "second 32-byte allocation exactly fills the 64-byte budget");
        let p3 = unsafe { alloc.alloc(layout) };
        assert!(p3.is_null(), "third 32-byte allocation must be refused: it would exceed the budget");

        unsafe {
            alloc.dealloc(p1, layout);
            alloc.dealloc(p2, layout);
        }
        set_memory_budget(usize::MAX);
    }
}
