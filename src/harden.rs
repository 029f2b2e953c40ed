//! Process hardening
//!
//! Invoked once at serve startup, before any secret is unsealed. On Linux:
//! mark the process non-dumpable, lock current and future pages into RAM,
//! and zero the core-file size limit. Absence of these does not change
//! correctness; presence keeps secrets out of swap and crash artifacts.

#[cfg(target_os = "linux")]
use tracing::warn;

/// Apply platform hardening. Failures are logged, not fatal; a proxy that
/// cannot mlock should still serve.
pub fn apply() {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: plain syscalls with static arguments; no memory is handed
        // to the kernel beyond the rlimit struct below.
        unsafe {
            if libc::prctl(libc::PR_SET_DUMPABLE, 0, 0, 0, 0) != 0 {
                warn!("prctl(PR_SET_DUMPABLE, 0) failed");
            }
            if libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) != 0 {
                warn!("mlockall failed; secrets may be swapped to disk");
            }
            let limit = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            if libc::setrlimit(libc::RLIMIT_CORE, &limit) != 0 {
                warn!("setrlimit(RLIMIT_CORE, 0) failed");
            }
        }
    }
}
