//! Side effects the quorum loop must be able to trigger but that unit
//! tests must never actually perform: rebooting the host and requesting a
//! real-time scheduling class. Hidden behind an injected `Reactor` so
//! tests can assert intent without rebooting the test runner.

use tracing::warn;

/// Reason a reboot was requested, carried through for logging at the call
/// site and for test assertions on *why* a reboot fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootCause {
    /// Our own sector came back with a foreign `updatenode` and
    /// `state == EVICT`: someone else fenced us.
    SelfEvicted,
    /// A cycle exceeded `interval * tko` and `paranoid` is configured.
    CycleOverrun,
    /// The score gate failed with `reboot` configured on.
    ScoreGateFailure,
}

/// Everything the quorum loop needs from the host OS that a test would
/// never want to actually happen.
pub trait Reactor: Send {
    /// Reboot the host. Implementations used in production never return;
    /// the trait still returns `()` so fakes can record the call and let
    /// the calling test continue executing.
    fn reboot(&self, cause: RebootCause);

    /// Best-effort request for a real-time scheduling class and priority.
    /// Failure (e.g. `EPERM` outside root) is logged as a warning, never
    /// fatal.
    fn request_scheduling(&self, scheduler: &str, priority: i32);
}

/// Records requests instead of acting on them. Used by every test that
/// exercises the quorum loop so assertions can check "a reboot was
/// requested" without rebooting the test runner.
#[derive(Debug, Default)]
pub struct RecordingReactor {
    reboots: std::sync::Mutex<Vec<RebootCause>>,
}

impl RecordingReactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reboots(&self) -> Vec<RebootCause> {
        self.reboots.lock().unwrap().clone()
    }

    pub fn rebooted(&self) -> bool {
        !self.reboots.lock().unwrap().is_empty()
    }
}

impl Reactor for RecordingReactor {
    fn reboot(&self, cause: RebootCause) {
        warn!(?cause, "reboot requested (recording reactor: no-op)");
        self.reboots.lock().unwrap().push(cause);
    }

    fn request_scheduling(&self, scheduler: &str, priority: i32) {
        warn!(scheduler, priority, "scheduling class requested (recording reactor: no-op)");
    }
}

impl Reactor for Box<dyn Reactor> {
    fn reboot(&self, cause: RebootCause) {
        (**self).reboot(cause);
    }

    fn request_scheduling(&self, scheduler: &str, priority: i32) {
        (**self).request_scheduling(scheduler, priority);
    }
}

/// The real, Linux-only reactor: `reboot(RB_AUTOBOOT)` and
/// `sched_setscheduler`. Only compiled with the `linux-sched` feature so
/// the library links on non-Linux hosts and in ordinary `cargo test` runs.
#[cfg(feature = "linux-sched")]
pub mod linux {
    use super::{Reactor, RebootCause};
    use tracing::{error, warn};

    pub struct LinuxReactor;

    impl Reactor for LinuxReactor {
        fn reboot(&self, cause: RebootCause) {
            error!(?cause, "rebooting host");
            // SAFETY: RB_AUTOBOOT takes no arguments beyond the magic
            // constants libc validates; failure is reported, not ignored,
            // but there is nothing more useful to do with it than log it.
            let ret = unsafe { libc::reboot(libc::RB_AUTOBOOT) };
            if ret != 0 {
                error!(errno = std::io::Error::last_os_error().raw_os_error(), "reboot(2) failed");
            }
        }

        fn request_scheduling(&self, scheduler: &str, priority: i32) {
            let policy = match scheduler.to_ascii_uppercase().as_str() {
                "RR" => libc::SCHED_RR,
                "FIFO" => libc::SCHED_FIFO,
                _ => {
                    warn!(scheduler, "unknown scheduler class; leaving default");
                    return;
                }
            };
            let param = libc::sched_param { sched_priority: priority };
            // SAFETY: `param` is fully initialized and valid for the
            // duration of the call; `sched_setscheduler` with pid 0
            // targets the calling process.
            let ret = unsafe { libc::sched_setscheduler(0, policy, &param) };
            if ret != 0 {
                warn!(
                    scheduler,
                    priority,
                    errno = std::io::Error::last_os_error().raw_os_error(),
                    "failed to acquire real-time scheduling class (continuing at default priority)"
                );
            }
        }
    }
}
