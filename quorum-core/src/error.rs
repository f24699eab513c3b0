//! Unified error type for the quorum state machine.

use thiserror::Error;

use crate::types::NodeId;

/// A single status-block read or write that did not complete. Distinguishes
/// a transient disk stall from a fatal one so callers can fold the former
/// into a peer's miss count instead of aborting the cycle.
#[derive(Debug, Error)]
pub enum IoFault {
    #[error("read of sector {sector} timed out")]
    ReadTimeout { sector: u64 },

    #[error("write of sector {sector} timed out")]
    WriteTimeout { sector: u64 },

    #[error("short read/write on sector {sector}: expected {expected} bytes, got {got}")]
    ShortTransfer { sector: u64, expected: usize, got: usize },

    #[error("underlying device error: {0}")]
    Device(#[from] std::io::Error),
}

impl IoFault {
    /// The partition between faults that feed peer-miss accounting (they
    /// never advance the peer's `last_seen`) and faults that abort startup.
    pub fn is_transient(&self) -> bool {
        matches!(self, IoFault::ReadTimeout { .. } | IoFault::WriteTimeout { .. } | IoFault::ShortTransfer { .. })
    }
}

/// Errors surfaced to the top-level daemon loop.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("header sector has bad magic or unsupported version")]
    BadHeader,

    #[error("device sector size {device} does not match header sector size {header}")]
    SectorSizeMismatch { device: u32, header: u32 },

    #[error("score_max ({score_max}) is below configured score_min ({score_min}); node is permanently ineligible")]
    ImpossibleScoreGate { score_max: u64, score_min: u64 },

    #[error(transparent)]
    Io(#[from] IoFault),

    #[error("self-eviction detected: node {0} was marked EVICT by a foreign writer")]
    SelfEvicted(NodeId),

    #[error("cycle overran interval*tko budget")]
    CycleOverrun,

    #[error("cluster membership collaborator is unavailable")]
    MembershipUnavailable,
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_transfer_and_timeouts_are_transient() {
        assert!(IoFault::ReadTimeout { sector: 1 }.is_transient());
        assert!(IoFault::WriteTimeout { sector: 1 }.is_transient());
        assert!(IoFault::ShortTransfer { sector: 1, expected: 512, got: 200 }.is_transient());
    }

    #[test]
    fn device_errors_are_not_transient() {
        let fault = IoFault::Device(std::io::Error::new(std::io::ErrorKind::Other, "bad magic"));
        assert!(!fault.is_transient());
    }
}
