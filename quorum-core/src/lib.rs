//! Shared-disk quorum core
//!
//! State machine for a per-node quorum agent that uses a shared block
//! device as its only communication channel with its peers: periodic
//! disk-block heartbeating, peer liveness tracking, a heuristic
//! eligibility score, and a single-master bid/ack/nack election, all
//! driven by a fixed-period loop. This crate holds the pure state
//! machine and the traits the surrounding process (`quorumd`) wires up
//! to real disk I/O, a real cluster-membership client, and the host OS.

pub mod bitmap;
pub mod codec;
pub mod config;
pub mod election;
pub mod error;
pub mod membership;
pub mod quorum_loop;
pub mod reactor;
pub mod report;
pub mod scorer;
pub mod tracker;
pub mod types;

pub use bitmap::Bitmap;
pub use codec::{BlockDevice, Header, MemoryDevice, StatusBlock};
pub use config::{clock_for, Clock, Config, ConfigSource, MapConfigSource, MonotonicClock, TomlConfigSource, WallClock};
pub use election::{ElectionConfig, ElectionEngine, ElectionOutcome};
pub use error::{Error, IoFault, Result};
pub use membership::{ClusterCommands, ClusterStatus, FakeMembership};
pub use quorum_loop::{CancelToken, QuorumLoop};
pub use reactor::{Reactor, RebootCause};
pub use report::{Report, ReportSink};
pub use scorer::{ProbeRunner, ProbeSpec, ProcessProbeRunner, ScoreBoard, Scorer};
pub use tracker::{PeerAction, PeerRecord, PeerTracker, TrackerConfig};
pub use types::{unix_timestamp, Msg, MsgKind, NodeId, State, MAX_NODES};
