//! The fixed-period driver tying the codec, tracker, scorer, election
//! engine, membership adapter and reporter together. Single-threaded;
//! cooperative cancellation at the granularity of one full cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::codec::{BlockDevice, Header, StatusBlock};
use crate::config::{Clock, Config};
use crate::election::{ElectionConfig, ElectionEngine};
use crate::error::{Error, Result};
use crate::membership::{ClusterCommands, ClusterStatus};
use crate::reactor::{Reactor, RebootCause};
use crate::report::{Report, ReportSink};
use crate::scorer::{required_score, ScoreBoard};
use crate::tracker::{PeerAction, PeerTracker, TrackerConfig};
use crate::types::{NodeId, State};

/// Cooperative cancellation token, checked once per loop iteration. A
/// signal handler calls `cancel()` and the running cycle finishes before
/// the loop observes it.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything one cycle needs, generic over the fakeable collaborators:
/// the shared disk, the cluster-membership adapter, and the host reactor.
pub struct QuorumLoop<D, M, R> {
    my_id: NodeId,
    incarnation: u64,
    device: D,
    membership: M,
    reactor: R,
    clock: Box<dyn Clock>,
    config: Config,
    tracker: PeerTracker,
    engine: ElectionEngine,
    scoreboard: Arc<ScoreBoard>,
    sink: ReportSink,
    debug: bool,
    node_limit: u32,
    last_blocks: HashMap<NodeId, StatusBlock>,
}

impl<D, M, R> QuorumLoop<D, M, R>
where
    D: BlockDevice,
    M: ClusterStatus + ClusterCommands,
    R: Reactor,
{
    /// Opens the header sector and validates it against the device's own
    /// reported sector size.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        mut device: D,
        incarnation: u64,
        membership: M,
        reactor: R,
        clock: Box<dyn Clock>,
        config: Config,
        scoreboard: Arc<ScoreBoard>,
        debug: bool,
    ) -> Result<Self> {
        let my_id = membership.my_node_id();
        let mut header_sector = vec![0u8; device.sector_size() as usize];
        device.read_sector(0, &mut header_sector).map_err(Error::Io)?;
        let header = Header::decode(&header_sector).ok_or(Error::BadHeader)?;
        if header.sector_size != device.sector_size() {
            return Err(Error::SectorSizeMismatch { device: device.sector_size(), header: header.sector_size });
        }

        let (_, score_max) = scoreboard.sample();
        if let Some(err) = config.check_score_gate(score_max) {
            warn!(error = %err, "starting despite an unsatisfiable score gate");
        }

        let node_limit = (device.sector_count().saturating_sub(1) as u32).min(crate::types::MAX_NODES);

        Ok(Self {
            my_id,
            incarnation,
            device,
            membership,
            reactor,
            clock,
            sink: ReportSink::from_config(&config.status_file),
            config,
            tracker: PeerTracker::new(my_id),
            engine: ElectionEngine::new(my_id),
            scoreboard,
            debug,
            node_limit,
            last_blocks: HashMap::new(),
        })
    }

    fn tracker_cfg(&self) -> TrackerConfig {
        TrackerConfig { tko: self.config.tko, tko_up: self.config.tko_up }
    }

    fn election_cfg(&self) -> ElectionConfig {
        ElectionConfig { upgrade_wait: self.config.upgrade_wait, master_wait: self.config.master_wait }
    }

    /// Read every peer sector in range. A transient fault reuses the last
    /// successfully observed block unchanged, so the tracker's own
    /// miss-counting fires naturally instead of the loop treating a
    /// stalled read as fatal.
    fn read_all(&mut self) -> HashMap<NodeId, StatusBlock> {
        let mut observed = HashMap::with_capacity(self.node_limit as usize);
        let mut buf = vec![0u8; self.device.sector_size() as usize];
        for id in 1..=self.node_limit {
            let block = match self.device.read_sector(id as u64, &mut buf) {
                Ok(()) => match StatusBlock::decode(&buf) {
                    Ok(block) => {
                        self.last_blocks.insert(id, block);
                        block
                    }
                    Err(err) => {
                        debug!(node = id, error = %err, "corrupt status block; reusing last observed block");
                        self.last_blocks.get(&id).copied().unwrap_or_else(|| StatusBlock::empty(id))
                    }
                },
                Err(err) => {
                    debug!(node = id, error = %err, "transient read fault; reusing last observed block");
                    self.last_blocks.get(&id).copied().unwrap_or_else(|| StatusBlock::empty(id))
                }
            };
            observed.insert(id, block);
        }
        observed
    }

    /// Our own sector came back with a foreign writer and
    /// `state == EVICT`.
    fn check_self_eviction(&self, observed: &HashMap<NodeId, StatusBlock>) -> bool {
        match observed.get(&self.my_id) {
            Some(block) => block.updatenode != self.my_id && block.state == State::Evict,
            None => false,
        }
    }

    fn write_block(&mut self, block: &StatusBlock) {
        let mut buf = vec![0u8; self.device.sector_size() as usize];
        block.encode(&mut buf);
        match self.device.write_sector(block.node_id as u64, &buf) {
            Ok(()) => {
                self.last_blocks.insert(block.node_id, *block);
            }
            Err(err) => warn!(node = block.node_id, error = %err, "failed to write status block"),
        }
    }

    fn write_own(&mut self, state: State, msg: crate::types::Msg, master_mask: crate::bitmap::Bitmap, score: u64, score_req: u64, score_max: u64) {
        let block = StatusBlock {
            node_id: self.my_id,
            state,
            timestamp: self.clock.stamp_secs(),
            incarnation: self.incarnation,
            updatenode: self.my_id,
            msg,
            score: score as u32,
            score_req: score_req as u32,
            score_max: score_max as u32,
            master_mask,
        };
        self.write_block(&block);
    }

    /// `tko` iterations publishing `INIT`, observing the world but
    /// deferring master election, so a starting node can see a
    /// pre-existing master before contending.
    pub fn run_init_phase(&mut self, cancel: &CancelToken) {
        self.engine.set_state_init();
        for _ in 0..self.config.tko {
            if cancel.is_cancelled() {
                return;
            }
            let observed = self.read_all();
            let _ = self.tracker.classify_all(&observed, false, self.tracker_cfg());
            let (score, score_max) = self.scoreboard.sample();
            let score_req = required_score(self.config.min_score, score_max);
            self.write_own(State::Init, crate::types::Msg::none(), crate::bitmap::Bitmap::new(), score, score_req, score_max);
            std::thread::sleep(self.config.interval);
        }
    }

    /// One full steady-state cycle. `Ok(())` means the cycle completed
    /// normally (the caller sleeps and loops); `Err` signals a fatal
    /// condition the caller should propagate and exit on (self-eviction,
    /// membership collaborator down).
    pub fn run_cycle(&mut self) -> Result<()> {
        if !self.membership.is_alive() {
            error!("cluster membership collaborator unavailable; halting");
            return Err(Error::MembershipUnavailable);
        }

        let t0 = self.clock.now();

        let observed = self.read_all();

        if self.check_self_eviction(&observed) {
            error!(node = self.my_id, "self-eviction detected");
            self.reactor.reboot(RebootCause::SelfEvicted);
            return Err(Error::SelfEvicted(self.my_id));
        }

        let is_master = self.engine.state() == State::Master;
        let outcome = self.tracker.classify_all(&observed, is_master, self.tracker_cfg());

        for action in &outcome.actions {
            match action {
                PeerAction::WriteEvict { node, incarnation } => {
                    let mut evict = StatusBlock::empty(*node);
                    evict.state = State::Evict;
                    evict.incarnation = *incarnation;
                    evict.updatenode = self.my_id;
                    evict.timestamp = self.clock.stamp_secs();
                    self.write_block(&evict);
                }
                PeerAction::RequestFence { node } => {
                    if self.config.allow_kill {
                        self.membership.request_kill_node(*node);
                    }
                }
            }
        }

        let (score, score_max) = self.scoreboard.sample();
        let score_req = required_score(self.config.min_score, score_max);

        let live_members = self.membership.live_members();
        let election_outcome = self.engine.step(&self.tracker, score, score_req, self.election_cfg(), &self.membership, &live_members);

        if election_outcome.reboot_requested && self.config.reboot {
            self.reactor.reboot(RebootCause::ScoreGateFailure);
        }

        let mask = election_outcome.master_mask.unwrap_or(outcome.our_mask);
        self.write_own(election_outcome.state, election_outcome.msg, mask, score, score_req, score_max);

        let master = self.tracker.peers().find(|(_, r)| r.status.state == State::Master).map(|(id, _)| *id).or_else(|| {
            if election_outcome.state == State::Master { Some(self.my_id) } else { None }
        });
        let master_mask_for_report = election_outcome.master_mask.or_else(|| {
            master.and_then(|id| if id == self.my_id { None } else { self.tracker.peer(id).map(|r| r.status.master_mask) })
        });

        let report = Report::build(
            self.my_id,
            self.clock.stamp_secs(),
            score,
            score_req,
            score_max,
            election_outcome.state,
            &self.tracker,
            master,
            master_mask_for_report,
            self.debug,
        );
        if let Err(err) = self.sink.emit(&report) {
            warn!(error = %err, "failed to write status report");
        }

        let elapsed = self.clock.now().duration_since(t0);
        let budget = self.config.max_cycle();
        if elapsed > budget {
            warn!(?elapsed, ?budget, "cycle overran interval*tko budget");
            if self.config.paranoid {
                self.reactor.reboot(RebootCause::CycleOverrun);
                return Err(Error::CycleOverrun);
            }
        }

        let remaining = self.config.interval.saturating_sub(elapsed);
        if !remaining.is_zero() {
            std::thread::sleep(remaining);
        }

        Ok(())
    }

    /// Run the init phase then the steady-state loop until `cancel` fires
    /// or a cycle returns a fatal error.
    pub fn run(&mut self, cancel: &CancelToken) -> Result<()> {
        self.run_init_phase(cancel);
        while !cancel.is_cancelled() {
            self.run_cycle()?;
        }
        self.logout();
        Ok(())
    }

    /// Publish `NONE` one last time. Idempotent: calling this after an
    /// already-logged-out engine still writes a valid NONE block with a
    /// non-decreasing sequence number.
    pub fn logout(&mut self) {
        self.engine.logout();
        let (score, score_max) = self.scoreboard.sample();
        let score_req = required_score(self.config.min_score, score_max);
        self.write_own(State::None, self.engine.msg(), crate::bitmap::Bitmap::new(), score, score_req, score_max);
        if self.config.stop_cman {
            self.membership.request_leave_cluster();
        }
        info!(node = self.my_id, "logged out");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Header, MemoryDevice, DEFAULT_SECTOR_SIZE};
    use crate::config::WallClock;
    use crate::membership::FakeMembership;
    use crate::reactor::RecordingReactor;

    fn device_with_header(sectors: u64) -> MemoryDevice {
        let mut dev = MemoryDevice::new(DEFAULT_SECTOR_SIZE, sectors);
        let header = Header::new("test", DEFAULT_SECTOR_SIZE);
        let mut sector = vec![0u8; DEFAULT_SECTOR_SIZE as usize];
        header.encode(&mut sector);
        dev.write_sector(0, &sector).unwrap();
        dev
    }

    fn config() -> Config {
        let mut cfg = Config::resolve(&crate::config::MapConfigSource::default()).unwrap();
        cfg.interval = std::time::Duration::ZERO;
        cfg
    }

    #[test]
    fn open_rejects_sector_size_mismatch() {
        let mut dev = MemoryDevice::new(256, 4);
        let header = Header::new("test", DEFAULT_SECTOR_SIZE);
        let mut sector = vec![0u8; 256];
        header.encode(&mut sector);
        dev.write_sector(0, &sector).unwrap();

        let membership = FakeMembership::new(1, [1]);
        let reactor = RecordingReactor::new();
        let board = Arc::new(ScoreBoard::new(1, 1));
        let result = QuorumLoop::open(dev, 1, membership, reactor, Box::new(WallClock), config(), board, false);
        assert!(matches!(result, Err(Error::SectorSizeMismatch { .. })));
    }

    #[test]
    fn a_single_node_elects_itself_master() {
        let dev = device_with_header(8);
        let membership = FakeMembership::new(1, [1]);
        let reactor = RecordingReactor::new();
        let board = Arc::new(ScoreBoard::new(1, 1));
        let mut loop_ = QuorumLoop::open(dev, 1, membership, reactor, Box::new(WallClock), config(), board, false).unwrap();

        for _ in 0..loop_.config.master_wait + loop_.config.upgrade_wait + 2 {
            loop_.run_cycle().unwrap();
        }
        assert_eq!(loop_.engine.state(), State::Master);
    }

    #[test]
    fn self_eviction_is_fatal_and_reboots() {
        let dev = device_with_header(8);
        let membership = FakeMembership::new(1, [1, 2]);
        let reactor = RecordingReactor::new();
        let board = Arc::new(ScoreBoard::new(1, 1));
        let mut loop_ = QuorumLoop::open(dev, 1, membership, reactor, Box::new(WallClock), config(), board, false).unwrap();

        let mut evict = StatusBlock::empty(1);
        evict.state = State::Evict;
        evict.updatenode = 2;
        let mut buf = vec![0u8; DEFAULT_SECTOR_SIZE as usize];
        evict.encode(&mut buf);
        loop_.device.write_sector(1, &buf).unwrap();

        let err = loop_.run_cycle().unwrap_err();
        assert!(matches!(err, Error::SelfEvicted(1)));
        assert!(loop_.reactor.rebooted());
    }

    #[test]
    fn membership_outage_halts_the_loop() {
        let dev = device_with_header(8);
        let membership = FakeMembership::new(1, [1]);
        membership.set_alive(false);
        let reactor = RecordingReactor::new();
        let board = Arc::new(ScoreBoard::new(1, 1));
        let mut loop_ = QuorumLoop::open(dev, 1, membership, reactor, Box::new(WallClock), config(), board, false).unwrap();
        assert!(matches!(loop_.run_cycle(), Err(Error::MembershipUnavailable)));
    }

    #[test]
    fn logout_publishes_none_and_is_idempotent() {
        let dev = device_with_header(8);
        let membership = FakeMembership::new(1, [1]);
        let reactor = RecordingReactor::new();
        let board = Arc::new(ScoreBoard::new(1, 1));
        let mut loop_ = QuorumLoop::open(dev, 1, membership, reactor, Box::new(WallClock), config(), board, false).unwrap();
        loop_.logout();
        loop_.logout();
        assert_eq!(loop_.engine.state(), State::None);
    }
}
