//! Background evaluation of external probes, aggregated into
//! `(score, max_score)` and published for the main loop to sample once
//! per cycle.

use std::collections::VecDeque;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::warn;

/// One configured probe: an external command, how often to run it, how many
/// consecutive successes before it contributes, and its weight.
#[derive(Debug, Clone)]
pub struct ProbeSpec {
    pub name: String,
    pub command: Vec<String>,
    pub interval: Duration,
    pub tko: u32,
    pub weight: u64,
}

/// Runs a probe command to completion and reports success/failure. Split
/// out from [`ProbeSpec`] so tests can substitute a fake without spawning
/// real processes.
pub trait ProbeRunner: Send + Sync {
    fn execute(&self, spec: &ProbeSpec) -> bool;
}

/// Default runner: spawns `command[0]` with the remaining elements as
/// argv, treating a zero exit status as success. No shell is involved, so
/// probe commands cannot be subverted by shell metacharacters in arguments.
pub struct ProcessProbeRunner;

impl ProbeRunner for ProcessProbeRunner {
    fn execute(&self, spec: &ProbeSpec) -> bool {
        let Some((program, args)) = spec.command.split_first() else {
            warn!(probe = %spec.name, "probe has an empty command, treating as failure");
            return false;
        };
        match Command::new(program).args(args).status() {
            Ok(status) => status.success(),
            Err(err) => {
                warn!(probe = %spec.name, error = %err, "probe failed to spawn");
                false
            }
        }
    }
}

/// Mutable run history for one probe.
struct ProbeState {
    spec: ProbeSpec,
    history: VecDeque<bool>,
    last_run: Option<Instant>,
}

impl ProbeState {
    fn new(spec: ProbeSpec) -> Self {
        let capacity = spec_tko(&spec) as usize;
        Self { spec, history: VecDeque::with_capacity(capacity), last_run: None }
    }

    fn record(&mut self, success: bool) {
        self.history.push_back(success);
        while self.history.len() > self.spec.tko as usize {
            self.history.pop_front();
        }
    }

    /// True once the last `tko` executions all succeeded: requires a full
    /// window of successes, not just the most recent one.
    fn passing(&self) -> bool {
        self.spec.tko > 0
            && self.history.len() == self.spec.tko as usize
            && self.history.iter().all(|ok| *ok)
    }

    fn due(&self, now: Instant) -> bool {
        match self.last_run {
            None => true,
            Some(last) => now.duration_since(last) >= self.spec.interval,
        }
    }
}

fn spec_tko(spec: &ProbeSpec) -> u32 {
    spec.tko.max(1)
}

/// Sum passing weight and total weight. The degenerate "no probes" mode
/// fixes `(score, max_score) = (1, 1)` so a node with no configured probes
/// is always eligible.
fn aggregate(states: &[ProbeState]) -> (u64, u64) {
    if states.is_empty() {
        return (1, 1);
    }
    let max_score = states.iter().map(|s| s.spec.weight).sum();
    let score = states.iter().filter(|s| s.passing()).map(|s| s.spec.weight).sum();
    (score, max_score)
}

/// Two atomics, published with `Release` and sampled with `Acquire`.
/// No locking is needed between the scorer thread and the main loop
/// beyond publishing these two integers.
#[derive(Default)]
pub struct ScoreBoard {
    score: AtomicU64,
    max_score: AtomicU64,
}

impl ScoreBoard {
    pub fn new(score: u64, max_score: u64) -> Self {
        let board = Self::default();
        board.publish(score, max_score);
        board
    }

    pub fn publish(&self, score: u64, max_score: u64) {
        self.score.store(score, Ordering::Release);
        self.max_score.store(max_score, Ordering::Release);
    }

    pub fn sample(&self) -> (u64, u64) {
        // Read max_score first: a reader racing a publish sees either the
        // old pair or the new pair, never a stale score paired with a
        // fresher max_score that would make score > max_score spuriously.
        let max_score = self.max_score.load(Ordering::Acquire);
        let score = self.score.load(Ordering::Acquire);
        (score, max_score)
    }
}

/// Drives the configured probes on their own independent paces. Exposes a
/// single-step `tick` so tests can simulate time advancing without a real
/// background thread, and a `spawn` entry point that runs the real thread
/// used in production.
pub struct Scorer {
    states: Vec<ProbeState>,
    board: Arc<ScoreBoard>,
}

impl Scorer {
    pub fn new(specs: Vec<ProbeSpec>) -> Self {
        let states: Vec<ProbeState> = specs.into_iter().map(ProbeState::new).collect();
        let (score, max_score) = aggregate(&states);
        Self { states, board: Arc::new(ScoreBoard::new(score, max_score)) }
    }

    pub fn board(&self) -> Arc<ScoreBoard> {
        self.board.clone()
    }

    /// Run any probe whose interval has elapsed as of `now`, then republish
    /// the aggregate. Pure with respect to wall-clock sleeping, so tests can
    /// drive it with a synthetic `now`.
    pub fn tick(&mut self, runner: &dyn ProbeRunner, now: Instant) {
        for state in &mut self.states {
            if state.due(now) {
                let ok = runner.execute(&state.spec);
                state.record(ok);
                state.last_run = Some(now);
            }
        }
        let (score, max_score) = aggregate(&self.states);
        self.board.publish(score, max_score);
    }

    /// Spawn the production background thread: ticks at a fine grain so
    /// each probe's own interval is honored without busy-waiting.
    pub fn spawn(mut self, runner: impl ProbeRunner + 'static, shutdown: Arc<AtomicBool>) -> ScorerHandle {
        let board = self.board.clone();
        let shutdown_for_handle = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("quorum-scorer".into())
            .spawn(move || {
                const TICK_GRAIN: Duration = Duration::from_millis(200);
                while !shutdown.load(Ordering::Acquire) {
                    self.tick(&runner, Instant::now());
                    std::thread::sleep(TICK_GRAIN);
                }
            })
            .expect("failed to spawn scorer thread");
        ScorerHandle { board, shutdown_flag: Some(shutdown_for_handle), join: Some(handle) }
    }
}

/// Handle to the running scorer thread. Dropping it does not stop the
/// thread; call [`ScorerHandle::join`] after flipping the shared shutdown
/// flag passed to [`Scorer::spawn`].
pub struct ScorerHandle {
    board: Arc<ScoreBoard>,
    shutdown_flag: Option<Arc<AtomicBool>>,
    join: Option<JoinHandle<()>>,
}

impl ScorerHandle {
    pub fn board(&self) -> Arc<ScoreBoard> {
        self.board.clone()
    }

    pub fn join(mut self) {
        if let Some(flag) = self.shutdown_flag.take() {
            flag.store(true, Ordering::Release);
        }
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

/// Derives the required score: `score_min <= 0` means "strict majority of
/// configured weights"; otherwise the configured floor is used verbatim.
/// Logs a warning (does not error) when `score_max` can never satisfy it,
/// the node is then permanently ineligible but the daemon still runs so
/// operators can observe and fix the configuration.
pub fn required_score(score_min: i64, score_max: u64) -> u64 {
    let req = if score_min <= 0 { score_max / 2 + 1 } else { score_min as u64 };
    if score_max < req {
        warn!(score_max, score_req = req, "score_max is below score_req; node is permanently ineligible");
    }
    req
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRunner(bool);
    impl ProbeRunner for FixedRunner {
        fn execute(&self, _spec: &ProbeSpec) -> bool {
            self.0
        }
    }

    fn spec(weight: u64, tko: u32) -> ProbeSpec {
        ProbeSpec { name: "p".into(), command: vec!["true".into()], interval: Duration::from_secs(0), tko, weight }
    }

    #[test]
    fn no_probes_is_the_degenerate_always_eligible_mode() {
        let scorer = Scorer::new(vec![]);
        assert_eq!(scorer.board().sample(), (1, 1));
    }

    #[test]
    fn probe_contributes_weight_only_after_a_full_window_of_successes() {
        let mut scorer = Scorer::new(vec![spec(10, 3)]);
        let runner = FixedRunner(true);
        let mut now = Instant::now();
        for _ in 0..2 {
            scorer.tick(&runner, now);
            assert_eq!(scorer.board().sample(), (0, 10));
            now += Duration::from_secs(1);
        }
        scorer.tick(&runner, now);
        assert_eq!(scorer.board().sample(), (10, 10));
    }

    #[test]
    fn a_single_failure_drops_the_probe_out_of_score_until_it_recovers() {
        let mut scorer = Scorer::new(vec![spec(10, 2)]);
        let mut now = Instant::now();
        scorer.tick(&FixedRunner(true), now);
        now += Duration::from_secs(1);
        scorer.tick(&FixedRunner(true), now);
        assert_eq!(scorer.board().sample(), (10, 10));

        now += Duration::from_secs(1);
        scorer.tick(&FixedRunner(false), now);
        assert_eq!(scorer.board().sample(), (0, 10));
    }

    #[test]
    fn required_score_defaults_to_strict_majority_of_weights() {
        assert_eq!(required_score(0, 10), 6);
        assert_eq!(required_score(-1, 9), 5);
    }

    #[test]
    fn required_score_honors_explicit_minimum() {
        assert_eq!(required_score(3, 10), 3);
    }
}
