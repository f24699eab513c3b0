//! A purely observational writer of a human-readable snapshot for
//! operators. Never participates in the protocol; reads whatever the loop
//! already computed this cycle.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use crate::bitmap::Bitmap;
use crate::tracker::PeerTracker;
use crate::types::{NodeId, State};

/// One cycle's worth of operator-facing state.
#[derive(Debug, Clone)]
pub struct Report {
    pub timestamp: u64,
    pub my_id: NodeId,
    pub score: u64,
    pub score_req: u64,
    pub score_max: u64,
    pub state: State,
    /// Nodes observed in `INIT` that have produced at least one heartbeat.
    pub init_set: BTreeSet<NodeId>,
    /// Nodes tracked `>= RUN`, plus ourselves.
    pub visible_set: BTreeSet<NodeId>,
    pub master: Option<NodeId>,
    /// The master's published quorate set, when a master is known.
    pub master_mask: Option<Bitmap>,
    /// Full peer record dump, only populated under `-d`.
    pub debug_dump: Option<String>,
}

impl Report {
    /// Build a snapshot from this cycle's tracker state. `master_mask`
    /// should be the mask the identified master most recently published
    /// (read from its peer record, or our own if we are the master).
    pub fn build(
        my_id: NodeId,
        timestamp: u64,
        score: u64,
        score_req: u64,
        score_max: u64,
        state: State,
        tracker: &PeerTracker,
        master: Option<NodeId>,
        master_mask: Option<Bitmap>,
        debug: bool,
    ) -> Self {
        let mut init_set = BTreeSet::new();
        let mut visible_set = BTreeSet::new();
        visible_set.insert(my_id);

        for (&id, rec) in tracker.peers() {
            if rec.status.state == State::Init && rec.seen > 0 {
                init_set.insert(id);
            }
            if rec.state >= State::Run {
                visible_set.insert(id);
            }
        }

        let debug_dump = debug.then(|| dump_peers(tracker));

        Self { timestamp, my_id, score, score_req, score_max, state, init_set, visible_set, master, master_mask, debug_dump }
    }

    /// Render the human-readable form written to the status file.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Time Stamp: {}", self.timestamp);
        let _ = writeln!(out, "Node ID: {}", self.my_id);
        let _ = writeln!(out, "Score: {}/{} (Minimum required = {})", self.score, self.score_max, self.score_req);
        let _ = writeln!(out, "Current state: {:?}", self.state);
        let _ = writeln!(out, "Initializing Set: {{{}}}", format_ids(&self.init_set));
        let _ = writeln!(out, "Visible Set: {{{}}}", format_ids(&self.visible_set));

        if self.state == State::Init {
            return out;
        }

        match self.master {
            Some(id) => {
                let _ = writeln!(out, "Master Node ID: {id}");
            }
            None => {
                let _ = writeln!(out, "Master Node ID: (none)");
            }
        }

        if let Some(mask) = &self.master_mask {
            let ids: Vec<NodeId> = mask.iter().collect();
            let _ = writeln!(out, "Quorate Set: {{{}}}", format_ids_vec(&ids));
        }

        if let Some(dump) = &self.debug_dump {
            out.push_str(dump);
        }

        out
    }
}

fn format_ids(ids: &BTreeSet<NodeId>) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(" ")
}

fn format_ids_vec(ids: &[NodeId]) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(" ")
}

fn dump_peers(tracker: &PeerTracker) -> String {
    let mut out = String::new();
    let mut ids: Vec<NodeId> = tracker.peers().map(|(id, _)| *id).collect();
    ids.sort_unstable();
    for id in ids {
        let rec = tracker.peer(id).expect("id collected from tracker.peers()");
        let _ = writeln!(out, "node_info [node {id}] {{");
        let _ = writeln!(out, "    incarnation = {}", rec.incarnation);
        let _ = writeln!(out, "    evil_incarnation = {}", rec.evil_incarnation);
        let _ = writeln!(out, "    last_seen = {}", rec.last_seen);
        let _ = writeln!(out, "    misses = {}", rec.misses);
        let _ = writeln!(out, "    seen = {}", rec.seen);
        let _ = writeln!(out, "    msg = {:?}", rec.msg);
        let _ = writeln!(out, "    last_msg = {:?}", rec.last_msg);
        let _ = writeln!(out, "    state = {:?}", rec.state);
        let _ = writeln!(out, "}}");
    }
    out
}

/// Where the reporter writes: a file path, stdout (`-`), or nowhere if
/// `status_file` is unconfigured.
pub enum ReportSink {
    None,
    Stdout,
    File(std::path::PathBuf),
}

impl ReportSink {
    pub fn from_config(status_file: &Option<String>) -> Self {
        match status_file.as_deref() {
            None => ReportSink::None,
            Some("-") => ReportSink::Stdout,
            Some(path) => ReportSink::File(std::path::PathBuf::from(path)),
        }
    }

    pub fn emit(&self, report: &Report) -> std::io::Result<()> {
        match self {
            ReportSink::None => Ok(()),
            ReportSink::Stdout => {
                print!("{}", report.render());
                Ok(())
            }
            ReportSink::File(path) => std::fs::write(path, report.render()),
        }
    }
}
