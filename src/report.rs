//! Per-update reports and run statistics.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use crate::topology::Position;

/// Outcome of one applied update.
#[derive(Debug, Clone, Default)]
pub struct UpdateReport {
    pub moved_aps: usize,
    /// New loops found by the check that followed the update.
    pub loops: usize,
    pub blackholes: usize,
    /// Live predicates after the update.
    pub ap_count: usize,
    pub classify_time: Duration,
    pub check_time: Duration,
}

/// Aggregate of a run over an update stream.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub updates: usize,
    pub skipped: usize,
    pub inserts: usize,
    pub removes: usize,
    /// Distinct loops found over the run.
    pub loops: usize,
    /// Distinct black-hole positions found over the run.
    pub blackholes: usize,
    pub ap_count: usize,
    /// Predicate count when the first removal triggered the hard merge.
    pub ap_count_after_inserts: Option<usize>,
    pub classify_time: Duration,
    pub check_time: Duration,
}

impl RunSummary {
    pub fn record(&mut self, report: &UpdateReport) {
        self.updates += 1;
        self.ap_count = report.ap_count;
        self.classify_time += report.classify_time;
        self.check_time += report.check_time;
    }

    /// Mean time per applied update.
    pub fn mean_update_time(&self) -> Duration {
        match self.updates {
            0 => Duration::ZERO,
            n => (self.classify_time + self.check_time) / n as u32,
        }
    }
}

impl Display for RunSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "updates:      {} (+{} / -{}, {} skipped)", self.updates, self.inserts, self.removes, self.skipped)?;
        writeln!(f, "atomic preds: {}", self.ap_count)?;
        if let Some(n) = self.ap_count_after_inserts {
            writeln!(f, "after inserts: {}", n)?;
        }
        writeln!(f, "loops:        {}", self.loops)?;
        writeln!(f, "black holes:  {}", self.blackholes)?;
        writeln!(f, "classify:     {:.3?}", self.classify_time)?;
        writeln!(f, "check:        {:.3?}", self.check_time)?;
        write!(f, "per update:   {:.3?}", self.mean_update_time())
    }
}

/// Result of checking one link failure.
#[derive(Debug, Clone)]
pub struct LinkFailureReport {
    pub from: Position,
    pub to: Position,
    pub affected_aps: usize,
    pub construction_time: Duration,
    pub detection_time: Duration,
    pub loops: usize,
}

impl Display for LinkFailureReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {}: {} predicates, {} loops (build {:.3?}, check {:.3?})",
            self.from, self.to, self.affected_aps, self.loops, self.construction_time, self.detection_time
        )
    }
}
