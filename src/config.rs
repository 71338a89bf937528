use crate::bdd::BddConfig;

/// Thresholds deciding when a soft merge pass is worth running.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MergeThresholds {
    /// Below this many live predicates the low threshold applies.
    pub total_aps: usize,
    pub low_mergeable: usize,
    pub high_mergeable: usize,
}

impl Default for MergeThresholds {
    fn default() -> Self {
        Self {
            total_aps: 500,
            low_mergeable: 10,
            high_mergeable: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum CheckerMode {
    /// Walk the topology on the fly, filtering at every step.
    #[default]
    Direct,
    /// Build the forwarding graph of the moved predicates first.
    Graph,
}

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Track identical location vectors and merge predicates that share them.
    pub merge_aps: bool,
    pub merge_thresholds: MergeThresholds,
    /// Keep ACL state in a partition of its own.
    pub division: bool,
    pub checker: CheckerMode,
    pub check_loops: bool,
    pub check_blackholes: bool,
    /// Collect BDD garbage every this many updates.
    pub gc_interval: usize,
    pub bdd: BddConfig,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            merge_aps: true,
            merge_thresholds: MergeThresholds::default(),
            division: false,
            checker: CheckerMode::default(),
            check_loops: true,
            check_blackholes: true,
            gc_interval: 100_000,
            bdd: BddConfig::default(),
        }
    }
}

impl VerifierConfig {
    pub fn with_merge_aps(mut self, merge_aps: bool) -> Self {
        self.merge_aps = merge_aps;
        self
    }

    pub fn with_merge_thresholds(mut self, thresholds: MergeThresholds) -> Self {
        self.merge_thresholds = thresholds;
        self
    }

    pub fn with_division(mut self, division: bool) -> Self {
        self.division = division;
        self
    }

    pub fn with_checker(mut self, checker: CheckerMode) -> Self {
        self.checker = checker;
        self
    }

    pub fn with_check_loops(mut self, check_loops: bool) -> Self {
        self.check_loops = check_loops;
        self
    }

    pub fn with_check_blackholes(mut self, check_blackholes: bool) -> Self {
        self.check_blackholes = check_blackholes;
        self
    }

    pub fn with_gc_interval(mut self, gc_interval: usize) -> Self {
        self.gc_interval = gc_interval;
        self
    }

    pub fn with_bdd(mut self, bdd: BddConfig) -> Self {
        self.bdd = bdd;
        self
    }
}
