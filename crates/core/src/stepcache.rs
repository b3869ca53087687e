use ndarray::Array4;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Caching behavior requested by a job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CacheMode {
    /// Compute every step.
    #[default]
    Off,
    /// Reuse when the accumulated state distance stays below a fixed
    /// threshold.
    Fixed { threshold: f32 },
    /// Derive the threshold from a calibration pass targeting a speed
    /// multiplier (e.g. 1.75 means "skip enough to run 1.75x faster").
    Auto { target_speedup: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDecision {
    Compute,
    Reuse,
}

/// Conditioning branch a cache instance belongs to. Classifier-free
/// guidance runs two trajectories that drift independently, so each gets
/// its own cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Branch {
    Conditional,
    Unconditional,
}

/// Decides, per denoising step, whether to recompute or reuse the last
/// computed residual. Implementations are stateful across one run.
pub trait SkipPolicy: Send {
    fn decide(&mut self, step_index: usize, distance: f32) -> CacheDecision;
    /// Called after a `Compute` step so the policy can reset its
    /// accumulated-drift state.
    fn note_compute(&mut self, step_index: usize);
}

/// Threshold policy: reuse while the distance accumulated since the last
/// computed step stays under `threshold`, with a cap on consecutive
/// reuses to bound drift.
#[derive(Debug, Clone)]
pub struct FixedThreshold {
    threshold: f32,
    max_consecutive_reuse: usize,
    accumulated: f32,
    consecutive_reuse: usize,
    has_baseline: bool,
}

pub const DEFAULT_MAX_CONSECUTIVE_REUSE: usize = 3;

impl FixedThreshold {
    pub fn new(threshold: f32, max_consecutive_reuse: usize) -> Self {
        Self {
            threshold,
            max_consecutive_reuse,
            accumulated: 0.0,
            consecutive_reuse: 0,
            has_baseline: false,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl SkipPolicy for FixedThreshold {
    fn decide(&mut self, step_index: usize, distance: f32) -> CacheDecision {
        if step_index == 0 || !self.has_baseline {
            return CacheDecision::Compute;
        }

        self.accumulated += distance;
        if self.accumulated < self.threshold
            && self.consecutive_reuse < self.max_consecutive_reuse
        {
            self.consecutive_reuse += 1;
            CacheDecision::Reuse
        } else {
            CacheDecision::Compute
        }
    }

    fn note_compute(&mut self, _step_index: usize) {
        self.accumulated = 0.0;
        self.consecutive_reuse = 0;
        self.has_baseline = true;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub computed: usize,
    pub reused: usize,
}

impl CacheStats {
    pub fn total(&self) -> usize {
        self.computed + self.reused
    }
}

/// Per-branch step cache: the active policy plus the last computed
/// residual. Scoped to one job; residuals never cross jobs.
pub struct StepCache {
    policy: Box<dyn SkipPolicy>,
    residual: Option<Array4<f32>>,
    stats: CacheStats,
}

impl StepCache {
    pub fn new(policy: Box<dyn SkipPolicy>) -> Self {
        Self {
            policy,
            residual: None,
            stats: CacheStats::default(),
        }
    }

    /// Step 0 is always `Compute`; `Reuse` is only returned when a prior
    /// computed residual exists for this branch.
    pub fn decide(&mut self, step_index: usize, distance: f32) -> CacheDecision {
        if self.residual.is_none() {
            self.stats.computed += 1;
            return CacheDecision::Compute;
        }

        match self.policy.decide(step_index, distance) {
            CacheDecision::Reuse => {
                self.stats.reused += 1;
                CacheDecision::Reuse
            }
            CacheDecision::Compute => {
                self.stats.computed += 1;
                CacheDecision::Compute
            }
        }
    }

    pub fn record(&mut self, step_index: usize, residual: Array4<f32>) {
        self.policy.note_compute(step_index);
        self.residual = Some(residual);
    }

    pub fn residual(&self) -> Option<&Array4<f32>> {
        self.residual.as_ref()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

/// Cache pair for classifier-free guidance runs.
pub struct BranchCaches {
    conditional: StepCache,
    unconditional: StepCache,
}

impl BranchCaches {
    pub fn for_mode(mode: CacheMode, calibration: Option<&[f32]>) -> Self {
        Self {
            conditional: StepCache::new(policy_for_mode(mode, calibration)),
            unconditional: StepCache::new(policy_for_mode(mode, calibration)),
        }
    }

    pub fn cache_mut(&mut self, branch: Branch) -> &mut StepCache {
        match branch {
            Branch::Conditional => &mut self.conditional,
            Branch::Unconditional => &mut self.unconditional,
        }
    }

    pub fn stats(&self) -> (CacheStats, CacheStats) {
        (self.conditional.stats(), self.unconditional.stats())
    }
}

fn policy_for_mode(mode: CacheMode, calibration: Option<&[f32]>) -> Box<dyn SkipPolicy> {
    match mode {
        CacheMode::Off => Box::new(FixedThreshold::new(0.0, 0)),
        CacheMode::Fixed { threshold } => Box::new(FixedThreshold::new(
            threshold,
            DEFAULT_MAX_CONSECUTIVE_REUSE,
        )),
        CacheMode::Auto { target_speedup } => {
            let distances = calibration.unwrap_or(&[]);
            let threshold = calibrate_threshold(
                distances,
                target_speedup,
                DEFAULT_MAX_CONSECUTIVE_REUSE,
            );
            debug!(threshold, target_speedup, "Calibrated step-skip threshold");
            Box::new(FixedThreshold::new(
                threshold,
                DEFAULT_MAX_CONSECUTIVE_REUSE,
            ))
        }
    }
}

/// Simulate a threshold policy over a recorded calibration pass and
/// return the achieved speedup (total steps / computed steps).
pub fn simulate_speedup(distances: &[f32], threshold: f32, max_consecutive_reuse: usize) -> f32 {
    if distances.is_empty() {
        return 1.0;
    }

    let mut cache = StepCache::new(Box::new(FixedThreshold::new(
        threshold,
        max_consecutive_reuse,
    )));
    for (step, distance) in distances.iter().enumerate() {
        if cache.decide(step, *distance) == CacheDecision::Compute {
            cache.record(step, Array4::zeros((1, 1, 1, 1)));
        }
    }

    let stats = cache.stats();
    stats.total() as f32 / stats.computed.max(1) as f32
}

/// Find the lowest threshold whose simulated run over the calibration
/// distances reaches at least `target_speedup`. Candidates are drawn from
/// the running sums the policy would actually compare against, so the
/// scan is exact. Returns the largest candidate as a best effort when the
/// target is unreachable (the consecutive-reuse cap bounds speedup at
/// `max_consecutive_reuse + 1`).
pub fn calibrate_threshold(
    distances: &[f32],
    target_speedup: f32,
    max_consecutive_reuse: usize,
) -> f32 {
    if distances.is_empty() || target_speedup <= 1.0 {
        return 0.0;
    }

    // Every decision compares an accumulated sum of consecutive distances
    // against the threshold, so decision patterns only change at those
    // sums. Enumerate the sums of runs the reuse cap permits and scan them
    // in ascending order.
    // The sum can span the capped reuses plus the compute that ends them.
    let run_limit = max_consecutive_reuse.max(1) + 1;
    let mut candidates: Vec<f32> = Vec::new();
    for start in 0..distances.len() {
        let mut running = 0.0f32;
        for d in distances.iter().skip(start).take(run_limit) {
            running += d;
            candidates.push(running + f32::EPSILON.max(running.abs() * 1e-6));
        }
    }
    candidates.sort_by(|a, b| a.total_cmp(b));
    candidates.dedup();

    for candidate in &candidates {
        if simulate_speedup(distances, *candidate, max_consecutive_reuse) >= target_speedup {
            return *candidate;
        }
    }

    candidates.last().copied().unwrap_or(0.0)
}
