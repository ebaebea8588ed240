//! Pipeline-wide and per-step configuration.

use std::time::Duration;

/// Configuration that stays fixed for the lifetime of a [`SolverPipeline`][crate::SolverPipeline].
///
/// [`Default`] gives values suitable for typical game-scale scenes;
/// use the `with_*` methods to tweak individual settings.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-types", serde(default))]
pub struct PipelineConfig {
    /// Capacity of the per-step device arena in bytes.
    pub device_memory_bytes: usize,
    /// Block on and check every queue operation right after issuing it.
    ///
    /// Errors are then returned from the issuing call instead of only being recorded
    /// on the diagnostic channel. Costs a few percent of throughput.
    pub sync_checks: bool,
    /// How long [`sync_dma_back`][crate::SolverPipeline::sync_dma_back] spins on the
    /// completion flag before falling back to a blocking wait.
    pub spin_wait_timeout: Duration,
    /// Number of consecutive partitions that share one slab.
    pub partitions_per_slab: u32,
    /// Maximum number of static constraints of one body solved in the same static slab.
    pub static_slab_size: u32,
    /// Fraction of penetration corrected per position iteration.
    pub bias_coefficient: f64,
    /// Upper limit for the separating velocity used to resolve penetration.
    pub max_depenetration_velocity: f64,
    /// Approach speeds below this don't cause restitution.
    pub bounce_threshold: f64,
    /// Mass-normalized kinetic energy below which stabilization damps a body.
    pub stabilization_threshold: f64,
    /// Velocity multiplier applied by stabilization.
    pub stabilization_damping: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            device_memory_bytes: 256 * 1024 * 1024,
            sync_checks: false,
            spin_wait_timeout: Duration::from_micros(100),
            partitions_per_slab: 32,
            static_slab_size: 32,
            bias_coefficient: 0.8,
            max_depenetration_velocity: 5.0,
            bounce_threshold: 2.0,
            stabilization_threshold: 1e-4,
            stabilization_damping: 0.5,
        }
    }
}

impl PipelineConfig {
    pub fn with_device_memory(mut self, bytes: usize) -> Self {
        self.device_memory_bytes = bytes;
        self
    }

    pub fn with_sync_checks(mut self, enabled: bool) -> Self {
        self.sync_checks = enabled;
        self
    }

    pub fn with_spin_wait_timeout(mut self, timeout: Duration) -> Self {
        self.spin_wait_timeout = timeout;
        self
    }

    /// Set the number of partitions per slab. Clamped to at least one.
    ///
    /// With one partition per slab every partition is averaged Jacobi-style;
    /// larger values let velocities flow Gauss-Seidel style between partitions.
    pub fn with_partitions_per_slab(mut self, count: u32) -> Self {
        self.partitions_per_slab = count.max(1);
        self
    }

    pub fn with_static_slab_size(mut self, count: u32) -> Self {
        self.static_slab_size = count.max(1);
        self
    }

    pub fn with_bias_coefficient(mut self, coef: f64) -> Self {
        self.bias_coefficient = coef;
        self
    }
}

/// Switches that can change from one step to the next.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-types", serde(default))]
pub struct StepFlags {
    /// Damp slow-moving bodies that are in contact during integration.
    pub enable_stabilization: bool,
    /// Run the force threshold pipeline and report threshold changes.
    pub has_force_thresholds: bool,
    /// Solve friction in every position iteration instead of only the last three.
    pub friction_every_iteration: bool,
    /// Accumulate constraint residuals and copy them back to the host.
    pub residual_reporting: bool,
}

/// Friction is only solved in this many trailing position iterations
/// unless [`StepFlags::friction_every_iteration`] is set.
pub const FRICTION_TRAILING_ITERATIONS: u32 = 3;
