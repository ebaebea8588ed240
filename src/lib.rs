//! A partitioned iterative constraint solver pipeline for rigid and articulated bodies,
//! executed on a software-modelled accelerator with two in-order command queues.
//!
//! The entry point is [`SolverPipeline`][pipeline::SolverPipeline].
//! A step is issued with [`step`][pipeline::SolverPipeline::step]
//! and its results collected with [`sync_dma_back`][pipeline::SolverPipeline::sync_dma_back].

/// Open a tracy profiling zone that lasts until the returned value is dropped.
///
/// Evaluates to `None` when no tracy client is running,
/// so this is free unless the `tracy` feature is enabled.
#[macro_export]
macro_rules! tracy_span {
    ($name:expr, $fn_name:expr) => {
        tracy_client::Client::running()
            .map(|client| client.span_alloc(Some($name), $fn_name, file!(), line!(), 0))
    };
}

pub mod math;
pub use math::{uv, Mat3, Pose, Rotor3, Vec3, Velocity};

pub mod config;
pub use config::{PipelineConfig, StepFlags};

pub mod error;
pub use error::{DeviceError, PipelineError};

pub mod device;
pub use device::{arena::DeviceArena, queue::Queue, DeviceContext};

pub mod solver;
pub use solver::{
    articulation::{ArticulationSolver, LinkRef, NullArticulationSolver},
    extended::{ExtendedBodyKind, ExtendedBodySolver, ExtendedSolverRegistry},
    residual::{ErrorAccumulator, IslandResidual},
    threshold::{ForceChange, ThresholdChange},
    BodyKind, ConstraintBatch, ConstraintBody, ContactDesc, ContactPoint, IslandDesc, JointDesc,
    JointRow, PartitionDesc, SolverBodyDesc, StepInput,
};

pub mod pipeline;
pub use pipeline::{SolverPipeline, StepOutput};
