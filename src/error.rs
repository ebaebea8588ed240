//! Error types for device operations and the solver pipeline.

/// Something went wrong on the modelled device.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Device arena exhausted allocating {requested} bytes for {label} ({available} bytes left)")]
    OutOfMemory {
        label: &'static str,
        requested: usize,
        available: usize,
    },
    #[error("Kernel {kernel} rejected launch with {blocks} blocks")]
    InvalidLaunch { kernel: &'static str, blocks: usize },
    #[error("Kernel {kernel} faulted: {message}")]
    KernelFault {
        kernel: &'static str,
        message: String,
    },
    #[error("Synchronous check after {operation} failed: {message}")]
    SyncCheck {
        operation: &'static str,
        message: String,
    },
    #[error("Queue {0} has shut down")]
    QueueShutDown(&'static str),
}

/// Errors returned from the host-facing pipeline API.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("Invalid step input: {0}")]
    InvalidInput(String),
    #[error("Two steps are already in flight, call sync_dma_back first")]
    TooManyStepsInFlight,
    #[error("No step is in flight")]
    NoStepInFlight,
}
