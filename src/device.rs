//! The modelled accelerator: shared device context, kernel launches and parallel fan-out.
//!
//! Work reaches the device through [`Queue`][queue::Queue]s.
//! Each queue executes its commands in issue order on its own worker thread,
//! and kernels fan out over their blocks with rayon when the `parallel` feature is on.

pub mod arena;
pub mod queue;

use parking_lot::Mutex;
use std::{
    cell::Cell,
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::DeviceError;

/// Number of lanes in one constraint batch, the unit of parallel dispatch.
pub const WARP_SIZE: usize = 32;

/// Launches with more blocks than this are rejected.
pub const MAX_GRID_BLOCKS: usize = 1 << 24;

/// Threads per block for the different kernel families.
pub mod block_dim {
    pub const PREPARE: usize = 128;
    pub const SOLVE: usize = 64;
    pub const BODIES: usize = 128;
    pub const WRITEBACK: usize = 128;
    pub const THRESHOLD: usize = 256;
    pub const COPY: usize = 256;
}

/// Name and grid size of one kernel dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelLaunch {
    pub name: &'static str,
    pub blocks: usize,
}

impl KernelLaunch {
    pub fn new(name: &'static str, blocks: usize) -> Self {
        Self { name, blocks }
    }

    /// A launch with enough blocks of `block_dim` threads to cover `threads` threads.
    pub fn for_threads(name: &'static str, threads: usize, block_dim: usize) -> Self {
        Self {
            name,
            blocks: (threads + block_dim - 1) / block_dim,
        }
    }

    /// One warp per batch, packed into solve-sized blocks.
    pub fn for_batches(name: &'static str, batches: usize) -> Self {
        Self::for_threads(name, batches * WARP_SIZE, block_dim::SOLVE)
    }
}

/// An error reported on the diagnostic channel, in the order it was reported.
#[derive(Clone, Debug, PartialEq)]
pub struct DiagnosticRecord {
    pub sequence: usize,
    /// The queue the error was raised on, `None` for errors raised on the host.
    pub queue: Option<&'static str>,
    pub error: DeviceError,
}

thread_local! {
    static CURRENT_QUEUE: Cell<Option<&'static str>> = Cell::new(None);
}

/// Attribute errors reported from this thread to `queue`.
pub(crate) fn set_current_queue(queue: &'static str) {
    CURRENT_QUEUE.with(|current| current.set(Some(queue)));
}

#[derive(Debug, Default)]
struct ContextInner {
    abort_mode: AtomicBool,
    sync_checks: bool,
    diagnostics: Mutex<Vec<DiagnosticRecord>>,
    dispatches: Mutex<HashMap<&'static str, u64>>,
}

/// State shared by every queue and subsystem using the same device.
///
/// Holds the device-wide abort flag and the diagnostic channel errors are reported to.
/// Cloning gives another handle to the same context.
/// Create one per process and pass clones to everything that talks to the device.
#[derive(Clone, Debug, Default)]
pub struct DeviceContext {
    inner: Arc<ContextInner>,
}

impl DeviceContext {
    pub fn new(sync_checks: bool) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                sync_checks,
                ..Default::default()
            }),
        }
    }

    pub fn sync_checks(&self) -> bool {
        self.inner.sync_checks
    }

    /// Put the device in abort mode.
    ///
    /// Kernels issued afterwards are skipped and threshold outputs are suppressed
    /// until [`clear_abort_mode`][Self::clear_abort_mode] is called.
    pub fn enter_abort_mode(&self) {
        if !self.inner.abort_mode.swap(true, Ordering::AcqRel) {
            log::error!("device entered abort mode");
        }
    }

    pub fn clear_abort_mode(&self) {
        self.inner.abort_mode.store(false, Ordering::Release);
    }

    pub fn is_in_abort_mode(&self) -> bool {
        self.inner.abort_mode.load(Ordering::Acquire)
    }

    /// Record an error on the diagnostic channel,
    /// attributed to the queue whose worker thread is reporting it.
    pub fn report(&self, error: DeviceError) {
        let queue = CURRENT_QUEUE.with(Cell::get);
        self.report_on(queue, error);
    }

    /// Record an error on the diagnostic channel on behalf of `queue`.
    pub fn report_on(&self, queue: Option<&'static str>, error: DeviceError) {
        match queue {
            Some(queue) => log::error!("[{}] {}", queue, error),
            None => log::error!("{}", error),
        }
        let mut diagnostics = self.inner.diagnostics.lock();
        let sequence = diagnostics.len();
        diagnostics.push(DiagnosticRecord {
            sequence,
            queue,
            error,
        });
    }

    /// Number of errors reported so far.
    pub fn error_count(&self) -> usize {
        self.inner.diagnostics.lock().len()
    }

    /// Errors reported after the first `start` ones.
    pub fn errors_since(&self, start: usize) -> Vec<DiagnosticRecord> {
        let diagnostics = self.inner.diagnostics.lock();
        diagnostics.get(start..).unwrap_or(&[]).to_vec()
    }

    /// How many times a kernel with this name has been enqueued.
    pub fn dispatch_count(&self, kernel: &str) -> u64 {
        self.inner
            .dispatches
            .lock()
            .get(kernel)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn record_dispatch(&self, kernel: &'static str) {
        *self.inner.dispatches.lock().entry(kernel).or_insert(0) += 1;
    }
}

//
// Parallel fan-out inside kernels
//

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Apply `f` to every item and collect the results in order,
/// in parallel with the `parallel` feature.
pub(crate) fn map_each_mut<T, R, F>(items: &mut [T], f: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(usize, &mut T) -> R + Send + Sync,
{
    #[cfg(feature = "parallel")]
    {
        items
            .par_iter_mut()
            .enumerate()
            .map(|(idx, item)| f(idx, item))
            .collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        items
            .iter_mut()
            .enumerate()
            .map(|(idx, item)| f(idx, item))
            .collect()
    }
}

/// Apply `f` to every index in `0..count` and collect the results in order.
pub(crate) fn map_range<R, F>(count: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(usize) -> R + Send + Sync,
{
    #[cfg(feature = "parallel")]
    {
        (0..count).into_par_iter().map(f).collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        (0..count).map(f).collect()
    }
}
