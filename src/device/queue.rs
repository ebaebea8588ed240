//! In-order command queues, cross-queue events and the pinned completion flag.
//!
//! A [`Queue`] owns a worker thread that executes commands strictly in issue order.
//! Ordering between queues only exists where one queue [`wait`][Queue::wait]s
//! on an [`Event`] another queue [`record`][Queue::record]ed.

use parking_lot::{Condvar, Mutex};
use std::{
    any::Any,
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use super::{set_current_queue, DeviceContext, KernelLaunch, MAX_GRID_BLOCKS};
use crate::DeviceError;

type CommandFn = Box<dyn FnOnce() -> Result<(), DeviceError> + Send + 'static>;

enum Command {
    /// Skipped while the device is in abort mode.
    Kernel { name: &'static str, run: CommandFn },
    /// Memory transfers run regardless of abort mode.
    Copy { name: &'static str, run: CommandFn },
    Signal { event: Event, ticket: u64 },
    Wait { event: Event, ticket: u64 },
    WriteFlag { flag: PinnedFlag, value: u64 },
}

#[derive(Default)]
struct QueueState {
    commands: VecDeque<Command>,
    busy: bool,
    shutdown: bool,
}

#[derive(Default)]
struct QueueShared {
    state: Mutex<QueueState>,
    wake: Condvar,
    idle: Condvar,
}

/// An in-order device command queue.
pub struct Queue {
    name: &'static str,
    ctx: DeviceContext,
    shared: Arc<QueueShared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("name", &self.name).finish()
    }
}

impl Queue {
    pub fn new(name: &'static str, ctx: DeviceContext) -> Self {
        let shared = Arc::new(QueueShared::default());
        let worker = {
            let shared = shared.clone();
            let ctx = ctx.clone();
            thread::Builder::new()
                .name(format!("queue-{}", name))
                .spawn(move || {
                    set_current_queue(name);
                    worker_loop(ctx, shared)
                })
                .ok()
        };
        if worker.is_none() {
            ctx.report_on(Some(name), DeviceError::QueueShutDown(name));
        }
        Self {
            name,
            ctx,
            shared,
            worker,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue a kernel.
    ///
    /// Zero-block launches are dropped without being enqueued.
    /// Launches the device can't execute are reported and dropped;
    /// with sync checks enabled this also returns the error.
    pub fn launch<F>(&self, launch: KernelLaunch, kernel: F) -> Result<(), DeviceError>
    where
        F: FnOnce() -> Result<(), DeviceError> + Send + 'static,
    {
        if launch.blocks == 0 {
            return Ok(());
        }
        let errors_before = self.ctx.error_count();
        if launch.blocks > MAX_GRID_BLOCKS {
            self.ctx.report_on(
                Some(self.name),
                DeviceError::InvalidLaunch {
                    kernel: launch.name,
                    blocks: launch.blocks,
                },
            );
        } else {
            self.ctx.record_dispatch(launch.name);
            self.push(Command::Kernel {
                name: launch.name,
                run: Box::new(kernel),
            })?;
        }
        self.check(launch.name, errors_before)
    }

    /// Enqueue a memory transfer.
    pub fn copy<F>(&self, name: &'static str, transfer: F) -> Result<(), DeviceError>
    where
        F: FnOnce() -> Result<(), DeviceError> + Send + 'static,
    {
        let errors_before = self.ctx.error_count();
        self.push(Command::Copy {
            name,
            run: Box::new(transfer),
        })?;
        self.check(name, errors_before)
    }

    /// Signal `event` once every command issued so far has completed.
    pub fn record(&self, event: &Event) -> Result<(), DeviceError> {
        let ticket = event.next_ticket();
        self.push(Command::Signal {
            event: event.clone(),
            ticket,
        })
    }

    /// Hold every command issued after this until the latest record of `event` has signaled.
    ///
    /// Waiting on an event that was never recorded is a no-op.
    pub fn wait(&self, event: &Event) -> Result<(), DeviceError> {
        let ticket = event.latest_ticket();
        if ticket == 0 {
            return Ok(());
        }
        self.push(Command::Wait {
            event: event.clone(),
            ticket,
        })
    }

    /// Set `flag` to `value` once every command issued so far has completed.
    pub fn write_flag(&self, flag: &PinnedFlag, value: u64) -> Result<(), DeviceError> {
        self.push(Command::WriteFlag {
            flag: flag.clone(),
            value,
        })
    }

    /// Block until the queue has executed everything issued to it.
    pub fn synchronize(&self) {
        let mut state = self.shared.state.lock();
        while state.busy || !state.commands.is_empty() {
            self.shared.idle.wait(&mut state);
        }
    }

    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.lock();
        !state.busy && state.commands.is_empty()
    }

    fn push(&self, command: Command) -> Result<(), DeviceError> {
        if self.worker.is_none() {
            return Err(DeviceError::QueueShutDown(self.name));
        }
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(DeviceError::QueueShutDown(self.name));
        }
        state.commands.push_back(command);
        self.shared.wake.notify_one();
        Ok(())
    }

    fn check(&self, operation: &'static str, errors_before: usize) -> Result<(), DeviceError> {
        if !self.ctx.sync_checks() {
            return Ok(());
        }
        self.synchronize();
        // errors other queues raised in the meantime belong to their own operations
        let own_error = self
            .ctx
            .errors_since(errors_before)
            .into_iter()
            .find(|record| record.queue == Some(self.name));
        match own_error {
            Some(record) => Err(DeviceError::SyncCheck {
                operation,
                message: record.error.to_string(),
            }),
            None => Ok(()),
        }
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.wake.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(ctx: DeviceContext, shared: Arc<QueueShared>) {
    loop {
        let command = {
            let mut state = shared.state.lock();
            loop {
                if let Some(command) = state.commands.pop_front() {
                    state.busy = true;
                    break command;
                }
                if state.shutdown {
                    return;
                }
                shared.wake.wait(&mut state);
            }
        };

        match command {
            Command::Kernel { name, run } => {
                if ctx.is_in_abort_mode() {
                    log::trace!("abort mode, skipping kernel {}", name);
                } else {
                    execute(&ctx, name, run);
                }
            }
            Command::Copy { name, run } => execute(&ctx, name, run),
            Command::Signal { event, ticket } => event.signal(ticket),
            Command::Wait { event, ticket } => event.wait_for(ticket),
            Command::WriteFlag { flag, value } => flag.set(value),
        }

        let mut state = shared.state.lock();
        state.busy = false;
        if state.commands.is_empty() {
            shared.idle.notify_all();
        }
    }
}

fn execute(ctx: &DeviceContext, name: &'static str, run: CommandFn) {
    let _span = crate::tracy_span!(name, "execute");
    match panic::catch_unwind(AssertUnwindSafe(run)) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => ctx.report(err),
        Err(payload) => {
            ctx.report(DeviceError::KernelFault {
                kernel: name,
                message: panic_message(payload.as_ref()),
            });
            ctx.enter_abort_mode();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

//
// Events
//

#[derive(Debug, Default)]
struct EventState {
    recorded: u64,
    signaled: u64,
}

#[derive(Debug, Default)]
struct EventInner {
    state: Mutex<EventState>,
    cond: Condvar,
}

/// A join point between queues.
///
/// Every [`Queue::record`] creates a new ticket;
/// [`Queue::wait`] waits for the ticket that was latest at the time of the call.
#[derive(Clone, Debug, Default)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether every record of this event has signaled.
    pub fn query(&self) -> bool {
        let state = self.inner.state.lock();
        state.signaled >= state.recorded
    }

    /// Block the host until every record of this event has signaled.
    pub fn synchronize(&self) {
        let ticket = self.latest_ticket();
        self.wait_for(ticket);
    }

    fn next_ticket(&self) -> u64 {
        let mut state = self.inner.state.lock();
        state.recorded += 1;
        state.recorded
    }

    fn latest_ticket(&self) -> u64 {
        self.inner.state.lock().recorded
    }

    fn signal(&self, ticket: u64) {
        let mut state = self.inner.state.lock();
        state.signaled = state.signaled.max(ticket);
        self.inner.cond.notify_all();
    }

    fn wait_for(&self, ticket: u64) {
        let mut state = self.inner.state.lock();
        while state.signaled < ticket {
            self.inner.cond.wait(&mut state);
        }
    }
}

//
// Pinned completion flag
//

/// A host-visible value the device writes as the last action of a piece of work.
///
/// Polling it is much cheaper than a full queue synchronization
/// when the work is expected to be done already.
#[derive(Clone, Debug, Default)]
pub struct PinnedFlag(Arc<AtomicU64>);

impl PinnedFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Release);
    }

    /// Spin until the flag reaches at least `value` or `timeout` passes.
    /// Returns whether the value was reached.
    pub fn spin_wait(&self, value: u64, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.get() >= value {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceContext;

    fn pushing_kernel(
        log: &Arc<Mutex<Vec<u32>>>,
        value: u32,
    ) -> impl FnOnce() -> Result<(), DeviceError> + Send + 'static {
        let log = log.clone();
        move || {
            log.lock().push(value);
            Ok(())
        }
    }

    #[test]
    fn commands_run_in_issue_order() {
        let ctx = DeviceContext::new(false);
        let queue = Queue::new("a", ctx.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            queue
                .launch(KernelLaunch::new("push", 1), pushing_kernel(&log, i))
                .unwrap();
        }
        queue.synchronize();
        assert!(queue.is_idle());
        itertools::assert_equal(log.lock().iter().copied(), 0..50);
        assert_eq!(ctx.dispatch_count("push"), 50);
    }

    #[test]
    fn zero_block_launch_is_not_dispatched() {
        let ctx = DeviceContext::new(false);
        let queue = Queue::new("a", ctx.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        queue
            .launch(KernelLaunch::new("empty", 0), pushing_kernel(&log, 1))
            .unwrap();
        queue.synchronize();
        assert!(log.lock().is_empty());
        assert_eq!(ctx.dispatch_count("empty"), 0);
    }

    #[test]
    fn cross_queue_wait_orders_work() {
        let ctx = DeviceContext::new(false);
        let queue_a = Queue::new("a", ctx.clone());
        let queue_b = Queue::new("b", ctx.clone());
        let event = Event::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let slow_log = log.clone();
        queue_a
            .launch(KernelLaunch::new("slow", 1), move || {
                thread::sleep(Duration::from_millis(20));
                slow_log.lock().push(1);
                Ok(())
            })
            .unwrap();
        queue_a.record(&event).unwrap();
        queue_b.wait(&event).unwrap();
        queue_b.copy("after", pushing_kernel(&log, 2)).unwrap();

        queue_b.synchronize();
        itertools::assert_equal(log.lock().iter().copied(), [1, 2]);
        assert!(event.query());
    }

    #[test]
    fn invalid_launch_is_reported_not_run() {
        let ctx = DeviceContext::new(false);
        let queue = Queue::new("a", ctx.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        let res = queue.launch(
            KernelLaunch::new("huge", MAX_GRID_BLOCKS + 1),
            pushing_kernel(&log, 1),
        );
        assert!(res.is_ok());
        queue.synchronize();
        assert!(log.lock().is_empty());
        assert_eq!(
            ctx.errors_since(0)[0].error,
            DeviceError::InvalidLaunch {
                kernel: "huge",
                blocks: MAX_GRID_BLOCKS + 1
            }
        );
    }

    #[test]
    fn sync_checks_escalate_kernel_errors() {
        let ctx = DeviceContext::new(true);
        let queue = Queue::new("a", ctx.clone());
        let res = queue.launch(KernelLaunch::new("failing", 1), || {
            Err(DeviceError::KernelFault {
                kernel: "failing",
                message: "bad input".to_string(),
            })
        });
        match res {
            Err(DeviceError::SyncCheck { operation, message }) => {
                assert_eq!(operation, "failing");
                assert!(message.contains("bad input"));
            }
            other => panic!("expected sync check failure, got {:?}", other),
        }
    }

    #[test]
    fn sync_checks_ignore_other_queues_errors() {
        let ctx = DeviceContext::new(true);
        let queue_a = Queue::new("a", ctx.clone());
        let queue_b = Queue::new("b", ctx.clone());
        let gate = PinnedFlag::new();

        // b fails while a's launch is still being checked
        let b_gate = gate.clone();
        let failing_b = thread::spawn(move || {
            queue_b.launch(KernelLaunch::new("failing_b", 1), move || {
                b_gate.spin_wait(1, Duration::from_secs(5));
                Err(DeviceError::KernelFault {
                    kernel: "failing_b",
                    message: "bad input".to_string(),
                })
            })
        });
        let res_a = queue_a.launch(KernelLaunch::new("slow_a", 1), move || {
            gate.set(1);
            thread::sleep(Duration::from_millis(50));
            Ok(())
        });

        assert!(res_a.is_ok());
        match failing_b.join().unwrap() {
            Err(DeviceError::SyncCheck { operation, .. }) => assert_eq!(operation, "failing_b"),
            other => panic!("expected sync check failure, got {:?}", other),
        }
        let errors = ctx.errors_since(0);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].queue, Some("b"));
    }

    #[test]
    fn panicking_kernel_enters_abort_mode() {
        let ctx = DeviceContext::new(false);
        let queue = Queue::new("a", ctx.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        queue
            .launch(KernelLaunch::new("panics", 1), || panic!("kernel blew up"))
            .unwrap();
        queue
            .launch(KernelLaunch::new("skipped", 1), pushing_kernel(&log, 1))
            .unwrap();
        queue.copy("copied", pushing_kernel(&log, 2)).unwrap();
        queue.synchronize();

        assert!(ctx.is_in_abort_mode());
        itertools::assert_equal(log.lock().iter().copied(), [2]);
        match &ctx.errors_since(0)[0].error {
            DeviceError::KernelFault { kernel, message } => {
                assert_eq!(*kernel, "panics");
                assert_eq!(message, "kernel blew up");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn pinned_flag_spin_wait() {
        let ctx = DeviceContext::new(false);
        let queue = Queue::new("a", ctx);
        let flag = PinnedFlag::new();
        assert!(!flag.spin_wait(1, Duration::from_micros(10)));

        queue
            .launch(KernelLaunch::new("slow", 1), || {
                thread::sleep(Duration::from_millis(10));
                Ok(())
            })
            .unwrap();
        queue.write_flag(&flag, 1).unwrap();
        // too short to see the slow kernel finish, fall back to blocking
        if !flag.spin_wait(1, Duration::from_micros(1)) {
            queue.synchronize();
        }
        assert_eq!(flag.get(), 1);
    }
}
