//! Event Processor - One Readiness Loop per Worker Thread
//!
//! An [`EventProcessor`] owns a readiness context and the set of processes it
//! serves. Its loop blocks in the readiness wait, dispatches each report to
//! the owning process, and reaps children whose output has closed.
//!
//! # Hand-off:
//! A spawning thread enqueues its process with a ticket, wakes the loop, and
//! waits on the [`SpawnBarrier`] until the loop has installed every queued
//! process up to that ticket. When the spawning thread *is* the loop thread
//! (a listener spawning from a callback) the install happens inline. A
//! spawn from any other processor's loop thread is queued without waiting,
//! so two loops spawning onto each other never block on one another.
//!
//! # Reaping:
//! ```text
//! stdout EOF + stderr EOF ──> closing set ──(every reap_interval)──> try_wait
//! every housekeeping_interval ──> try_wait on all ──> drain output ──> finish
//! ```

use crate::config::PoolConfig;
use crate::poller::{Events, Poller, Readiness, Waker, WAKER_TOKEN};
use crate::process::{Process, ReadOutcome, Stream, WriteOutcome};
use crate::stats::{DispatchTimer, ProcessorStats};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::cell::Cell;
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

thread_local! {
    static ON_PROCESSOR_LOOP: Cell<bool> = const { Cell::new(false) };
}

/// `true` on the loop thread of any event processor.
fn on_processor_loop() -> bool {
    ON_PROCESSOR_LOOP.with(Cell::get)
}

/// Rendezvous between a spawning thread and the loop that installs its process.
///
/// Tickets are issued in increasing order; arriving at ticket `n` releases
/// every waiter holding a ticket up to `n`.
#[derive(Debug, Default)]
pub struct SpawnBarrier {
    arrived: Mutex<u64>,
    released: Condvar,
}

impl SpawnBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `ticket` has arrived.
    pub fn wait(&self, ticket: u64) {
        let mut arrived = self.arrived.lock();
        while *arrived < ticket {
            self.released.wait(&mut arrived);
        }
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`. Returns `true`
    /// once `ticket` has arrived.
    pub fn wait_timeout(&self, ticket: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut arrived = self.arrived.lock();
        while *arrived < ticket {
            if self.released.wait_until(&mut arrived, deadline).timed_out() {
                return *arrived >= ticket;
            }
        }
        true
    }

    /// Release every waiter holding a ticket up to `ticket`.
    pub fn arrive(&self, ticket: u64) {
        let mut arrived = self.arrived.lock();
        if ticket > *arrived {
            *arrived = ticket;
            self.released.notify_all();
        }
    }

    /// Highest ticket released so far.
    pub fn arrived(&self) -> u64 {
        *self.arrived.lock()
    }
}

#[derive(Default)]
struct Pending {
    next_ticket: u64,
    queue: Vec<Arc<Process>>,
}

struct LoopState {
    events: Events,
    ready: Vec<Readiness>,
    /// Processes whose stdout and stderr have both closed.
    closing: HashSet<u64>,
    next_sweep: Instant,
}

pub struct EventProcessor {
    id: usize,
    config: PoolConfig,
    poller: Poller,
    waker: Waker,
    running: AtomicBool,
    registry: Mutex<HashMap<u64, Arc<Process>>>,
    pending: Mutex<Pending>,
    barrier: SpawnBarrier,
    state: Mutex<LoopState>,
    stats: ProcessorStats,
    loop_thread: OnceLock<ThreadId>,
}

impl EventProcessor {
    /// Create processor `id` with its readiness context. The loop is not
    /// started until [`start`](Self::start).
    pub fn new(id: usize, config: &PoolConfig) -> io::Result<Arc<Self>> {
        let poller = Poller::new()?;
        let waker = Waker::new()?;
        poller.register_waker(&waker)?;

        Ok(Arc::new(Self {
            id,
            config: config.clone(),
            poller,
            waker,
            running: AtomicBool::new(false),
            registry: Mutex::new(HashMap::new()),
            pending: Mutex::new(Pending::default()),
            barrier: SpawnBarrier::new(),
            state: Mutex::new(LoopState {
                events: Events::with_capacity(config.max_events),
                ready: Vec::with_capacity(config.max_events),
                closing: HashSet::new(),
                next_sweep: Instant::now() + config.housekeeping_interval,
            }),
            stats: ProcessorStats::new(),
            loop_thread: OnceLock::new(),
        }))
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn stats(&self) -> &ProcessorStats {
        &self.stats
    }

    pub fn spawn_barrier(&self) -> &SpawnBarrier {
        &self.barrier
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of processes installed and not yet reaped.
    pub fn process_count(&self) -> usize {
        self.registry.lock().len()
    }

    pub(crate) fn poller(&self) -> &Poller {
        &self.poller
    }

    /// Atomic test-and-set of the running flag. Exactly one caller ever
    /// observes `true` and must then call [`start`](Self::start).
    pub fn check_and_set_running(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Run the loop on a dedicated worker thread. On failure the running flag
    /// is cleared so a later spawn can retry.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        let processor = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("procplex-processor-{}", self.id))
            .spawn(move || processor.run());

        match spawned {
            Ok(_) => Ok(()),
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn run(&self) {
        let _ = self.loop_thread.set(thread::current().id());
        ON_PROCESSOR_LOOP.with(|flag| flag.set(true));
        info!(processor = self.id, "Event processor started");
        loop {
            self.process();
        }
    }

    fn is_loop_thread(&self) -> bool {
        self.loop_thread.get() == Some(&thread::current().id())
    }

    /// Hand `process` to the loop and return once the loop can see it.
    ///
    /// From another processor's loop thread this returns right after
    /// queueing; write interest raised before the install is re-armed by it.
    /// If the loop cannot be started the child is killed and its exit
    /// resolves to [`EXIT_LAUNCH_FAILURE`](crate::EXIT_LAUNCH_FAILURE).
    pub(crate) fn register_process(self: &Arc<Self>, process: &Arc<Process>) {
        if self.is_loop_thread() {
            self.install(process);
            return;
        }

        let ticket = {
            let mut pending = self.pending.lock();
            pending.next_ticket += 1;
            pending.queue.push(Arc::clone(process));
            pending.next_ticket
        };
        self.waker.wake();

        if on_processor_loop() {
            if !self.ensure_running() && self.withdraw(process) {
                process.fail_hand_off();
            }
            return;
        }

        while !self.barrier.wait_timeout(ticket, self.config.reap_interval) {
            if self.ensure_running() {
                continue;
            }
            if self.withdraw(process) {
                process.fail_hand_off();
                return;
            }
        }
    }

    /// `true` if the loop is running, starting it when an earlier start failed.
    fn ensure_running(self: &Arc<Self>) -> bool {
        if self.is_running() {
            return true;
        }
        if !self.check_and_set_running() {
            return self.is_running();
        }
        match self.start() {
            Ok(()) => true,
            Err(err) => {
                error!(processor = self.id, error = %err, "Cannot start event processor loop");
                false
            }
        }
    }

    /// Remove `process` from the hand-off queue. Returns `false` if the loop
    /// already took it.
    fn withdraw(&self, process: &Arc<Process>) -> bool {
        let mut pending = self.pending.lock();
        let before = pending.queue.len();
        pending.queue.retain(|queued| !Arc::ptr_eq(queued, process));
        pending.queue.len() != before
    }

    /// Re-arm read readiness for one output stream of `process`.
    pub(crate) fn requeue_read(&self, process: &Process, stream: Stream) {
        if let Err(err) = process.arm_output(&self.poller, stream) {
            warn!(processor = self.id, pid = process.pid(), ?stream, error = %err, "Failed to re-arm read readiness");
        }
    }

    /// Re-arm write readiness for `process`'s stdin. Safe from any thread.
    pub(crate) fn queue_write(&self, process: &Process) {
        process.arm_stdin(&self.poller);
    }

    fn install_pending(&self) {
        let (batch, ticket) = {
            let mut pending = self.pending.lock();
            (std::mem::take(&mut pending.queue), pending.next_ticket)
        };
        if batch.is_empty() {
            return;
        }
        for process in &batch {
            self.install(process);
        }
        self.barrier.arrive(ticket);
    }

    fn install(&self, process: &Arc<Process>) {
        self.registry.lock().insert(process.token(), Arc::clone(process));
        self.requeue_read(process, Stream::Stdout);
        self.requeue_read(process, Stream::Stderr);
        if process.wants_write() {
            process.arm_stdin(&self.poller);
        }
        self.stats.record_registered();
        debug!(processor = self.id, pid = process.pid(), "Registered process");
    }

    fn lookup(&self, token: u64) -> Option<Arc<Process>> {
        self.registry.lock().get(&token).cloned()
    }

    /// Run one wait-dispatch-reap iteration. Returns `true` while any process
    /// is registered.
    pub fn process(&self) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let timeout = self.next_timeout(state);
        if let Err(err) = self.poller.wait(&mut state.events, timeout) {
            error!(processor = self.id, error = %err, "Readiness wait failed");
            drop(guard);
            thread::sleep(self.config.reap_interval);
            return self.process_count() > 0;
        }
        self.stats.record_wakeup();

        state.ready.clear();
        state.ready.extend(state.events.iter());
        self.install_pending();

        let mut ready = std::mem::take(&mut state.ready);
        for readiness in ready.drain(..) {
            self.dispatch(readiness, &mut state.closing);
        }
        state.ready = ready;

        self.reap_closing(&mut state.closing);

        let now = Instant::now();
        if now >= state.next_sweep {
            self.sweep(&mut state.closing);
            state.next_sweep = now + self.config.housekeeping_interval;
        }

        self.process_count() > 0
    }

    fn next_timeout(&self, state: &LoopState) -> Option<Duration> {
        let mut timeout = None;
        if !state.closing.is_empty() {
            timeout = Some(self.config.reap_interval);
        }
        if self.process_count() > 0 {
            let until_sweep = state.next_sweep.saturating_duration_since(Instant::now());
            timeout = Some(timeout.map_or(until_sweep, |t: Duration| t.min(until_sweep)));
        }
        timeout
    }

    fn dispatch(&self, readiness: Readiness, closing: &mut HashSet<u64>) {
        if readiness.token == WAKER_TOKEN {
            self.waker.drain();
            return;
        }
        let Some((token, stream)) = Stream::decode(readiness.token) else {
            return;
        };
        trace!(
            processor = self.id,
            token,
            ?stream,
            readable = readiness.readable,
            writable = readiness.writable,
            hangup = readiness.hangup,
            error = readiness.error,
            "Readiness"
        );
        // A report for a process already reaped.
        let Some(process) = self.lookup(token) else {
            return;
        };

        let _timer = DispatchTimer::new(&self.stats);
        let outcome = catch_unwind(AssertUnwindSafe(|| match stream {
            Stream::Stdout | Stream::Stderr => match process.read_output(stream) {
                ReadOutcome::Data(_) | ReadOutcome::WouldBlock => {
                    self.requeue_read(&process, stream);
                    false
                }
                ReadOutcome::Closed => process.output_closed(),
            },
            Stream::Stdin => {
                match process.write_stdin() {
                    WriteOutcome::WantMore => {
                        process.arm_stdin(&self.poller);
                    }
                    WriteOutcome::Idle if process.wants_write() => {
                        process.arm_stdin(&self.poller);
                    }
                    WriteOutcome::Idle | WriteOutcome::Closed => {}
                }
                false
            }
        }));

        match outcome {
            Ok(true) => {
                closing.insert(token);
            }
            Ok(false) => {}
            Err(_) => {
                error!(processor = self.id, pid = process.pid(), ?stream, "Listener panicked, terminating process");
                self.abandon(&process, closing);
            }
        }
    }

    fn abandon(&self, process: &Process, closing: &mut HashSet<u64>) {
        process.abandon();
        self.stats.record_abandoned();
        closing.insert(process.token());
    }

    fn reap_closing(&self, closing: &mut HashSet<u64>) {
        if closing.is_empty() {
            return;
        }
        let tokens: Vec<u64> = closing.iter().copied().collect();
        for token in tokens {
            let Some(process) = self.lookup(token) else {
                closing.remove(&token);
                continue;
            };
            if let Some(code) = process.try_reap() {
                closing.remove(&token);
                self.finalize(&process, code);
            }
        }
    }

    /// Poll every registered process, catching children that exited while a
    /// descendant still holds their pipes open.
    fn sweep(&self, closing: &mut HashSet<u64>) {
        let processes: Vec<Arc<Process>> = self.registry.lock().values().cloned().collect();
        for process in processes {
            if closing.contains(&process.token()) {
                continue;
            }
            let Some(code) = process.try_reap() else {
                continue;
            };

            debug!(processor = self.id, pid = process.pid(), "Child exited with output still open");
            let drained = catch_unwind(AssertUnwindSafe(|| {
                for stream in [Stream::Stdout, Stream::Stderr] {
                    process.drain_output(stream);
                    process.close_output(stream, true);
                }
            }));
            if drained.is_err() {
                error!(processor = self.id, pid = process.pid(), "Listener panicked, terminating process");
                process.abandon();
                self.stats.record_abandoned();
            }
            self.finalize(&process, code);
        }
    }

    fn finalize(&self, process: &Process, code: i32) {
        self.registry.lock().remove(&process.token());
        if catch_unwind(AssertUnwindSafe(|| process.finish(code))).is_err() {
            error!(processor = self.id, pid = process.pid(), "Listener panicked in on_exit");
        }
        self.stats.record_exited();
        debug!(processor = self.id, pid = process.pid(), code, "Reaped process");
    }
}

impl fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventProcessor")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .field("processes", &self.process_count())
            .finish_non_exhaustive()
    }
}
