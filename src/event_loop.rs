//! Single-threaded reactor built on `mio`
//!
//! The [`EventLoop`] owns one `mio::Poll` and dispatches readiness events to
//! the sockets registered with it, alongside:
//!
//! - deferred calls posted for the next iteration
//! - one-shot timers ordered by deadline
//! - callbacks that run once per loop iteration
//! - background work executed on a small worker pool
//! - closures handed over from other threads through [`LoopRemote`]
//!
//! [`EventLoop::run`] returns once none of those sources is active. All
//! handles created on a loop are `!Send`; the only way into a loop from
//! another thread is [`LoopRemote::execute_on_loop_thread`].
//!
//! # Examples
//!
//! ```rust
//! use horizon_io::EventLoop;
//!
//! let lp = EventLoop::new().unwrap();
//! lp.add_work(|| 2 + 2, |_lp, sum| assert_eq!(sum, 4));
//! lp.run().unwrap();
//! ```

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;

use crate::config::NetConfig;
use crate::error::{Error, StatusCode};

const WAKER_TOKEN: Token = Token(usize::MAX);
/// Deadline used for delays past what `Instant` can represent
const MAX_TIMER_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

type Deferred = Box<dyn FnOnce(&EventLoop)>;
type RemoteCall = Box<dyn FnOnce(&EventLoop) + Send>;
type WorkResult = thread::Result<Box<dyn Any + Send>>;
type Job = Box<dyn FnOnce() + Send>;

/// Readiness reported for one registered source
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub read_closed: bool,
    pub write_closed: bool,
}

impl Readiness {
    fn from_event(ev: &mio::event::Event) -> Self {
        Self {
            readable: ev.is_readable(),
            writable: ev.is_writable(),
            error: ev.is_error(),
            read_closed: ev.is_read_closed(),
            write_closed: ev.is_write_closed(),
        }
    }
}

/// Receiver of readiness events for a registered source
pub(crate) trait EventHandler {
    fn handle_event(self: Rc<Self>, lp: &EventLoop, ready: Readiness);
}

struct Slot {
    handler: Rc<dyn EventHandler>,
    refd: bool,
}

/// Identifies a one-shot timer for cancellation
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerId(Instant, u64);

/// Identifies a per-cycle callback for cancellation
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CycleHandle(u64);

enum RemoteMsg {
    Call(RemoteCall),
    Notify(u64),
    WorkDone(u64, WorkResult),
}

/// Thread-safe handle for handing closures to a loop
#[derive(Clone)]
pub struct LoopRemote {
    tx: mpsc::Sender<RemoteMsg>,
    waker: Arc<Waker>,
    pending: Arc<AtomicUsize>,
}

impl LoopRemote {
    /// Runs `cb` exactly once on the loop thread at its next iteration
    ///
    /// Calls made from one thread run in the order they were issued. A call
    /// that arrives after the loop has been dropped is discarded.
    pub fn execute_on_loop_thread<F>(&self, cb: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(RemoteMsg::Call(Box::new(cb))).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            log::warn!("execute_on_loop_thread: loop is gone, call dropped");
            return;
        }
        self.wake();
    }

    /// Fires the loop-local wakeup registered under `id`
    pub(crate) fn notify(&self, id: u64) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(RemoteMsg::Notify(id)).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        self.wake();
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            log::error!("failed to wake event loop: {}", e);
        }
    }
}

impl std::fmt::Debug for LoopRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopRemote")
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish()
    }
}

struct WorkerPool {
    size: usize,
    tx: RefCell<Option<mpsc::Sender<Job>>>,
}

impl WorkerPool {
    fn submit(&self, job: Job) -> Result<(), Job> {
        if self.tx.borrow().is_none() {
            match self.spawn() {
                Ok(tx) => *self.tx.borrow_mut() = Some(tx),
                Err(e) => {
                    log::error!("failed to start worker threads: {}", e);
                    return Err(job);
                }
            }
        }
        match self.tx.borrow().as_ref() {
            Some(tx) => tx.send(job).map_err(|e| e.0),
            None => Err(job),
        }
    }

    fn spawn(&self) -> io::Result<mpsc::Sender<Job>> {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        for i in 0..self.size {
            let rx = Arc::clone(&rx);
            thread::Builder::new()
                .name(format!("horizon-io-worker-{}", i))
                .spawn(move || loop {
                    let job = rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
                    match job {
                        Ok(job) => job(),
                        Err(_) => return,
                    }
                })?;
        }
        log::debug!("started {} worker threads", self.size);
        Ok(tx)
    }
}

struct Shared {
    config: NetConfig,
    poll: RefCell<Poll>,
    registry: Registry,
    events: RefCell<Events>,
    sources: RefCell<Slab<Slot>>,
    refd_sources: Cell<usize>,
    timers: RefCell<BTreeMap<TimerId, Deferred>>,
    deferred: RefCell<VecDeque<Deferred>>,
    cycle: RefCell<BTreeMap<u64, Rc<RefCell<dyn FnMut(&EventLoop)>>>>,
    next_id: Cell<u64>,
    keep_alive: Cell<usize>,
    work_done: RefCell<HashMap<u64, Box<dyn FnOnce(&EventLoop, Box<dyn Any + Send>)>>>,
    wakeups: RefCell<HashMap<u64, Rc<dyn Fn(&EventLoop)>>>,
    remote: LoopRemote,
    remote_rx: mpsc::Receiver<RemoteMsg>,
    workers: WorkerPool,
    running: Cell<bool>,
}

/// Handle to a reactor; clones refer to the same loop
#[derive(Clone)]
pub struct EventLoop {
    shared: Rc<Shared>,
}

impl EventLoop {
    /// Creates a loop with the default [`NetConfig`]
    pub fn new() -> Result<Self, Error> {
        Self::with_config(NetConfig::default())
    }

    /// Creates a loop whose components read their settings from `config`
    pub fn with_config(config: NetConfig) -> Result<Self, Error> {
        config.validate()?;
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (tx, remote_rx) = mpsc::channel();

        let shared = Shared {
            events: RefCell::new(Events::with_capacity(config.event_capacity)),
            workers: WorkerPool { size: config.worker_threads, tx: RefCell::new(None) },
            config,
            poll: RefCell::new(poll),
            registry,
            sources: RefCell::new(Slab::new()),
            refd_sources: Cell::new(0),
            timers: RefCell::new(BTreeMap::new()),
            deferred: RefCell::new(VecDeque::new()),
            cycle: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(1),
            keep_alive: Cell::new(0),
            work_done: RefCell::new(HashMap::new()),
            wakeups: RefCell::new(HashMap::new()),
            remote: LoopRemote { tx, waker, pending: Arc::new(AtomicUsize::new(0)) },
            remote_rx,
            running: Cell::new(false),
        };
        Ok(Self { shared: Rc::new(shared) })
    }

    pub fn config(&self) -> &NetConfig {
        &self.shared.config
    }

    /// Thread-safe handle for [`LoopRemote::execute_on_loop_thread`]
    pub fn remote(&self) -> LoopRemote {
        self.shared.remote.clone()
    }

    /// Convenience for `self.remote().execute_on_loop_thread(cb)`
    pub fn execute_on_loop_thread<F>(&self, cb: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        self.shared.remote.execute_on_loop_thread(cb);
    }

    /// Monotonic clock used for timers and activity tracking
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Runs until no registered source, timer, pending call or work remains
    ///
    /// Returns an error only when the poller itself fails or when the loop
    /// is already running.
    pub fn run(&self) -> Result<(), Error> {
        if self.shared.running.replace(true) {
            return Err(Error::with_message(StatusCode::InvalidArgument, "event loop is already running"));
        }
        let result = self.run_inner();
        self.shared.running.set(false);
        result
    }

    fn run_inner(&self) -> Result<(), Error> {
        let mut ready = Vec::new();
        loop {
            self.run_timers();
            self.run_cycle_callbacks();
            self.run_deferred();
            self.drain_remote();

            if !self.is_alive() {
                log::debug!("event loop has no active handles, exiting");
                return Ok(());
            }

            let timeout = self.poll_timeout();
            {
                let mut poll = self.shared.poll.borrow_mut();
                let mut events = self.shared.events.borrow_mut();
                match poll.poll(&mut events, timeout) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::error!("poll failed: {}", e);
                        return Err(e.into());
                    }
                }
                ready.clear();
                ready.extend(events.iter().map(|ev| (ev.token(), Readiness::from_event(ev))));
            }

            for &(token, readiness) in &ready {
                if token == WAKER_TOKEN {
                    continue;
                }
                let handler = self.shared.sources.borrow().get(token.0).map(|s| Rc::clone(&s.handler));
                if let Some(handler) = handler {
                    handler.handle_event(self, readiness);
                }
            }
        }
    }

    fn is_alive(&self) -> bool {
        let s = &self.shared;
        s.refd_sources.get() > 0
            || !s.timers.borrow().is_empty()
            || !s.deferred.borrow().is_empty()
            || !s.cycle.borrow().is_empty()
            || s.keep_alive.get() > 0
            || !s.work_done.borrow().is_empty()
            || s.remote.pending.load(Ordering::Acquire) > 0
    }

    fn poll_timeout(&self) -> Option<Duration> {
        let s = &self.shared;
        if !s.deferred.borrow().is_empty()
            || !s.cycle.borrow().is_empty()
            || s.remote.pending.load(Ordering::Acquire) > 0
        {
            return Some(Duration::ZERO);
        }
        s.timers
            .borrow()
            .keys()
            .next()
            .map(|id| id.0.saturating_duration_since(Instant::now()))
    }

    fn next_id(&self) -> u64 {
        let id = self.shared.next_id.get();
        self.shared.next_id.set(id + 1);
        id
    }

    // Deferred calls

    /// Queues `cb` to run on the next loop iteration
    pub(crate) fn post<F: FnOnce(&EventLoop) + 'static>(&self, cb: F) {
        self.shared.deferred.borrow_mut().push_back(Box::new(cb));
    }

    fn run_deferred(&self) {
        let n = self.shared.deferred.borrow().len();
        for _ in 0..n {
            let next = self.shared.deferred.borrow_mut().pop_front();
            match next {
                Some(cb) => cb(self),
                None => break,
            }
        }
    }

    // Timers

    pub(crate) fn schedule_timer<F: FnOnce(&EventLoop) + 'static>(&self, delay: Duration, cb: F) -> TimerId {
        let now = Instant::now();
        let deadline = now.checked_add(delay).unwrap_or_else(|| now + MAX_TIMER_DELAY);
        let id = TimerId(deadline, self.next_id());
        self.shared.timers.borrow_mut().insert(id, Box::new(cb));
        id
    }

    pub(crate) fn cancel_timer(&self, id: TimerId) -> bool {
        self.shared.timers.borrow_mut().remove(&id).is_some()
    }

    fn run_timers(&self) {
        let now = Instant::now();
        loop {
            let due = {
                let mut timers = self.shared.timers.borrow_mut();
                match timers.keys().next().copied() {
                    Some(id) if id.0 <= now => timers.remove(&id),
                    _ => None,
                }
            };
            match due {
                Some(cb) => cb(self),
                None => break,
            }
        }
    }

    // Per-cycle callbacks

    /// Calls `cb` once per loop iteration until stopped
    ///
    /// While any such callback is registered the loop never blocks in poll,
    /// so keep them cheap.
    pub fn schedule_call_on_each_loop_cycle<F: FnMut(&EventLoop) + 'static>(&self, cb: F) -> CycleHandle {
        let id = self.next_id();
        self.shared.cycle.borrow_mut().insert(id, Rc::new(RefCell::new(cb)));
        CycleHandle(id)
    }

    pub fn stop_call_on_each_loop_cycle(&self, handle: CycleHandle) {
        self.shared.cycle.borrow_mut().remove(&handle.0);
    }

    fn run_cycle_callbacks(&self) {
        let snapshot: Vec<_> = self
            .shared
            .cycle
            .borrow()
            .iter()
            .map(|(id, cb)| (*id, Rc::clone(cb)))
            .collect();
        for (id, cb) in snapshot {
            if !self.shared.cycle.borrow().contains_key(&id) {
                continue;
            }
            match cb.try_borrow_mut() {
                Ok(mut f) => (&mut *f)(self),
                Err(_) => log::warn!("per-cycle callback re-entered, skipping"),
            }
        }
    }

    // Keep-alive

    /// Keeps the loop running even with nothing registered
    pub fn start_keep_alive(&self) {
        self.shared.keep_alive.set(self.shared.keep_alive.get() + 1);
    }

    pub fn stop_keep_alive(&self) {
        let n = self.shared.keep_alive.get();
        if n == 0 {
            log::warn!("stop_keep_alive called without matching start");
            return;
        }
        self.shared.keep_alive.set(n - 1);
    }

    // Background work

    /// Runs `work` on a worker thread, then `done` with its result on the loop thread
    ///
    /// If `work` panics the panic is logged and `done` never runs.
    pub fn add_work<W, R, D>(&self, work: W, done: D)
    where
        W: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
        D: FnOnce(&EventLoop, R) + 'static,
    {
        let id = self.next_id();
        self.shared.work_done.borrow_mut().insert(
            id,
            Box::new(move |lp: &EventLoop, result: Box<dyn Any + Send>| match result.downcast::<R>() {
                Ok(r) => done(lp, *r),
                Err(_) => log::error!("background work returned an unexpected type"),
            }),
        );

        let tx = self.shared.remote.tx.clone();
        let waker = Arc::clone(&self.shared.remote.waker);
        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(work)).map(|r| Box::new(r) as Box<dyn Any + Send>);
            if tx.send(RemoteMsg::WorkDone(id, result)).is_ok() {
                let _ = waker.wake();
            }
        });

        if let Err(job) = self.shared.workers.submit(job) {
            // No worker available: run it on the loop thread at the next iteration
            self.post(move |_| job());
        }
    }

    fn drain_remote(&self) {
        while let Ok(msg) = self.shared.remote_rx.try_recv() {
            match msg {
                RemoteMsg::Call(cb) => {
                    self.shared.remote.pending.fetch_sub(1, Ordering::AcqRel);
                    cb(self);
                }
                RemoteMsg::Notify(id) => {
                    self.shared.remote.pending.fetch_sub(1, Ordering::AcqRel);
                    let cb = self.shared.wakeups.borrow().get(&id).cloned();
                    if let Some(cb) = cb {
                        cb(self);
                    }
                }
                RemoteMsg::WorkDone(id, result) => {
                    let done = self.shared.work_done.borrow_mut().remove(&id);
                    match (done, result) {
                        (Some(done), Ok(value)) => done(self, value),
                        (Some(_), Err(_)) => log::error!("background work {} panicked", id),
                        (None, _) => log::warn!("completion for unknown work item {}", id),
                    }
                }
            }
        }
    }

    // Loop-local wakeups, fired from any thread through `LoopRemote::notify`

    pub(crate) fn add_wakeup<F: Fn(&EventLoop) + 'static>(&self, cb: F) -> u64 {
        let id = self.next_id();
        self.shared.wakeups.borrow_mut().insert(id, Rc::new(cb));
        id
    }

    pub(crate) fn remove_wakeup(&self, id: u64) {
        self.shared.wakeups.borrow_mut().remove(&id);
    }

    // Source registration

    pub(crate) fn register<S: Source + ?Sized>(
        &self,
        source: &mut S,
        interest: Interest,
        handler: Rc<dyn EventHandler>,
    ) -> io::Result<Token> {
        let mut sources = self.shared.sources.borrow_mut();
        let entry = sources.vacant_entry();
        let token = Token(entry.key());
        self.shared.registry.register(source, token, interest)?;
        entry.insert(Slot { handler, refd: true });
        self.shared.refd_sources.set(self.shared.refd_sources.get() + 1);
        Ok(token)
    }

    pub(crate) fn reregister<S: Source + ?Sized>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()> {
        self.shared.registry.reregister(source, token, interest)
    }

    pub(crate) fn deregister<S: Source + ?Sized>(&self, source: &mut S, token: Token) {
        if let Err(e) = self.shared.registry.deregister(source) {
            log::debug!("deregister of token {} failed: {}", token.0, e);
        }
        let removed = {
            let mut sources = self.shared.sources.borrow_mut();
            if sources.contains(token.0) { Some(sources.remove(token.0)) } else { None }
        };
        if let Some(slot) = removed {
            if slot.refd {
                self.shared.refd_sources.set(self.shared.refd_sources.get() - 1);
            }
        }
    }

    /// Controls whether a registered source keeps the loop alive
    pub(crate) fn set_refd(&self, token: Token, refd: bool) {
        let mut sources = self.shared.sources.borrow_mut();
        if let Some(slot) = sources.get_mut(token.0) {
            if slot.refd != refd {
                slot.refd = refd;
                let n = self.shared.refd_sources.get();
                self.shared.refd_sources.set(if refd { n + 1 } else { n - 1 });
            }
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("sources", &self.shared.sources.borrow().len())
            .field("timers", &self.shared.timers.borrow().len())
            .field("running", &self.shared.running.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_loop_returns_immediately() {
        let lp = EventLoop::new().unwrap();
        assert!(lp.run().is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = NetConfig { event_capacity: 0, ..Default::default() };
        assert!(EventLoop::with_config(cfg).is_err());
    }

    #[test]
    fn test_post_runs_in_order() {
        let lp = EventLoop::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let log = Rc::clone(&log);
            lp.post(move |_| log.borrow_mut().push(i));
        }
        lp.run().unwrap();
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let lp = EventLoop::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let l1 = Rc::clone(&log);
        lp.schedule_timer(Duration::from_millis(20), move |_| l1.borrow_mut().push("late"));
        let l2 = Rc::clone(&log);
        lp.schedule_timer(Duration::from_millis(1), move |_| l2.borrow_mut().push("early"));
        let l3 = Rc::clone(&log);
        let canceled = lp.schedule_timer(Duration::from_millis(5), move |_| l3.borrow_mut().push("canceled"));
        assert!(lp.cancel_timer(canceled));
        lp.run().unwrap();
        assert_eq!(*log.borrow(), vec!["early", "late"]);
    }

    #[test]
    fn test_unbounded_delay_is_clamped() {
        let lp = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let f = Rc::clone(&fired);
        let forever = lp.schedule_timer(Duration::MAX, move |_| f.set(true));
        assert!(forever.0 > Instant::now() + Duration::from_secs(365 * 24 * 60 * 60));
        lp.post(move |lp| assert!(lp.cancel_timer(forever)));
        lp.run().unwrap();
        assert!(!fired.get());
    }

    #[test]
    fn test_keep_alive_holds_loop_until_stopped() {
        let lp = EventLoop::new().unwrap();
        lp.start_keep_alive();
        let remote = lp.remote();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.execute_on_loop_thread(|lp| lp.stop_keep_alive());
        });
        lp.run().unwrap();
        t.join().unwrap();
    }

    #[test]
    fn test_run_is_not_reentrant() {
        let lp = EventLoop::new().unwrap();
        let nested = Rc::new(Cell::new(None));
        let n = Rc::clone(&nested);
        lp.post(move |lp| n.set(Some(lp.run().is_err())));
        lp.run().unwrap();
        assert_eq!(nested.get(), Some(true));
    }
}
