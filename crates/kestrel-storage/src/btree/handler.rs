//! Execution of page operations.
//!
//! Every operation runs under a [`PageOperationHandler`], whose id is the
//! owner token written into page locks and whose signal is what the
//! operation parks on when it finds a page locked. Operations either run on
//! the calling thread ([`run_to_completion`]) or are queued on one of the
//! pooled handlers of a [`PageOperationHandlerFactory`].

use super::constants::{HANDLER_IDLE_WAIT, LOCKED_WAIT_MAX, LOCKED_WAIT_MIN};
use kestrel_common::{KestrelError, Result};
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Owner token of page locks. Zero is reserved for "unowned".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    fn next() -> Self {
        HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Wake-up flag a handler parks on.
#[derive(Debug, Default)]
pub struct HandlerSignal {
    notified: Mutex<bool>,
    cond: Condvar,
}

impl HandlerSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut notified = self.notified.lock();
        *notified = true;
        self.cond.notify_all();
    }

    /// Parks until notified or until `timeout` passes. Consumes the
    /// notification; returns whether there was one.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut notified = self.notified.lock();
        if !*notified {
            self.cond.wait_for(&mut notified, timeout);
        }
        std::mem::replace(&mut *notified, false)
    }
}

/// Identity and wake-up signal of one executor of page operations.
#[derive(Debug)]
pub struct PageOperationHandler {
    id: HandlerId,
    signal: Arc<HandlerSignal>,
}

impl PageOperationHandler {
    pub fn new() -> Self {
        Self {
            id: HandlerId::next(),
            signal: Arc::new(HandlerSignal::new()),
        }
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn signal(&self) -> &Arc<HandlerSignal> {
        &self.signal
    }

    pub fn wait(&self, timeout: Duration) -> bool {
        self.signal.wait(timeout)
    }
}

impl Default for PageOperationHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one run of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    /// Done; the result is available.
    Succeeded,
    /// A structural race was seen; run again right away.
    Retry,
    /// A needed page lock is held by another handler; run again once woken.
    Locked,
}

/// A resumable operation on the tree.
///
/// `run` must release every page lock it took before returning, so an
/// operation can be parked or requeued between runs.
pub trait PageOperation: Send {
    fn run(&mut self, handler: &PageOperationHandler) -> Result<OpStatus>;

    /// Called once with the final outcome.
    fn complete(self: Box<Self>, result: Result<()>);
}

/// Runs an operation on the calling thread until it succeeds or fails.
pub fn run_to_completion(op: &mut dyn PageOperation, handler: &PageOperationHandler) -> Result<()> {
    let mut wait = LOCKED_WAIT_MIN;
    loop {
        match op.run(handler)? {
            OpStatus::Succeeded => return Ok(()),
            OpStatus::Retry => {
                trace!("Page operation retrying");
                wait = LOCKED_WAIT_MIN;
            }
            OpStatus::Locked => {
                trace!(wait_ms = wait.as_millis() as u64, "Page operation locked out");
                handler.wait(wait);
                wait = (wait * 2).min(LOCKED_WAIT_MAX);
            }
        }
    }
}

thread_local! {
    static LOCAL_HANDLER: PageOperationHandler = PageOperationHandler::new();
    static POOLED_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Calls `f` with the handler owned by the current thread.
pub fn with_local_handler<R>(f: impl FnOnce(&PageOperationHandler) -> R) -> R {
    LOCAL_HANDLER.with(f)
}

/// True on the threads of a handler factory. Blocking on pooled work from
/// one of them could wait on its own queue.
pub fn on_pooled_thread() -> bool {
    POOLED_THREAD.with(Cell::get)
}

/// Blocks a caller until a pooled operation reports its result.
pub struct CompletionListener<R> {
    slot: Mutex<Option<Result<R>>>,
    cond: Condvar,
}

impl<R> CompletionListener<R> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    pub fn complete(&self, result: Result<R>) {
        let mut slot = self.slot.lock();
        *slot = Some(result);
        self.cond.notify_all();
    }

    pub fn wait(&self) -> Result<R> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            self.cond.wait(&mut slot);
        }
    }
}

struct HandlerQueue {
    ops: Mutex<VecDeque<Box<dyn PageOperation>>>,
    handler: PageOperationHandler,
}

/// A fixed pool of handler threads, each with its own operation queue.
pub struct PageOperationHandlerFactory {
    queues: Vec<Arc<HandlerQueue>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    next: AtomicUsize,
}

impl PageOperationHandlerFactory {
    /// Starts `handler_count` handler threads.
    pub fn new(handler_count: usize) -> Result<Arc<Self>> {
        if handler_count == 0 {
            return Err(KestrelError::InvalidParameter {
                name: "handler_threads".to_string(),
                value: "0".to_string(),
            });
        }
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut queues = Vec::with_capacity(handler_count);
        let mut threads = Vec::with_capacity(handler_count);
        for i in 0..handler_count {
            let queue = Arc::new(HandlerQueue {
                ops: Mutex::new(VecDeque::new()),
                handler: PageOperationHandler::new(),
            });
            let worker_queue = Arc::clone(&queue);
            let worker_shutdown = Arc::clone(&shutdown);
            let handle = thread::Builder::new()
                .name(format!("kestrel-handler-{i}"))
                .spawn(move || handler_loop(worker_queue, worker_shutdown))?;
            queues.push(queue);
            threads.push(handle);
        }
        debug!(handlers = handler_count, "Started page operation handlers");
        Ok(Arc::new(Self {
            queues,
            threads: Mutex::new(threads),
            shutdown,
            next: AtomicUsize::new(0),
        }))
    }

    pub fn handler_count(&self) -> usize {
        self.queues.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Queues an operation on the next handler, round robin.
    pub fn submit(&self, op: Box<dyn PageOperation>) {
        if self.is_shutdown() {
            op.complete(Err(KestrelError::Closed));
            return;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        let queue = &self.queues[index];
        queue.ops.lock().push_back(op);
        queue.handler.signal().notify();
        if self.is_shutdown() {
            // raced with shutdown after its drain
            let pending: Vec<_> = queue.ops.lock().drain(..).collect();
            for op in pending {
                op.complete(Err(KestrelError::Closed));
            }
        }
    }

    /// Stops the handler threads. Queued operations complete with `Closed`.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for queue in &self.queues {
            queue.handler.signal().notify();
        }
        let current = thread::current().id();
        for handle in self.threads.lock().drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        for queue in &self.queues {
            let pending: Vec<_> = queue.ops.lock().drain(..).collect();
            for op in pending {
                op.complete(Err(KestrelError::Closed));
            }
        }
        debug!("Stopped page operation handlers");
    }
}

impl Drop for PageOperationHandlerFactory {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_until_blocked(op: &mut dyn PageOperation, handler: &PageOperationHandler) -> Result<OpStatus> {
    loop {
        match op.run(handler)? {
            OpStatus::Retry => continue,
            status => return Ok(status),
        }
    }
}

fn handler_loop(queue: Arc<HandlerQueue>, shutdown: Arc<AtomicBool>) {
    POOLED_THREAD.with(|pooled| pooled.set(true));
    let handler = &queue.handler;
    let mut wait = LOCKED_WAIT_MIN;
    let mut locked_streak = 0usize;
    while !shutdown.load(Ordering::Acquire) {
        let next = queue.ops.lock().pop_front();
        let Some(mut op) = next else {
            handler.wait(HANDLER_IDLE_WAIT);
            continue;
        };
        match run_until_blocked(op.as_mut(), handler) {
            Ok(OpStatus::Locked) => {
                // to the back, so the rest of the queue keeps moving
                let queued = {
                    let mut ops = queue.ops.lock();
                    ops.push_back(op);
                    ops.len()
                };
                locked_streak += 1;
                if locked_streak >= queued {
                    trace!(queued, wait_ms = wait.as_millis() as u64, "Handler parked");
                    handler.wait(wait);
                    wait = (wait * 2).min(LOCKED_WAIT_MAX);
                    locked_streak = 0;
                }
            }
            Ok(_) => {
                wait = LOCKED_WAIT_MIN;
                locked_streak = 0;
                op.complete(Ok(()));
            }
            Err(e) => {
                wait = LOCKED_WAIT_MIN;
                locked_streak = 0;
                op.complete(Err(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    struct CountDown {
        remaining: usize,
        locked_first: bool,
        done: Arc<CompletionListener<usize>>,
        runs: usize,
    }

    impl PageOperation for CountDown {
        fn run(&mut self, _handler: &PageOperationHandler) -> Result<OpStatus> {
            self.runs += 1;
            if self.locked_first {
                self.locked_first = false;
                return Ok(OpStatus::Locked);
            }
            if self.remaining == 0 {
                return Ok(OpStatus::Succeeded);
            }
            self.remaining -= 1;
            Ok(OpStatus::Retry)
        }

        fn complete(self: Box<Self>, result: Result<()>) {
            self.done.complete(result.map(|_| self.runs));
        }
    }

    #[test]
    fn test_handler_ids_are_unique() {
        let a = PageOperationHandler::new();
        let b = PageOperationHandler::new();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id().as_u64(), 0);
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let signal = Arc::new(HandlerSignal::new());
        assert!(!signal.wait(Duration::from_millis(1)));

        let waker = Arc::clone(&signal);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.notify();
        });
        let start = Instant::now();
        assert!(signal.wait(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(10));
        t.join().unwrap();
    }

    #[test]
    fn test_run_to_completion_retries_and_waits() {
        let done = CompletionListener::new();
        let mut op = CountDown {
            remaining: 3,
            locked_first: true,
            done,
            runs: 0,
        };
        let handler = PageOperationHandler::new();
        run_to_completion(&mut op, &handler).unwrap();
        assert_eq!(op.runs, 5);
    }

    #[test]
    fn test_factory_runs_submitted_operations() {
        let factory = PageOperationHandlerFactory::new(2).unwrap();
        let listeners: Vec<_> = (0..8).map(|_| CompletionListener::new()).collect();
        for (i, done) in listeners.iter().enumerate() {
            factory.submit(Box::new(CountDown {
                remaining: i,
                locked_first: i % 2 == 0,
                done: Arc::clone(done),
                runs: 0,
            }));
        }
        for (i, done) in listeners.iter().enumerate() {
            let expected = i + 1 + usize::from(i % 2 == 0);
            assert_eq!(done.wait().unwrap(), expected);
        }
        factory.shutdown();
    }

    #[test]
    fn test_submit_after_shutdown_completes_closed() {
        let factory = PageOperationHandlerFactory::new(1).unwrap();
        factory.shutdown();
        let done = CompletionListener::new();
        factory.submit(Box::new(CountDown {
            remaining: 0,
            locked_first: false,
            done: Arc::clone(&done),
            runs: 0,
        }));
        assert!(matches!(done.wait(), Err(KestrelError::Closed)));
    }

    #[test]
    fn test_local_handler_is_per_thread() {
        let here = with_local_handler(|h| h.id());
        assert_eq!(here, with_local_handler(|h| h.id()));
        let there = thread::spawn(|| with_local_handler(|h| h.id())).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_zero_handlers_rejected() {
        assert!(PageOperationHandlerFactory::new(0).is_err());
    }
}
