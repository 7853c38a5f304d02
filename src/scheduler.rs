//! Elastic worker pool used to decouple inbound invocations from the
//! transport's receive thread.
//!
//! The pool keeps at least `min_idle` parked workers around and grows on
//! demand up to `max_busy`. When every worker is busy, tasks queue in a
//! double-ended overflow list: normal tasks append at the tail, priority
//! tasks cut in at the head, and `NO_QUEUE` submissions fail fast instead
//! of queuing. After finishing a task a worker drains the overflow queue
//! before parking again, so queued work never waits for a fresh
//! submission.
//!
//! Condition variables are treated as stateless: every wait uses a short
//! bounded timeout together with an explicit state flag, so a notification
//! that fires before the waiter arrives cannot produce a permanent hang.

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Bounded wait applied to every worker condvar.
const WORKER_POLL: Duration = Duration::from_millis(10);

type Task = Box<dyn FnOnce() + Send + 'static>;

bitflags! {
    /// Flags influencing task placement when no worker is free.
    pub struct ScheduleFlags: u32 {
        /// Insert at the head of the overflow queue.
        const PRIORITY = 0x1;
        /// Fail the submission instead of queuing.
        const NO_QUEUE = 0x2;
    }
}

/// Mailbox shared between a worker thread and the pool.
struct Mailbox {
    task: Option<Task>,
    started: bool,
    shutdown: bool,
}

struct WorkerShared {
    mailbox: Mutex<Mailbox>,
    signal: Condvar,
}

/// One pooled worker. Dropping it requests shutdown and joins the thread.
struct Worker {
    shared: Arc<WorkerShared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Start a worker thread and block until it has entered its wait loop.
    /// Without the startup handshake a task could be assigned to a thread
    /// that has not observed its condvar yet.
    fn start() -> Worker {
        let shared = Arc::new(WorkerShared {
            mailbox: Mutex::new(Mailbox {
                task: None,
                started: false,
                shutdown: false,
            }),
            signal: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let mut mailbox = shared.mailbox.lock();
        let handle = thread::spawn(move || Worker::thread_main(thread_shared));
        while !mailbox.started {
            shared.signal.wait_for(&mut mailbox, WORKER_POLL);
        }
        drop(mailbox);

        Worker {
            shared,
            handle: Some(handle),
        }
    }

    /// Hand a task to the (idle) worker.
    fn execute(shared: &Arc<WorkerShared>, task: Task) {
        let mut mailbox = shared.mailbox.lock();
        mailbox.task = Some(task);
        shared.signal.notify_all();
    }

    fn thread_main(shared: Arc<WorkerShared>) {
        let mut mailbox = shared.mailbox.lock();
        mailbox.started = true;
        shared.signal.notify_all();

        while !mailbox.shutdown {
            shared.signal.wait_for(&mut mailbox, WORKER_POLL);
            if mailbox.shutdown {
                break;
            }
            if let Some(task) = mailbox.task.take() {
                task();
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let mut mailbox = self.shared.mailbox.lock();
        mailbox.shutdown = true;
        self.shared.signal.notify_all();
        drop(mailbox);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Pool {
    workers: HashMap<u64, Worker>,
    idle: VecDeque<u64>,
    tasks: VecDeque<Task>,
    min_idle: usize,
    max_busy: usize,
    max_seen: usize,
    next_id: u64,
}

struct Inner {
    pool: Mutex<Pool>,
}

/// Elastic worker pool with a priority-aware overflow queue.
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl TaskScheduler {
    /// Create a pool with `min_idle` pre-started workers and a hard busy
    /// limit of `max_busy`. Both values are clamped to at least one.
    pub fn new(min_idle: usize, max_busy: usize) -> TaskScheduler {
        let min_idle = min_idle.max(1);
        let max_busy = max_busy.max(1);

        let mut pool = Pool {
            workers: HashMap::new(),
            idle: VecDeque::new(),
            tasks: VecDeque::new(),
            min_idle,
            max_busy,
            max_seen: 0,
            next_id: 0,
        };
        for _ in 0..min_idle {
            let id = pool.next_id;
            pool.next_id += 1;
            pool.workers.insert(id, Worker::start());
            pool.idle.push_back(id);
        }
        pool.max_seen = pool.workers.len();

        TaskScheduler {
            inner: Arc::new(Inner {
                pool: Mutex::new(pool),
            }),
        }
    }

    /// Schedule a task for asynchronous execution.
    ///
    /// An idle worker is preferred; otherwise a new worker is started while
    /// the pool is below its busy limit; otherwise the task queues according
    /// to `flags`. Returns whether the submission was accepted (`NO_QUEUE`
    /// is the only way to be turned down).
    pub fn schedule<F>(&self, task: F, flags: ScheduleFlags) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let task: Task = Box::new(task);
        let mut pool = self.inner.pool.lock();

        let worker = if let Some(id) = pool.idle.pop_front() {
            Some(id)
        } else if pool.workers.len() < pool.max_busy {
            let id = pool.next_id;
            pool.next_id += 1;
            pool.workers.insert(id, Worker::start());
            pool.max_seen = pool.max_seen.max(pool.workers.len());
            Some(id)
        } else {
            None
        };

        match worker {
            Some(id) => {
                let shared = pool.workers[&id].shared.clone();
                drop(pool);
                let inner = self.inner.clone();
                Worker::execute(&shared, Box::new(move || Self::run_and_park(inner, id, task)));
                true
            }
            None => {
                if flags.contains(ScheduleFlags::NO_QUEUE) {
                    return false;
                }
                if flags.contains(ScheduleFlags::PRIORITY) {
                    pool.tasks.push_front(task);
                } else {
                    pool.tasks.push_back(task);
                }
                true
            }
        }
    }

    /// Worker body: run the assigned task, drain the overflow queue, trim
    /// surplus idle workers, and park.
    fn run_and_park(inner: Arc<Inner>, id: u64, first: Task) {
        let mut task = first;
        loop {
            task();

            let mut pool = inner.pool.lock();
            match pool.tasks.pop_front() {
                Some(next) => {
                    drop(pool);
                    task = next;
                }
                None => {
                    // A worker cannot reap itself; it only trims workers
                    // already sitting in the idle queue, which it is not
                    // part of while running.
                    while !pool.idle.is_empty() && pool.idle.len() >= pool.min_idle {
                        if let Some(victim) = pool.idle.pop_front() {
                            pool.workers.remove(&victim);
                        }
                    }
                    pool.idle.push_back(id);
                    break;
                }
            }
        }
    }

    /// Quiescence barrier: wait until every worker has finished and been
    /// reaped, then restore the configured idle level.
    ///
    /// Must not be called from inside a scheduled task; the calling task
    /// would wait for its own worker to terminate.
    pub fn wait_for_execution(&self) {
        let mut pool = self.inner.pool.lock();
        let saved_min_idle = pool.min_idle;
        pool.min_idle = 0;

        while !pool.workers.is_empty() {
            while let Some(id) = pool.idle.pop_front() {
                pool.workers.remove(&id);
            }
            drop(pool);
            thread::sleep(WORKER_POLL);
            pool = self.inner.pool.lock();
        }

        pool.min_idle = saved_min_idle;
    }

    /// Current amount of workers, idle and busy.
    pub fn thread_count(&self) -> usize {
        self.inner.pool.lock().workers.len()
    }

    /// Largest amount of workers observed at one time.
    pub fn max_thread_count(&self) -> usize {
        self.inner.pool.lock().max_seen
    }

    /// Amount of workers currently executing a task.
    pub fn busy_thread_count(&self) -> usize {
        let pool = self.inner.pool.lock();
        pool.workers.len() - pool.idle.len()
    }

    /// Amount of workers currently parked.
    pub fn idle_thread_count(&self) -> usize {
        self.inner.pool.lock().idle.len()
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.wait_for_execution();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn construction_starts_the_idle_level() {
        let scheduler = TaskScheduler::new(2, 8);
        assert_eq!(scheduler.thread_count(), 2);
        assert_eq!(scheduler.idle_thread_count(), 2);
        assert_eq!(scheduler.busy_thread_count(), 0);
        assert_eq!(scheduler.max_thread_count(), 2);
    }

    #[test]
    fn zero_parameters_are_clamped() {
        let scheduler = TaskScheduler::new(0, 0);
        assert_eq!(scheduler.thread_count(), 1);
        assert!(scheduler.schedule(|| {}, ScheduleFlags::empty()));
        scheduler.wait_for_execution();
    }

    #[test]
    fn wait_for_execution_is_a_quiescence_barrier() {
        let scheduler = TaskScheduler::new(2, 8);
        let finished = Arc::new(AtomicBool::new(false));
        let task_flag = finished.clone();
        scheduler.schedule(
            move || {
                thread::sleep(Duration::from_millis(100));
                task_flag.store(true, Ordering::SeqCst);
            },
            ScheduleFlags::empty(),
        );
        scheduler.wait_for_execution();
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(scheduler.busy_thread_count(), 0);
    }

    #[test]
    fn pool_grows_to_the_busy_limit() {
        let scheduler = TaskScheduler::new(2, 4);
        let release = Arc::new(AtomicBool::new(false));
        let executed = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let release = release.clone();
            let executed = executed.clone();
            assert!(scheduler.schedule(
                move || {
                    while !release.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(5));
                    }
                    executed.fetch_add(1, Ordering::SeqCst);
                },
                ScheduleFlags::empty(),
            ));
        }
        release.store(true, Ordering::SeqCst);
        scheduler.wait_for_execution();
        assert_eq!(executed.load(Ordering::SeqCst), 4);
        assert_eq!(scheduler.max_thread_count(), 4);
    }

    #[test]
    fn no_queue_fails_fast_when_saturated() {
        let scheduler = TaskScheduler::new(2, 2);
        let release = Arc::new(AtomicBool::new(false));
        for _ in 0..2 {
            let release = release.clone();
            assert!(scheduler.schedule(
                move || {
                    while !release.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(5));
                    }
                },
                ScheduleFlags::empty(),
            ));
        }
        // Both workers are pinned; the third submission queues, the fourth
        // is refused.
        assert!(scheduler.schedule(|| {}, ScheduleFlags::empty()));
        assert!(!scheduler.schedule(|| {}, ScheduleFlags::NO_QUEUE));
        release.store(true, Ordering::SeqCst);
        scheduler.wait_for_execution();
    }

    #[test]
    fn priority_tasks_overtake_queued_normal_tasks() {
        let scheduler = TaskScheduler::new(1, 1);
        let release = Arc::new(AtomicBool::new(false));
        let order = Arc::new(Mutex::new(Vec::new()));

        let gate = release.clone();
        scheduler.schedule(
            move || {
                while !gate.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
            },
            ScheduleFlags::empty(),
        );
        // The single worker is pinned; everything below lands in the queue.
        for tag in ["normal-1", "normal-2"] {
            let order = order.clone();
            scheduler.schedule(
                move || order.lock().push(tag),
                ScheduleFlags::empty(),
            );
        }
        {
            let order = order.clone();
            scheduler.schedule(
                move || order.lock().push("priority"),
                ScheduleFlags::PRIORITY,
            );
        }

        release.store(true, Ordering::SeqCst);
        scheduler.wait_for_execution();
        assert_eq!(*order.lock(), vec!["priority", "normal-1", "normal-2"]);
    }

    #[test]
    fn idle_pool_trims_back_to_the_configured_level() {
        let scheduler = TaskScheduler::new(1, 4);
        let release = Arc::new(AtomicBool::new(false));
        for _ in 0..4 {
            let release = release.clone();
            scheduler.schedule(
                move || {
                    while !release.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(5));
                    }
                },
                ScheduleFlags::empty(),
            );
        }
        release.store(true, Ordering::SeqCst);
        // Give the workers time to finish and trim the idle queue.
        thread::sleep(Duration::from_millis(200));
        assert!(scheduler.idle_thread_count() <= 2);
        scheduler.wait_for_execution();
    }
}
