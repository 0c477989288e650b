//! Serialized task scheduler.
//!
//! One worker task drains two queues: a FIFO "now" queue and a "later" queue
//! ordered by absolute deadline. Tasks queued through the same scheduler tree
//! run strictly one at a time, so a scheduler doubles as a coarse lock for
//! the state of every component that queues onto it.
//!
//! Components take a child [`SchedulerHandle`] off a parent; children share
//! the parent's worker but tag their tasks with their own handle id, so a
//! dropped handle clears exactly its own pending work.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as MemOrd};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use tokio::sync::Notify;
use tracing::trace;

/// Process tick origin; all deadlines and activity stamps are milliseconds
/// since this instant.
static TICK_ORIGIN: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic milliseconds since process start.
pub fn ticks_ms() -> u64 {
    TICK_ORIGIN.elapsed().as_millis() as u64
}

/// Opaque id of a queued task, usable with [`SchedulerHandle::kill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(u64);

type TaskFn = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    id: u64,
    owner: u64,
    tag: &'static str,
    run: TaskFn,
}

struct LaterEntry {
    deadline: u64,
    entry: Entry,
}

impl Ord for LaterEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: earliest deadline pops first, ties FIFO
        // by queueing order (smaller task id first).
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.entry.id.cmp(&self.entry.id))
    }
}

impl PartialOrd for LaterEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for LaterEntry {
    fn eq(&self, other: &Self) -> bool {
        self.entry.id == other.entry.id
    }
}

impl Eq for LaterEntry {}

#[derive(Default)]
struct Queues {
    now: VecDeque<Entry>,
    later: BinaryHeap<LaterEntry>,
}

struct Inner {
    queues: Mutex<Queues>,
    wakeup: Notify,
    should_run: AtomicBool,
    next_task: AtomicU64,
    next_handle: AtomicU64,
    handles: AtomicUsize,
}

impl Inner {
    fn enqueue(&self, owner: u64, tag: &'static str, delay_ms: u64, run: TaskFn) -> TaskId {
        let id = self.next_task.fetch_add(1, MemOrd::Relaxed);
        let entry = Entry {
            id,
            owner,
            tag,
            run,
        };
        {
            let mut q = self.queues.lock().unwrap();
            if delay_ms == 0 {
                q.now.push_back(entry);
            } else {
                q.later.push(LaterEntry {
                    deadline: ticks_ms() + delay_ms,
                    entry,
                });
            }
        }
        self.wakeup.notify_one();
        TaskId(id)
    }

    fn remove_where(&self, pred: impl Fn(&Entry) -> bool) {
        let mut q = self.queues.lock().unwrap();
        q.now.retain(|e| !pred(e));
        let later = std::mem::take(&mut q.later);
        q.later = later.into_iter().filter(|l| !pred(&l.entry)).collect();
    }

    fn release_one(&self, owner: u64) {
        self.remove_where(|e| e.owner == owner);
        if self.handles.fetch_sub(1, MemOrd::AcqRel) == 1 {
            self.should_run.store(false, MemOrd::Release);
            self.wakeup.notify_one();
        }
    }
}

// ─── Worker ───────────────────────────────────────────────────────────────────

async fn worker(inner: Arc<Inner>) {
    loop {
        // Promote due later-tasks, then take one now-task.
        let (task, next_deadline) = {
            let mut q = inner.queues.lock().unwrap();
            let now = ticks_ms();
            while q
                .later
                .peek()
                .map(|l| l.deadline <= now)
                .unwrap_or(false)
            {
                let l = q.later.pop().unwrap();
                q.now.push_back(l.entry);
            }
            (q.now.pop_front(), q.later.peek().map(|l| l.deadline))
        };

        if let Some(entry) = task {
            trace!(tag = entry.tag, "running task");
            (entry.run)();
            continue;
        }

        if !inner.should_run.load(MemOrd::Acquire) {
            break;
        }

        match next_deadline {
            Some(deadline) => {
                let wait = deadline.saturating_sub(ticks_ms());
                tokio::select! {
                    _ = inner.wakeup.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(wait)) => {}
                }
            }
            None => inner.wakeup.notified().await,
        }
    }
    trace!("scheduler worker exited");
}

// ─── Public types ─────────────────────────────────────────────────────────────

/// A root scheduler: owns the worker task. Also usable as a handle via
/// [`Scheduler::handle`].
pub struct Scheduler {
    inner: Arc<Inner>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// One component's slot on a scheduler. Dropping the handle clears every
/// task queued through it; dropping the last handle stops the worker.
pub struct SchedulerHandle {
    inner: Arc<Inner>,
    id: u64,
}

impl Scheduler {
    /// Create a scheduler and spawn its worker on the current runtime.
    pub fn new() -> Arc<Scheduler> {
        let inner = Arc::new(Inner {
            queues: Mutex::new(Queues::default()),
            wakeup: Notify::new(),
            should_run: AtomicBool::new(true),
            next_task: AtomicU64::new(1),
            next_handle: AtomicU64::new(1),
            handles: AtomicUsize::new(0),
        });
        let worker = tokio::spawn(worker(inner.clone()));
        Arc::new(Scheduler {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Take a new child handle sharing this scheduler's worker.
    pub fn handle(&self) -> Arc<SchedulerHandle> {
        let id = self.inner.next_handle.fetch_add(1, MemOrd::Relaxed);
        self.inner.handles.fetch_add(1, MemOrd::AcqRel);
        Arc::new(SchedulerHandle {
            inner: self.inner.clone(),
            id,
        })
    }

    /// Wait for the worker to exit. The worker exits once every handle has
    /// been dropped and the remaining queue has drained.
    pub async fn join(&self) {
        let handle = self.worker.lock().unwrap().take();
        if let Some(h) = handle {
            let _ = h.await;
        }
    }
}

impl SchedulerHandle {
    /// Take a sibling handle on the same worker.
    pub fn child(&self) -> Arc<SchedulerHandle> {
        let id = self.inner.next_handle.fetch_add(1, MemOrd::Relaxed);
        self.inner.handles.fetch_add(1, MemOrd::AcqRel);
        Arc::new(SchedulerHandle {
            inner: self.inner.clone(),
            id,
        })
    }

    /// Append a task to the now-queue (FIFO).
    pub fn queue(&self, tag: &'static str, run: impl FnOnce() + Send + 'static) -> TaskId {
        self.inner.enqueue(self.id, tag, 0, Box::new(run))
    }

    /// Insert a task into the later-queue, due `delay_ms` from now.
    pub fn defer(
        &self,
        tag: &'static str,
        delay_ms: u64,
        run: impl FnOnce() + Send + 'static,
    ) -> TaskId {
        self.inner.enqueue(self.id, tag, delay_ms, Box::new(run))
    }

    /// Remove one pending task by id. A task already running is unaffected.
    pub fn kill(&self, id: TaskId) {
        self.inner.remove_where(|e| e.id == id.0);
    }

    /// Remove every pending task this handle queued under `tag`.
    pub fn clear(&self, tag: &'static str) {
        let owner = self.id;
        self.inner.remove_where(|e| e.owner == owner && e.tag == tag);
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.inner.release_one(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_now_tasks_run_fifo() {
        let sched = Scheduler::new();
        let h = sched.handle();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5u32 {
            let order = order.clone();
            h.queue("t", move || order.lock().unwrap().push(i));
        }
        settle().await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_deferred_runs_after_delay() {
        let sched = Scheduler::new();
        let h = sched.handle();
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        h.defer("t", 30, move || {
            hits2.fetch_add(1, MemOrd::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(hits.load(MemOrd::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(hits.load(MemOrd::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deadline_ordering() {
        let sched = Scheduler::new();
        let h = sched.handle();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (order.clone(), order.clone());
        h.defer("t", 60, move || a.lock().unwrap().push("late"));
        h.defer("t", 20, move || b.lock().unwrap().push("early"));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*order.lock().unwrap(), vec!["early", "late"]);
    }

    #[tokio::test]
    async fn test_clear_removes_tagged_tasks_only() {
        let sched = Scheduler::new();
        let h = sched.handle();
        let hits = Arc::new(AtomicU32::new(0));
        let (a, b) = (hits.clone(), hits.clone());
        h.defer("victim", 30, move || {
            a.fetch_add(1, MemOrd::SeqCst);
        });
        h.defer("keeper", 30, move || {
            b.fetch_add(10, MemOrd::SeqCst);
        });
        h.clear("victim");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(MemOrd::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_kill_removes_task() {
        let sched = Scheduler::new();
        let h = sched.handle();
        let hits = Arc::new(AtomicU32::new(0));
        let a = hits.clone();
        let id = h.defer("t", 30, move || {
            a.fetch_add(1, MemOrd::SeqCst);
        });
        h.kill(id);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(MemOrd::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_drop_clears_handle_tasks() {
        let sched = Scheduler::new();
        let h = sched.handle();
        let other = sched.handle();
        let hits = Arc::new(AtomicU32::new(0));
        let (a, b) = (hits.clone(), hits.clone());
        h.defer("t", 30, move || {
            a.fetch_add(1, MemOrd::SeqCst);
        });
        other.defer("t", 30, move || {
            b.fetch_add(10, MemOrd::SeqCst);
        });
        drop(h);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(MemOrd::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_worker_exits_after_last_handle() {
        let sched = Scheduler::new();
        let h = sched.handle();
        h.queue("t", || {});
        drop(h);
        // join must complete.
        tokio::time::timeout(Duration::from_secs(1), sched.join())
            .await
            .expect("worker did not exit");
    }
}
