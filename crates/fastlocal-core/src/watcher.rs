//! Thread death notification.
//!
//! A [`ThreadDeathWatcher`] is told "watch this thread, and run this job when
//! it dies". Watching installs a sentinel in the watched thread's
//! thread-locals; when the thread exits, the sentinel's destructor queues the
//! thread id and wakes a background worker, which runs the jobs off the dying
//! thread. The worker is spawned on demand and exits once nothing is watched.
//!
//! ## Integration
//!
//! With `FASTLOCAL_DEATH_WATCH=on`, the first variable tracked on a thread
//! adds the thread to a process-wide set of tracked threads and watches it
//! with a job that removes that entry again. `remove_all` untracks and
//! unwatches first. Jobs only ever drop bookkeeping; they are never handed a
//! slot table. The table itself is freed by the dying thread's own
//! thread-local destructors.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, LazyLock, OnceLock, Weak};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::metrics::{LocalMetrics, global_metrics};

/// Cleanup job run after a watched thread dies.
pub type DeathJob = Box<dyn FnOnce() + Send + 'static>;

/// Upper bound on how long the worker sleeps between queue checks.
const WORKER_POLL: Duration = Duration::from_millis(250);

/// A thread death notification service.
pub trait DeathWatch: Send + Sync {
    /// Run `job` once `thread` has died. Must be called from `thread` itself.
    fn watch(&self, thread: ThreadId, job: DeathJob);

    /// Cancel every pending job for `thread` without running it.
    fn unwatch(&self, thread: ThreadId);
}

#[derive(Default)]
struct WatcherState {
    watched: HashMap<ThreadId, Vec<DeathJob>>,
    dead: VecDeque<ThreadId>,
    worker_running: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<WatcherState>,
    changed: Condvar,
}

impl Shared {
    fn thread_died(&self, thread: ThreadId) {
        let mut state = self.state.lock();
        if state.watched.contains_key(&thread) {
            state.dead.push_back(thread);
            self.changed.notify_all();
        }
    }
}

/// Lives in a watched thread's locals; reports the thread's death on drop.
struct DeathSentinel {
    thread: ThreadId,
    watchers: Vec<Weak<Shared>>,
}

impl DeathSentinel {
    fn attach(&mut self, shared: &Arc<Shared>) {
        if !self
            .watchers
            .iter()
            .any(|w| w.as_ptr() == Arc::as_ptr(shared))
        {
            self.watchers.push(Arc::downgrade(shared));
        }
    }
}

impl Drop for DeathSentinel {
    fn drop(&mut self) {
        for shared in self.watchers.iter().filter_map(Weak::upgrade) {
            shared.thread_died(self.thread);
        }
    }
}

thread_local! {
    static SENTINEL: RefCell<Option<DeathSentinel>> = const { RefCell::new(None) };
}

/// Background-worker implementation of [`DeathWatch`].
#[derive(Clone, Default)]
pub struct ThreadDeathWatcher {
    shared: Arc<Shared>,
}

impl ThreadDeathWatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of threads with pending jobs.
    #[must_use]
    pub fn watched_count(&self) -> usize {
        self.shared.state.lock().watched.len()
    }

    /// True while the background worker is alive.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.state.lock().worker_running
    }

    /// Wait until the worker has exited (nothing left to watch).
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub fn await_inactivity(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.shared.state.lock();
        while state.worker_running {
            match deadline {
                Some(deadline) => {
                    if self.shared.changed.wait_until(&mut state, deadline).timed_out() {
                        return !state.worker_running;
                    }
                }
                None => self.shared.changed.wait(&mut state),
            }
        }
        true
    }

    fn ensure_worker(&self, state: &mut MutexGuard<'_, WatcherState>) {
        if state.worker_running {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("fastlocal-death-watcher".to_string())
            .spawn(move || run_worker(&shared));
        // If the spawn fails the jobs stay queued; the next watch retries.
        state.worker_running = spawned.is_ok();
    }
}

impl DeathWatch for ThreadDeathWatcher {
    fn watch(&self, thread: ThreadId, job: DeathJob) {
        let installed = SENTINEL
            .try_with(|slot| {
                slot.borrow_mut()
                    .get_or_insert_with(|| DeathSentinel {
                        thread,
                        watchers: Vec::new(),
                    })
                    .attach(&self.shared);
            })
            .is_ok();
        if !installed {
            // The thread is already tearing down its locals.
            job();
            return;
        }

        let mut state = self.shared.state.lock();
        state.watched.entry(thread).or_default().push(job);
        self.ensure_worker(&mut state);
    }

    fn unwatch(&self, thread: ThreadId) {
        let cancelled = {
            let mut state = self.shared.state.lock();
            let cancelled = state.watched.remove(&thread);
            // Lets an idle worker notice there is nothing left to watch.
            self.shared.changed.notify_all();
            cancelled
        };
        drop(cancelled);
    }
}

fn run_worker(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        while let Some(thread) = state.dead.pop_front() {
            let jobs = state.watched.remove(&thread).unwrap_or_default();
            MutexGuard::unlocked(&mut state, || {
                for job in jobs {
                    // A panicking job must not take the worker down with it.
                    let _ = catch_unwind(AssertUnwindSafe(job));
                }
            });
        }
        if state.watched.is_empty() {
            state.worker_running = false;
            shared.changed.notify_all();
            return;
        }
        shared.changed.wait_for(&mut state, WORKER_POLL);
    }
}

static GLOBAL_WATCHER: OnceLock<ThreadDeathWatcher> = OnceLock::new();

/// The process-wide watcher used by the variable integration.
pub fn global_watcher() -> &'static ThreadDeathWatcher {
    GLOBAL_WATCHER.get_or_init(ThreadDeathWatcher::new)
}

// Threads that currently hold removal bookkeeping and are being watched.
static TRACKED_THREADS: LazyLock<Mutex<HashSet<ThreadId>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

thread_local! {
    static CURRENT_ID: ThreadId = std::thread::current().id();
}

fn current_thread_id() -> Option<ThreadId> {
    CURRENT_ID.try_with(|id| *id).ok()
}

/// Start tracking the calling thread and watch it for death.
pub(crate) fn track_current_thread() {
    let Some(thread) = current_thread_id() else {
        return;
    };
    if !TRACKED_THREADS.lock().insert(thread) {
        return;
    }
    LocalMetrics::inc(&global_metrics().threads_watched);
    global_watcher().watch(
        thread,
        Box::new(move || {
            TRACKED_THREADS.lock().remove(&thread);
            LocalMetrics::inc(&global_metrics().death_jobs_run);
        }),
    );
}

/// Stop tracking the calling thread, cancelling its death job.
pub(crate) fn untrack_current_thread() {
    let Some(thread) = current_thread_id() else {
        return;
    };
    if TRACKED_THREADS.lock().remove(&thread) {
        global_watcher().unwatch(thread);
    }
}

/// Number of threads currently tracked through the death watcher.
#[must_use]
pub fn tracked_thread_count() -> usize {
    TRACKED_THREADS.lock().len()
}
