//! The helper-thread pool and work dispatch.
//!
//! A fixed set of helpers is spawned on first use and lives until the
//! handle is dropped. One mutex guards pool bookkeeping only; two condvars
//! (`work_to_do`, `helpers_done`) replace the original three-event
//! handshake, and an atomic counter hands out work items.
//!
//! Dispatch of one job:
//!
//! 1. the main thread publishes the job and generation under the mutex,
//!    then signals `work_to_do` — so every plan write happens-before any
//!    helper read;
//! 2. each participating helper claims item indices by `fetch_add` on the
//!    shared counter until the count is exhausted (the calling thread may
//!    claim items the same way);
//! 3. each helper decrements `helpers_active` and parks again; the last
//!    one signals `helpers_done`, so helper writes happen-before the main
//!    thread's post-pass.
//!
//! There is no cancellation at item granularity; a termination flag is
//! checked only at the barrier. Each helper owns an engine clone for its
//! lifetime and runs the engine's worker lifecycle hooks.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::JoinHandle,
};

use crate::{engine::Engine, kernels::Elem};

// ======================================================================
// Scratch / WorkerSlot - CRATE

/// Per-worker line buffers, grown on demand and reused across items.
#[derive(Default)]
pub(crate) struct Scratch {
    pub a: Vec<Elem>,
    pub b: Vec<Elem>,
    pub full: Vec<Elem>,
    pub work: Vec<Elem>,
    pub work2: Vec<Elem>,
    pub tmp: Vec<Elem>,
    pub values: Vec<Elem>,
}

/// What a worker brings to each item: its private engine clone and its
/// scratch buffers.
pub(crate) struct WorkerSlot<E: Engine> {
    pub engine: E,
    pub scratch: Scratch,
}

impl<E: Engine> WorkerSlot<E> {
    pub(crate) fn new(engine: E) -> Self {
        Self {
            engine,
            scratch: Scratch::default(),
        }
    }
}

// ======================================================================
// Job - CRATE

/// A dispatched job: called once per claimed item index.
pub(crate) type Job<'j, E> = dyn Fn(usize, &mut WorkerSlot<E>) + Sync + 'j;

struct JobPtr<E: Engine>(*const Job<'static, E>);

impl<E: Engine> Clone for JobPtr<E> {
    fn clone(&self) -> Self {
        JobPtr(self.0)
    }
}
impl<E: Engine> Copy for JobPtr<E> {}

// The pointer is only dereferenced between `launch` and `wait`, while the
// borrow it was created from is still alive on the launching thread.
unsafe impl<E: Engine> Send for JobPtr<E> {}

// ======================================================================
// HelperPool - CRATE

struct State<E: Engine> {
    job: Option<JobPtr<E>>,
    items: usize,
    participants: usize,
    generation: u64,
    helpers_active: usize,
    terminating: bool,
}

struct Shared<E: Engine> {
    state: Mutex<State<E>>,
    work_to_do: Condvar,
    helpers_done: Condvar,
    next_item: AtomicUsize,
    engine: E,
}

pub(crate) struct HelperPool<E: Engine> {
    shared: Arc<Shared<E>>,
    threads: Vec<JoinHandle<()>>,
    helper_target: usize,
}

impl<E: Engine> HelperPool<E> {
    pub(crate) fn new(engine: E) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    job: None,
                    items: 0,
                    participants: 0,
                    generation: 0,
                    helpers_active: 0,
                    terminating: false,
                }),
                work_to_do: Condvar::new(),
                helpers_done: Condvar::new(),
                next_item: AtomicUsize::new(0),
                engine,
            }),
            threads: Vec::new(),
            helper_target: 0,
        }
    }

    /// Sets how many helpers the pool will run. Growth takes effect on the
    /// next launch; the pool never shrinks once spawned.
    pub(crate) fn set_helper_target(&mut self, helpers: usize) {
        self.helper_target = helpers.max(self.threads.len());
    }

    pub(crate) fn spawned(&self) -> usize {
        self.threads.len()
    }

    /// Publishes a job and wakes the helpers. At most `participants`
    /// helpers claim items; the rest pass straight through the barrier.
    ///
    /// The caller must keep `job` alive and must not touch the work's data
    /// until [`wait`](Self::wait) returns; every caller in this crate
    /// launches and waits inside a single scope.
    pub(crate) fn launch(&mut self, items: usize, participants: usize, job: &Job<'_, E>) {
        self.ensure_spawned();

        // Erase the borrow; helpers only use the pointer before `wait`
        // returns, while the borrow is still live.
        let job: *const Job<'_, E> = job;
        let job: *const Job<'static, E> = unsafe { std::mem::transmute(job) };

        let helpers = self.threads.len();
        {
            let mut state = self.shared.state.lock().unwrap();
            assert!(state.job.is_none(), "helper job already active");
            state.job = Some(JobPtr(job));
            state.items = items;
            state.participants = participants;
            state.helpers_active = helpers;
            state.generation += 1;
            self.shared.next_item.store(0, Ordering::Relaxed);
        }
        self.shared.work_to_do.notify_all();
    }

    /// Claims items on the calling thread, exactly like a helper would.
    pub(crate) fn run_items(&self, items: usize, job: &Job<'_, E>, slot: &mut WorkerSlot<E>) {
        loop {
            let item = self.shared.next_item.fetch_add(1, Ordering::Relaxed);
            if item >= items {
                break;
            }
            job(item, slot);
        }
    }

    /// Blocks until every helper has passed the barrier, then clears the
    /// job slot.
    pub(crate) fn wait(&self) {
        let mut state = self.shared.state.lock().unwrap();
        while state.helpers_active > 0 {
            state = self.shared.helpers_done.wait(state).unwrap();
        }
        state.job = None;
    }

    fn ensure_spawned(&mut self) {
        while self.threads.len() < self.helper_target {
            let shared = Arc::clone(&self.shared);
            let index = self.threads.len();
            self.threads
                .push(std::thread::spawn(move || worker_main(shared, index)));
        }
    }
}

impl<E: Engine> Drop for HelperPool<E> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.terminating = true;
        }
        self.shared.work_to_do.notify_all();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

// ======================================================================
// FUNCTIONS - PRIVATE

fn worker_main<E: Engine>(shared: Arc<Shared<E>>, index: usize) {
    let engine = shared.engine.worker_clone();
    engine.worker_start();
    let mut slot = WorkerSlot::new(engine);

    let mut seen_generation = 0u64;
    loop {
        let claimed = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.terminating {
                    drop(state);
                    slot.engine.worker_stop();
                    return;
                }
                if state.generation != seen_generation && state.job.is_some() {
                    break;
                }
                state = shared.work_to_do.wait(state).unwrap();
            }
            seen_generation = state.generation;
            let participates = index < state.participants;
            participates.then(|| (state.job.unwrap(), state.items))
        };

        if let Some((job, items)) = claimed {
            // The launching thread keeps the job borrow alive until its
            // `wait` returns, which cannot happen before our decrement
            // below.
            let job = unsafe { &*job.0 };
            loop {
                let item = shared.next_item.fetch_add(1, Ordering::Relaxed);
                if item >= items {
                    break;
                }
                job(item, &mut slot);
            }
        }

        let mut state = shared.state.lock().unwrap();
        state.helpers_active -= 1;
        if state.helpers_active == 0 {
            shared.helpers_done.notify_all();
        }
    }
}

// ======================================================================
// SharedSliceMut - CRATE

/// Raw view of a mutable slice for index-disjoint access across workers.
pub(crate) struct SharedSliceMut<T> {
    ptr: *mut T,
    len: usize,
}

unsafe impl<T: Send> Send for SharedSliceMut<T> {}
unsafe impl<T: Send> Sync for SharedSliceMut<T> {}

impl<T> SharedSliceMut<T> {
    pub(crate) fn new(slice: &mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// # Safety
    ///
    /// Each index must be accessed by at most one worker at a time; the
    /// pool's claim counter provides that.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn get_mut(&self, index: usize) -> &mut T {
        debug_assert!(index < self.len);
        &mut *self.ptr.add(index)
    }
}

// ======================================================================
// TESTS
