//! Progress coordination between background workers and observer threads
//!
//! **Why**: Long jobs (renders, encodes, batch conversions) run on worker
//! threads while the launching thread wants to watch fractional completion,
//! block until a milestone, or freeze the whole crew without tearing it down.
//!
//! **Used by**: `Task` (single background job), `execute_concurrently`
//! (fork-join worker teams), `Pipeline` (multi-stage composed fractions)
//!
//! # Monitor
//!
//! All counters live behind one mutex with four condition variables:
//!
//! - `progressed`: the fraction moved, milestone waiters should re-check
//! - `none_running`: every live worker is parked, a pause is complete
//! - `all_running`: every live worker runs again, a resume is complete
//! - `resume`: parked workers sleep here until the last pause hold is gone
//!
//! `min_wait` keeps [`Progress::increment`] cheap: waiters record the lowest
//! fraction anyone is blocked on, and increments only broadcast once that
//! threshold is crossed.
//!
//! # Pausing is cooperative
//!
//! Workers park at checkpoints ([`Progress::increment`] contains one,
//! [`Progress::checkpoint`] is the explicit form). A worker that never
//! reaches a checkpoint cannot be paused, and there is no preemptive
//! cancellation; [`Progress::request_cancel`] is a flag workers poll at
//! their own safe points.

use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Counters protected by the monitor mutex
#[derive(Debug)]
struct State {
    completed: usize, // work units finished, never decremented
    total: usize,     // expected work units, 0 = not yet calibrated
    done: bool,       // forces the fraction to 1.0 even when uncalibrated
    min_wait: f64,    // lowest fraction any blocked waiter needs
    workers: usize,   // live registered worker threads
    running: usize,   // registered workers not currently parked
    pausers: usize,   // outstanding pause holds from observers
}

impl State {
    /// Completion fraction in [0, 1], 0.0 while the total is unknown
    fn fraction(&self) -> f64 {
        if self.done {
            1.0
        } else if self.total == 0 {
            0.0
        } else {
            (self.completed as f64 / self.total as f64).min(1.0)
        }
    }
}

#[derive(Debug)]
struct Monitor {
    state: Mutex<State>,
    progressed: Condvar,
    none_running: Condvar,
    all_running: Condvar,
    resume: Condvar,
    cancelled: AtomicBool,
}

fn wait_on<'a>(cond: &Condvar, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
    cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

/// Shared progress coordinator for one background job.
///
/// Cloning is cheap (Arc bump) and every clone points at the same counters,
/// so the handle can be passed freely between the job, its workers, and any
/// number of observer threads.
///
/// The lifecycle is: the job owner calibrates the expected work with
/// [`set_total`](Self::set_total), workers call
/// [`increment`](Self::increment) per finished unit, observers read
/// [`fraction`](Self::fraction) or block in [`wait`](Self::wait), and the
/// job ends with [`finish`](Self::finish) (normally via the guard installed
/// by [`Task::spawn`](crate::task::Task::spawn)).
///
/// # Examples
///
/// ```
/// use espera::Progress;
///
/// let progress = Progress::with_total(2);
/// progress.increment();
/// assert_eq!(progress.fraction(), 0.5);
/// progress.increment();
/// assert!(progress.is_finished());
/// ```
#[derive(Debug, Clone)]
pub struct Progress {
    monitor: Arc<Monitor>,
}

/// One consistent view of a coordinator, read under a single lock.
///
/// For status displays that want more than the bare fraction. `paused`
/// counts workers currently parked at a checkpoint; `holds` counts pause
/// holds taken by observers and can run ahead of `paused` while a pause is
/// still collecting the team (or no team is registered yet).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Snapshot {
    pub completed: usize,
    pub total: usize,
    pub fraction: f64,
    pub finished: bool,
    pub workers: usize,
    pub running: usize,
    pub paused: usize,
    pub holds: usize,
    pub cancelled: bool,
}

impl Progress {
    /// Create a coordinator with an unknown total.
    ///
    /// Until [`set_total`](Self::set_total) calibrates it, the fraction
    /// reads 0.0 no matter how many increments arrive.
    pub fn new() -> Self {
        Self {
            monitor: Arc::new(Monitor {
                state: Mutex::new(State {
                    completed: 0,
                    total: 0,
                    done: false,
                    min_wait: 1.0,
                    workers: 0,
                    running: 0,
                    pausers: 0,
                }),
                progressed: Condvar::new(),
                none_running: Condvar::new(),
                all_running: Condvar::new(),
                resume: Condvar::new(),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    /// Create a coordinator already calibrated to `total` work units.
    pub fn with_total(total: usize) -> Self {
        let progress = Self::new();
        progress.set_total(total);
        progress
    }

    // finish() runs from drop guards during a panic unwind; recover the
    // counters from a poisoned lock instead of aborting the process. The
    // counters stay usable because no operation leaves them half-updated.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.monitor
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Calibrate the expected amount of work.
    ///
    /// Done once by the job owner, usually right after it figures out the
    /// job size (frame count, tile count). Calling it late is legal, the
    /// fraction just stays 0.0 until then. Recalibrating or passing 0 is a
    /// programming error.
    pub fn set_total(&self, total: usize) {
        let mut state = self.lock();
        debug_assert!(state.total == 0, "total can only be calibrated once");
        debug_assert!(total > 0, "total must be nonzero");
        if total == 0 {
            return;
        }
        state.total = total;
        // Late calibration can jump the fraction past a waiter's milestone.
        self.wake_progress(&mut state);
    }

    /// Record one finished unit of work and pass a pause checkpoint.
    ///
    /// Safe to call from any number of workers at once; units are counted
    /// under the lock so none are lost. Waiters whose milestone is reached
    /// are woken. If an observer holds a pause, the calling worker parks
    /// here until the last hold is released.
    pub fn increment(&self) {
        let mut state = self.lock();
        state.completed += 1;
        debug_assert!(
            state.done || state.total == 0 || state.completed <= state.total,
            "incremented past the calibrated total"
        );
        // Late increments after finish() clamp instead of pushing past total.
        if state.total != 0 && state.completed > state.total {
            state.completed = state.total;
        }
        self.wake_progress(&mut state);
        self.pause_point(state);
    }

    /// Force the fraction to 1.0 and release every waiter.
    ///
    /// Idempotent. Called on normal completion, early abort, or failure so
    /// no observer stays blocked; [`Task`](crate::task::Task) installs a
    /// guard that calls this on every exit path.
    pub fn finish(&self) {
        let mut state = self.lock();
        state.done = true;
        if state.total > 0 {
            state.completed = state.total;
        }
        state.min_wait = 1.0;
        self.monitor.progressed.notify_all();
    }

    /// Completion fraction in [0, 1].
    ///
    /// 0.0 while the total is uncalibrated, 1.0 once finished. Computed
    /// under the lock, so the completed/total pair is never read torn.
    pub fn fraction(&self) -> f64 {
        self.lock().fraction()
    }

    /// Whether the job has reached 1.0.
    pub fn is_finished(&self) -> bool {
        self.fraction() >= 1.0
    }

    /// Work units finished so far.
    pub fn completed(&self) -> usize {
        self.lock().completed
    }

    /// Calibrated total, 0 while unknown.
    pub fn total(&self) -> usize {
        self.lock().total
    }

    /// Block until the fraction reaches `fraction`.
    ///
    /// Returns immediately if the milestone is already met; `wait(0.0)`
    /// never blocks and `wait(1.0)` is the join point. Out-of-range inputs
    /// clamp to [0, 1], so waiting on 2.0 waits for completion rather than
    /// forever. [`finish`](Self::finish) releases all waiters regardless of
    /// milestone.
    pub fn wait(&self, fraction: f64) {
        debug_assert!(!fraction.is_nan(), "wait() needs a numeric fraction");
        let target = fraction.clamp(0.0, 1.0);
        let mut state = self.lock();
        while state.fraction() < target {
            if target < state.min_wait {
                state.min_wait = target;
            }
            state = wait_on(&self.monitor.progressed, state);
        }
    }

    /// Park every registered worker at its next checkpoint.
    ///
    /// **Why**: Interactive callers want to freeze a running job (to
    /// inspect intermediate output, or while the machine is needed for
    /// something else) without tearing down its threads.
    ///
    /// Blocks until all live workers are parked, then returns with the
    /// counters frozen. Several observers may hold pauses at once; workers
    /// run again only after every hold is released by a matching
    /// [`resume`](Self::resume). With no workers registered the hold is
    /// recorded and the call returns at once; workers launched afterwards
    /// park at their first checkpoint.
    ///
    /// Calling this from a worker of the same coordinator deadlocks: the
    /// worker would wait for itself to park. Pause only from observers.
    pub fn pause(&self) {
        let mut state = self.lock();
        // An in-flight resume may still be collecting workers; taking a
        // hold mid-collection would strand it.
        while state.running < state.workers {
            state = wait_on(&self.monitor.all_running, state);
        }
        state.pausers += 1;
        debug!("pause hold taken ({} active)", state.pausers);
        while state.running > 0 {
            state = wait_on(&self.monitor.none_running, state);
        }
    }

    /// Release one pause hold.
    ///
    /// The releaser of the last hold wakes all parked workers and blocks
    /// until every live worker runs again, so pause/resume pairs always
    /// bracket a fully stopped and a fully restarted crew. Every
    /// [`pause`](Self::pause) must be matched by exactly one `resume`.
    pub fn resume(&self) {
        let mut state = self.lock();
        debug_assert!(state.pausers > 0, "resume() without a matching pause()");
        if state.pausers == 0 {
            return;
        }
        state.pausers -= 1;
        debug!("pause hold released ({} active)", state.pausers);
        if state.pausers == 0 {
            self.monitor.resume.notify_all();
            while state.running < state.workers {
                state = wait_on(&self.monitor.all_running, state);
            }
        }
    }

    /// Explicit pause checkpoint for workers.
    ///
    /// Workers that go a long time between increments can offer extra
    /// pause opportunities by calling this inside their inner loops.
    /// Returns immediately when no pause is held.
    pub fn checkpoint(&self) {
        let state = self.lock();
        self.pause_point(state);
    }

    /// Ask the job to stop early.
    ///
    /// Purely cooperative: workers poll [`is_cancelled`](Self::is_cancelled)
    /// at their own safe points and wind down, and the job's finish guard
    /// releases any waiters. Nothing is interrupted preemptively.
    pub fn request_cancel(&self) {
        self.monitor.cancelled.store(true, Ordering::Relaxed);
    }

    /// Whether an observer asked the job to stop.
    pub fn is_cancelled(&self) -> bool {
        self.monitor.cancelled.load(Ordering::Relaxed)
    }

    /// One consistent copy of all counters for status displays.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.lock();
        Snapshot {
            completed: state.completed,
            total: state.total,
            fraction: state.fraction(),
            finished: state.fraction() >= 1.0,
            workers: state.workers,
            running: state.running,
            paused: state.workers - state.running,
            holds: state.pausers,
            cancelled: self.monitor.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Register the worker team before it launches.
    ///
    /// Workers start in the running state; a pause hold taken before the
    /// launch parks them at their first checkpoint.
    pub(crate) fn register_workers(&self, count: usize) {
        let mut state = self.lock();
        debug_assert!(state.workers == 0, "worker team already registered");
        state.workers = count;
        state.running = count;
        debug!("registered {} workers", count);
    }

    /// Permanently remove one worker from the live team.
    ///
    /// Keeps the pause/resume conditions consistent when workers finish at
    /// different times: a pauser waiting for the crew to park must not wait
    /// on a thread that already exited.
    pub(crate) fn worker_finished(&self) {
        let mut state = self.lock();
        debug_assert!(state.workers > 0, "worker_finished() with no workers registered");
        state.workers = state.workers.saturating_sub(1);
        state.running = state.running.saturating_sub(1);
        debug!("worker finished ({} remain)", state.workers);
        if state.running == state.workers {
            self.monitor.all_running.notify_all();
        }
        if state.running == 0 {
            self.monitor.none_running.notify_all();
        }
    }

    /// Wake milestone waiters whose threshold has been crossed.
    fn wake_progress(&self, state: &mut State) {
        if state.fraction() >= state.min_wait {
            state.min_wait = 1.0;
            self.monitor.progressed.notify_all();
        }
    }

    /// Park the calling worker while any pause hold is active.
    ///
    /// The last worker to park wakes the pausers; the last to unpark wakes
    /// resume's collection wait. Only registered workers may reach this
    /// with a hold active, everyone else passes straight through.
    fn pause_point(&self, mut state: MutexGuard<'_, State>) {
        if state.workers == 0 {
            return;
        }
        while state.pausers > 0 {
            debug_assert!(
                state.running > 0,
                "pause checkpoint from a thread that is not a registered worker"
            );
            state.running = state.running.saturating_sub(1);
            if state.running == 0 {
                self.monitor.none_running.notify_all();
            }
            while state.pausers > 0 {
                state = wait_on(&self.monitor.resume, state);
            }
            state.running += 1;
            if state.running == state.workers {
                self.monitor.all_running.notify_all();
            }
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}
