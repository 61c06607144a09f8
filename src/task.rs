//! Background task launch and fork-join worker execution
//!
//! **Why**: Job entry points should return immediately with a progress
//! handle while the work runs on its own thread, and compute-heavy bodies
//! need a splitter that fans them out over a worker team registered for
//! pause/resume coordination.
//!
//! **Used by**: Library consumers; the worker registration side of
//! [`Progress`] is driven from here.
//!
//! # Completion guarantee
//!
//! Every spawned body runs under a finish guard: whether it returns a
//! value, returns an error, or panics, the coordinator reads 1.0 afterwards
//! and blocked observers are released. Dropping an unjoined [`Task`]
//! detaches the thread; the guard still runs.

use log::{debug, error};
use std::thread;

use crate::progress::Progress;

/// Task failure surfaced by [`Task::join`]
#[derive(Debug)]
pub enum TaskError {
    Panicked(String),
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::Panicked(msg) => write!(f, "Background task panicked: {}", msg),
        }
    }
}

impl std::error::Error for TaskError {}

/// Calls `finish()` on every exit path, panic included.
struct FinishGuard {
    progress: Progress,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.progress.finish();
    }
}

/// Unregisters one worker on every exit path, panic included.
struct WorkerGuard<'a> {
    progress: &'a Progress,
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        self.progress.worker_finished();
    }
}

/// A background job paired with its progress coordinator.
///
/// [`Task::spawn`] starts the body on a named OS thread and hands it a
/// [`Progress`] handle; the caller keeps its own clone for watching,
/// pausing, or cancelling. [`Task::join`] collects the body's value.
///
/// # Examples
///
/// ```
/// use espera::Task;
///
/// let task = Task::spawn("thumbnail-job", |progress| {
///     progress.set_total(3);
///     for _ in 0..3 {
///         progress.increment();
///     }
///     "3 thumbnails"
/// });
///
/// task.progress().wait(1.0);
/// assert_eq!(task.join().unwrap(), "3 thumbnails");
/// ```
pub struct Task<T> {
    progress: Progress,
    handle: Option<thread::JoinHandle<T>>,
    name: String,
}

impl<T> Task<T> {
    /// Spawn `body` on a named background thread.
    ///
    /// The body receives the task's coordinator; a finish guard around it
    /// makes sure the fraction reads 1.0 once the thread exits, no matter
    /// how it exits.
    pub fn spawn<F>(name: &str, body: F) -> Self
    where
        F: FnOnce(&Progress) -> T + Send + 'static,
        T: Send + 'static,
    {
        let progress = Progress::new();
        let inner = progress.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let guard = FinishGuard { progress: inner };
                body(&guard.progress)
            })
            .expect("Failed to spawn task thread");
        debug!("Task '{}' spawned", name);

        Self {
            progress,
            handle: Some(handle),
            name: name.to_string(),
        }
    }

    /// Clone of the coordinator, for observer threads.
    pub fn progress(&self) -> Progress {
        self.progress.clone()
    }

    /// Thread name the task was spawned with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the body to finish and return its value.
    ///
    /// A panicking body is reported as [`TaskError::Panicked`] with the
    /// panic message; its waiters were already released by the finish
    /// guard before the panic propagated here.
    pub fn join(mut self) -> Result<T, TaskError> {
        let handle = self.handle.take().expect("Task already joined");
        match handle.join() {
            Ok(value) => {
                debug!("Task '{}' joined", self.name);
                Ok(value)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Task '{}' panicked: {}", self.name, message);
                Err(TaskError::Panicked(message))
            }
        }
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            debug!("Task '{}' detached", self.name);
        }
        // Handle drops here, the thread keeps running on its own.
    }
}

/// Worker count used when a caller passes 0: one per logical CPU.
pub fn default_worker_count() -> usize {
    num_cpus::get()
}

/// Run `body` on a team of worker threads and wait for all of them.
///
/// Registers `workers` threads on the coordinator (0 selects
/// [`default_worker_count`]), spawns them named, and calls
/// `body(index, count)` on each. Workers hit a checkpoint before their
/// first unit of work, so a pause hold taken before the launch parks the
/// whole team at birth, and each worker unregisters itself on exit so
/// pause/resume never waits on a finished thread.
///
/// The first body error (by worker index) is returned after all workers
/// were joined. If a worker panicked, the panic is resumed on the calling
/// thread once the rest of the team has been collected.
///
/// # Examples
///
/// ```
/// use espera::{execute_concurrently, Progress};
///
/// let progress = Progress::with_total(8);
/// let worker = progress.clone();
/// execute_concurrently(&progress, 4, move |_index, count| {
///     for _ in 0..(8 / count) {
///         worker.increment();
///     }
///     Ok::<(), std::io::Error>(())
/// })
/// .unwrap();
/// assert_eq!(progress.fraction(), 1.0);
/// ```
pub fn execute_concurrently<F, E>(progress: &Progress, workers: usize, body: F) -> Result<(), E>
where
    F: Fn(usize, usize) -> Result<(), E> + Sync,
    E: Send,
{
    let count = if workers == 0 {
        default_worker_count()
    } else {
        workers
    };
    progress.register_workers(count);

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let body = &body;
            let handle = thread::Builder::new()
                .name(format!("espera-worker-{}", index))
                .spawn_scoped(scope, move || {
                    let _live = WorkerGuard { progress };
                    // Park right away if a pause hold predates the launch.
                    progress.checkpoint();
                    body(index, count)
                })
                .expect("Failed to spawn worker thread");
            handles.push(handle);
        }

        let mut result = Ok(());
        let mut panic = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
                Err(payload) => {
                    error!("Worker thread panicked: {}", panic_message(payload.as_ref()));
                    if panic.is_none() {
                        panic = Some(payload);
                    }
                }
            }
        }
        if let Some(payload) = panic {
            std::panic::resume_unwind(payload);
        }
        result
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Test: Spawn, watch, join
    /// Validates: The body's value comes back and the fraction completes
    #[test]
    fn test_task_spawn_and_join() {
        init_logs();
        let task = Task::spawn("count-job", |progress: &Progress| {
            progress.set_total(4);
            for _ in 0..4 {
                progress.increment();
            }
            42
        });

        assert_eq!(task.name(), "count-job");
        let progress = task.progress();
        progress.wait(1.0);
        assert_eq!(progress.fraction(), 1.0);
        assert_eq!(task.join().unwrap(), 42);
    }

    /// Test: Body fails partway through
    /// Validates: The finish guard releases waiters even though only 3 of
    /// 10 units were done, and the error value comes back intact
    #[test]
    fn test_finish_guard_releases_on_error() {
        let task = Task::spawn("failing-job", |progress: &Progress| -> anyhow::Result<()> {
            progress.set_total(10);
            for _ in 0..3 {
                progress.increment();
            }
            anyhow::bail!("input file vanished")
        });

        let progress = task.progress();
        progress.wait(1.0);
        assert_eq!(progress.fraction(), 1.0);

        let result = task.join().unwrap();
        assert!(result.unwrap_err().to_string().contains("input file vanished"));
    }

    /// Test: Body panics partway through
    /// Validates: Waiters are released by the guard and join reports the
    /// panic message instead of propagating it
    #[test]
    fn test_panicked_task_reports() {
        init_logs();
        let task = Task::spawn("panicking-job", |progress: &Progress| {
            progress.set_total(10);
            for _ in 0..3 {
                progress.increment();
            }
            panic!("codec crashed");
        });

        let progress = task.progress();
        progress.wait(1.0);
        assert!(progress.is_finished());

        let err = task.join().unwrap_err();
        assert!(matches!(err, TaskError::Panicked(_)));
        assert!(err.to_string().contains("codec crashed"));
    }

    /// Test: Dropping an unjoined task
    /// Validates: The thread detaches and its guard still completes the job
    #[test]
    fn test_detached_task_still_finishes() {
        let (release, gate) = bounded::<()>(0);
        let task = Task::spawn("detached-job", move |progress: &Progress| {
            progress.set_total(1);
            gate.recv().unwrap();
            progress.increment();
        });

        let progress = task.progress();
        drop(task);

        release.send(()).unwrap();
        progress.wait(1.0);
        assert!(progress.is_finished());
    }

    /// Test: Fork-join over a worker team
    /// Validates: Every index runs exactly once and all workers unregister
    #[test]
    fn test_execute_runs_every_worker() {
        const WORKERS: usize = 4;
        let progress = Progress::with_total(WORKERS);
        let seen = Arc::new(Mutex::new(vec![false; WORKERS]));

        let inner = progress.clone();
        let board = seen.clone();
        execute_concurrently(&progress, WORKERS, move |index, count| {
            assert_eq!(count, WORKERS);
            board.lock().unwrap()[index] = true;
            inner.increment();
            anyhow::Ok(())
        })
        .unwrap();

        assert!(seen.lock().unwrap().iter().all(|&ran| ran));
        assert_eq!(progress.completed(), WORKERS);
        assert_eq!(progress.snapshot().workers, 0);
    }

    /// Test: Worker count 0
    /// Validates: The CPU-derived default is selected and passed to bodies
    #[test]
    fn test_zero_workers_selects_default() {
        let progress = Progress::new();
        let inner = progress.clone();
        execute_concurrently(&progress, 0, move |index, count| {
            assert_eq!(count, default_worker_count());
            assert!(index < count);
            inner.increment();
            anyhow::Ok(())
        })
        .unwrap();

        assert_eq!(progress.completed(), default_worker_count());
        assert!(default_worker_count() >= 1);
    }

    /// Test: Worker errors
    /// Validates: The lowest-indexed error wins, later ones are dropped
    #[test]
    fn test_execute_first_error_wins() {
        let progress = Progress::new();
        let result = execute_concurrently(&progress, 4, |index, _count| {
            if index >= 1 {
                anyhow::bail!("worker {} failed", index);
            }
            Ok(())
        });

        assert_eq!(result.unwrap_err().to_string(), "worker 1 failed");
    }

    /// Test: Worker panics
    /// Validates: The panic resumes on the caller after the team is joined
    #[test]
    #[should_panic(expected = "worker exploded")]
    fn test_execute_propagates_panic() {
        let progress = Progress::new();
        let _ = execute_concurrently(&progress, 2, |index, _count| {
            if index == 1 {
                panic!("worker exploded");
            }
            anyhow::Ok(())
        });
    }

    /// Test: Pause hold taken before the team launches
    /// Validates: Workers park at their birth checkpoint, nothing is
    /// counted until the hold is released
    #[test]
    fn test_pause_before_launch_parks_at_birth() {
        init_logs();
        let progress = Progress::with_total(4);
        progress.pause(); // no workers yet, the hold is just recorded
        assert_eq!(progress.snapshot().holds, 1);

        let runner = {
            let progress = progress.clone();
            thread::spawn(move || {
                let inner = progress.clone();
                execute_concurrently(&progress, 2, move |_index, _count| {
                    inner.increment();
                    inner.increment();
                    anyhow::Ok(())
                })
            })
        };

        // Give the team time to launch; the hold must keep it at zero.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(progress.completed(), 0);
        // The hold stays visible whether or not the team has parked yet.
        assert_eq!(progress.snapshot().holds, 1);

        progress.resume();
        assert_eq!(progress.snapshot().holds, 0);
        runner.join().unwrap().unwrap();
        assert_eq!(progress.fraction(), 1.0);
    }
}
