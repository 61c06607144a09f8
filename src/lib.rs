//! ESPERA - Progress futures for multi-threaded background work
//!
//! A background job gets a cloneable [`Progress`] coordinator: workers
//! count finished units into it, observers read the completion fraction,
//! block on milestones, pause and resume the whole worker team
//! cooperatively, or request a cooperative cancel. [`Task`] runs a job on
//! its own thread with a guarantee that the fraction completes on every
//! exit path, [`execute_concurrently`] fans a body out over a registered
//! worker team, and [`Pipeline`] composes several coordinators into one
//! weighted fraction.
//!
//! ```
//! use espera::Task;
//!
//! let task = Task::spawn("demo-job", |progress| {
//!     progress.set_total(3);
//!     for _ in 0..3 {
//!         progress.increment();
//!     }
//!     "done"
//! });
//!
//! task.progress().wait(1.0);
//! assert_eq!(task.progress().fraction(), 1.0);
//! assert_eq!(task.join().unwrap(), "done");
//! ```

// Coordinator core (counters, waits, pause/resume)
pub mod progress;

// Job launch and fork-join execution
pub mod task;

// Multi-stage composition
pub mod pipeline;

// Re-export the main types
pub use pipeline::Pipeline;
pub use progress::{Progress, Snapshot};
pub use task::{default_worker_count, execute_concurrently, Task, TaskError};
