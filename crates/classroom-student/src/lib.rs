//! # classroom-student
//!
//! Training-state management for classroom models.
//!
//! A [`Student`] owns a [`Model`](classroom_core::Model) and an
//! [`Optimizer`], shares a read-only [`Dataset`](classroom_core::Dataset),
//! and keeps:
//!
//! * per-step metrics (time, grade, baseline grade, relative grade);
//! * a bounded stack of frozen snapshots for `push()` / `pop()`;
//! * a baseline model, the model of the newest snapshot, that each study
//!   step scores alongside the live model.
//!
//! ## Usage
//!
//! ```text
//! let mut student = Student::new(model, optimizer, Arc::new(dataset), 16, 129)?;
//! for _ in 0..1000 {
//!     student.study()?;
//! }
//! student.save("student.json")?;
//!
//! // hill climbing
//! let outcome = HillClimber::new(32).trial(&mut student, &mut rng)?;
//! ```

pub mod adamw;
pub mod autocomplete;
pub mod checkpoint;
pub mod evolve;
pub mod metrics;
pub mod optimizer;
pub mod schedule;
pub mod sgd;
pub mod snapshot;
pub mod student;


pub use adamw::{AdamW, AdamWParams};
pub use autocomplete::{AutocompleteOptions, Generation, DEFAULT_N_GENERATE};
pub use checkpoint::CHECKPOINT_VERSION;
pub use evolve::{HillClimber, TrialOutcome};
pub use metrics::{Metrics, StudyRecord};
pub use optimizer::{Evaluation, Optimizer, ParamGroup, StepContext};
pub use schedule::LrSchedule;
pub use sgd::Sgd;
pub use snapshot::{Snapshot, SnapshotStack, DEFAULT_HISTORY_DEPTH};
pub use student::{Mutation, Student, MIN_MUTATED_LR, MUTATION_FACTORS};
