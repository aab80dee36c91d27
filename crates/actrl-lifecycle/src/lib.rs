//! ---
//! actrl_section: "02-lifecycle"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Activity lifecycle engine shared exports."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
//! Lifecycle engine for activities hosted on a controller node.
//!
//! The crate is leaf-first: [`state`] and [`transition`] are pure, the
//! [`instance`] controller wraps one managed activity behind a per-activity
//! lock, the [`sequencer`] chains multi-step goals, the [`watcher`] samples
//! cached health and the [`serializer`] runs callbacks one at a time.
#![warn(missing_docs)]

pub mod activity;
pub mod error;
pub mod instance;
pub mod sequencer;
pub mod serializer;
pub mod state;
pub mod transition;
pub mod watcher;

pub use activity::{
    ActivityConfiguration, ActivityContext, ActivityFactory, ActivityFilesystem,
    ActivityStatusListener, AutostartPolicy, InstalledActivity, ManagedActivity,
    MemoryConfiguration, StatusListener,
};
pub use error::{LifecycleError, Result};
pub use instance::{InstanceController, LockState, DEFAULT_LOCK_WAIT};
pub use sequencer::{Advance, TransitionSequencer};
pub use serializer::EventSerializer;
pub use state::{ActivityState, ActivityStatus};
pub use transition::{Operation, Transition, TransitionPlan, TransitionResult};
pub use watcher::{spawn_watcher_task, ActivityWatcher, WatchedActivity, WatcherListener};
