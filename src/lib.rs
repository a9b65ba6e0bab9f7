//! # Fanout
//!
//! Run one command against many targets at once, with a cap on how many run
//! concurrently.
//!
//! Each target gets its own connection and pipeline, driven as a single
//! operation. Operations are handed to a throttle scheduler and their output
//! is merged into one job-level stream tagged with the originating target.
//! Jobs can be collected synchronously, left running in the background, or
//! disconnected and reconnected later without losing remote output.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run a command against three simulated hosts, two at a time
//! fanout invoke web01 web02 web03 --command "uptime" --throttle-limit 2 --simulate
//!
//! # Run against the local machine
//! fanout invoke local --command "echo hello"
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::cast_possible_truncation)]

pub mod core;
pub mod transport;

pub use core::{
    CommandDefinition, Config, ExecutionOperation, FanoutError, InvokeCommand, InvokeOutcome, Job, JobRepository,
    JobState, RetryProgressMonitor, Target, ThrottleScheduler,
};
pub use transport::{LocalProcessTransport, SimulatedTransport, Transport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "fanout";
