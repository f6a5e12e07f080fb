pub mod build;
pub mod cli_args;
pub mod config;
pub mod flock;
pub mod git;
pub mod model;
pub mod supervisor;
pub mod sync;
pub mod watchdog;

mod api;
mod output;

pub use api::{Watchdog, WatchdogBuilder};
