pub mod aggregate;
pub mod classify;
pub mod config;
pub mod db;
pub mod git;
pub mod github;
pub mod notify;
pub mod poller;
pub mod remediation;
pub mod state;
pub mod supervisor;
pub mod types;

pub use types::*;
