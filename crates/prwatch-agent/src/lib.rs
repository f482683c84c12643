pub mod claude;
pub mod command;
pub mod event;
pub mod instruction;

pub use claude::ClaudeRemediator;
