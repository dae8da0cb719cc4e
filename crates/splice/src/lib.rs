pub mod args;
pub mod commands;
pub mod interrupt;
pub mod progress;
