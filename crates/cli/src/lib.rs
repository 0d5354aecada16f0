mod commands;
pub mod config;
pub mod errors;
mod lockfile;

pub use commands::{exec, Command};
pub use config::Config;
