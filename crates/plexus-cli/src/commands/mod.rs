//! CLI command implementations

pub mod config_cmd;
pub mod inspect;
pub mod run;
pub mod watch;
