pub mod checks;
pub mod config;
pub mod logging;
