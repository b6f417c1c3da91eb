//! Configuration: process settings from the environment and the rule file

pub mod file;
pub mod loader;
pub mod server;

pub use file::{load_config, parse_config, AlertConfig, ConfigError, RouteSpec, RuleFile, RuleSpec};
pub use loader::ConfigLoader;
pub use server::ServerConfig;
