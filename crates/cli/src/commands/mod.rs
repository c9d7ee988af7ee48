pub mod replay;
pub mod show_config;

pub use replay::{run_replay, ReplayArgs};
pub use show_config::{run_show_config, ShowConfigArgs};

use anyhow::Result;
use updown_core::{AppConfig, ConfigLoader};

/// Loads the base config file plus an optional profile overlay and `UPDOWN_` overrides.
fn load_config(path: &str, profile: Option<&str>) -> Result<AppConfig> {
    ConfigLoader::load_from(path, profile)
}
