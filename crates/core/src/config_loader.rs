use crate::config::AppConfig;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use std::path::Path;
use tracing::debug;

const ENV_PREFIX: &str = "UPDOWN_";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads configuration from `config/Config.toml` and `UPDOWN_` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be parsed or the result is invalid.
    pub fn load() -> Result<AppConfig> {
        Self::load_from("config/Config.toml", None)
    }

    /// Loads configuration with a specific profile overlay (`config/Config.{profile}.toml`).
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be parsed or the result is invalid.
    pub fn load_with_profile(profile: &str) -> Result<AppConfig> {
        Self::load_from("config/Config.toml", Some(profile))
    }

    /// Loads configuration from an explicit base file. The profile overlay is looked up
    /// next to it. Missing files are skipped; defaults fill the gaps.
    ///
    /// Environment keys use `__` for nesting: `UPDOWN_ENTRY__MIN_EDGE=0.03`.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be parsed or the result is invalid.
    pub fn load_from(path: impl AsRef<Path>, profile: Option<&str>) -> Result<AppConfig> {
        let path = path.as_ref();
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path));

        if let Some(profile) = profile {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            figment = figment.merge(Toml::file(dir.join(format!("Config.{profile}.toml"))));
        }

        let config: AppConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("failed to load configuration from {}", path.display()))?;

        config.validate()?;
        debug!(path = %path.display(), profile = ?profile, "Configuration loaded");
        Ok(config)
    }
}
