//! show-config CLI command: prints the merged configuration.

use anyhow::Result;
use clap::Args;

/// Arguments for the show-config command.
#[derive(Args, Debug, Clone)]
pub struct ShowConfigArgs {
    /// Base config file path
    #[arg(short, long, default_value = "config/Config.toml")]
    pub config: String,

    /// Profile overlay (`Config.{profile}.toml` next to the base file)
    #[arg(long)]
    pub profile: Option<String>,
}

/// Prints the effective configuration (defaults, files, environment) as JSON.
pub fn run_show_config(args: ShowConfigArgs) -> Result<()> {
    let config = super::load_config(&args.config, args.profile.as_deref())?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
