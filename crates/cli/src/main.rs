use clap::{Parser, Subcommand};

mod commands;

use commands::{ReplayArgs, ShowConfigArgs};

#[derive(Parser)]
#[command(name = "updown")]
#[command(about = "15-minute up/down prediction market trader", long_about = None)]
struct Cli {
    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay recorded market events against the paper venue
    Replay(ReplayArgs),
    /// Print the effective configuration as JSON
    ShowConfig(ShowConfigArgs),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    match &cli.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
                )
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
                )
                .with_writer(std::io::stderr)
                .init();
        }
    }

    match cli.command {
        Commands::Replay(args) => commands::run_replay(args).await?,
        Commands::ShowConfig(args) => commands::run_show_config(args)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_log_file_help_names_default_stream() {
        let cmd = Cli::command();
        let help = cmd
            .get_arguments()
            .find(|arg| arg.get_id() == "log_file")
            .and_then(|arg| arg.get_help())
            .map(ToString::to_string)
            .unwrap();
        assert!(help.ends_with("instead of stderr"), "{help}");
    }

    #[test]
    fn test_log_file_is_global() {
        let cli = Cli::try_parse_from(["updown", "show-config", "--log-file", "run.log"]).unwrap();
        assert_eq!(cli.log_file.as_deref(), Some("run.log"));
        assert!(matches!(cli.command, Commands::ShowConfig(_)));
    }
}
