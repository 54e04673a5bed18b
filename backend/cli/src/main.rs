mod commands;
mod launch;
mod roles;
mod runtime;
mod terminal_output;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::error;

use equaforge_config::{check, config_dir, config_file_path, load_resolved};
use equaforge_core::{OriginType, RecordId};

use commands::UploadArgs;
use runtime::Runtime;

#[derive(Parser)]
#[command(name = "equaforge")]
#[command(about = "Equation OCR pipeline with correction-driven retraining")]
#[command(version)]
struct Cli {
    /// Config file (default: $EQUAFORGE_CONFIG_DIR/config.yaml or ~/.equaforge/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume images, run OCR, store and announce results
    InferenceWorker,
    /// Consume results into the display index
    ResultSink,
    /// Consume corrections and run retraining when a batch is ready
    TrainingCoordinator,
    /// Start the configured number of processes for every worker role
    Launch,
    /// Store an image and queue it for recognition
    Upload {
        file: PathBuf,
        /// digital or handwritten
        #[arg(long, default_value = "handwritten")]
        origin: OriginType,
        #[arg(long)]
        equation: String,
        #[arg(long)]
        section: String,
        #[arg(long)]
        author: String,
    },
    /// Submit the correct text for a recognised equation
    Correct {
        /// Result id (hex)
        result_id: RecordId,
        label: String,
    },
    /// Delete a result together with its image
    Delete {
        /// Result id (hex)
        result_id: RecordId,
    },
    /// Rebuild the display index from the record store
    RebuildIndex,
    /// Print the display index
    Index,
    /// Show pending corrections, checkpoints and queue depths
    Status,
    /// Inspect or create the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective config with defaults applied
    Show,
    /// Write a config file populated with defaults
    Init {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run(Cli::parse()).await {
        error!(error = %format!("{e:#}"), "equaforge failed");
        terminal_output::note_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .unwrap_or_else(|| config_file_path(&config_dir()));
    let config = load_resolved(&config_path).await?;
    equaforge_logging::init_logger(
        config.logging.dir.as_deref(),
        config.logging.level(),
        config.logging.json(),
    )?;

    if let Commands::Config { action } = &cli.command {
        return match action {
            ConfigAction::Show => commands::show_config(&config),
            ConfigAction::Init { force } => commands::init_config(&config_path, *force).await,
        };
    }
    check(&config).with_context(|| format!("invalid config {}", config_path.display()))?;

    if let Commands::Launch = cli.command {
        return launch::launch(&config_path, &config).await;
    }

    let runtime = Runtime::connect(config).await?;
    match cli.command {
        Commands::InferenceWorker => roles::inference_worker(runtime).await,
        Commands::ResultSink => roles::result_sink(runtime).await,
        Commands::TrainingCoordinator => roles::training_coordinator(runtime).await,
        Commands::Upload {
            file,
            origin,
            equation,
            section,
            author,
        } => {
            runtime.declare_all_queues().await?;
            commands::upload(
                &runtime,
                UploadArgs {
                    file: &file,
                    origin,
                    equation_name: equation,
                    section,
                    author,
                },
            )
            .await
        }
        Commands::Correct { result_id, label } => {
            runtime.declare_all_queues().await?;
            commands::correct(&runtime, result_id, &label).await
        }
        Commands::Delete { result_id } => commands::delete(&runtime, result_id).await,
        Commands::RebuildIndex => commands::rebuild_index(&runtime).await,
        Commands::Index => commands::show_index(&runtime).await,
        Commands::Status => commands::status(&runtime).await,
        Commands::Launch | Commands::Config { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_upload_with_global_config() {
        let cli = Cli::try_parse_from([
            "equaforge",
            "upload",
            "eq.png",
            "--equation",
            "euler",
            "--section",
            "analysis",
            "--author",
            "leonhard",
            "--origin",
            "digital",
            "--config",
            "/tmp/eq.yaml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/eq.yaml")));
        match cli.command {
            Commands::Upload { origin, equation, .. } => {
                assert_eq!(origin, OriginType::Digital);
                assert_eq!(equation, "euler");
            }
            _ => panic!("expected upload"),
        }
    }

    #[test]
    fn rejects_malformed_result_id() {
        assert!(Cli::try_parse_from(["equaforge", "delete", "not-hex"]).is_err());
        let id = RecordId::generate();
        let cli = Cli::try_parse_from(["equaforge", "delete", &id.to_hex()]).unwrap();
        assert!(matches!(cli.command, Commands::Delete { result_id } if result_id == id));
    }
}
