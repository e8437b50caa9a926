mod demos;

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use weft_core::config::EngineConfig;
use weft_core::types::TaskOutcome;
use weft_engine::Engine;

use demos::App;

/// How long `run` waits for the run logger to drain after the graph ends.
const RUN_LOG_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "weft", version, about = "Durable function orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weft.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a bundled application and print its result
    Run {
        #[arg(value_enum)]
        app: App,
        /// JSON input (defaults to the app's sample input)
        #[arg(short, long)]
        input: Option<String>,
        /// Graph id; reuse one to resume an interrupted run
        #[arg(short, long)]
        graph_id: Option<String>,
        /// Print the full graph report instead of the result value
        #[arg(long)]
        report: bool,
    },
    /// List the durable records of a graph
    Records {
        graph_id: String,
    },
    /// Delete the durable records of a graph
    Purge {
        graph_id: String,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weft=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "weft", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Records { graph_id } => {
            let engine = Engine::open(config)?;
            let records = engine.records(&graph_id).await?;
            if records.is_empty() {
                println!("No records for graph '{}'.", graph_id);
            }
            for record in records {
                println!(
                    "{}  {:<10} attempts={}  {}",
                    record.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                    record.outcome.state().to_string(),
                    record.attempts,
                    record.identity.key()
                );
            }
        }
        Commands::Purge { graph_id } => {
            let engine = Engine::open(config)?;
            let removed = engine.purge(&graph_id).await?;
            println!("Removed {} record(s) for graph '{}'.", removed, graph_id);
        }
        Commands::Run {
            app,
            input,
            graph_id,
            report,
        } => {
            let input = match input {
                Some(raw) => serde_json::from_str(&raw)?,
                None => app.default_input(),
            };
            let graph_id = graph_id.unwrap_or_else(|| {
                format!("{}-{}", app.name(), chrono::Utc::now().format("%Y%m%d%H%M%S"))
            });

            let engine = Engine::open(config)?;
            let root = app.register(&engine);
            let run_log = engine.start_run_log(&graph_id);

            info!(app = app.name(), graph_id = %graph_id, "Running application");
            let result = engine.invoke(&graph_id, &root, input).await;

            if let Some(mut run_log) = run_log {
                if tokio::time::timeout(RUN_LOG_GRACE, &mut run_log.task)
                    .await
                    .is_err()
                {
                    run_log.finish().await;
                }
            }

            let result = result?;
            info!(
                graph_id = %graph_id,
                executed = result.report.executed(),
                replayed = result.report.replayed(),
                "Run finished"
            );

            if report {
                println!("{}", serde_json::to_string_pretty(&result.report)?);
            }
            match result.outcome {
                TaskOutcome::Succeeded { value } => {
                    if !report {
                        println!("{}", serde_json::to_string_pretty(&value)?);
                    }
                }
                TaskOutcome::Failed { failure } => {
                    anyhow::bail!("{} failed ({:?}): {}", app.name(), failure.kind, failure);
                }
            }
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

/// Explicit path, then `~/.weft/config.toml`, then built-in defaults.
fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    if path.exists() {
        return Ok(EngineConfig::load(path)?);
    }
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        let home_config = home.join(".weft").join("config.toml");
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(EngineConfig::load(&home_config)?);
        }
    }
    info!("No config file found, using defaults");
    Ok(EngineConfig::default())
}
