use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "triage",
    version,
    about = "Incremental mailbox triage with a generative classifier"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    globals: GlobalArgs,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Configuration file (defaults to ~/.triage/config.json)
    #[arg(long, global = true, env = "TRIAGE_CONFIG")]
    config: Option<PathBuf>,

    /// State database (defaults to ~/.triage/triage.db)
    #[arg(long, global = true, env = "TRIAGE_DB")]
    db: Option<PathBuf>,

    /// Classifier API key, overriding the config file
    #[arg(long, global = true, env = "TRIAGE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Handler name, overriding the config file
    #[arg(long, global = true)]
    handler: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one triage cycle and re-arm the trigger
    Run,
    /// Run a cycle now and again every time the trigger fires
    Watch(WatchArgs),
    /// Inspect or remove trigger registrations
    Triggers {
        #[command(subcommand)]
        command: TriggerCommands,
    },
    /// Inspect or move the processing watermark
    Watermark {
        #[command(subcommand)]
        command: WatermarkCommands,
    },
    /// Validate configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Debug, Args)]
struct WatchArgs {
    /// Longest single sleep between trigger checks, in seconds
    #[arg(long, default_value_t = 30)]
    poll_seconds: u64,
    /// Stop after this many cycles
    #[arg(long)]
    max_cycles: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum TriggerCommands {
    /// List registered triggers
    List,
    /// Remove every trigger bound to the handler, stopping the chain
    Clear {
        /// Remove triggers of every handler
        #[arg(long, default_value_t = false)]
        all: bool,
    },
}

#[derive(Debug, Subcommand)]
enum WatermarkCommands {
    /// Show the stored watermark
    Show,
    /// Store a millisecond timestamp as the watermark
    Set { ms: i64 },
    /// Forget the watermark so the next cycle looks back one hour
    Reset,
}

#[derive(Debug, Subcommand)]
enum ConfigCommands {
    /// Validate the configuration and print the normalized label set
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use std::time::Duration as StdDuration;

    use anyhow::{bail, Context, Result};

    use triage::classifier::GeminiClassifier;
    use triage::config::{RawConfig, TriageConfig};
    use triage::connectors::GmailMailbox;
    use triage::db::Database;
    use triage::output::{self, OutputFormat, WatermarkView};
    use triage::triage::{CycleRunner, WatchOptions, WatchOutcome, WatermarkStore, WATERMARK_KEY};

    use super::{
        Cli, Commands, ConfigCommands, GlobalArgs, TriggerCommands, WatchArgs, WatermarkCommands,
    };

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let format = OutputFormat::from_json_flag(cli.json);
        match cli.command {
            Commands::Run => handle_run(&cli.globals, format).await,
            Commands::Watch(args) => handle_watch(&cli.globals, args).await,
            Commands::Triggers { command } => handle_triggers(&cli.globals, command, format),
            Commands::Watermark { command } => handle_watermark(&cli.globals, command, format),
            Commands::Config { command } => handle_config(&cli.globals, command, format),
        }
    }

    fn load_config(globals: &GlobalArgs) -> Result<TriageConfig> {
        let path = match &globals.config {
            Some(path) => path.clone(),
            None => RawConfig::default_path()?,
        };
        let mut raw = RawConfig::load(&path)?;
        if let Some(api_key) = &globals.api_key {
            raw.api_key = Some(api_key.clone());
        }
        if let Some(handler) = &globals.handler {
            raw.handler_name = Some(handler.clone());
        }
        TriageConfig::from_raw(raw)
            .with_context(|| format!("invalid configuration in {}", path.display()))
    }

    fn open_db(globals: &GlobalArgs) -> Result<Database> {
        let path = match &globals.db {
            Some(path) => path.clone(),
            None => Database::default_db_path().context("resolve default triage database path")?,
        };
        Database::open(&path).with_context(|| format!("open triage database at {}", path.display()))
    }

    /// The handler whose triggers a command manages, without requiring a
    /// complete configuration.
    fn handler_name(globals: &GlobalArgs) -> Result<String> {
        if let Some(handler) = &globals.handler {
            return Ok(handler.clone());
        }
        Ok(load_config(globals)?.handler_name)
    }

    async fn handle_run(globals: &GlobalArgs, format: OutputFormat) -> Result<()> {
        let config = load_config(globals)?;
        let db = open_db(globals)?;
        let mailbox = GmailMailbox::connect(&db, &config.gmail)
            .await
            .context("connect to gmail")?;
        let classifier = GeminiClassifier::new(&config.api_key, &config.model);

        let runner = CycleRunner::new(&config, &mailbox, &classifier, &db);
        match runner.run_once().await? {
            Some(report) => println!("{}", output::format_report(format, &report)?),
            None => eprintln!("Another cycle holds the lease; nothing was done."),
        }
        Ok(())
    }

    async fn handle_watch(globals: &GlobalArgs, args: WatchArgs) -> Result<()> {
        let config = load_config(globals)?;
        let db = open_db(globals)?;
        let mailbox = GmailMailbox::connect(&db, &config.gmail)
            .await
            .context("connect to gmail")?;
        let classifier = GeminiClassifier::new(&config.api_key, &config.model);

        let options = WatchOptions {
            poll_interval: StdDuration::from_secs(args.poll_seconds.max(1)),
            max_cycles: args.max_cycles,
        };
        let outcome = CycleRunner::new(&config, &mailbox, &classifier, &db)
            .watch(options)
            .await;
        match outcome {
            WatchOutcome::Aborted { cycles } => {
                bail!("watch stopped after {cycles} cycle(s): a cycle aborted")
            }
            WatchOutcome::ChainStopped { cycles } | WatchOutcome::CycleLimitReached { cycles } => {
                eprintln!("Watch finished after {cycles} cycle(s).");
                Ok(())
            }
        }
    }

    fn handle_triggers(
        globals: &GlobalArgs,
        command: TriggerCommands,
        format: OutputFormat,
    ) -> Result<()> {
        let db = open_db(globals)?;
        match command {
            TriggerCommands::List => {
                let triggers = db.list_triggers()?;
                println!("{}", output::format_triggers(format, &triggers)?);
            }
            TriggerCommands::Clear { all } => {
                let handler = if all { None } else { Some(handler_name(globals)?) };
                let mut removed = 0usize;
                for trigger in db.list_triggers()? {
                    if handler.as_deref().map_or(true, |h| h == trigger.handler_name) {
                        removed += db.delete_trigger(trigger.id)?;
                    }
                }
                println!("Removed {removed} trigger(s).");
            }
        }
        Ok(())
    }

    fn handle_watermark(
        globals: &GlobalArgs,
        command: WatermarkCommands,
        format: OutputFormat,
    ) -> Result<()> {
        let db = open_db(globals)?;
        match command {
            WatermarkCommands::Show => {
                let value_ms = WatermarkStore::new(&db).read()?;
                let updated_at = db
                    .get_sync_state(WATERMARK_KEY)?
                    .and_then(|state| state.updated_at);
                let view = WatermarkView {
                    key: WATERMARK_KEY.to_string(),
                    value_ms,
                    updated_at,
                };
                println!("{}", output::format_watermark(format, &view)?);
            }
            WatermarkCommands::Set { ms } => {
                WatermarkStore::new(&db).write(ms)?;
                println!("Watermark set to {ms}.");
            }
            WatermarkCommands::Reset => {
                db.delete_sync_state(WATERMARK_KEY)?;
                println!("Watermark cleared.");
            }
        }
        Ok(())
    }

    fn handle_config(
        globals: &GlobalArgs,
        command: ConfigCommands,
        format: OutputFormat,
    ) -> Result<()> {
        match command {
            ConfigCommands::Check => {
                let config = load_config(globals)?;
                if format == OutputFormat::Table {
                    println!(
                        "Handler: {}  Batch size: {}  Interval: {}m  Model: {}\n",
                        config.handler_name,
                        config.batch_size,
                        config.trigger_interval_minutes,
                        config.model
                    );
                }
                println!("{}", output::format_labels(format, &config.labels)?);
            }
        }
        Ok(())
    }
}
