use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use orchestrator::config::Config;
use orchestrator::machinery::MachineryRegistry;
use orchestrator::models::task::parse_options;
use orchestrator::models::NewTask;
use orchestrator::scheduler::AnalysisManager;
use orchestrator::storage::{SqlTaskStore, TaskStore};
use orchestrator::{startup, ResultServer, Scheduler};
use shared::observability::{init_logging, LogConfig, LogLevel};

#[derive(Debug, Parser)]
#[command(name = "detector", version, about = "Automated malware analysis orchestrator")]
struct Cli {
    /// Display debug messages
    #[arg(short, long, global = true)]
    debug: bool,

    /// Stop after this many analyses
    #[arg(short = 'm', long, global = true)]
    max_analysis_count: Option<u64>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the result server and the scheduler (default)
    Run,
    /// Add a pending task to the task store
    Submit(SubmitArgs),
}

#[derive(Debug, Args)]
struct SubmitArgs {
    /// Path of the sample, or the URL with --url
    target: String,

    #[arg(long)]
    url: bool,

    #[arg(long)]
    package: Option<String>,

    /// Pin the task to one machine
    #[arg(long)]
    machine: Option<String>,

    #[arg(long)]
    platform: Option<String>,

    /// Analysis options, as key=value,key2=value2
    #[arg(long)]
    options: Option<String>,

    #[arg(long, default_value_t = 1)]
    priority: i64,

    /// Analysis duration in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Comma separated machine tags
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            // Still report the failure through the default subscriber.
            let _ = init_logging(LogConfig::default());
            return Err(e.context("Failed to load configuration"));
        }
    };
    if cli.debug {
        config.logging.level = LogLevel::Debug;
    }
    if let Some(max) = cli.max_analysis_count {
        config.detector.max_analysis_count = max;
    }

    init_logging(config.logging.to_log_config()).context("Failed to initialize logging")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => serve(config).await,
        Command::Submit(args) => submit(config, args).await,
    }
}

async fn connect(config: &Config) -> Result<Arc<dyn TaskStore>> {
    let store = SqlTaskStore::connect(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to the task store")?;
    Ok(Arc::new(store))
}

async fn serve(config: Config) -> Result<()> {
    let root = config.detector.root.clone();
    startup::check_working_directory(&root)?;
    startup::check_configs(&root, &config.detector.machinery)?;
    startup::create_structure(&root).await?;

    let db = connect(&config).await?;

    let resultserver = Arc::new(ResultServer::bind(&config.resultserver, config.analyses_path()).await?);
    let accept_loop = resultserver.spawn().await?;

    let scheduler = Scheduler::initialize(
        &config,
        &MachineryRegistry::default(),
        db,
        Arc::clone(&resultserver),
        Arc::new(AnalysisManager),
    )
    .await?;

    let outcome = tokio::select! {
        result = scheduler.start() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            scheduler.stop().await;
            Ok(())
        }
    };

    resultserver.stop();
    if let Err(e) = accept_loop.await {
        error!(error = %e, "Result server task failed");
    }

    outcome?;
    info!("Detector stopped");
    Ok(())
}

async fn submit(config: Config, args: SubmitArgs) -> Result<()> {
    startup::check_working_directory(&config.detector.root)?;
    startup::create_structure(&config.detector.root).await?;
    let db = connect(&config).await?;

    let mut task = if args.url {
        NewTask::url(args.target)
    } else {
        NewTask::file(args.target)
    };
    task.package = args.package;
    task.machine = args.machine;
    task.platform = args.platform;
    task.options = args.options.as_deref().map(parse_options).unwrap_or_default();
    task.priority = args.priority;
    task.timeout = args.timeout;
    task.tags = args
        .tags
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    let id = db.add_task(task).await?;
    println!("Task added with id {}", id);
    Ok(())
}
