//! FlowRunner CLI Entry Point
//!
//! Runs a single workflow file through the engine and reports the result.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! flowrunner workflow.yaml
//!
//! # Seed the shared context
//! flowrunner workflow.yaml --metadata Dataset=run-42 --metadata Owner=ops
//!
//! # Persist instances on disk and use the prioritized scheduler
//! flowrunner workflow.yaml --state-dir ./instances --strategy prioritized
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use log::{error, info};

use flowrunner::repository::{FileInstanceRepository, InstanceRepository, MemoryInstanceRepository};
use flowrunner::{
    load_workflow, Engine, EngineConfig, HandlerRegistry, Metadata, Priority, SchedulingStrategy,
    WorkflowStatus, APP_NAME, VERSION,
};

/// Default workflow file used when none is specified.
const DEFAULT_WORKFLOW: &str = "workflow.yaml";

/// How long to wait between progress checks.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

/// Command-line options parsed from arguments.
#[derive(Debug)]
struct Options {
    workflow_path: String,
    config_path: Option<PathBuf>,
    metadata: Vec<(String, String)>,
    strategy: Option<SchedulingStrategy>,
    priority: Option<f64>,
    state_dir: Option<PathBuf>,
    verbose: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            workflow_path: DEFAULT_WORKFLOW.to_string(),
            config_path: None,
            metadata: Vec::new(),
            strategy: None,
            priority: None,
            state_dir: None,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Workflow Orchestration Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: flowrunner [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>       Path to workflow YAML file");
    println!();
    println!("Options:");
    println!("  --config FILE         Engine configuration (YAML)");
    println!("  --metadata KEY=VALUE  Add a value to the shared context (repeatable)");
    println!("  --strategy NAME       thread_pool or prioritized");
    println!("  --priority N          Instance priority, 0 to 10 (default: {})", Priority::default().value());
    println!("  --state-dir DIR       Persist instances as JSON files in DIR");
    println!("  --verbose             Enable debug logging");
    println!("  --help                Show this help message");
    println!("  --version             Show version information");
    println!();
    println!("Examples:");
    println!("  flowrunner pipeline.yaml");
    println!("  flowrunner pipeline.yaml --metadata Dataset=run-42");
    println!("  flowrunner pipeline.yaml --strategy prioritized --priority 8");
}

/// Fetches the value following an option.
fn option_value<'a>(args: &'a [String], i: &mut usize, option: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", option))
}

/// Parses command-line arguments into an Options struct.
fn parse_arguments(args: &[String]) -> Result<Options, String> {
    let mut options = Options::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                options.verbose = true;
            }
            "--config" => {
                options.config_path = Some(PathBuf::from(option_value(args, &mut i, "--config")?));
            }
            "--state-dir" => {
                options.state_dir = Some(PathBuf::from(option_value(args, &mut i, "--state-dir")?));
            }
            "--metadata" => {
                let pair = option_value(args, &mut i, "--metadata")?;
                let (key, value) = pair
                    .split_once('=')
                    .filter(|(key, _)| !key.trim().is_empty())
                    .ok_or_else(|| format!("Invalid metadata '{}', expected KEY=VALUE", pair))?;
                options.metadata.push((key.trim().to_string(), value.to_string()));
            }
            "--strategy" => {
                let value = option_value(args, &mut i, "--strategy")?;
                options.strategy = Some(value.parse::<SchedulingStrategy>().map_err(|e| e.to_string())?);
            }
            "--priority" => {
                let value = option_value(args, &mut i, "--priority")?;
                options.priority = Some(
                    value
                        .parse::<f64>()
                        .map_err(|_| format!("Invalid priority value: {}", value))?,
                );
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                match positional_index {
                    0 => options.workflow_path = arg.clone(),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    Ok(options)
}

/// Builds the engine configuration: file, then environment, then flags.
fn load_config(options: &Options) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut config = match &options.config_path {
        Some(path) => {
            info!("Engine configuration: {}", path.display());
            EngineConfig::load(path)?
        }
        None => EngineConfig::default(),
    };
    config.apply_env()?;

    if let Some(strategy) = options.strategy {
        config.strategy = strategy;
    }
    Ok(config)
}

fn open_repository(options: &Options) -> Result<Arc<dyn InstanceRepository>, Box<dyn std::error::Error>> {
    match &options.state_dir {
        Some(dir) => {
            info!("Instance state directory: {}", dir.display());
            Ok(Arc::new(FileInstanceRepository::open(dir)?))
        }
        None => Ok(Arc::new(MemoryInstanceRepository::new())),
    }
}

fn colored_status(status: WorkflowStatus) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        WorkflowStatus::Finished => text.green().bold(),
        WorkflowStatus::Failure | WorkflowStatus::MetadataMissing => text.red().bold(),
        _ => text.yellow().bold(),
    }
}

/// Main application entry point. Returns the final instance status.
fn run() -> Result<WorkflowStatus, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let options = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(options.verbose);
    print_banner();

    let config = load_config(&options)?;
    let repository = open_repository(&options)?;

    info!("Loading workflow: {}", options.workflow_path);
    let workflow = load_workflow(&options.workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!("Could not load workflow from '{}': {}", options.workflow_path, e)
    })?;
    info!("Workflow loaded: {} ({} tasks)", workflow.name, workflow.len());

    let metadata: Metadata = options.metadata.iter().cloned().collect();
    let priority = options.priority.map(Priority::new).unwrap_or_default();

    let engine = Engine::new(config, repository, Arc::new(HandlerRegistry::with_builtins()), None)?;
    let started = engine.start_workflow_with_priority(workflow, metadata, priority)?;
    let id = started.id.clone().unwrap_or_default();
    info!("Started workflow instance [{}]", id);

    let instance = loop {
        let Some(instance) = engine.wait_for_completion(&id, PROGRESS_INTERVAL) else {
            return Err(format!("Workflow instance [{}] disappeared", id).into());
        };
        if instance.status.is_terminal() {
            break instance;
        }
        info!(
            "Workflow instance [{}] is {} (task {})",
            id, instance.status, instance.current_task_id
        );
    };

    println!();
    println!("Workflow instance: {}", id);
    println!("Status:            {}", colored_status(instance.status));
    if let Some(message) = &instance.status_message {
        println!("Message:           {}", message);
    }
    println!("Wall clock:        {:.2} min", engine.wall_clock_minutes(&id));
    println!();

    if let Some(processor) = engine.workflow_processor(&id) {
        println!("{}", processor.timeline().summary());
    }

    engine.shutdown();
    Ok(instance.status)
}

fn main() -> ExitCode {
    match run() {
        Ok(WorkflowStatus::Finished) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
