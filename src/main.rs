//! Fanout - run one command against many targets.
//!
//! Connects to every target, runs the command with a cap on concurrent
//! targets, and streams the tagged results back as they arrive.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fanout::core::{
    CommandDefinition, Config, InfoLevel, InvokeCommand, InvokeOutcome, Job, JobRecord, JobState, JobWake,
    PipelineRecord, RetryProgressMonitor, Target,
};
use fanout::transport::{HostScript, LocalProcessTransport, ScriptStep, SimulatedTransport, Transport};

/// Run one command against many targets
#[derive(Parser)]
#[command(name = "fanout")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this config file instead of the default locations
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command against one or more targets
    Invoke {
        /// Targets: host names, ssh://[user@]host[:port], vm:<name>, container:<id>, or `local`
        targets: Vec<String>,

        /// Script to run
        #[arg(short, long, conflicts_with_all = ["alias", "file"])]
        command: Option<String>,

        /// Run a command alias from the config
        #[arg(short, long, conflicts_with = "file")]
        alias: Option<String>,

        /// Run the script in this file
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Add the targets of a configured group
        #[arg(short, long)]
        group: Vec<String>,

        /// Input values sent to every target
        #[arg(short, long)]
        input: Vec<String>,

        /// Maximum targets running at once
        #[arg(short, long)]
        throttle_limit: Option<usize>,

        /// Start the job and report it instead of streaming results
        #[arg(long)]
        as_job: bool,

        /// Disconnect once every target accepted the command
        #[arg(long)]
        disconnect: bool,

        /// Session name for a disconnected job
        #[arg(long)]
        session_name: Option<String>,

        /// Stream errors of a single target instead of stopping on the first
        #[arg(long)]
        no_propagate: bool,

        /// Use simulated targets instead of real connections
        #[arg(long)]
        simulate: bool,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show configuration
    Config {
        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

struct InvokeArgs {
    targets: Vec<String>,
    command: Option<String>,
    alias: Option<String>,
    file: Option<PathBuf>,
    groups: Vec<String>,
    input: Vec<String>,
    throttle_limit: Option<usize>,
    as_job: bool,
    disconnect: bool,
    session_name: Option<String>,
    no_propagate: bool,
    simulate: bool,
    format: OutputFormat,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose { EnvFilter::new("debug") } else { EnvFilter::new("warn") };

    tracing_subscriber::registry().with(fmt::layer().with_target(false).with_writer(io::stderr)).with(filter).init();

    let config = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Invoke {
            targets,
            command,
            alias,
            file,
            group,
            input,
            throttle_limit,
            as_job,
            disconnect,
            session_name,
            no_propagate,
            simulate,
            format,
        } => {
            let args = InvokeArgs {
                targets,
                command,
                alias,
                file,
                groups: group,
                input,
                throttle_limit,
                as_job,
                disconnect,
                session_name,
                no_propagate,
                simulate,
                format,
            };
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cmd_invoke(&config, args, cli.verbose))?;
        }
        Commands::Config { path } => {
            cmd_config(&config, cli.config.as_deref(), path)?;
        }
    }

    Ok(())
}

/// Handle the invoke command.
async fn cmd_invoke(config: &Config, args: InvokeArgs, verbose: bool) -> Result<()> {
    config.validate()?;

    let mut targets: Vec<Target> = args.targets.iter().map(|t| Target::parse(t)).collect();
    for name in &args.groups {
        let group = config.target_group(name).with_context(|| format!("no target group named '{name}'"))?;
        targets.extend(group.targets());
    }

    let command = match (&args.command, &args.alias, &args.file) {
        (Some(script), None, None) => CommandDefinition::script(script.clone()),
        (None, Some(alias), None) => {
            let alias = config.command(alias).with_context(|| format!("no command alias named '{alias}'"))?;
            CommandDefinition::from_alias(alias)
        }
        (None, None, Some(path)) => CommandDefinition::from_file(path.clone())
            .with_context(|| format!("failed to read script {}", path.display()))?,
        _ => bail!("give exactly one of --command, --alias or --file"),
    };

    let input: Vec<Value> =
        args.input.iter().map(|raw| serde_json::from_str(raw).unwrap_or_else(|_| Value::from(raw.as_str()))).collect();

    let transport: Arc<dyn Transport> = if args.simulate {
        Arc::new(SimulatedTransport::new().with_default(
            HostScript::new().step(ScriptStep::Sleep(Duration::from_millis(20))).step(ScriptStep::EchoCommand),
        ))
    } else {
        Arc::new(LocalProcessTransport::new())
    };

    let mut invoke = InvokeCommand::from_config(config)
        .as_job(args.as_job)
        .invoke_and_disconnect(args.disconnect);
    if let Some(limit) = args.throttle_limit {
        invoke = invoke.throttle_limit(limit);
    }
    if let Some(name) = args.session_name {
        invoke = invoke.session_name(name);
    }
    if args.no_propagate {
        invoke = invoke.propagate_errors(false);
    }
    if config.progress.enabled {
        invoke = invoke.retry_monitor(Arc::new(RetryProgressMonitor::default()));
    }

    if args.as_job || args.disconnect {
        match invoke.execute(transport, targets, &command, input).await? {
            InvokeOutcome::Job(job) => {
                print_json(&job.info())?;
                let state = job.wait_finished().await;
                print_json(&job.info())?;
                return check_state(state);
            }
            InvokeOutcome::Disconnected { session_name, job } => {
                println!("Disconnected session '{}' from {} target(s)", session_name, job.len());
                for target in job.targets() {
                    println!("  {target}");
                }
                eprintln!("note: sessions live in this process, so their commands end when fanout exits");
                return Ok(());
            }
            InvokeOutcome::Completed(result) => {
                for record in &result.records {
                    print_record(record, args.format, verbose)?;
                }
                return check_state(result.state);
            }
        }
    }

    let job = invoke.start(transport, targets, &command, input)?;
    let state = stream_job(&job, args.format, verbose).await?;

    if let Some(err) = job.terminating_error() {
        return Err(err.into());
    }
    if args.format == OutputFormat::Text {
        for target in job.target_outcomes() {
            match target.outcome {
                Some(outcome) if !outcome.is_success() => eprintln!("{}: {}", target.target, outcome),
                _ => {}
            }
        }
    }
    check_state(state)
}

/// Print records as they arrive until the job finishes. Ctrl-C stops the job.
async fn stream_job(job: &Job, format: OutputFormat, verbose: bool) -> Result<JobState> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        let wake = tokio::select! {
            wake = job.wait_for_activity(None) => wake,
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                eprintln!("Stopping...");
                let job = job.clone();
                tokio::spawn(async move { job.stop().await });
                continue;
            }
        };

        match wake {
            JobWake::ResultsAvailable => {
                for record in job.read_all() {
                    print_record(&record, format, verbose)?;
                }
            }
            JobWake::Finished(state) => {
                for record in job.read_all() {
                    print_record(&record, format, verbose)?;
                }
                return Ok(state);
            }
            JobWake::DisconnectRequested => return Ok(job.state()),
        }
    }
}

fn print_record(record: &JobRecord, format: OutputFormat, verbose: bool) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(record);
    }

    let target = &record.target.name;
    match &record.record {
        PipelineRecord::Output(Value::String(s)) => println!("[{target}] {s}"),
        PipelineRecord::Output(value) => println!("[{target}] {value}"),
        PipelineRecord::Error(error) => eprintln!("[{target}] ERROR: {error}"),
        PipelineRecord::Informational(info) => match info.level {
            InfoLevel::Warning => eprintln!("[{target}] WARNING: {}", info.message),
            InfoLevel::Verbose if verbose => eprintln!("[{target}] VERBOSE: {}", info.message),
            InfoLevel::Debug if verbose => eprintln!("[{target}] DEBUG: {}", info.message),
            _ => {}
        },
        PipelineRecord::Progress(progress) => {
            if verbose {
                eprintln!("[{target}] {}: {}", progress.activity, progress.status);
            }
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

fn check_state(state: JobState) -> Result<()> {
    match state {
        JobState::Completed | JobState::Disconnected => Ok(()),
        other => bail!("job finished {other}"),
    }
}

/// Handle the config command.
fn cmd_config(config: &Config, explicit: Option<&std::path::Path>, show_path: bool) -> Result<()> {
    if show_path {
        match explicit {
            Some(path) => println!("{}", path.display()),
            None => {
                if let Some(path) = Config::config_dir() {
                    println!("{}", path.display());
                }
            }
        }
        return Ok(());
    }

    config.validate()?;
    let toml = toml::to_string_pretty(config)?;
    println!("{toml}");

    Ok(())
}
