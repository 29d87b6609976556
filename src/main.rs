//! procrack: run the processes of a Procfile as one supervised group.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, merges them with `procrack.toml`, loads the Procfile and
//! environment, and hands the resulting replicas to the supervisor.

mod concurrency;
mod config;
mod env;
mod logging;
mod output;
mod process;
mod procfile;
mod shutdown;
mod supervisor;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;

use crate::concurrency::Concurrency;
use crate::config::Config;
use crate::logging::LogLevel;
use crate::output::{OutputRouter, OutputSettings, SYSTEM_LABEL};
use crate::procfile::{read_procfile, Procfile};
use crate::shutdown::{MonitorExit, ShutdownBarrier};
use crate::supervisor::{plan_replicas, Supervisor, SupervisorSettings, DEFAULT_GRACE_PERIOD};

const DEFAULT_PROCFILE: &str = "Procfile";
const DEFAULT_PORT: u16 = 5000;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "procrack",
    version,
    about = "Run a Procfile as one supervised process group",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to procrack.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ignore any procrack.toml in the current directory.
    #[arg(long, global = true)]
    no_config: bool,
    /// Diagnostic log level (overrides PROCRACK_LOG).
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevel>,
    /// Never colorize output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Do not prefix output lines with the elapsed time.
    #[arg(long, global = true)]
    no_timestamp: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start every process in the Procfile (or only NAME).
    Start(StartArgs),
    /// Validate the Procfile.
    Check(SourceArgs),
    /// Run one command with the application's environment.
    Run(RunArgs),
    /// Show version information.
    Version,
}

/// Where the application is described.
#[derive(Debug, Clone, Default, Args)]
struct SourceArgs {
    /// Procfile path.
    #[arg(short = 'f', long)]
    procfile: Option<PathBuf>,
    /// Env file path (defaults to .env next to the Procfile).
    #[arg(short = 'e', long)]
    env: Option<PathBuf>,
    /// Base port; each template gets its own block of 100.
    #[arg(short = 'p', long)]
    port: Option<u16>,
}

#[derive(Debug, Clone, Default, Args)]
struct StartArgs {
    /// Only run this process template.
    name: Option<String>,
    #[command(flatten)]
    source: SourceArgs,
    /// Replica counts, e.g. "web=2,worker=1".
    #[arg(short = 'c', long)]
    concurrency: Option<String>,
    /// Relaunch processes that exit instead of stopping the group.
    #[arg(short = 'r', long)]
    restart: bool,
    /// Delay before relaunching an exited process (ms).
    #[arg(long)]
    restart_delay_ms: Option<u64>,
    /// Time to wait after SIGTERM before killing (ms).
    #[arg(long)]
    shutdown_grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    #[command(flatten)]
    source: SourceArgs,
    /// Command to run.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_logging(cli.log_level);

    let color = !cli.no_color && std::io::stdout().is_terminal();
    let result = match &cli.command {
        None => start(&cli, &StartArgs::default()).await,
        Some(Commands::Start(args)) => start(&cli, args).await,
        Some(Commands::Check(args)) => check(&cli, args),
        Some(Commands::Run(args)) => run(&cli, args).await,
        Some(Commands::Version) => {
            println!("procrack {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
    };
    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => output::fatal(&format!("{:#}", err), color),
    }
}

async fn start(cli: &Cli, args: &StartArgs) -> Result<i32> {
    let config = load_config(cli)?;
    let settings = StartSettings::resolve(cli, args, &config);
    let source = Source::load(&settings.source)?;
    let concurrency = Concurrency::parse(&settings.concurrency)?;

    let router = Arc::new(OutputRouter::new(OutputSettings {
        padding: label_width(&source.procfile, &concurrency),
        color: settings.color,
        timestamp: settings.timestamp,
    }));

    let filter = args.name.as_deref();
    if let Some(name) = filter {
        if !source.procfile.has_process(name) {
            router.fatal(format!("no such process: {}", name));
        }
    }
    let replicas = match plan_replicas(
        &source.procfile.entries,
        &concurrency,
        filter,
        settings.source.port,
    ) {
        Ok(replicas) => replicas,
        Err(err) => router.fatal(format!("{:#}", err)),
    };
    if replicas.is_empty() {
        router.fatal("no processes to run");
    }

    let barrier = ShutdownBarrier::new();
    let (interrupt_tx, interrupt_rx) = mpsc::channel(8);
    shutdown::spawn_signal_listener(interrupt_tx);
    {
        let barrier = barrier.clone();
        let router = Arc::clone(&router);
        tokio::spawn(async move {
            let exit = shutdown::monitor_interrupts(barrier, Arc::clone(&router), interrupt_rx).await;
            if exit == MonitorExit::InterruptSourceClosed {
                tracing::warn!("interrupt listener stopped");
                router.system("interrupt handling unavailable, group stops when a process exits");
            }
        });
    }

    let supervisor = Supervisor::new(
        barrier,
        Arc::clone(&router),
        source.env,
        SupervisorSettings {
            root: source.root,
            restart: settings.restart,
            restart_delay: settings.restart_delay,
            grace_period: settings.grace_period,
        },
    );
    let spawned = supervisor.spawn_replicas(replicas);
    tracing::debug!(spawned, "replicas launched");

    supervisor.run_until_shutdown().await;
    Ok(0)
}

fn check(cli: &Cli, args: &SourceArgs) -> Result<i32> {
    let config = load_config(cli)?;
    let source = SourceSettings::resolve(args, &config);
    let procfile = read_procfile(&source.procfile)?;
    if procfile.entries.is_empty() {
        bail!("no processes defined in {}", source.procfile.display());
    }
    println!(
        "valid procfile detected ({})",
        procfile.names().join(", ")
    );
    Ok(0)
}

async fn run(cli: &Cli, args: &RunArgs) -> Result<i32> {
    let config = load_config(cli)?;
    let source = SourceSettings::resolve(&args.source, &config);
    let root = procfile_root(&source.procfile);
    let mut env = env::read_env(&source.env_path(&root), source.env.is_some())?;
    env.insert("PORT".to_string(), source.port.to_string());

    let line = shell_words::join(&args.command);
    let status = process::run_foreground(&line, &env, &root).await?;
    Ok(status.code().unwrap_or(1))
}

fn load_config(cli: &Cli) -> Result<Config> {
    if cli.no_config {
        return Ok(Config::default());
    }
    match cli.config.clone().or_else(config::default_config_path) {
        Some(path) => config::load_config(&path),
        None => Ok(Config::default()),
    }
}

/// Procfile location, env file and base port after merging CLI and config.
#[derive(Debug, Clone)]
struct SourceSettings {
    procfile: PathBuf,
    /// Explicitly requested env file, if any.
    env: Option<PathBuf>,
    port: u16,
}

impl SourceSettings {
    fn resolve(args: &SourceArgs, config: &Config) -> Self {
        let procfile = args
            .procfile
            .clone()
            .or_else(|| config.procfile.as_ref().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PROCFILE));
        let env = args
            .env
            .clone()
            .or_else(|| config.env.as_ref().map(PathBuf::from));
        let port = args.port.or(config.port).unwrap_or(DEFAULT_PORT);
        Self { procfile, env, port }
    }

    fn env_path(&self, root: &Path) -> PathBuf {
        self.env.clone().unwrap_or_else(|| root.join(".env"))
    }
}

/// Runtime configuration for `start`, derived from CLI arguments and the
/// config file.
#[derive(Debug, Clone)]
struct StartSettings {
    source: SourceSettings,
    concurrency: String,
    restart: bool,
    restart_delay: Duration,
    grace_period: Duration,
    timestamp: bool,
    color: bool,
}

impl StartSettings {
    fn resolve(cli: &Cli, args: &StartArgs, config: &Config) -> Self {
        let source = SourceSettings::resolve(&args.source, config);
        let concurrency = args
            .concurrency
            .clone()
            .or_else(|| config.concurrency.clone())
            .unwrap_or_default();
        let restart = args.restart || config.restart.unwrap_or(false);
        let restart_delay = Duration::from_millis(
            args.restart_delay_ms
                .or(config.restart_delay_ms)
                .unwrap_or(0),
        );
        let grace_period = args
            .shutdown_grace_ms
            .or(config.shutdown_grace_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_GRACE_PERIOD);
        let timestamp = !cli.no_timestamp && config.timestamp.unwrap_or(true);
        let color = if cli.no_color {
            false
        } else {
            config
                .color
                .unwrap_or_else(|| std::io::stdout().is_terminal())
        };
        Self {
            source,
            concurrency,
            restart,
            restart_delay,
            grace_period,
            timestamp,
            color,
        }
    }
}

/// Everything loaded from disk before supervision starts.
struct Source {
    procfile: Procfile,
    env: env::Env,
    root: PathBuf,
}

impl Source {
    fn load(settings: &SourceSettings) -> Result<Self> {
        let procfile = read_procfile(&settings.procfile)?;
        let root = procfile_root(&settings.procfile);
        let env = env::read_env(&settings.env_path(&root), settings.env.is_some())?;
        Ok(Self { procfile, env, root })
    }
}

fn procfile_root(procfile: &Path) -> PathBuf {
    match procfile.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Width of the label column: the longest template name plus the widest
/// replica suffix, or the system label if that is wider.
fn label_width(procfile: &Procfile, concurrency: &Concurrency) -> usize {
    let widest_replica = procfile
        .entries
        .iter()
        .map(|entry| concurrency.replicas(&entry.name).max(1))
        .max()
        .unwrap_or(1);
    let longest = procfile.longest_name() + 1 + widest_replica.to_string().len();
    longest.max(SYSTEM_LABEL.len())
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("procrack").chain(args.iter().copied())).unwrap()
    }

    fn start_args(cli: &Cli) -> StartArgs {
        match &cli.command {
            Some(Commands::Start(args)) => args.clone(),
            other => panic!("expected start, got {:?}", other),
        }
    }

    #[test]
    fn parses_start_flags() {
        let cli = cli(&[
            "start", "web", "-f", "app/Procfile", "-e", "app/.env.test", "-p", "6000", "-c",
            "web=2", "-r", "--shutdown-grace-ms", "500",
        ]);
        let args = start_args(&cli);
        assert_eq!(args.name.as_deref(), Some("web"));
        let settings = StartSettings::resolve(&cli, &args, &Config::default());
        assert_eq!(settings.source.procfile, PathBuf::from("app/Procfile"));
        assert_eq!(settings.source.env, Some(PathBuf::from("app/.env.test")));
        assert_eq!(settings.source.port, 6000);
        assert_eq!(settings.concurrency, "web=2");
        assert!(settings.restart);
        assert_eq!(settings.grace_period, Duration::from_millis(500));
    }

    #[test]
    fn cli_overrides_config_and_config_overrides_defaults() {
        let config: Config = toml::from_str(
            "port = 7000\nconcurrency = \"worker=3\"\nrestart = true\nshutdown_grace_ms = 100\ntimestamp = false\n",
        )
        .unwrap();
        let cli = cli(&["start", "-p", "8000"]);
        let settings = StartSettings::resolve(&cli, &start_args(&cli), &config);
        assert_eq!(settings.source.port, 8000);
        assert_eq!(settings.concurrency, "worker=3");
        assert!(settings.restart);
        assert_eq!(settings.grace_period, Duration::from_millis(100));
        assert!(!settings.timestamp);
        assert_eq!(settings.source.procfile, PathBuf::from(DEFAULT_PROCFILE));
    }

    #[test]
    fn defaults_without_config() {
        let cli = cli(&["--no-color", "start"]);
        let settings = StartSettings::resolve(&cli, &start_args(&cli), &Config::default());
        assert_eq!(settings.source.port, DEFAULT_PORT);
        assert_eq!(settings.grace_period, DEFAULT_GRACE_PERIOD);
        assert_eq!(settings.restart_delay, Duration::ZERO);
        assert!(!settings.restart);
        assert!(!settings.color);
        assert!(settings.timestamp);
        assert!(settings.source.env.is_none());
    }

    #[test]
    fn parses_run_command() {
        let cli = cli(&["run", "-p", "5100", "--", "rake", "db:migrate"]);
        match cli.command {
            Some(Commands::Run(args)) => {
                assert_eq!(args.source.port, Some(5100));
                assert_eq!(args.command, vec!["rake", "db:migrate"]);
            }
            other => panic!("expected run, got {:?}", other),
        }
    }

    #[test]
    fn root_is_procfile_directory() {
        assert_eq!(procfile_root(Path::new("Procfile")), PathBuf::from("."));
        assert_eq!(procfile_root(Path::new("app/Procfile")), PathBuf::from("app"));
    }

    #[test]
    fn label_width_covers_replica_names() {
        let procfile = Procfile::parse("web: a\nscheduler: b\n").unwrap();
        let concurrency = Concurrency::parse("scheduler=12").unwrap();
        assert_eq!(label_width(&procfile, &concurrency), "scheduler.12".len());
        let short = Procfile::parse("web: a\n").unwrap();
        assert_eq!(label_width(&short, &Concurrency::default()), SYSTEM_LABEL.len());
        let mixed = Concurrency::parse("web=12").unwrap();
        assert_eq!(label_width(&procfile, &mixed), "scheduler.12".len());
    }

    #[test]
    fn source_loads_default_env_next_to_procfile() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Procfile"), "web: echo hi\n").unwrap();
        std::fs::write(dir.path().join(".env"), "GREETING=hi\n").unwrap();
        let settings = SourceSettings {
            procfile: dir.path().join("Procfile"),
            env: None,
            port: DEFAULT_PORT,
        };
        let source = Source::load(&settings).unwrap();
        assert_eq!(source.procfile.names(), vec!["web"]);
        assert_eq!(source.env["GREETING"], "hi");
        assert_eq!(source.root, dir.path());
    }

    #[test]
    fn explicit_missing_env_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Procfile"), "web: echo hi\n").unwrap();
        let settings = SourceSettings {
            procfile: dir.path().join("Procfile"),
            env: Some(dir.path().join(".env.missing")),
            port: DEFAULT_PORT,
        };
        assert!(Source::load(&settings).is_err());
    }
}
