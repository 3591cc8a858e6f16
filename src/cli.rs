use crate::config::paths::Workdir;
use crate::config::types::{Mode, Result as TurfResult, TurfError};
use crate::core::realm::ExitKind;
use crate::core::registry::Registry;
use crate::core::runtime::{CreateOptions, Runtime, StartOptions, DEFAULT_STOP_WAIT};
use crate::daemon::{Daemon, DaemonConfig, RemoteClient};
use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use std::os::fd::RawFd;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "turf", author, version, about = "Lightweight sandbox runtime")]
pub struct Cli {
    /// Run the daemon
    #[arg(short = 'D', long = "daemon")]
    pub daemon: bool,
    /// Keep the daemon in the foreground
    #[arg(short = 'f', long = "foreground", requires = "daemon")]
    pub foreground: bool,
    /// Forward create/start/stop/delete/run to the daemon
    #[arg(short = 'H', long = "remote")]
    pub remote: bool,
    /// Isolation mode (fallback or sysadmin) instead of the detected one
    #[arg(long = "mode", env = "TURF_MODE", value_name = "MODE")]
    pub mode: Option<Mode>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Args, Clone, Debug, Default, PartialEq, Eq)]
pub struct BundleArgs {
    /// Bundle directory (defaults to the current directory)
    #[arg(short = 'b', long = "bundle")]
    pub bundle: Option<PathBuf>,
    /// Memory limit in MB
    #[arg(short = 'm', long = "mem", value_name = "MB")]
    pub mem: Option<u32>,
    /// CPU limit in percent of one core
    #[arg(short = 'c', long = "cpu", value_name = "PCT")]
    pub cpu: Option<u32>,
}

impl From<&BundleArgs> for CreateOptions {
    fn from(args: &BundleArgs) -> Self {
        Self {
            bundle: args.bundle.clone(),
            mem_mb: args.mem,
            cpu_pct: args.cpu,
        }
    }
}

#[derive(Args, Clone, Debug, Default, PartialEq, Eq)]
pub struct LaunchArgs {
    /// Redirect stdout to this file
    #[arg(long)]
    pub stdout: Option<String>,
    /// Redirect stderr to this file
    #[arg(long)]
    pub stderr: Option<String>,
    /// Extra environment entry
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,
    /// Clone from a running seed realm
    #[arg(short = 's', long = "seed", value_name = "SEED")]
    pub seed: Option<String>,
}

impl From<&LaunchArgs> for StartOptions {
    fn from(args: &LaunchArgs) -> Self {
        Self {
            stdout: args.stdout.clone(),
            stderr: args.stderr.clone(),
            env: args.env.clone(),
            seed: args.seed.clone(),
        }
    }
}

#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Create the workspace directories
    Init,
    /// Write a default config.json
    Spec {
        #[command(flatten)]
        bundle: BundleArgs,
    },
    /// Create a sandbox from a bundle
    Create {
        #[command(flatten)]
        bundle: BundleArgs,
        name: String,
    },
    /// Remove a sandbox
    Delete {
        /// Kill the sandbox if it is still running
        #[arg(short = 'f', long)]
        force: bool,
        name: String,
    },
    /// List sandboxes
    #[command(visible_alias = "ls")]
    List,
    /// Show sandboxes with pid and state
    Ps,
    /// Show the detailed state of a sandbox
    State { name: String },
    /// Show workspace paths
    Info,
    /// List installed runtimes
    Runtime,
    /// Print a stats snapshot as JSON
    Events { name: String },
    /// Start a created sandbox
    Start {
        #[command(flatten)]
        launch: LaunchArgs,
        name: String,
    },
    /// Stop a running sandbox
    Stop {
        /// Send SIGKILL instead of SIGTERM
        #[arg(short = 'f', long)]
        force: bool,
        /// Liveness probes after signalling, minus one
        #[arg(short = 't', long = "time", default_value_t = DEFAULT_STOP_WAIT)]
        time: u32,
        name: String,
    },
    /// Create and start a sandbox
    Run {
        #[command(flatten)]
        bundle: BundleArgs,
        #[command(flatten)]
        launch: LaunchArgs,
        name: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Spec { .. } => "spec",
            Self::Create { .. } => "create",
            Self::Delete { .. } => "delete",
            Self::List => "list",
            Self::Ps => "ps",
            Self::State { .. } => "state",
            Self::Info => "info",
            Self::Runtime => "runtime",
            Self::Events { .. } => "events",
            Self::Start { .. } => "start",
            Self::Stop { .. } => "stop",
            Self::Run { .. } => "run",
        }
    }

    /// Commands the daemon accepts over its socket.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Self::Create { .. }
                | Self::Delete { .. }
                | Self::Start { .. }
                | Self::Stop { .. }
                | Self::Run { .. }
        )
    }
}

/// Daemon-side handler for forwarded command lines.
pub fn execute_remote(
    argv: &[String],
    rt: &Runtime,
    registry: &mut Registry,
) -> TurfResult<Option<RawFd>> {
    let cli = Cli::try_parse_from(argv).map_err(|e| TurfError::InvalidArgument(e.to_string()))?;
    let command = cli
        .command
        .ok_or_else(|| TurfError::InvalidArgument("missing command".to_string()))?;
    info!("remote {}", command.name());

    match command {
        Command::Create { bundle, name } => rt.create(&name, &(&bundle).into()).map(|_| None),
        Command::Delete { force, name } => rt.delete(&name, force).map(|_| None),
        Command::Start { launch, name } => rt
            .start(&name, &(&launch).into(), Some(registry))
            .map(|out| out.seed_fd),
        Command::Stop { force, time, name } => {
            rt.stop(&name, force, time, Some(registry)).map(|_| None)
        }
        Command::Run {
            bundle,
            launch,
            name,
        } => {
            // the client already created the sandbox from its own bundle
            if !rt.workdir().sandbox(&name).exists() {
                rt.create(&name, &(&bundle).into())?;
            }
            rt.start(&name, &(&launch).into(), Some(registry))
                .map(|out| out.seed_fd)
        }
        other => Err(TurfError::NotSupported(format!(
            "{} over the daemon socket",
            other.name()
        ))),
    }
}

/// Run a command in this process (runc mode).
pub fn dispatch(rt: &Runtime, command: Command) -> Result<()> {
    match command {
        Command::Init => rt.init()?,
        Command::Spec { bundle } => {
            let path = rt.spec(&(&bundle).into())?;
            println!("{}", path.display());
        }
        Command::Create { bundle, name } => rt.create(&name, &(&bundle).into())?,
        Command::Delete { force, name } => rt.delete(&name, force)?,
        Command::List => {
            for name in rt.list()? {
                println!("{}", name);
            }
        }
        Command::Ps => {
            for entry in rt.ps()? {
                println!("{}", entry);
            }
        }
        Command::State { name } => print!("{}", rt.state(&name)?),
        Command::Info => println!("{}", rt.info()),
        Command::Runtime => {
            for name in rt.runtimes()? {
                println!("{}", name);
            }
        }
        Command::Events { name } => {
            println!("{}", serde_json::to_string_pretty(&rt.events(&name)?)?);
        }
        Command::Start { launch, name } => {
            let out = rt.start(&name, &(&launch).into(), None)?;
            report_exit(&name, out.pid, out.exit_status);
        }
        Command::Stop { force, time, name } => rt.stop(&name, force, time, None)?,
        Command::Run {
            bundle,
            launch,
            name,
        } => {
            let out = rt.run(&name, &(&bundle).into(), &(&launch).into(), None)?;
            report_exit(&name, out.pid, out.exit_status);
        }
    }
    Ok(())
}

fn report_exit(name: &str, pid: i32, status: Option<i32>) {
    if let Some(status) = status {
        info!(
            "{} ({}) finished: {:?}",
            name,
            pid,
            ExitKind::from_wait_status(status)
        );
    }
}

fn runtime(workdir: Workdir, mode: Option<Mode>) -> Runtime {
    let rt = Runtime::new(workdir);
    match mode {
        Some(mode) => rt.with_mode(mode),
        None => rt,
    }
}

fn run_daemon(workdir: Workdir, foreground: bool, mode: Option<Mode>) -> Result<()> {
    let rt = runtime(workdir.clone(), mode);
    rt.init()?;

    let mut config = DaemonConfig::new(&workdir);
    config.foreground = foreground;
    let mut daemon = Daemon::new(config, rt, execute_remote);
    daemon.bind()?;
    if !foreground {
        nix::unistd::daemon(true, false)?;
    }
    daemon.serve()?;
    Ok(())
}

/// Send the command line to the daemon, minus our own `-H`.
fn forward(workdir: &Workdir, command: &Command) -> Result<()> {
    if let Command::Run { bundle, name, .. } = command {
        Runtime::new(workdir.clone()).create(name, &bundle.into())?;
    }
    let args: Vec<String> = std::env::args()
        .skip(1)
        .filter(|a| a != "-H" && a != "--remote")
        .collect();
    RemoteClient::new(workdir.socket_path()).send(&args)?;
    Ok(())
}

/// Process exit code for a failed command: the errno when there is one.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<TurfError>()
        .map(TurfError::errno)
        .filter(|code| (1..=255).contains(code))
        .unwrap_or(1)
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let workdir = Workdir::from_env();
    if cli.daemon {
        return run_daemon(workdir, cli.foreground, cli.mode);
    }

    let command = cli
        .command
        .ok_or_else(|| anyhow!("missing command, see `turf --help`"))?;
    if cli.remote && command.is_remote() {
        return forward(&workdir, &command);
    }
    dispatch(&runtime(workdir, cli.mode), command)
}
