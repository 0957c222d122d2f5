// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! reef supervisor daemon (reefd)
//!
//! Long-lived parent process of a reef cluster: provisions shared
//! memory, spawns the worker processes, and drives the lifecycle state
//! machine. The first argument selects a mode; with none given the
//! process supervises.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::error;

use reef_core::SystemClock;
use reef_supervisor::launcher::read_payload;
use reef_supervisor::machine::Supervisor;
use reef_supervisor::pidfile::PidFile;
use reef_supervisor::runloop::{self, Listeners};
use reef_supervisor::signals::{PendingSignals, SignalIntake};
use reef_supervisor::{datadir, env, latch::Latch, logging, worker, Config, ProcessLauncher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Supervise,
    Check,
    Bootstrap,
    DescribeConfig,
    SingleUser,
    SpawnChild,
    PrintConfigVariable,
    Help,
    Version,
}

impl Mode {
    fn parse(s: &str) -> Option<Mode> {
        Some(match s {
            "supervise" => Mode::Supervise,
            "check" => Mode::Check,
            "bootstrap" => Mode::Bootstrap,
            "describe-config" => Mode::DescribeConfig,
            "single-user" => Mode::SingleUser,
            "spawn-child" => Mode::SpawnChild,
            "print-config-variable" => Mode::PrintConfigVariable,
            "help" => Mode::Help,
            "version" => Mode::Version,
            _ => return None,
        })
    }

    /// Modes that never write and are therefore allowed under root.
    fn read_only(self) -> bool {
        matches!(
            self,
            Mode::Check
                | Mode::DescribeConfig
                | Mode::PrintConfigVariable
                | Mode::Help
                | Mode::Version
        )
    }
}

#[derive(Debug)]
struct Cli {
    mode: Mode,
    data_dir: Option<PathBuf>,
    options: Vec<(String, String)>,
    positionals: Vec<String>,
    payload: Option<PathBuf>,
}

fn parse_args(args: Vec<String>) -> Result<Cli, String> {
    let mut mode = None;
    let mut data_dir = None;
    let mut options = Vec::new();
    let mut positionals = Vec::new();
    let mut payload = None;

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-D" | "--data-dir" => {
                let value = iter.next().ok_or("-D requires a directory")?;
                data_dir = Some(PathBuf::from(value));
            }
            "-c" => {
                let value = iter.next().ok_or("-c requires name=value")?;
                let (name, value) = value
                    .split_once('=')
                    .ok_or_else(|| format!("malformed -c option '{value}' (want name=value)"))?;
                options.push((name.to_string(), value.to_string()));
            }
            "--payload" => {
                let value = iter.next().ok_or("--payload requires a path")?;
                payload = Some(PathBuf::from(value));
            }
            "-h" | "--help" => mode = Some(Mode::Help),
            "-V" | "--version" => mode = Some(Mode::Version),
            s if !s.starts_with('-') && mode.is_none() => {
                mode = Some(Mode::parse(s).ok_or_else(|| format!("unrecognized mode '{s}'"))?);
            }
            s if !s.starts_with('-') => positionals.push(s.to_string()),
            _ => return Err(format!("unexpected argument '{arg}'")),
        }
    }

    Ok(Cli {
        mode: mode.unwrap_or(Mode::Supervise),
        data_dir,
        options,
        positionals,
        payload,
    })
}

fn print_help() {
    println!("reefd {}", env!("CARGO_PKG_VERSION"));
    println!("reef supervisor - parent process of a reef database cluster");
    println!();
    println!("USAGE:");
    println!("    reefd [MODE] [OPTIONS]");
    println!();
    println!("MODES:");
    println!("    supervise                    run the cluster (default)");
    println!("    check                        validate data directory and configuration");
    println!("    bootstrap                    create a new cluster data directory");
    println!("    describe-config              list configuration variables");
    println!("    print-config-variable NAME   print one resolved configuration value");
    println!("    single-user                  run recovery inline, without workers");
    println!("    spawn-child KIND --payload P internal: re-entry for spawned workers");
    println!("    help | version               this text / version");
    println!();
    println!("OPTIONS:");
    println!("    -D <dir>        data directory (or REEF_DATA_DIR)");
    println!("    -c name=value   set a configuration variable");
}

fn require_data_dir(cli: &Cli) -> Result<PathBuf, ExitCode> {
    cli.data_dir.clone().or_else(env::data_dir).ok_or_else(|| {
        eprintln!("reefd: no data directory specified; use -D or REEF_DATA_DIR");
        ExitCode::from(2)
    })
}

/// Force the non-semantic locale categories and export the configured
/// triple for children to inherit.
fn apply_locales(config: &Config) {
    std::env::set_var("LC_COLLATE", &config.locale_collate);
    std::env::set_var("LC_CTYPE", &config.locale_ctype);
    std::env::set_var("LC_MESSAGES", &config.locale_messages);
    for forced in ["LC_MONETARY", "LC_NUMERIC", "LC_TIME"] {
        std::env::set_var(forced, "C");
    }
}

fn load_config(cli: &Cli, data_dir: PathBuf) -> Result<Config, ExitCode> {
    Config::load(data_dir, &cli.options).map_err(|e| {
        eprintln!("reefd: {e}");
        ExitCode::from(2)
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = match parse_args(std::env::args().skip(1).collect()) {
        Ok(cli) => cli,
        Err(message) => {
            eprintln!("error: {message}");
            eprintln!("Usage: reefd [mode] [-D datadir] [-c name=value]");
            return ExitCode::from(2);
        }
    };

    if !cli.mode.read_only() && nix::unistd::geteuid().is_root() {
        eprintln!("reefd: refusing to run as root");
        eprintln!("The supervisor must run under an unprivileged account.");
        return ExitCode::from(2);
    }

    match cli.mode {
        Mode::Help => {
            print_help();
            ExitCode::SUCCESS
        }
        Mode::Version => {
            println!("reefd {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        Mode::Check => run_check(&cli),
        Mode::Bootstrap => run_bootstrap(&cli),
        Mode::DescribeConfig => run_describe_config(&cli),
        Mode::PrintConfigVariable => run_print_variable(&cli),
        Mode::SingleUser => run_single_user(&cli),
        Mode::SpawnChild => run_spawn_child(&cli).await,
        Mode::Supervise => run_supervise(&cli).await,
    }
}

fn run_check(cli: &Cli) -> ExitCode {
    let data_dir = match require_data_dir(cli) {
        Ok(dir) => dir,
        Err(code) => return code,
    };
    let control = match datadir::check(&data_dir) {
        Ok(control) => control,
        Err(e) => {
            eprintln!("reefd: {e}");
            return ExitCode::from(2);
        }
    };
    if let Err(code) = load_config(cli, data_dir.clone()) {
        return code;
    }
    println!(
        "data directory {} is valid (system {}, state {:?})",
        data_dir.display(),
        control.system_id,
        control.cluster_state
    );
    ExitCode::SUCCESS
}

fn run_bootstrap(cli: &Cli) -> ExitCode {
    let data_dir = match require_data_dir(cli) {
        Ok(dir) => dir,
        Err(code) => return code,
    };
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        eprintln!("reefd: cannot create {}: {e}", data_dir.display());
        return ExitCode::from(2);
    }
    match datadir::bootstrap(&data_dir, epoch_now()) {
        Ok(control) => {
            println!(
                "bootstrapped cluster {} in {}",
                control.system_id,
                data_dir.display()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("reefd: {e}");
            ExitCode::from(2)
        }
    }
}

fn run_describe_config(cli: &Cli) -> ExitCode {
    let data_dir = cli
        .data_dir
        .clone()
        .or_else(env::data_dir)
        .unwrap_or_default();
    let config = match Config::load(data_dir, &cli.options) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("reefd: {e}");
            return ExitCode::from(2);
        }
    };
    for (name, value, doc) in config.describe() {
        println!("{name}\t{value}\t{doc}");
    }
    ExitCode::SUCCESS
}

fn run_print_variable(cli: &Cli) -> ExitCode {
    let Some(name) = cli.positionals.first() else {
        eprintln!("reefd: print-config-variable requires a variable name");
        return ExitCode::from(2);
    };
    let data_dir = cli
        .data_dir
        .clone()
        .or_else(env::data_dir)
        .unwrap_or_default();
    let config = match Config::load(data_dir, &cli.options) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("reefd: {e}");
            return ExitCode::from(2);
        }
    };
    match config.describe().into_iter().find(|(n, _, _)| n == name) {
        Some((_, value, _)) => {
            println!("{value}");
            ExitCode::SUCCESS
        }
        None => {
            eprintln!("reefd: unrecognized configuration variable {name:?}");
            ExitCode::from(2)
        }
    }
}

/// Run the startup worker's recovery pass inline, without any children.
fn run_single_user(cli: &Cli) -> ExitCode {
    let data_dir = match require_data_dir(cli) {
        Ok(dir) => dir,
        Err(code) => return code,
    };
    if let Err(e) = datadir::check(&data_dir) {
        eprintln!("reefd: {e}");
        return ExitCode::from(2);
    }
    let mut control = match datadir::read_control(&data_dir) {
        Ok(control) => control,
        Err(e) => {
            eprintln!("reefd: {e}");
            return ExitCode::from(2);
        }
    };

    control.cluster_state = datadir::ClusterState::InRecovery;
    if let Err(e) = datadir::write_control(&data_dir, &control) {
        eprintln!("reefd: {e}");
        return ExitCode::FAILURE;
    }
    control.cluster_state = datadir::ClusterState::InProduction;
    control.updated_epoch = epoch_now();
    if let Err(e) = datadir::write_control(&data_dir, &control) {
        eprintln!("reefd: {e}");
        return ExitCode::FAILURE;
    }
    println!("single-user recovery complete; cluster is consistent");
    ExitCode::SUCCESS
}

async fn run_spawn_child(cli: &Cli) -> ExitCode {
    logging::init_stderr();
    let Some(payload_path) = &cli.payload else {
        eprintln!("reefd: spawn-child requires --payload");
        return ExitCode::from(2);
    };
    let payload = match read_payload(payload_path) {
        Ok(payload) => payload,
        Err(e) => {
            eprintln!("reefd: unreadable spawn payload: {e}");
            return ExitCode::from(2);
        }
    };
    if let Some(label) = cli.positionals.first() {
        if *label != payload.kind.label() {
            eprintln!(
                "reefd: payload kind {} does not match argv kind {label}",
                payload.kind.label()
            );
            return ExitCode::from(2);
        }
    }
    ExitCode::from(worker::run(payload).await.clamp(0, 255) as u8)
}

async fn run_supervise(cli: &Cli) -> ExitCode {
    let data_dir = match require_data_dir(cli) {
        Ok(dir) => dir,
        Err(code) => return code,
    };
    if let Err(e) = datadir::check(&data_dir) {
        eprintln!("reefd: {e}");
        return ExitCode::from(2);
    }
    let config = match load_config(cli, data_dir) {
        Ok(config) => config,
        Err(code) => return code,
    };
    apply_locales(&config);

    let _log_guard = match logging::init_daemon(&config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("reefd: cannot open log file: {e}");
            return ExitCode::FAILURE;
        }
    };

    let pidfile = match PidFile::acquire(config.pidfile_path()) {
        Ok(pidfile) => pidfile,
        Err(e) => {
            // Human-readable: this is the "is it already running?" path.
            eprintln!("reefd is not able to start: {e}");
            return ExitCode::FAILURE;
        }
    };

    // From here on the pidfile exists on disk; every failure path must
    // unlink it so a successor does not observe a half-started cluster.
    let listeners = match Listeners::bind(&config).await {
        Ok(listeners) => listeners,
        Err(e) => {
            error!(error = %e, "socket binding failed");
            pidfile.unlink();
            return ExitCode::FAILURE;
        }
    };

    let pending = Arc::new(PendingSignals::new());
    let latch = Arc::new(Latch::new());
    let intake = match SignalIntake::install(Arc::clone(&pending), Arc::clone(&latch)) {
        Ok(intake) => intake,
        Err(e) => {
            error!(error = %e, "signal setup failed");
            listeners.shutdown();
            pidfile.unlink();
            return ExitCode::FAILURE;
        }
    };

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            error!(error = %e, "cannot determine own executable path");
            listeners.shutdown();
            pidfile.unlink();
            return ExitCode::FAILURE;
        }
    };
    let launcher = Arc::new(ProcessLauncher::new(
        exe,
        config.data_dir.clone(),
        config.standby_mode,
    ));

    let cli_options = cli.options.clone();
    let mut sup = Supervisor::new(config, cli_options, SystemClock, launcher, pending, latch);
    if let Err(e) = sup.boot(Some(pidfile)).await {
        error!(error = %e, "supervisor startup failed");
        listeners.shutdown();
        if let Some(pidfile) = sup.take_pidfile() {
            pidfile.unlink();
        }
        return ExitCode::FAILURE;
    }

    let code = runloop::run(sup, intake, listeners).await;
    ExitCode::from(code.clamp(0, 255) as u8)
}

fn epoch_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
