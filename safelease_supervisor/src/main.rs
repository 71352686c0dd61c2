//! Safelease renewal supervisor, and the utility that asks a running one to
//! release its lease.

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{self, LevelFilter};
use safelease::{
    logger_init, pf_error, pf_info, read_pid_file, LeaseParams,
    SafeleaseError, SectorDevice, SectorLease, Supervisor, SupervisorConfig,
    SupervisorExit, SystemFencer, Tag, ME,
};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Where `stop` looks for the running supervisor's pid by default.
const DEFAULT_PID_PATH: &str = "/run/safelease_supervisor.pid";

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Acquire the lease and keep renewing it, fencing this host if that
    /// ever becomes impossible. SIGINT/SIGTERM release the lease.
    Run {
        /// Byte offset of the lease sector.
        #[arg(short, long, default_value_t = 0)]
        offset: u64,

        /// Supervisor config overrides as a TOML string.
        #[arg(long, default_value_t = String::from("None"))]
        config: String,

        /// Open the device with O_DSYNC instead of O_DIRECT.
        #[arg(long)]
        no_direct: bool,

        /// Number of tokio worker threads.
        #[arg(long, default_value_t = 4)]
        threads: usize,

        path: PathBuf,
        id: String,
        lease_ms: u64,
        op_max_ms: u64,
    },

    /// Ask the running supervisor to release its lease and exit.
    Stop {
        /// Pid file written by the running supervisor.
        #[arg(long, default_value_t = String::from(DEFAULT_PID_PATH))]
        pid_path: String,
    },
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(SafeleaseError)` on any error.
    fn sanitize(&self) -> Result<(), SafeleaseError> {
        match &self.command {
            Command::Run {
                offset,
                config,
                threads,
                id,
                lease_ms,
                op_max_ms,
                ..
            } => {
                SectorDevice::check_offset(*offset)?;
                Tag::validate_owner_id(id)?;
                LeaseParams::new_strict(*lease_ms, *op_max_ms)?;
                SupervisorConfig::parse(config_arg(config))?;
                if *threads < 2 {
                    return Err(SafeleaseError::msg(format!(
                        "invalid number of threads {}",
                        threads
                    )));
                }
            }
            Command::Stop { pid_path } => {
                if pid_path.is_empty() {
                    return Err(SafeleaseError::msg("empty pid path"));
                }
            }
        }
        Ok(())
    }
}

/// Config string argument, where the literal `None` means no overrides.
fn config_arg(config: &str) -> Option<&str> {
    if config == "None" {
        None
    } else {
        Some(config)
    }
}

/// Acquires and supervises the lease until released or fenced.
fn run_main(
    offset: u64,
    config: &str,
    direct: bool,
    threads: usize,
    path: PathBuf,
    id: String,
    params: LeaseParams,
) -> Result<SupervisorExit, SafeleaseError> {
    let device = Arc::new(SectorDevice::open(&path, direct)?);
    pf_info!(
        "opened '{}' with {}",
        path.display(),
        if device.is_direct() { "O_DIRECT" } else { "O_DSYNC" }
    );
    let lease = Arc::new(SectorLease::new(device, offset, &id, params)?);

    // parse config now so the fencer gets the configured commands
    let config = SupervisorConfig::parse(config_arg(config))?;
    let fencer =
        SystemFencer::new(&config.reboot_cmd, &config.stop_service_cmd);

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    let exit = {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(threads)
            .thread_name("tokio-worker-supervisor")
            .build()?;

        // enter tokio runtime, set up the supervisor, and run it to the end
        runtime.block_on(async move {
            let mut supervisor =
                Supervisor::new_with_config(lease, fencer, config, rx_term)?;
            let exit = supervisor.run().await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            // give type hint for this async closure
            Ok::<SupervisorExit, SafeleaseError>(exit)
        })?
    }; // drop the runtime here

    log::set_max_level(log_level);
    Ok(exit)
}

/// Signals the running supervisor to release.
fn stop_main(pid_path: &str) -> Result<(), SafeleaseError> {
    let pid = read_pid_file(Path::new(pid_path))?;
    // SAFETY: kill() has no memory-safety preconditions
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        return Err(io::Error::last_os_error().into());
    }
    pf_info!("sent SIGTERM to supervisor pid {}", pid);
    Ok(())
}

/// Actual main function of the safelease supervisor; returns the process
/// exit status.
fn supervisor_main() -> Result<u8, SafeleaseError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    match args.command {
        Command::Run {
            offset,
            config,
            no_direct,
            threads,
            path,
            id,
            lease_ms,
            op_max_ms,
        } => {
            let _ = ME.set(id.clone());
            let params = LeaseParams::new_strict(lease_ms, op_max_ms)?;
            let exit = run_main(
                offset, &config, !no_direct, threads, path, id, params,
            )?;
            pf_info!("supervisor exiting: {:?}", exit);
            Ok(exit.exit_code())
        }

        Command::Stop { pid_path } => {
            let _ = ME.set("stop".into());
            stop_main(&pid_path)?;
            Ok(0)
        }
    }
}

/// Main function of the safelease supervisor.
fn main() -> ExitCode {
    logger_init();

    match supervisor_main() {
        Ok(code) => ExitCode::from(code),
        Err(ref e) => {
            pf_error!("supervisor_main exited: {}", e);
            ExitCode::FAILURE
        }
    }
}
