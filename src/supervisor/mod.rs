//! Renewal supervisor: holds a lease after acquiring it, renews it on a
//! fixed interval, and fences the host the moment it cannot prove the lease
//! any longer.
//!
//! A deadline timer is armed at `last confirmed renewal + lease duration`.
//! Each renewal attempt runs as its own task so that a hung storage path
//! cannot keep the timer from firing; whichever finishes first wins, and a
//! fired deadline always fences.

mod fencing;
mod pidfile;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::lease::{write_marker, LeaseParams, SectorLease};
use crate::utils::{ErrorKind, SafeleaseError, Timer};

use async_trait::async_trait;

use serde::Deserialize;

use tokio::sync::watch;
use tokio::time::{self, Duration, Instant};

pub use fencing::{Fencer, SystemFencer};
pub use pidfile::{read_pid_file, remove_pid_file, write_pid_file};

/// Lease operations the supervisor drives.
#[async_trait]
pub trait LeaseBackend: Send + Sync + 'static {
    /// Timing parameters of the lease.
    fn params(&self) -> LeaseParams;

    /// Human-readable identity of the lease for logs.
    fn describe(&self) -> String;

    async fn acquire(&self, busy_loop: bool) -> Result<u64, SafeleaseError>;

    async fn renew(&self, known_ts: u64) -> Result<u64, SafeleaseError>;

    async fn release(&self) -> Result<bool, SafeleaseError>;
}

#[async_trait]
impl LeaseBackend for SectorLease {
    fn params(&self) -> LeaseParams {
        *SectorLease::params(self)
    }

    fn describe(&self) -> String {
        format!(
            "'{}'@{} id {}",
            self.device().path().display(),
            self.offset(),
            self.owner_id()
        )
    }

    async fn acquire(&self, busy_loop: bool) -> Result<u64, SafeleaseError> {
        SectorLease::acquire(self, busy_loop, &mut None).await
    }

    async fn renew(&self, known_ts: u64) -> Result<u64, SafeleaseError> {
        SectorLease::renew(self, Some(known_ts)).await
    }

    async fn release(&self) -> Result<bool, SafeleaseError> {
        SectorLease::release(self, false).await
    }
}

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Interval between renewals in millisecs; 0 means half the lease.
    pub renew_interval_ms: u64,

    /// Delay between failed renewal attempts within one round in millisecs.
    pub renew_retry_ms: u64,

    /// Maximum renewal attempts per round before fencing.
    pub max_renew_attempts: u32,

    /// Whether to acquire in busy-loop mode.
    pub busy_loop: bool,

    /// Delay before the forced reboot fires once fencing starts.
    pub reboot_grace_secs: u64,

    /// Time allowed for stopping the dependent service.
    pub stop_service_grace_secs: u64,

    /// Local service depending on the lease, stopped when fencing.
    pub service_name: Option<String>,

    /// Pid file of the dependent service's process, signalled when fencing.
    pub service_pid_path: Option<String>,

    /// Shell command rebooting the host.
    pub reboot_cmd: String,

    /// Shell command prefix stopping a service by name.
    pub stop_service_cmd: String,

    /// Where to record the supervisor's own pid; empty string disables.
    pub pid_path: String,

    /// Where to record each committed renewal's timestamp, if anywhere.
    pub marker_path: Option<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            renew_interval_ms: 0,
            renew_retry_ms: 1000,
            max_renew_attempts: 5,
            busy_loop: true,
            reboot_grace_secs: 30,
            stop_service_grace_secs: 10,
            service_name: None,
            service_pid_path: None,
            reboot_cmd: "reboot -f".into(),
            stop_service_cmd: "systemctl stop".into(),
            pid_path: "/run/safelease_supervisor.pid".into(),
            marker_path: None,
        }
    }
}

impl SupervisorConfig {
    /// Parses a TOML string of overrides on top of the defaults.
    pub fn parse(config_str: Option<&str>) -> Result<Self, SafeleaseError> {
        parsed_config!(config_str => SupervisorConfig;
                       renew_interval_ms, renew_retry_ms,
                       max_renew_attempts, busy_loop, reboot_grace_secs,
                       stop_service_grace_secs, service_name,
                       service_pid_path, reboot_cmd, stop_service_cmd,
                       pid_path, marker_path)
    }
}

/// How a supervisor run ended.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SupervisorExit {
    /// Lease released on request.
    Released,

    /// Acquisition found the lease busy or lost the race.
    Contended,

    /// Acquisition failed on the storage path.
    AcquireFailed,

    /// Lease could not be proven in time; host fenced.
    Fenced,
}

impl SupervisorExit {
    /// Process exit status for this outcome.
    pub fn exit_code(&self) -> u8 {
        match self {
            SupervisorExit::Released => 0,
            SupervisorExit::Contended => 2,
            SupervisorExit::AcquireFailed => 3,
            SupervisorExit::Fenced => 4,
        }
    }
}

/// Supervisor states, for transition logging.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum State {
    Acquiring,
    Holding,
    Renewing,
    Fencing,
    Released,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            State::Acquiring => "ACQUIRING",
            State::Holding => "HOLDING",
            State::Renewing => "RENEWING",
            State::Fencing => "FENCING",
            State::Released => "RELEASED",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of one renewal round.
enum RoundOutcome {
    /// Renewal committed with `ts`, issued at `issued`.
    Renewed { ts: u64, issued: Instant },

    /// Lease cannot be proven; carries the reason.
    Fence(String),

    /// Release requested meanwhile.
    Release,
}

/// The renewal supervisor state machine.
pub struct Supervisor<L: LeaseBackend, F: Fencer> {
    /// Configuration parameters struct.
    config: SupervisorConfig,

    /// The lease being held.
    lease: Arc<L>,

    /// Lease timing parameters.
    params: LeaseParams,

    /// Interval between renewals.
    renew_interval: Duration,

    /// Fencing actions.
    fencer: F,

    /// Current state.
    state: State,

    /// Deadline timer armed at last confirmed renewal + lease duration.
    deadline: Timer,

    /// When the last confirmed renewal (or the acquisition) was issued.
    last_renewal: Instant,

    /// Timestamp of the last tag we wrote.
    known_ts: u64,

    /// Receiver side of the termination channel.
    rx_term: watch::Receiver<bool>,

    /// Set once the termination sender is gone.
    term_closed: bool,
}

impl<L: LeaseBackend, F: Fencer> Supervisor<L, F> {
    /// Creates a supervisor for `lease`. `config_str` holds TOML overrides of
    /// `SupervisorConfig`. A `true` on `rx_term` requests release.
    pub fn new_and_setup(
        lease: Arc<L>,
        fencer: F,
        config_str: Option<&str>,
        rx_term: watch::Receiver<bool>,
    ) -> Result<Self, SafeleaseError> {
        let config = SupervisorConfig::parse(config_str)?;
        Self::new_with_config(lease, fencer, config, rx_term)
    }

    /// Same as `new_and_setup()` with an already composed config.
    pub fn new_with_config(
        lease: Arc<L>,
        fencer: F,
        config: SupervisorConfig,
        rx_term: watch::Receiver<bool>,
    ) -> Result<Self, SafeleaseError> {
        let params = lease.params();
        let renew_interval_ms = if config.renew_interval_ms == 0 {
            params.lease_ms() / 2
        } else {
            config.renew_interval_ms
        };
        if renew_interval_ms == 0 || renew_interval_ms >= params.lease_ms() {
            return logged_err!(
                ErrorKind::InvalidParameters;
                "renew interval {} ms must be within lease duration {} ms",
                renew_interval_ms,
                params.lease_ms()
            );
        }
        if config.max_renew_attempts == 0 {
            return logged_err!(
                ErrorKind::InvalidParameters;
                "max_renew_attempts must be positive"
            );
        }

        Ok(Supervisor {
            config,
            lease,
            params,
            renew_interval: Duration::from_millis(renew_interval_ms),
            fencer,
            state: State::Acquiring,
            deadline: Timer::new(),
            last_renewal: Instant::now(),
            known_ts: 0,
            rx_term,
            term_closed: false,
        })
    }

    fn transition(&mut self, to: State) {
        pf_info!(
            "{} -> {} ({})",
            self.state,
            to,
            self.lease.describe()
        );
        self.state = to;
    }

    fn pid_path(&self) -> Option<PathBuf> {
        if self.config.pid_path.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.config.pid_path))
        }
    }

    /// Runs the supervisor to completion.
    pub async fn run(&mut self) -> Result<SupervisorExit, SafeleaseError> {
        // written before acquiring so that `stop` reaches us while we wait
        if let Some(path) = self.pid_path() {
            if let Err(e) = write_pid_file(&path) {
                pf_warn!("error writing pid file '{}': {}", path.display(), e);
            }
        }

        let exit = match self.acquire().await {
            Ok(None) => Ok(self.hold().await),
            Ok(Some(exit)) => Ok(exit),
            Err(e) => Err(e),
        };

        if let Some(path) = self.pid_path() {
            if let Err(e) = remove_pid_file(&path) {
                pf_warn!(
                    "error removing pid file '{}': {}",
                    path.display(),
                    e
                );
            }
        }
        exit
    }

    /// ACQUIRING: returns `None` once the lease is won, or how the run ends
    /// otherwise. A release request cancels acquisition at any point.
    async fn acquire(
        &mut self,
    ) -> Result<Option<SupervisorExit>, SafeleaseError> {
        pf_info!(
            "acquiring {} lease {} ms op {} ms",
            self.lease.describe(),
            self.params.lease_ms(),
            self.params.op_max_ms()
        );
        let lease = self.lease.clone();
        let issued = Instant::now();

        let result = {
            let acquiring = lease.acquire(self.config.busy_loop);
            tokio::pin!(acquiring);
            loop {
                tokio::select! {
                    res = &mut acquiring => break Some(res),

                    res = self.rx_term.changed(), if !self.term_closed => {
                        if self.term_requested(res) {
                            break None;
                        }
                    },
                }
            }
        };

        match result {
            Some(Ok(ts)) => {
                self.known_ts = ts;
                self.last_renewal = issued;
                pf_info!("acquired lease ts {:x}", self.known_ts);
                Ok(None)
            }
            Some(Err(e)) if e.is_contention() => {
                pf_warn!("acquire failed: {}", e);
                Ok(Some(SupervisorExit::Contended))
            }
            Some(Err(e))
                if matches!(e.kind(), ErrorKind::Io | ErrorKind::TimedOut) =>
            {
                pf_error!("acquire failed: {}", e);
                Ok(Some(SupervisorExit::AcquireFailed))
            }
            Some(Err(e)) => Err(e),
            None => {
                pf_info!("release requested while acquiring");
                // a claim write may still be landing; let it settle, then
                // free the sector only if it holds our tag
                time::sleep(self.params.op_timeout()).await;
                Ok(Some(self.release().await))
            }
        }
    }

    /// HOLDING/RENEWING loop; only ever leaves through release or fencing.
    async fn hold(&mut self) -> SupervisorExit {
        loop {
            self.transition(State::Holding);
            self.deadline
                .arm_at(self.last_renewal + self.params.lease_duration());

            let next_renewal = self.last_renewal + self.renew_interval;
            tokio::select! {
                _ = time::sleep_until(next_renewal) => {},

                _ = self.deadline.timeout() => {
                    return self.fence("deadline passed while holding").await;
                },

                res = self.rx_term.changed(), if !self.term_closed => {
                    if self.term_requested(res) {
                        return self.release().await;
                    }
                    continue;
                },
            }

            self.transition(State::Renewing);
            match self.renew_round().await {
                RoundOutcome::Renewed { ts, issued } => {
                    pf_debug!(
                        "renewed ts {:x}, {} ms since last renewal",
                        ts,
                        issued.duration_since(self.last_renewal).as_millis()
                    );
                    self.known_ts = ts;
                    self.last_renewal = issued;
                    self.record_marker(ts);
                }
                RoundOutcome::Fence(reason) => {
                    return self.fence(&reason).await;
                }
                RoundOutcome::Release => return self.release().await,
            }
        }
    }

    /// Interprets a termination channel event; true if release requested.
    fn term_requested(
        &mut self,
        res: Result<(), watch::error::RecvError>,
    ) -> bool {
        if res.is_err() {
            pf_warn!("termination channel closed");
            self.term_closed = true;
            return false;
        }
        *self.rx_term.borrow()
    }

    /// Tries to renew until success, a fatal failure, retries running out,
    /// or the deadline firing.
    async fn renew_round(&mut self) -> RoundOutcome {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let lease = self.lease.clone();
            let known_ts = self.known_ts;
            let issued = Instant::now();
            let mut worker =
                tokio::spawn(async move { lease.renew(known_ts).await });

            let result = tokio::select! {
                joined = &mut worker => joined,

                _ = self.deadline.timeout() => {
                    worker.abort();
                    return RoundOutcome::Fence(format!(
                        "deadline passed during renewal attempt {}",
                        attempts
                    ));
                },

                res = self.rx_term.changed(), if !self.term_closed => {
                    let release = self.term_requested(res);
                    // the in-flight write must land before anything else
                    // touches the sector, so keep waiting on this attempt
                    let joined = tokio::select! {
                        joined = &mut worker => joined,
                        _ = self.deadline.timeout() => {
                            worker.abort();
                            return RoundOutcome::Fence(format!(
                                "deadline passed during renewal attempt {}",
                                attempts
                            ));
                        },
                    };
                    if release {
                        return match joined {
                            Ok(Err(e)) if e.kind() == ErrorKind::TimedOut => {
                                RoundOutcome::Fence(e.to_string())
                            }
                            _ => RoundOutcome::Release,
                        };
                    }
                    joined
                },
            };

            let err = match result {
                Ok(Ok(ts)) => return RoundOutcome::Renewed { ts, issued },
                Ok(Err(e)) => e,
                Err(e) => SafeleaseError::from(e),
            };
            match err.kind() {
                ErrorKind::LeaseLost | ErrorKind::TimedOut => {
                    return RoundOutcome::Fence(err.to_string());
                }
                _ => {}
            }
            if attempts >= self.config.max_renew_attempts {
                return RoundOutcome::Fence(format!(
                    "renewal failed {} times, last: {}",
                    attempts, err
                ));
            }
            pf_warn!("renewal attempt {} failed: {}", attempts, err);

            let retry_delay = Duration::from_millis(self.config.renew_retry_ms);
            tokio::select! {
                _ = time::sleep(retry_delay) => {},

                _ = self.deadline.timeout() => {
                    return RoundOutcome::Fence(format!(
                        "deadline passed after {} failed renewal attempts, \
                         last: {}",
                        attempts, err
                    ));
                },

                res = self.rx_term.changed(), if !self.term_closed => {
                    if self.term_requested(res) {
                        return RoundOutcome::Release;
                    }
                },
            }
        }
    }

    /// Records a committed renewal in the marker file, off the renewal path.
    fn record_marker(&self, ts: u64) {
        if let Some(marker_path) = &self.config.marker_path {
            let path = PathBuf::from(marker_path);
            tokio::spawn(async move {
                if let Err(e) = write_marker(&path, ts).await {
                    pf_warn!(
                        "error writing marker '{}': {}",
                        path.display(),
                        e
                    );
                }
            });
        }
    }

    /// Fences this host. Every step is launched without waiting on it.
    async fn fence(&mut self, reason: &str) -> SupervisorExit {
        self.transition(State::Fencing);
        pf_error!(
            "fencing {}: {}; {} ms since last renewal, {} ms left on \
             deadline, last ts {:x}",
            self.lease.describe(),
            reason,
            self.last_renewal.elapsed().as_millis(),
            self.deadline.remaining().as_millis(),
            self.known_ts
        );

        let reboot_grace = Duration::from_secs(self.config.reboot_grace_secs);
        if let Err(e) = self.fencer.schedule_reboot(reboot_grace) {
            pf_error!("error scheduling reboot: {}", e);
        }

        if let Some(service) = &self.config.service_name {
            let grace =
                Duration::from_secs(self.config.stop_service_grace_secs);
            if let Err(e) = self.fencer.stop_service(service, grace) {
                pf_error!("error stopping service '{}': {}", service, e);
            }
        }

        if let Some(pid_path) = &self.config.service_pid_path {
            match read_pid_file(Path::new(pid_path)) {
                Ok(pid) => {
                    if let Err(e) =
                        self.fencer.signal_process(pid, libc::SIGTERM)
                    {
                        pf_error!("error signalling pid {}: {}", pid, e);
                    }
                }
                Err(e) => pf_error!("error reading service pid: {}", e),
            }
        }

        SupervisorExit::Fenced
    }

    /// Releases the lease on request.
    async fn release(&mut self) -> SupervisorExit {
        self.transition(State::Released);
        match self.lease.release().await {
            Ok(true) => pf_info!("released {}", self.lease.describe()),
            Ok(false) => pf_warn!(
                "{} was no longer ours to release",
                self.lease.describe()
            ),
            Err(e) => pf_error!("error releasing: {}", e),
        }
        SupervisorExit::Released
    }
}
