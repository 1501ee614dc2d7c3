//! Service model: configuration, lifecycle states, and the runtime record.
//!
//! ```text
//!     ┌─────────┐  start   ┌──────────┐  all deps started  ┌─────────┐
//!     │ Stopped │─────────▶│ Starting │───────────────────▶│ Started │
//!     └─────────┘          └──────────┘                    └─────────┘
//!          ▲                                                    │ stop
//!          │               ┌──────────┐   all dependents        │
//!          └───────────────│ Stopping │◀────────────────────────┘
//!             stopped      └──────────┘      stopped
//! ```
//!
//! A record's `desired_state` only ever holds `Stopped` or `Started`; the
//! reference count `required_by` tracks who is keeping it at `Started`.

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use serde::{Deserialize, Serialize};
use tokio::process::Child;

/// Stable handle for a service record. Also used on the control wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId(pub u32);

/// Lifecycle state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
        }
    }
}

/// Event delivered to control connections when a service changes state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceEvent {
    Started,
    Stopped,
    StartCancelled,
    StopCancelled,
    FailedStart,
}

/// How a service is executed and supervised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    /// No process; started/stopped purely as a dependency node.
    Internal,
    /// A long-running process; the supervised pid is the spawned child.
    Process,
    /// A daemonizing process; the launch command exits and the supervised
    /// pid is read from a pid file.
    Bgprocess,
    /// Start/stop commands that run to completion.
    Scripted,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::Process => "process",
            Self::Bgprocess => "bgprocess",
            Self::Scripted => "scripted",
        }
    }
}

/// Behavior flags set from the service description.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnStartFlags {
    pub starts_on_console: bool,
    pub runs_on_console: bool,
    pub pass_cs_fd: bool,
    pub rw_ready: bool,
    pub log_ready: bool,
    pub no_sigterm: bool,
}

/// Activation socket parameters.
#[derive(Debug, Clone)]
pub struct SocketSpec {
    pub path: PathBuf,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub perms: u32,
}

/// Static configuration of a service, produced by the loader.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub command: Vec<String>,
    pub stop_command: Vec<String>,
    pub logfile: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    pub flags: OnStartFlags,
    pub socket: Option<SocketSpec>,
    pub auto_restart: bool,
    pub smooth_recovery: bool,
    pub restart_delay: Duration,
    pub restart_interval: Duration,
    pub max_restart_interval_count: u32,
    pub term_signal: Option<Signal>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            stop_command: Vec::new(),
            logfile: None,
            pid_file: None,
            flags: OnStartFlags::default(),
            socket: None,
            auto_restart: false,
            smooth_recovery: false,
            restart_delay: Duration::from_millis(200),
            restart_interval: Duration::from_secs(10),
            max_restart_interval_count: 3,
            term_signal: None,
        }
    }
}

/// A soft dependency edge. The target is started along with the dependent
/// but its failure does not block the dependent.
#[derive(Debug, Clone)]
pub struct SoftDep {
    pub to: ServiceId,
    /// We issued `require()` on the target and have not released it yet.
    pub holding_acq: bool,
    /// Our start is currently waiting for the target to leave Starting.
    pub waiting_on: bool,
}

impl SoftDep {
    pub fn new(to: ServiceId) -> Self {
        Self {
            to,
            holding_acq: false,
            waiting_on: false,
        }
    }
}

/// Exit disposition of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitInfo {
    Exited(i32),
    Signaled(i32),
    /// The process disappeared without a reapable status (non-child pid).
    Unknown,
}

impl ExitInfo {
    pub fn is_clean(&self) -> bool {
        matches!(self, ExitInfo::Exited(0))
    }

    pub fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        if let Some(code) = status.code() {
            ExitInfo::Exited(code)
        } else if let Some(sig) = status.signal() {
            ExitInfo::Signaled(sig)
        } else {
            ExitInfo::Unknown
        }
    }

    pub fn from_wait_status(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => ExitInfo::Exited(code),
            WaitStatus::Signaled(_, sig, _) => ExitInfo::Signaled(sig as i32),
            _ => ExitInfo::Unknown,
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitInfo::Exited(code) => write!(f, "exit code {}", code),
            ExitInfo::Signaled(sig) => write!(f, "signal {}", sig),
            ExitInfo::Unknown => write!(f, "unknown status"),
        }
    }
}

/// Process-supervision state for service types that own a child.
#[derive(Debug, Default)]
pub(crate) struct ProcState {
    /// Handle for a directly-spawned child, while it is still running.
    pub child: Option<Child>,
    /// Pid of the supervised process. For Bgprocess this may be a pid read
    /// from the pid file rather than the spawned launcher.
    pub pid: Option<i32>,
    pub exit_status: Option<ExitInfo>,
    /// False when the supervised pid is not our direct child and liveness
    /// is checked by polling.
    pub tracking_child: bool,
    pub doing_recovery: bool,
    pub restart_interval_count: u32,
    pub last_start_time: Option<Instant>,
    pub restart_interval_time: Option<Instant>,
    /// Armed restart timer: the service restarts when this deadline passes.
    pub restart_at: Option<Instant>,
    /// Activation socket listener. Kept open across smooth recovery so a
    /// re-launched process inherits the same listening socket; closed on a
    /// stop that does not restart.
    pub socket_fd: Option<OwnedFd>,
}

/// One supervised service: configuration, dependency edges, and runtime
/// state. Records are owned by the `ServiceSet` arena and addressed by
/// `ServiceId`; dependents hold non-owning back-references.
#[derive(Debug)]
pub struct ServiceRecord {
    pub(crate) name: String,
    pub(crate) kind: ServiceType,
    pub(crate) config: ServiceConfig,

    pub(crate) hard_deps: Vec<ServiceId>,
    pub(crate) hard_dependents: Vec<ServiceId>,
    pub(crate) soft_deps: Vec<SoftDep>,
    pub(crate) soft_dependents: Vec<ServiceId>,

    pub(crate) state: ServiceState,
    pub(crate) desired_state: ServiceState,
    pub(crate) required_by: u32,

    pub(crate) waiting_for_deps: bool,
    pub(crate) force_stop: bool,
    pub(crate) start_explicit: bool,
    pub(crate) restarting: bool,
    pub(crate) pinned_started: bool,
    pub(crate) pinned_stopped: bool,

    pub(crate) prop_require: bool,
    pub(crate) prop_release: bool,
    pub(crate) prop_start: bool,
    pub(crate) prop_stop: bool,
    pub(crate) prop_failure: bool,

    pub(crate) in_prop_queue: bool,
    pub(crate) in_start_queue: bool,
    pub(crate) in_stop_queue: bool,

    pub(crate) proc: ProcState,
}

impl ServiceRecord {
    pub(crate) fn new(name: &str, kind: ServiceType, config: ServiceConfig) -> Self {
        Self {
            name: name.to_string(),
            kind,
            config,
            hard_deps: Vec::new(),
            hard_dependents: Vec::new(),
            soft_deps: Vec::new(),
            soft_dependents: Vec::new(),
            state: ServiceState::Stopped,
            desired_state: ServiceState::Stopped,
            required_by: 0,
            waiting_for_deps: false,
            force_stop: false,
            start_explicit: false,
            restarting: false,
            pinned_started: false,
            pinned_stopped: false,
            prop_require: false,
            prop_release: false,
            prop_start: false,
            prop_stop: false,
            prop_failure: false,
            in_prop_queue: false,
            in_start_queue: false,
            in_stop_queue: false,
            proc: ProcState::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ServiceType {
        self.kind
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn target_state(&self) -> ServiceState {
        self.desired_state
    }

    pub fn required_by(&self) -> u32 {
        self.required_by
    }

    pub fn pid(&self) -> Option<i32> {
        self.proc.pid
    }

    /// Exit disposition of the most recently observed process death.
    pub fn exit_status(&self) -> Option<ExitInfo> {
        self.proc.exit_status
    }

    pub(crate) fn any_prop_bit(&self) -> bool {
        self.prop_require || self.prop_release || self.prop_start || self.prop_stop || self.prop_failure
    }
}
