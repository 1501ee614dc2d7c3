//! Service description loader.
//!
//! Descriptions are `key = value` files named after the service, searched
//! across the configured directories. Dependencies are loaded recursively;
//! cycles and duplicate names are rejected here and never reach the engine.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use nix::sys::signal::Signal;

use crate::engine::{EngineError, ServiceSet};
use crate::service::{ServiceConfig, ServiceId, ServiceType, SocketSpec};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("service description not found: {0}")]
    NotFound(String),

    #[error("{file}: {msg}")]
    Parse { file: String, msg: String },

    #[error("circular dependency loading service {0}")]
    DependencyCycle(String),

    #[error("error reading {0}: {1}")]
    Io(String, io::Error),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Loads service descriptions into a [`ServiceSet`].
pub struct ServiceLoader {
    dirs: Vec<PathBuf>,
}

impl ServiceLoader {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// Default search directories for system or per-user operation.
    pub fn default_dirs(system: bool) -> Vec<PathBuf> {
        if system {
            vec![PathBuf::from("/etc/supd.d")]
        } else {
            let home = std::env::var_os("HOME").map(PathBuf::from);
            match home {
                Some(home) => vec![home.join(".config/supd.d")],
                None => vec![PathBuf::from("/etc/supd.d")],
            }
        }
    }

    /// Load a service (and, recursively, its dependencies). Returns the
    /// existing record when the service is already loaded.
    pub fn load(&self, set: &mut ServiceSet, name: &str) -> Result<ServiceId, LoadError> {
        let mut loading = Vec::new();
        self.load_inner(set, name, &mut loading)
    }

    fn load_inner(
        &self,
        set: &mut ServiceSet,
        name: &str,
        loading: &mut Vec<String>,
    ) -> Result<ServiceId, LoadError> {
        if let Some(id) = set.find_service(name) {
            return Ok(id);
        }
        if loading.iter().any(|n| n == name) {
            return Err(LoadError::DependencyCycle(name.to_string()));
        }

        let path = self
            .dirs
            .iter()
            .map(|d| d.join(name))
            .find(|p| p.is_file())
            .ok_or_else(|| LoadError::NotFound(name.to_string()))?;

        let content = std::fs::read_to_string(&path)
            .map_err(|e| LoadError::Io(path.display().to_string(), e))?;
        let settings = parse_description(&path, &content)?;

        loading.push(name.to_string());

        let mut hard = Vec::with_capacity(settings.depends_on.len());
        for dep in &settings.depends_on {
            hard.push(self.load_inner(set, dep, loading)?);
        }

        // A soft dependency that cannot be loaded is not fatal to us.
        let mut soft = Vec::new();
        for dep in &settings.waits_for {
            match self.load_inner(set, dep, loading) {
                Ok(id) => soft.push(id),
                Err(e) => warn!("service {}: cannot load waits-for {}: {}", name, dep, e),
            }
        }

        loading.pop();

        Ok(set.add_service(name, settings.kind, settings.config, hard, soft)?)
    }
}

struct ParsedService {
    kind: ServiceType,
    config: ServiceConfig,
    depends_on: Vec<String>,
    waits_for: Vec<String>,
}

fn parse_err(path: &Path, msg: impl Into<String>) -> LoadError {
    LoadError::Parse {
        file: path.display().to_string(),
        msg: msg.into(),
    }
}

fn parse_bool(path: &Path, key: &str, value: &str) -> Result<bool, LoadError> {
    match value {
        "true" | "yes" => Ok(true),
        "false" | "no" => Ok(false),
        _ => Err(parse_err(path, format!("{}: expected boolean, got '{}'", key, value))),
    }
}

fn parse_seconds(path: &Path, key: &str, value: &str) -> Result<Duration, LoadError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|s| *s >= 0.0 && s.is_finite())
        .map(Duration::from_secs_f64)
        .ok_or_else(|| parse_err(path, format!("{}: expected seconds, got '{}'", key, value)))
}

fn parse_signal(path: &Path, value: &str) -> Result<Signal, LoadError> {
    match value {
        "HUP" => Ok(Signal::SIGHUP),
        "INT" => Ok(Signal::SIGINT),
        "QUIT" => Ok(Signal::SIGQUIT),
        "KILL" => Ok(Signal::SIGKILL),
        "USR1" => Ok(Signal::SIGUSR1),
        "USR2" => Ok(Signal::SIGUSR2),
        _ => Err(parse_err(path, format!("unknown term-signal '{}'", value))),
    }
}

fn parse_description(path: &Path, content: &str) -> Result<ParsedService, LoadError> {
    let mut kind = ServiceType::Process;
    let mut config = ServiceConfig::default();
    let mut depends_on = Vec::new();
    let mut waits_for = Vec::new();

    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(parse_err(path, format!("line {}: expected 'key = value'", lineno + 1)));
        };
        let key = key.trim();
        let value = value.trim();

        match key {
            "type" => {
                kind = match value {
                    "internal" => ServiceType::Internal,
                    "process" => ServiceType::Process,
                    "bgprocess" => ServiceType::Bgprocess,
                    "scripted" => ServiceType::Scripted,
                    _ => return Err(parse_err(path, format!("unknown service type '{}'", value))),
                };
            }
            "command" => {
                config.command = shlex::split(value)
                    .ok_or_else(|| parse_err(path, format!("cannot parse command '{}'", value)))?;
            }
            "stop-command" => {
                config.stop_command = shlex::split(value)
                    .ok_or_else(|| parse_err(path, format!("cannot parse stop-command '{}'", value)))?;
            }
            "logfile" => config.logfile = Some(PathBuf::from(value)),
            "pid-file" => config.pid_file = Some(PathBuf::from(value)),
            "depends-on" => depends_on.push(value.to_string()),
            "waits-for" => waits_for.push(value.to_string()),
            "restart" => config.auto_restart = parse_bool(path, key, value)?,
            "smooth-recovery" => config.smooth_recovery = parse_bool(path, key, value)?,
            "restart-delay" => config.restart_delay = parse_seconds(path, key, value)?,
            "restart-limit-interval" => config.restart_interval = parse_seconds(path, key, value)?,
            "restart-limit-count" => {
                config.max_restart_interval_count = value
                    .parse()
                    .map_err(|_| parse_err(path, format!("{}: expected integer", key)))?;
            }
            "term-signal" => config.term_signal = Some(parse_signal(path, value)?),
            "socket-listen" => {
                let spec = config.socket.get_or_insert_with(|| SocketSpec {
                    path: PathBuf::new(),
                    uid: None,
                    gid: None,
                    perms: 0o666,
                });
                spec.path = PathBuf::from(value);
            }
            "socket-permissions" => {
                let perms = u32::from_str_radix(value, 8)
                    .map_err(|_| parse_err(path, format!("{}: expected octal mode", key)))?;
                if let Some(spec) = config.socket.as_mut() {
                    spec.perms = perms;
                } else {
                    return Err(parse_err(path, "socket-permissions without socket-listen"));
                }
            }
            "socket-uid" => {
                let uid = value
                    .parse()
                    .map_err(|_| parse_err(path, format!("{}: expected integer", key)))?;
                if let Some(spec) = config.socket.as_mut() {
                    spec.uid = Some(uid);
                } else {
                    return Err(parse_err(path, "socket-uid without socket-listen"));
                }
            }
            "socket-gid" => {
                let gid = value
                    .parse()
                    .map_err(|_| parse_err(path, format!("{}: expected integer", key)))?;
                if let Some(spec) = config.socket.as_mut() {
                    spec.gid = Some(gid);
                } else {
                    return Err(parse_err(path, "socket-gid without socket-listen"));
                }
            }
            "options" => {
                for opt in value.split_whitespace() {
                    match opt {
                        "starts-on-console" => config.flags.starts_on_console = true,
                        "runs-on-console" => {
                            // Running on console implies starting there.
                            config.flags.runs_on_console = true;
                            config.flags.starts_on_console = true;
                        }
                        "pass-cs-fd" => config.flags.pass_cs_fd = true,
                        "rw-ready" => config.flags.rw_ready = true,
                        "log-ready" => config.flags.log_ready = true,
                        "no-sigterm" => config.flags.no_sigterm = true,
                        _ => return Err(parse_err(path, format!("unknown option '{}'", opt))),
                    }
                }
            }
            _ => return Err(parse_err(path, format!("unknown setting '{}'", key))),
        }
    }

    if kind != ServiceType::Internal && config.command.is_empty() {
        return Err(parse_err(path, "command is required for this service type"));
    }

    Ok(ParsedService {
        kind,
        config,
        depends_on,
        waits_for,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<ParsedService, LoadError> {
        parse_description(Path::new("test-service"), content)
    }

    #[test]
    fn test_parse_minimal_process() {
        let svc = parse("command = /usr/sbin/sshd -D\n").unwrap();
        assert_eq!(svc.kind, ServiceType::Process);
        assert_eq!(svc.config.command, vec!["/usr/sbin/sshd", "-D"]);
        assert!(svc.depends_on.is_empty());
    }

    #[test]
    fn test_parse_full_description() {
        let svc = parse(
            r#"
# database server
type = bgprocess
command = /usr/bin/dbd --fork
pid-file = /run/dbd.pid
logfile = /var/log/dbd.log
depends-on = net
waits-for = cache
restart = yes
smooth-recovery = true
restart-delay = 0.5
restart-limit-interval = 20
restart-limit-count = 5
term-signal = HUP
socket-listen = /run/dbd.sock
socket-permissions = 660
socket-uid = 100
socket-gid = 100
options = no-sigterm rw-ready
"#,
        )
        .unwrap();

        assert_eq!(svc.kind, ServiceType::Bgprocess);
        assert_eq!(svc.depends_on, vec!["net"]);
        assert_eq!(svc.waits_for, vec!["cache"]);
        assert!(svc.config.auto_restart);
        assert!(svc.config.smooth_recovery);
        assert_eq!(svc.config.restart_delay, Duration::from_millis(500));
        assert_eq!(svc.config.restart_interval, Duration::from_secs(20));
        assert_eq!(svc.config.max_restart_interval_count, 5);
        assert_eq!(svc.config.term_signal, Some(Signal::SIGHUP));
        let socket = svc.config.socket.unwrap();
        assert_eq!(socket.perms, 0o660);
        assert_eq!(socket.uid, Some(100));
        assert!(svc.config.flags.no_sigterm);
        assert!(svc.config.flags.rw_ready);
    }

    #[test]
    fn test_runs_on_console_implies_starts_on_console() {
        let svc = parse("command = /sbin/getty\noptions = runs-on-console\n").unwrap();
        assert!(svc.config.flags.runs_on_console);
        assert!(svc.config.flags.starts_on_console);
    }

    #[test]
    fn test_unknown_setting_rejected() {
        assert!(matches!(
            parse("command = /bin/true\nbogus = 1\n"),
            Err(LoadError::Parse { .. })
        ));
    }

    #[test]
    fn test_command_required_for_process() {
        assert!(matches!(
            parse("type = process\n"),
            Err(LoadError::Parse { .. })
        ));
    }

    #[test]
    fn test_internal_needs_no_command() {
        let svc = parse("type = internal\n").unwrap();
        assert_eq!(svc.kind, ServiceType::Internal);
    }

    #[test]
    fn test_quoted_command_arguments() {
        let svc = parse("command = /bin/sh -c 'echo hello world'\n").unwrap();
        assert_eq!(
            svc.config.command,
            vec!["/bin/sh", "-c", "echo hello world"]
        );
    }
}
