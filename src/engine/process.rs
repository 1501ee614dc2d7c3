//! Process launch and restart for supervised service types.
//!
//! `Command::spawn` on Unix reports exec failure through an internal
//! close-on-exec pipe: a failed `execvp` surfaces as a spawn error carrying
//! the child's errno, before any exit can be observed. The engine treats
//! that error as the start failure. Child-side setup (fd passing, session
//! and terminal handling) runs in `pre_exec` between fork and exec, and
//! performs no heap allocation there.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use log::error;
use tokio::process::Command;

use super::ServiceSet;
use crate::service::{ServiceId, ServiceState, ServiceType};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("no command configured")]
    EmptyCommand,

    #[error("cannot open log file {}: {}", .0.display(), .1)]
    LogFile(PathBuf, io::Error),

    #[error("cannot create control socket: {0}")]
    ControlSocket(io::Error),

    #[error("{0}")]
    Exec(io::Error),
}

impl ServiceSet {
    /// Type-specific launch, entered once dependencies (and console, and
    /// activation socket) are ready. Returns false when the start failed.
    pub(crate) fn start_ps_process(&mut self, id: ServiceId) -> bool {
        match self.rec(id).kind {
            ServiceType::Internal => {
                // No process; we are started.
                self.started(id);
                true
            }
            ServiceType::Process | ServiceType::Bgprocess | ServiceType::Scripted => {
                if self.rec(id).proc.pid.is_some() {
                    // A launch is already in flight (re-entry from a stale
                    // queue item); don't fork again.
                    return true;
                }
                if self.rec(id).restarting {
                    self.restart_ps_process(id)
                } else {
                    {
                        let rec = self.rec_mut(id);
                        rec.proc.restart_interval_time = Some(Instant::now());
                        rec.proc.restart_interval_count = 0;
                    }
                    let args = self.rec(id).config.command.clone();
                    let on_console = self.rec(id).config.flags.starts_on_console;
                    match self.spawn_service_process(id, &args, on_console) {
                        Ok(()) => {
                            // For a plain process, a successful exec is the
                            // startup criterion.
                            if self.rec(id).kind == ServiceType::Process
                                && self.rec(id).state == ServiceState::Starting
                            {
                                self.started(id);
                            }
                            true
                        }
                        Err(e) => {
                            error!("service {}: execution failed: {}", self.rec(id).name, e);
                            false
                        }
                    }
                }
            }
        }
    }

    /// Restart after an unexpected exit, applying the rate limit. Returns
    /// false when the service is restarting too quickly and must stop.
    pub(crate) fn restart_ps_process(&mut self, id: ServiceId) -> bool {
        let now = Instant::now();

        let (max_count, interval, delay) = {
            let cfg = &self.rec(id).config;
            (
                cfg.max_restart_interval_count,
                cfg.restart_interval,
                cfg.restart_delay,
            )
        };

        if max_count != 0 {
            let in_window = self
                .rec(id)
                .proc
                .restart_interval_time
                .is_some_and(|t| now.duration_since(t) < interval);
            if in_window {
                if self.rec(id).proc.restart_interval_count >= max_count {
                    error!(
                        "service {} restarting too quickly; stopping",
                        self.rec(id).name
                    );
                    return false;
                }
            } else {
                let rec = self.rec_mut(id);
                rec.proc.restart_interval_time = Some(now);
                rec.proc.restart_interval_count = 0;
            }
        }

        // Enforce a minimum spacing since the previous launch; arm the
        // restart timer for the remainder if it has not yet elapsed.
        let last_start = self.rec(id).proc.last_start_time;
        let elapsed_ok = last_start.is_none_or(|t| now.duration_since(t) >= delay);
        if elapsed_ok {
            self.do_restart(id);
        } else if let Some(t) = last_start {
            self.rec_mut(id).proc.restart_at = Some(t + delay);
        }
        true
    }

    /// Actually re-launch (immediately or from timer expiry).
    pub(crate) fn do_restart(&mut self, id: ServiceId) {
        {
            let rec = self.rec_mut(id);
            rec.restarting = false;
            rec.proc.restart_at = None;
            rec.proc.restart_interval_count += 1;
        }

        // A regular restart runs in Starting; smooth recovery re-launches
        // while Started. Console access differs accordingly.
        let state = self.rec(id).state;
        let flags = self.rec(id).config.flags;
        let on_console = if state == ServiceState::Starting {
            flags.starts_on_console
        } else {
            flags.runs_on_console
        };

        let args = self.rec(id).config.command.clone();
        if let Err(e) = self.spawn_service_process(id, &args, on_console) {
            error!("service {}: execution failed: {}", self.rec(id).name, e);
            if self.rec(id).state == ServiceState::Starting {
                self.failed_to_start(id, false);
            } else {
                self.rec_mut(id).desired_state = ServiceState::Stopped;
                self.force_stop_service(id);
            }
        } else if self.rec(id).kind == ServiceType::Process
            && self.rec(id).state == ServiceState::Starting
        {
            self.started(id);
        }
    }

    /// Fork and exec a command for this service. On success the child is
    /// registered for supervision; on failure every acquired descriptor is
    /// closed again.
    pub(crate) fn spawn_service_process(
        &mut self,
        id: ServiceId,
        args: &[String],
        on_console: bool,
    ) -> Result<(), SpawnError> {
        let program = args.first().ok_or(SpawnError::EmptyCommand)?;

        let (flags, logfile, socket_raw) = {
            let rec = self.rec(id);
            (
                rec.config.flags,
                rec.config.logfile.clone(),
                rec.proc.socket_fd.as_ref().map(|fd| fd.as_raw_fd()),
            )
        };

        let mut cmd = Command::new(program);
        cmd.args(&args[1..]);
        cmd.kill_on_drop(false);

        if on_console {
            cmd.stdin(Stdio::inherit());
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        } else {
            cmd.stdin(Stdio::null());
            let path = logfile.unwrap_or_else(|| PathBuf::from("/dev/null"));
            let log = OpenOptions::new()
                .append(true)
                .create(true)
                .mode(0o600)
                .open(&path)
                .map_err(|e| SpawnError::LogFile(path.clone(), e))?;
            let log_err = log
                .try_clone()
                .map_err(|e| SpawnError::LogFile(path.clone(), e))?;
            cmd.stdout(Stdio::from(log));
            cmd.stderr(Stdio::from(log_err));
        }

        // Control-socket pair for services that talk back to the daemon.
        let mut control_pair: Option<(UnixStream, UnixStream)> = None;
        if flags.pass_cs_fd {
            let (ours, theirs) = UnixStream::pair().map_err(SpawnError::ControlSocket)?;
            ours.set_nonblocking(true)
                .map_err(SpawnError::ControlSocket)?;
            control_pair = Some((ours, theirs));
        }
        let cs_raw = control_pair.as_ref().map(|(_, theirs)| theirs.as_raw_fd());

        if socket_raw.is_some() {
            cmd.env("LISTEN_FDS", "1");
        }
        if cs_raw.is_some() {
            // The target fd is fixed before fork; only LISTEN_PID needs the
            // child's pid.
            let target = if socket_raw.is_some() { 4 } else { 3 };
            cmd.env("SUPD_CS_FD", target.to_string());
        }

        // The buffer is moved into the (boxed) closure so the environment
        // string written by the child stays valid through exec.
        let mut listen_pid_env = [0u8; 32];
        unsafe {
            cmd.pre_exec(move || child_setup(socket_raw, cs_raw, on_console, &mut listen_pid_env));
        }

        self.rec_mut(id).proc.last_start_time = Some(Instant::now());

        let child = cmd.spawn().map_err(SpawnError::Exec)?;
        let pid = child.id().map(|p| p as i32);
        {
            let rec = self.rec_mut(id);
            rec.proc.child = Some(child);
            rec.proc.pid = pid;
            rec.proc.tracking_child = true;
            rec.proc.exit_status = None;
        }

        if let Some((ours, theirs)) = control_pair {
            drop(theirs);
            self.hooks.control_conn_fd(OwnedFd::from(ours));
        }
        Ok(())
    }
}

/// Child-side setup between fork and exec. Runs with the caller's address
/// space duplicated; must not allocate.
fn child_setup(
    socket_fd: Option<RawFd>,
    cs_fd: Option<RawFd>,
    on_console: bool,
    listen_pid_env: &mut [u8; 32],
) -> io::Result<()> {
    unsafe {
        // Give the child a clean signal mask.
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigprocmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut());

        // Relocate passed fds above the range they will be dup'd into.
        let mut socket_fd = socket_fd;
        let mut cs_fd = cs_fd;
        if let Some(fd) = socket_fd {
            if fd < 5 {
                socket_fd = Some(dup_above(fd, 5)?);
            }
        }
        if let Some(fd) = cs_fd {
            if fd < 5 {
                cs_fd = Some(dup_above(fd, 5)?);
            }
        }

        if let Some(fd) = socket_fd {
            // dup2 clears close-on-exec on the target descriptor.
            if libc::dup2(fd, 3) == -1 {
                return Err(io::Error::last_os_error());
            }
            format_listen_pid(listen_pid_env, libc::getpid());
            if libc::putenv(listen_pid_env.as_mut_ptr() as *mut libc::c_char) != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        if let Some(fd) = cs_fd {
            let target: RawFd = if socket_fd.is_some() { 4 } else { 3 };
            if libc::dup2(fd, target) == -1 {
                return Err(io::Error::last_os_error());
            }
        }

        if on_console {
            if libc::tcgetsid(0) == -1 {
                // No session leader on the terminal: become it, and keep
                // suspend from stopping the service.
                libc::signal(libc::SIGTSTP, libc::SIG_IGN);
                libc::setsid();
                libc::ioctl(0, libc::TIOCSCTTY, 0);
            }
            libc::setpgid(0, 0);
            libc::tcsetpgrp(0, libc::getpgrp());
        } else {
            libc::setsid();
        }
    }
    Ok(())
}

unsafe fn dup_above(fd: RawFd, min: RawFd) -> io::Result<RawFd> {
    let r = libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, min);
    if r == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(r)
    }
}

/// Write `LISTEN_PID=<pid>\0` into a preallocated buffer.
fn format_listen_pid(buf: &mut [u8; 32], pid: libc::pid_t) {
    const PREFIX: &[u8] = b"LISTEN_PID=";
    buf[..PREFIX.len()].copy_from_slice(PREFIX);

    let mut digits = [0u8; 12];
    let mut n = pid as i64;
    let mut i = digits.len();
    if n <= 0 {
        i -= 1;
        digits[i] = b'0';
    }
    while n > 0 {
        i -= 1;
        digits[i] = b'0' + (n % 10) as u8;
        n /= 10;
    }
    let len = digits.len() - i;
    buf[PREFIX.len()..PREFIX.len() + len].copy_from_slice(&digits[i..]);
    buf[PREFIX.len() + len] = 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_listen_pid() {
        let mut buf = [0u8; 32];
        format_listen_pid(&mut buf, 12345);
        assert_eq!(&buf[..16], b"LISTEN_PID=12345");
        assert_eq!(buf[16], 0);

        format_listen_pid(&mut buf, 7);
        assert_eq!(&buf[..12], b"LISTEN_PID=7");
        assert_eq!(buf[12], 0);
    }
}
