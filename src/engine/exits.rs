//! Child-exit observation and dispatch.
//!
//! The daemon tick polls supervised children and due restart timers while
//! holding the engine; every exit is therefore observed and handled before
//! any other event could signal a recycled pid.

use std::fs::File;
use std::io::Read;
use std::time::Instant;

use log::error;
use nix::sys::signal::kill;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use super::ServiceSet;
use crate::service::{ExitInfo, ServiceId, ServiceState, ServiceType};

/// Outcome of reading a bgprocess pid file.
pub(crate) enum PidResult {
    Ok,
    /// The pid was valid but the process has already terminated.
    Terminated(ExitInfo),
    Failed,
}

impl ServiceSet {
    /// Reap exited children and probe untracked pids; dispatch the
    /// type-specific exit handling for each observed death.
    pub fn process_exits(&mut self) {
        let supervised: Vec<ServiceId> = self
            .records
            .iter()
            .filter(|(_, rec)| rec.proc.child.is_some())
            .map(|(&id, _)| id)
            .collect();

        for id in supervised {
            let status = {
                let rec = self.rec_mut(id);
                let Some(child) = rec.proc.child.as_mut() else {
                    continue;
                };
                match child.try_wait() {
                    Ok(Some(status)) => Some(ExitInfo::from_status(status)),
                    Ok(None) => None,
                    Err(e) => {
                        error!("service {}: error checking child: {}", rec.name, e);
                        None
                    }
                }
            };
            if let Some(info) = status {
                let rec = self.rec_mut(id);
                rec.proc.child = None;
                rec.proc.pid = None;
                rec.proc.exit_status = Some(info);
                self.handle_exit_status(id, info);
            }
        }

        // Bgprocess daemons that are not our direct children have no
        // reapable status; poll for their disappearance instead.
        let polled: Vec<(ServiceId, i32)> = self
            .records
            .iter()
            .filter(|(_, rec)| {
                rec.proc.child.is_none() && !rec.proc.tracking_child && rec.proc.pid.is_some()
            })
            .map(|(&id, rec)| (id, rec.proc.pid.unwrap_or(-1)))
            .collect();

        for (id, pid) in polled {
            if kill(Pid::from_raw(pid), None).is_err() {
                let rec = self.rec_mut(id);
                rec.proc.pid = None;
                rec.proc.exit_status = Some(ExitInfo::Unknown);
                self.handle_exit_status(id, ExitInfo::Unknown);
            }
        }

        self.process_queues();
    }

    /// Fire restart timers whose deadline has passed.
    pub fn process_restarts(&mut self) {
        let now = Instant::now();
        let due: Vec<ServiceId> = self
            .records
            .iter()
            .filter(|(_, rec)| rec.proc.restart_at.is_some_and(|t| now >= t))
            .map(|(&id, _)| id)
            .collect();

        for id in due {
            self.do_restart(id);
        }
        self.process_queues();
    }

    pub(crate) fn handle_exit_status(&mut self, id: ServiceId, info: ExitInfo) {
        match self.rec(id).kind {
            ServiceType::Internal => {}
            ServiceType::Process => self.handle_process_exit(id, info),
            ServiceType::Bgprocess => self.handle_bgprocess_exit(id, info),
            ServiceType::Scripted => self.handle_scripted_exit(id, info),
        }
    }

    fn log_unexpected_exit(&self, id: ServiceId, info: ExitInfo) {
        if !info.is_clean() && self.rec(id).state != ServiceState::Stopping {
            error!(
                "service {} process terminated with {}",
                self.rec(id).name,
                info
            );
        }
    }

    fn handle_process_exit(&mut self, id: ServiceId, info: ExitInfo) {
        self.log_unexpected_exit(id, info);

        let (state, desired, smooth) = {
            let rec = self.rec(id);
            (rec.state, rec.desired_state, rec.config.smooth_recovery)
        };
        match state {
            ServiceState::Starting => {
                if info.is_clean() {
                    self.started(id);
                } else {
                    self.failed_to_start(id, false);
                }
            }
            ServiceState::Stopping => {
                // Assume the process died because we signalled it.
                self.stopped(id);
            }
            _ => {
                if smooth && state == ServiceState::Started && desired == ServiceState::Started {
                    if !self.restart_ps_process(id) {
                        self.emergency_stop(id);
                    }
                } else {
                    self.emergency_stop(id);
                }
            }
        }
    }

    fn handle_bgprocess_exit(&mut self, id: ServiceId, info: ExitInfo) {
        let mut info = info;
        // Re-entered when the pid file reports a process that already
        // terminated; its status replaces the launcher's.
        loop {
            self.log_unexpected_exit(id, info);

            if self.rec(id).proc.doing_recovery {
                self.rec_mut(id).proc.doing_recovery = false;
                let mut need_stop = !info.is_clean();
                if !need_stop {
                    match self.read_pid_file(id) {
                        PidResult::Failed => need_stop = true,
                        PidResult::Terminated(new_info) => {
                            info = new_info;
                            continue;
                        }
                        PidResult::Ok => {}
                    }
                }
                if need_stop {
                    self.emergency_stop(id);
                }
                return;
            }

            let (state, desired, smooth) = {
                let rec = self.rec(id);
                (rec.state, rec.desired_state, rec.config.smooth_recovery)
            };
            match state {
                ServiceState::Starting => {
                    if info.is_clean() {
                        match self.read_pid_file(id) {
                            PidResult::Failed => self.failed_to_start(id, false),
                            PidResult::Terminated(new_info) => {
                                // Started, but died right away: process the
                                // observed death too.
                                self.started(id);
                                info = new_info;
                                continue;
                            }
                            PidResult::Ok => self.started(id),
                        }
                    } else {
                        self.failed_to_start(id, false);
                    }
                }
                ServiceState::Stopping => self.stopped(id),
                _ => {
                    if smooth && state == ServiceState::Started && desired == ServiceState::Started
                    {
                        self.rec_mut(id).proc.doing_recovery = true;
                        if !self.restart_ps_process(id) {
                            self.emergency_stop(id);
                        }
                    } else {
                        self.emergency_stop(id);
                    }
                }
            }
            return;
        }
    }

    fn handle_scripted_exit(&mut self, id: ServiceId, info: ExitInfo) {
        if self.rec(id).state == ServiceState::Stopping {
            if !info.is_clean() {
                // The stop command failed, but blocking dependents on it
                // helps nothing; log and treat the service as stopped.
                log::info!(
                    "service {} stop command terminated with {}",
                    self.rec(id).name,
                    info
                );
            }
            self.stopped(id);
        } else {
            // Starting.
            if info.is_clean() {
                self.started(id);
            } else {
                error!(
                    "service {} command terminated with {}",
                    self.rec(id).name,
                    info
                );
                self.failed_to_start(id, false);
            }
        }
    }

    /// Read and validate the bgprocess pid file, taking over supervision of
    /// the pid it names.
    pub(crate) fn read_pid_file(&mut self, id: ServiceId) -> PidResult {
        let Some(path) = self.rec(id).config.pid_file.clone() else {
            error!("service {}: no pid file configured", self.rec(id).name);
            return PidResult::Failed;
        };

        let mut buf = [0u8; 20];
        let read = File::open(&path).and_then(|mut f| f.read(&mut buf));
        let len = match read {
            Ok(n) => n,
            Err(e) => {
                error!("service {}: could not read pid file: {}", self.rec(id).name, e);
                return PidResult::Failed;
            }
        };

        let pid = std::str::from_utf8(&buf[..len])
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
            .filter(|&p| p > 0);
        let Some(pid) = pid else {
            error!("service {}: invalid pid file contents", self.rec(id).name);
            return PidResult::Failed;
        };

        self.rec_mut(id).proc.pid = Some(pid);

        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            // ECHILD: not our child; we can still check it exists and poll it.
            Err(_) => {
                if kill(Pid::from_raw(pid), None).is_ok() {
                    self.rec_mut(id).proc.tracking_child = false;
                    PidResult::Ok
                } else {
                    error!(
                        "service {}: pid read from pid file ({}) is not valid",
                        self.rec(id).name,
                        pid
                    );
                    self.rec_mut(id).proc.pid = None;
                    PidResult::Failed
                }
            }
            Ok(WaitStatus::StillAlive) => {
                // Our own child, still running; the poll loop watches it.
                self.rec_mut(id).proc.tracking_child = false;
                PidResult::Ok
            }
            Ok(status) => {
                self.rec_mut(id).proc.pid = None;
                PidResult::Terminated(ExitInfo::from_wait_status(status))
            }
        }
    }
}
