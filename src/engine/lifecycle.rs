//! Per-service lifecycle transitions and cross-service propagation.
//!
//! A single command ("stop X") can fan out across many services in several
//! phases. Instead of deep recursive call chains, each record carries sticky
//! propagation bits which the propagate queue consumes in a fixed order:
//! require, release, failure, start, stop.

use log::{error, info};

use super::console;
use super::ServiceSet;
use crate::service::{ServiceEvent, ServiceId, ServiceState, ServiceType};

impl ServiceSet {
    // -- Activation reference counting ---------------------------------

    /// Increment the activation count. On 0 -> 1 the acquisition is
    /// propagated to dependencies (unless a pending release cancels out).
    pub(crate) fn require(&mut self, id: ServiceId) {
        let rec = self.rec_mut(id);
        rec.required_by += 1;
        if rec.required_by == 1 {
            rec.prop_require = !rec.prop_release;
            rec.prop_release = false;
            self.add_to_prop_queue(id);
        }
    }

    /// Decrement the activation count. On 1 -> 0 the service no longer has
    /// a reason to run: mark it for stop and release its dependencies.
    pub(crate) fn release(&mut self, id: ServiceId) {
        let rec = self.rec_mut(id);
        rec.required_by -= 1;
        if rec.required_by == 0 {
            rec.desired_state = ServiceState::Stopped;
            rec.prop_release = !rec.prop_require;
            rec.prop_require = false;
            let already_stopped = rec.state == ServiceState::Stopped;
            self.add_to_prop_queue(id);

            if already_stopped {
                self.service_inactive(id);
            } else {
                self.do_stop(id);
            }
        }
    }

    fn release_dependencies(&mut self, id: ServiceId) {
        let hard = self.rec(id).hard_deps.clone();
        for dep in hard {
            self.release(dep);
        }
        for i in 0..self.rec(id).soft_deps.len() {
            let (to, holding) = {
                let edge = &self.rec(id).soft_deps[i];
                (edge.to, edge.holding_acq)
            };
            if holding {
                self.rec_mut(id).soft_deps[i].holding_acq = false;
                self.release(to);
            }
        }
    }

    // -- Start ---------------------------------------------------------

    /// Bring the service up. `activate` marks an explicit activation, which
    /// contributes one reference until a matching stop/release.
    pub(crate) fn start(&mut self, id: ServiceId, activate: bool) {
        if activate && !self.rec(id).start_explicit {
            self.require(id);
            self.rec_mut(id).start_explicit = true;
        }

        let (state, desired) = {
            let rec = self.rec(id);
            (rec.state, rec.desired_state)
        };
        if desired == ServiceState::Started && state != ServiceState::Stopped {
            return;
        }
        let was_active = state != ServiceState::Stopped || desired != ServiceState::Stopped;
        self.rec_mut(id).desired_state = ServiceState::Started;

        if state != ServiceState::Stopped {
            // Already starting or started, or stopping. A stop in progress
            // can only be reversed while dependents are still being waited
            // on; otherwise it must run to completion first.
            if state != ServiceState::Stopping || !self.can_interrupt_stop(id) {
                return;
            }
            self.notify_listeners(id, ServiceEvent::StopCancelled);
        } else if !was_active {
            self.service_active(id);
        }

        if self.rec(id).pinned_stopped {
            // Desired state is recorded; unpin resumes the start.
            return;
        }

        let rec = self.rec_mut(id);
        rec.state = ServiceState::Starting;
        rec.waiting_for_deps = true;
        if self.start_check_dependencies(id, true) {
            self.add_to_start_queue(id);
        }
    }

    /// Resume a start that was suppressed by a stopped-pin.
    pub(crate) fn do_start(&mut self, id: ServiceId) {
        if self.rec(id).pinned_stopped {
            return;
        }
        if self.rec(id).state != ServiceState::Stopped {
            return;
        }
        let rec = self.rec_mut(id);
        rec.state = ServiceState::Starting;
        rec.waiting_for_deps = true;
        if self.start_check_dependencies(id, true) {
            self.add_to_start_queue(id);
        }
    }

    /// Check dependency readiness. With `start_deps`, also request starts
    /// of dependencies that are not yet up and mark awaited soft edges.
    pub(crate) fn start_check_dependencies(&mut self, id: ServiceId, start_deps: bool) -> bool {
        let mut all_started = true;

        let hard = self.rec(id).hard_deps.clone();
        for dep in hard {
            if self.rec(dep).state != ServiceState::Started {
                if start_deps {
                    all_started = false;
                    self.rec_mut(dep).prop_start = true;
                    self.add_to_prop_queue(dep);
                } else {
                    return false;
                }
            }
        }

        for i in 0..self.rec(id).soft_deps.len() {
            let (to, waiting) = {
                let edge = &self.rec(id).soft_deps[i];
                (edge.to, edge.waiting_on)
            };
            let to_state = self.rec(to).state;
            if start_deps {
                if to_state != ServiceState::Started {
                    self.rec_mut(to).prop_start = true;
                    self.add_to_prop_queue(to);
                    self.rec_mut(id).soft_deps[i].waiting_on = true;
                    all_started = false;
                } else {
                    self.rec_mut(id).soft_deps[i].waiting_on = false;
                }
            } else if waiting {
                if to_state != ServiceState::Starting {
                    // Either started or gave up; stop waiting on it.
                    self.rec_mut(id).soft_deps[i].waiting_on = false;
                } else {
                    return false;
                }
            }
        }

        all_started
    }

    /// A dependency reached Started; re-evaluate our own start.
    pub(crate) fn dependency_started(&mut self, id: ServiceId) {
        let rec = self.rec(id);
        if rec.state == ServiceState::Starting && rec.waiting_for_deps {
            self.add_to_start_queue(id);
        }
    }

    /// All hard deps Started, awaited soft deps no longer Starting. Acquire
    /// the console if needed, open the activation socket, launch.
    pub(crate) fn all_deps_started(&mut self, id: ServiceId, has_console: bool) {
        if self.rec(id).config.flags.starts_on_console && !has_console {
            self.rec_mut(id).waiting_for_deps = true;
            self.queue_for_console(id);
            return;
        }

        self.rec_mut(id).waiting_for_deps = false;

        if self.rec(id).proc.restart_at.is_some() {
            // A restart timer is still pending; it re-launches on expiry.
            self.rec_mut(id).waiting_for_deps = true;
            return;
        }

        if !self.open_socket(id) {
            self.failed_to_start(id, false);
            return;
        }

        if !self.start_ps_process(id) {
            self.failed_to_start(id, false);
        }
    }

    // -- Stop ----------------------------------------------------------

    /// Drop an explicit activation and optionally bring the service down.
    pub(crate) fn stop(&mut self, id: ServiceId, bring_down: bool) {
        if self.rec(id).start_explicit {
            self.rec_mut(id).start_explicit = false;
            self.release(id);
        }
        if bring_down {
            // A commanded stop fixes the target state, so a service woken
            // without activation does not bounce back up on global restart.
            self.rec_mut(id).desired_state = ServiceState::Stopped;
            self.do_stop(id);
        }
    }

    pub(crate) fn do_stop(&mut self, id: ServiceId) {
        if self.rec(id).pinned_started {
            return;
        }

        if self.rec(id).start_explicit && !self.do_auto_restart(id) {
            self.rec_mut(id).start_explicit = false;
            self.release(id);
            if self.rec(id).required_by == 0 {
                // The release re-entered us already.
                return;
            }
        }

        let state = self.rec(id).state;
        if state != ServiceState::Started {
            if state == ServiceState::Starting {
                if !self.can_interrupt_start(id) {
                    // The start must run to completion, but dependents
                    // must not believe they are about to come up.
                    self.stop_dependents(id);
                    return;
                }
                self.notify_listeners(id, ServiceEvent::StartCancelled);
                self.interrupt_start(id);
            } else {
                // Stopping already, or stopped: nothing to do.
                return;
            }
        }

        let rec = self.rec_mut(id);
        rec.state = ServiceState::Stopping;
        rec.waiting_for_deps = true;
        if self.stop_dependents(id) {
            self.add_to_stop_queue(id);
        }
    }

    /// Request stops of all direct dependents. Returns true when every
    /// dependent is already stopped.
    pub(crate) fn stop_dependents(&mut self, id: ServiceId) -> bool {
        let dependents = self.rec(id).hard_dependents.clone();
        let force = self.rec(id).force_stop;
        let mut all_stopped = true;
        for dep in dependents {
            if self.rec(dep).state != ServiceState::Stopped {
                all_stopped = false;
            }
            if force {
                self.force_stop_service(dep);
            }
            self.rec_mut(dep).prop_stop = true;
            self.add_to_prop_queue(dep);
        }
        all_stopped
    }

    pub(crate) fn stop_check_dependents(&self, id: ServiceId) -> bool {
        self.rec(id)
            .hard_dependents
            .iter()
            .all(|&dep| self.rec(dep).state == ServiceState::Stopped)
    }

    /// Mark this service (and, via stop propagation, its dependents) as
    /// force-stopped: the stop can no longer be reversed by a start.
    pub(crate) fn force_stop_service(&mut self, id: ServiceId) {
        if self.rec(id).state != ServiceState::Stopped {
            self.rec_mut(id).force_stop = true;
            self.add_to_stop_queue(id);
        }
    }

    /// A dependent reached Stopped; re-evaluate our own stop.
    pub(crate) fn dependent_stopped(&mut self, id: ServiceId) {
        let rec = self.rec(id);
        if rec.state == ServiceState::Stopping && rec.waiting_for_deps {
            self.add_to_stop_queue(id);
        }
    }

    /// Unexpected process death without recovery: bring everything down.
    pub(crate) fn emergency_stop(&mut self, id: ServiceId) {
        if !self.do_auto_restart(id) && self.rec(id).start_explicit {
            self.rec_mut(id).start_explicit = false;
            self.release(id);
        }
        self.force_stop_service(id);
        self.stop_dependents(id);
        self.stopped(id);
    }

    // -- Interruptibility ----------------------------------------------

    pub(crate) fn can_interrupt_start(&self, id: ServiceId) -> bool {
        let rec = self.rec(id);
        rec.proc.restart_at.is_some() || rec.waiting_for_deps
    }

    pub(crate) fn can_interrupt_stop(&self, id: ServiceId) -> bool {
        let rec = self.rec(id);
        rec.waiting_for_deps && !rec.force_stop
    }

    /// Cancel an in-flight start: disarm the restart timer and leave the
    /// console queue.
    pub(crate) fn interrupt_start(&mut self, id: ServiceId) {
        self.rec_mut(id).proc.restart_at = None;
        self.unqueue_console(id);
    }

    pub(crate) fn do_auto_restart(&self, id: ServiceId) -> bool {
        self.rec(id).config.auto_restart && self.restart_enabled()
    }

    // -- Propagation and transitions -----------------------------------

    /// Consume this record's sticky propagation bits, in order.
    pub(crate) fn do_propagation(&mut self, id: ServiceId) {
        if self.rec(id).prop_require {
            self.rec_mut(id).prop_require = false;
            let hard = self.rec(id).hard_deps.clone();
            for dep in hard {
                self.require(dep);
            }
            for i in 0..self.rec(id).soft_deps.len() {
                let to = self.rec(id).soft_deps[i].to;
                self.require(to);
                self.rec_mut(id).soft_deps[i].holding_acq = true;
            }
        }

        if self.rec(id).prop_release {
            self.rec_mut(id).prop_release = false;
            self.release_dependencies(id);
        }

        if self.rec(id).prop_failure {
            self.rec_mut(id).prop_failure = false;
            self.failed_to_start(id, true);
        }

        if self.rec(id).prop_start {
            self.rec_mut(id).prop_start = false;
            self.start(id, false);
        }

        if self.rec(id).prop_stop {
            self.rec_mut(id).prop_stop = false;
            self.do_stop(id);
        }
    }

    /// Entry point of the start and stop queues.
    pub(crate) fn execute_transition(&mut self, id: ServiceId) {
        match self.rec(id).state {
            ServiceState::Starting => {
                if self.start_check_dependencies(id, false) {
                    self.all_deps_started(id, false);
                }
            }
            ServiceState::Stopping => {
                if self.stop_check_dependents(id) {
                    self.all_deps_stopped(id);
                }
            }
            _ => {}
        }
    }

    // -- Terminal transitions ------------------------------------------

    /// The service is up: record it, notify, and wake dependents.
    pub(crate) fn started(&mut self, id: ServiceId) {
        let flags = self.rec(id).config.flags;
        if flags.starts_on_console && !flags.runs_on_console {
            console::reclaim_terminal();
            self.release_console(id);
        }

        info!("service {} started", self.rec(id).name);
        self.rec_mut(id).state = ServiceState::Started;
        self.notify_listeners(id, ServiceEvent::Started);

        if flags.rw_ready {
            self.hooks.control_socket_ready();
        }
        if flags.log_ready {
            self.hooks.log_ready();
        }

        let (force, desired) = {
            let rec = self.rec(id);
            (rec.force_stop, rec.desired_state)
        };
        if force || desired == ServiceState::Stopped {
            self.do_stop(id);
            return;
        }

        let hard_dependents = self.rec(id).hard_dependents.clone();
        for dep in hard_dependents {
            self.dependency_started(dep);
        }
        let soft_dependents = self.rec(id).soft_dependents.clone();
        for dep in soft_dependents {
            self.dependency_started(dep);
        }
    }

    /// The start attempt failed: cancel dependent starts and release soft
    /// acquisitions held against us.
    pub(crate) fn failed_to_start(&mut self, id: ServiceId, dep_failed: bool) {
        let flags = self.rec(id).config.flags;
        if !dep_failed && flags.starts_on_console {
            console::reclaim_terminal();
            self.release_console(id);
        }

        error!("service {} failed to start", self.rec(id).name);
        self.rec_mut(id).state = ServiceState::Stopped;

        if self.rec(id).start_explicit {
            self.rec_mut(id).start_explicit = false;
            self.release(id);
        } else if self.rec(id).required_by == 0 {
            self.service_inactive(id);
        }
        self.notify_listeners(id, ServiceEvent::FailedStart);

        let hard_dependents = self.rec(id).hard_dependents.clone();
        for dep in hard_dependents {
            if self.rec(dep).state == ServiceState::Starting {
                self.rec_mut(dep).prop_failure = true;
                self.add_to_prop_queue(dep);
            }
        }

        // Soft dependents do not have to wait for us: wake them and break
        // the acquisition they took when requesting our start.
        let soft_dependents = self.rec(id).soft_dependents.clone();
        for dep in soft_dependents {
            let edge_idx = self.rec(dep).soft_deps.iter().position(|e| e.to == id);
            if let Some(i) = edge_idx {
                if self.rec(dep).soft_deps[i].waiting_on {
                    let edge = &mut self.rec_mut(dep).soft_deps[i];
                    edge.holding_acq = false;
                    edge.waiting_on = false;
                    self.dependency_started(dep);
                    self.release(id);
                }
            }
        }
    }

    /// The service has actually stopped (dependents stopped already, or an
    /// unexpected termination forced the issue).
    pub(crate) fn stopped(&mut self, id: ServiceId) {
        let flags = self.rec(id).config.flags;
        if flags.runs_on_console {
            console::reclaim_terminal();
            self.release_console(id);
        }

        self.rec_mut(id).force_stop = false;

        // Break soft acquisitions other services hold against us.
        let soft_dependents = self.rec(id).soft_dependents.clone();
        for dep in soft_dependents {
            let edge_idx = self.rec(dep).soft_deps.iter().position(|e| e.to == id);
            if let Some(i) = edge_idx {
                if self.rec(dep).soft_deps[i].holding_acq {
                    self.rec_mut(dep).soft_deps[i].holding_acq = false;
                    self.release(id);
                }
            }
        }

        let will_restart =
            self.rec(id).desired_state == ServiceState::Started && self.restart_enabled();

        let hard_deps = self.rec(id).hard_deps.clone();
        for dep in hard_deps {
            self.dependent_stopped(dep);
        }

        self.rec_mut(id).state = ServiceState::Stopped;

        if will_restart {
            self.rec_mut(id).restarting = true;
            self.start(id, false);
        } else {
            self.rec_mut(id).proc.socket_fd = None;
            if self.rec(id).start_explicit {
                self.rec_mut(id).start_explicit = false;
                self.release(id);
            } else if self.rec(id).required_by == 0 {
                self.service_inactive(id);
            }
        }

        info!("service {} stopped", self.rec(id).name);
        self.notify_listeners(id, ServiceEvent::Stopped);
    }

    /// All dependents are stopped; take the type-specific stop action.
    pub(crate) fn all_deps_stopped(&mut self, id: ServiceId) {
        self.rec_mut(id).waiting_for_deps = false;
        match self.rec(id).kind {
            ServiceType::Internal => self.stopped(id),
            ServiceType::Scripted => {
                let stop_cmd = self.rec(id).config.stop_command.clone();
                if stop_cmd.is_empty() {
                    self.stopped(id);
                } else if let Err(e) = self.spawn_service_process(id, &stop_cmd, false) {
                    info!("service {} stop command failed: {}", self.rec(id).name, e);
                    // Assume stopped anyway so dependencies can stop too.
                    self.stopped(id);
                }
            }
            ServiceType::Process | ServiceType::Bgprocess => {
                let pid = self.rec(id).proc.pid;
                let Some(pid) = pid else {
                    self.stopped(id);
                    return;
                };

                // Signal the process group rather than just the process;
                // less risk of leaving an orphaned process group behind.
                let flags = self.rec(id).config.flags;
                let term_signal = self.rec(id).config.term_signal;
                if !flags.no_sigterm {
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(-pid),
                        nix::sys::signal::Signal::SIGTERM,
                    );
                }
                if let Some(sig) = term_signal {
                    let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(-pid), sig);
                }

                // A bgprocess daemon may not be our direct child, in which
                // case no exit notification will arrive if it is already
                // gone; probe it now.
                if self.rec(id).kind == ServiceType::Bgprocess && self.rec(id).proc.child.is_none()
                {
                    let alive =
                        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
                    if !alive {
                        self.rec_mut(id).proc.pid = None;
                        self.stopped(id);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::{EngineError, EngineEvent, ServiceSet};
    use crate::service::{ServiceConfig, ServiceEvent, ServiceId, ServiceState, ServiceType};
    use tokio::sync::broadcast;

    fn internal(set: &mut ServiceSet, name: &str, hard: &[ServiceId], soft: &[ServiceId]) -> ServiceId {
        set.add_service(
            name,
            ServiceType::Internal,
            ServiceConfig::default(),
            hard.to_vec(),
            soft.to_vec(),
        )
        .unwrap()
    }

    /// A process service with no command always fails its start attempt.
    fn failing(set: &mut ServiceSet, name: &str) -> ServiceId {
        set.add_service(
            name,
            ServiceType::Process,
            ServiceConfig::default(),
            Vec::new(),
            Vec::new(),
        )
        .unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<(ServiceId, ServiceEvent)> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let EngineEvent::Service { id, event } = ev {
                out.push((id, event));
            }
        }
        out
    }

    fn chain(set: &mut ServiceSet) -> (ServiceId, ServiceId, ServiceId) {
        // a depends on b, b depends on c
        let c = internal(set, "c", &[], &[]);
        let b = internal(set, "b", &[c], &[]);
        let a = internal(set, "a", &[b], &[]);
        (a, b, c)
    }

    #[test]
    fn test_start_chain_starts_dependencies_first() {
        let mut set = ServiceSet::new();
        let (a, b, c) = chain(&mut set);
        let mut rx = set.subscribe();

        set.start_service(a, true, false);

        assert_eq!(set.service_state(a), Some(ServiceState::Started));
        assert_eq!(set.service_state(b), Some(ServiceState::Started));
        assert_eq!(set.service_state(c), Some(ServiceState::Started));
        assert_eq!(set.required_by(a), Some(1));
        assert_eq!(set.required_by(b), Some(1));
        assert_eq!(set.required_by(c), Some(1));

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                (c, ServiceEvent::Started),
                (b, ServiceEvent::Started),
                (a, ServiceEvent::Started),
            ]
        );
    }

    #[test]
    fn test_stop_dependency_cascades_to_dependents() {
        let mut set = ServiceSet::new();
        let (a, b, c) = chain(&mut set);
        set.start_service(a, true, false);
        let mut rx = set.subscribe();

        set.stop_service(c, true, false);

        assert_eq!(set.service_state(a), Some(ServiceState::Stopped));
        assert_eq!(set.service_state(b), Some(ServiceState::Stopped));
        assert_eq!(set.service_state(c), Some(ServiceState::Stopped));
        assert_eq!(set.required_by(a), Some(0));
        assert_eq!(set.required_by(b), Some(0));
        assert_eq!(set.required_by(c), Some(0));

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                (a, ServiceEvent::Stopped),
                (b, ServiceEvent::Stopped),
                (c, ServiceEvent::Stopped),
            ]
        );
    }

    #[test]
    fn test_start_stop_roundtrip() {
        let mut set = ServiceSet::new();
        let a = internal(&mut set, "a", &[], &[]);

        set.start_service(a, true, false);
        assert_eq!(set.service_state(a), Some(ServiceState::Started));
        set.stop_service(a, true, false);
        assert_eq!(set.service_state(a), Some(ServiceState::Stopped));
        assert_eq!(set.required_by(a), Some(0));
        assert_eq!(set.active_count(), 0);
    }

    #[test]
    fn test_double_start_is_absorbed() {
        let mut set = ServiceSet::new();
        let a = internal(&mut set, "a", &[], &[]);

        set.start_service(a, true, false);
        set.start_service(a, true, false);
        assert_eq!(set.required_by(a), Some(1));

        set.stop_service(a, true, false);
        assert_eq!(set.service_state(a), Some(ServiceState::Stopped));
        assert_eq!(set.required_by(a), Some(0));
    }

    #[test]
    fn test_release_stops_when_no_other_holders() {
        let mut set = ServiceSet::new();
        let a = internal(&mut set, "a", &[], &[]);

        set.start_service(a, true, false);
        // Release without bring-down: the refcount drop alone stops it.
        set.stop_service(a, false, false);
        assert_eq!(set.service_state(a), Some(ServiceState::Stopped));
        assert_eq!(set.required_by(a), Some(0));
    }

    #[test]
    fn test_wake_does_not_activate() {
        let mut set = ServiceSet::new();
        let a = internal(&mut set, "a", &[], &[]);

        set.start_service(a, false, false);
        assert_eq!(set.service_state(a), Some(ServiceState::Started));
        assert_eq!(set.required_by(a), Some(0));

        set.stop_service(a, true, false);
        assert_eq!(set.service_state(a), Some(ServiceState::Stopped));
    }

    #[test]
    fn test_pin_started_blocks_stop_until_unpin() {
        let mut set = ServiceSet::new();
        let a = internal(&mut set, "a", &[], &[]);

        set.start_service(a, true, true);
        set.stop_service(a, true, false);
        assert_eq!(set.service_state(a), Some(ServiceState::Started));
        assert_eq!(set.target_state(a), Some(ServiceState::Stopped));

        set.unpin_service(a);
        assert_eq!(set.service_state(a), Some(ServiceState::Stopped));
        assert_eq!(set.required_by(a), Some(0));
    }

    #[test]
    fn test_pin_stopped_blocks_start_until_unpin() {
        let mut set = ServiceSet::new();
        let a = internal(&mut set, "a", &[], &[]);

        set.stop_service(a, true, true);
        set.start_service(a, true, false);
        assert_eq!(set.service_state(a), Some(ServiceState::Stopped));
        assert_eq!(set.target_state(a), Some(ServiceState::Started));

        set.unpin_service(a);
        assert_eq!(set.service_state(a), Some(ServiceState::Started));
    }

    #[test]
    fn test_soft_dependency_started_and_released() {
        let mut set = ServiceSet::new();
        let b = internal(&mut set, "b", &[], &[]);
        let a = internal(&mut set, "a", &[], &[b]);

        set.start_service(a, true, false);
        assert_eq!(set.service_state(a), Some(ServiceState::Started));
        assert_eq!(set.service_state(b), Some(ServiceState::Started));
        assert_eq!(set.required_by(b), Some(1));

        set.stop_service(a, true, false);
        assert_eq!(set.service_state(a), Some(ServiceState::Stopped));
        assert_eq!(set.service_state(b), Some(ServiceState::Stopped));
        assert_eq!(set.required_by(b), Some(0));
    }

    #[test]
    fn test_soft_dependency_failure_does_not_block_start() {
        let mut set = ServiceSet::new();
        let b = failing(&mut set, "b");
        let a = internal(&mut set, "a", &[], &[b]);
        let mut rx = set.subscribe();

        set.start_service(a, true, false);
        assert_eq!(set.service_state(a), Some(ServiceState::Started));
        assert_eq!(set.service_state(b), Some(ServiceState::Stopped));
        assert_eq!(set.required_by(b), Some(0));

        let events = drain(&mut rx);
        assert!(events.contains(&(b, ServiceEvent::FailedStart)));
        assert!(events.contains(&(a, ServiceEvent::Started)));
    }

    #[test]
    fn test_hard_dependency_failure_propagates() {
        let mut set = ServiceSet::new();
        let b = failing(&mut set, "b");
        let a = internal(&mut set, "a", &[b], &[]);
        let mut rx = set.subscribe();

        set.start_service(a, true, false);
        assert_eq!(set.service_state(a), Some(ServiceState::Stopped));
        assert_eq!(set.service_state(b), Some(ServiceState::Stopped));
        assert_eq!(set.required_by(a), Some(0));
        assert_eq!(set.required_by(b), Some(0));
        assert_eq!(set.active_count(), 0);

        let events = drain(&mut rx);
        assert!(events.contains(&(b, ServiceEvent::FailedStart)));
        assert!(events.contains(&(a, ServiceEvent::FailedStart)));
    }

    #[test]
    fn test_console_is_granted_one_service_at_a_time() {
        let mut set = ServiceSet::new();
        let mut config = ServiceConfig::default();
        config.flags.starts_on_console = true;
        config.flags.runs_on_console = true;

        let x = set
            .add_service("x", ServiceType::Internal, config.clone(), Vec::new(), Vec::new())
            .unwrap();
        let y = set
            .add_service("y", ServiceType::Internal, config, Vec::new(), Vec::new())
            .unwrap();

        set.start_service(x, true, false);
        assert_eq!(set.service_state(x), Some(ServiceState::Started));

        set.start_service(y, true, false);
        assert_eq!(set.service_state(y), Some(ServiceState::Starting));
        assert_eq!(set.console.owner(), Some(x));

        set.stop_service(x, true, false);
        assert_eq!(set.service_state(x), Some(ServiceState::Stopped));
        assert_eq!(set.service_state(y), Some(ServiceState::Started));
        assert_eq!(set.console.owner(), Some(y));
    }

    #[test]
    fn test_queues_and_prop_bits_clear_after_processing() {
        let mut set = ServiceSet::new();
        let (a, _b, c) = chain(&mut set);
        set.start_service(a, true, false);
        set.stop_service(c, true, false);

        for (_, rec) in set.services() {
            assert!(!rec.any_prop_bit());
            assert!(!rec.in_prop_queue);
            assert!(!rec.in_start_queue);
            assert!(!rec.in_stop_queue);
        }
    }

    #[test]
    fn test_unload_rules() {
        let mut set = ServiceSet::new();
        let b = internal(&mut set, "b", &[], &[]);
        let a = internal(&mut set, "a", &[b], &[]);

        set.start_service(a, true, false);
        assert!(matches!(set.unload_service(a), Err(EngineError::NotStopped)));

        set.stop_service(a, true, false);
        assert!(matches!(
            set.unload_service(b),
            Err(EngineError::HasDependents)
        ));

        set.unload_service(a).unwrap();
        set.unload_service(b).unwrap();
        assert!(set.find_service("a").is_none());
        assert!(set.find_service("b").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut set = ServiceSet::new();
        internal(&mut set, "a", &[], &[]);
        let err = set.add_service(
            "a",
            ServiceType::Internal,
            ServiceConfig::default(),
            Vec::new(),
            Vec::new(),
        );
        assert!(matches!(err, Err(EngineError::DuplicateName(_))));
    }

    #[test]
    fn test_stop_all_services_reports_completion() {
        let mut set = ServiceSet::new();
        let (a, b, c) = chain(&mut set);
        set.start_service(a, true, false);
        let mut rx = set.subscribe();

        set.stop_all_services();

        assert_eq!(set.service_state(a), Some(ServiceState::Stopped));
        assert_eq!(set.service_state(b), Some(ServiceState::Stopped));
        assert_eq!(set.service_state(c), Some(ServiceState::Stopped));
        assert_eq!(set.active_count(), 0);

        let mut saw_complete = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, EngineEvent::ShutdownComplete) {
                saw_complete = true;
            }
        }
        assert!(saw_complete);
    }

    #[test]
    fn test_forced_stop_cascades_to_dependents() {
        let mut set = ServiceSet::new();
        let b = internal(&mut set, "b", &[], &[]);
        let a = internal(&mut set, "a", &[b], &[]);
        set.start_service(a, true, false);

        set.force_stop_service(b);
        set.do_stop(b);
        set.process_queues();

        assert_eq!(set.service_state(a), Some(ServiceState::Stopped));
        assert_eq!(set.service_state(b), Some(ServiceState::Stopped));
    }

    #[test]
    fn test_stopped_service_can_be_started_again() {
        let mut set = ServiceSet::new();
        let b = internal(&mut set, "b", &[], &[]);
        let a = internal(&mut set, "a", &[b], &[]);
        set.start_service(a, true, false);

        set.stop_service(b, true, false);
        assert_eq!(set.service_state(b), Some(ServiceState::Stopped));
        assert_eq!(set.service_state(a), Some(ServiceState::Stopped));

        set.start_service(b, true, false);
        assert_eq!(set.service_state(b), Some(ServiceState::Started));
        // a was released during the cascade and stays down.
        assert_eq!(set.service_state(a), Some(ServiceState::Stopped));
    }
}
