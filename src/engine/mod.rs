//! Service management engine
//!
//! Owns all service records, the four propagation queues (propagate, start,
//! stop, console) and the tick that drains them. Control requests, child
//! exits, and restart timers each mutate one record and enqueue follow-up
//! work; `process_queues` then runs until quiescent.

mod console;
mod exits;
mod lifecycle;
mod process;
mod socket;

pub use process::SpawnError;
pub use socket::SocketError;

use std::collections::{HashMap, VecDeque};
use std::os::fd::OwnedFd;

use tokio::sync::broadcast;

use crate::service::{
    ServiceConfig, ServiceEvent, ServiceId, ServiceRecord, ServiceState, ServiceType, SoftDep,
};

/// Side effects the engine triggers but does not own. The daemon installs
/// its implementation; tests use [`NullHooks`].
pub trait EngineHooks: Send + Sync {
    /// A service flagged `rw-ready` reached Started: the control socket can
    /// be (re)opened read-write. Best effort.
    fn control_socket_ready(&mut self) {}

    /// A service flagged `log-ready` reached Started: external logging can
    /// be set up. Best effort.
    fn log_ready(&mut self) {}

    /// Parent side of the control-socket pair created for a `pass-cs-fd`
    /// service, to be served as a control connection.
    fn control_conn_fd(&mut self, fd: OwnedFd) {
        drop(fd);
    }
}

/// Hooks that do nothing.
pub struct NullHooks;

impl EngineHooks for NullHooks {}

/// Engine notifications broadcast to control connections.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Service { id: ServiceId, event: ServiceEvent },
    /// All services reached Stopped after a shutdown request.
    ShutdownComplete,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("service {0} is already loaded")]
    DuplicateName(String),

    #[error("service is not stopped")]
    NotStopped,

    #[error("service is required by another service")]
    HasDependents,
}

/// The set of all loaded services plus the propagation machinery.
pub struct ServiceSet {
    records: HashMap<ServiceId, ServiceRecord>,
    by_name: HashMap<String, ServiceId>,
    next_id: u32,

    prop_queue: VecDeque<ServiceId>,
    start_queue: VecDeque<ServiceId>,
    stop_queue: VecDeque<ServiceId>,
    pub(crate) console: console::ConsoleQueue,

    /// Count of records not in Stopped state.
    active_services: u32,
    /// Global restart switch; cleared when shutting down.
    restart_enabled: bool,
    shutting_down: bool,
    shutdown_notified: bool,

    events: broadcast::Sender<EngineEvent>,
    pub(crate) hooks: Box<dyn EngineHooks>,
}

impl ServiceSet {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            records: HashMap::new(),
            by_name: HashMap::new(),
            next_id: 0,
            prop_queue: VecDeque::new(),
            start_queue: VecDeque::new(),
            stop_queue: VecDeque::new(),
            console: console::ConsoleQueue::new(),
            active_services: 0,
            restart_enabled: true,
            shutting_down: false,
            shutdown_notified: false,
            events,
            hooks: Box::new(NullHooks),
        }
    }

    /// Replace the side-effect hooks (daemon startup).
    pub fn set_hooks(&mut self, hooks: Box<dyn EngineHooks>) {
        self.hooks = hooks;
    }

    /// Enable or disable restart-on-unexpected-exit globally. Shutdown
    /// disables it unconditionally.
    pub fn set_auto_restart(&mut self, enable: bool) {
        self.restart_enabled = enable;
    }

    /// Subscribe to service events and shutdown completion.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub(crate) fn rec(&self, id: ServiceId) -> &ServiceRecord {
        &self.records[&id]
    }

    pub(crate) fn rec_mut(&mut self, id: ServiceId) -> &mut ServiceRecord {
        self.records.get_mut(&id).expect("stale service id")
    }

    /// Insert a fully-built record. Dependency edges must reference already
    /// loaded services; back-references are wired here.
    pub fn add_service(
        &mut self,
        name: &str,
        kind: ServiceType,
        config: ServiceConfig,
        hard_deps: Vec<ServiceId>,
        soft_deps: Vec<ServiceId>,
    ) -> Result<ServiceId, EngineError> {
        if self.by_name.contains_key(name) {
            return Err(EngineError::DuplicateName(name.to_string()));
        }
        let id = ServiceId(self.next_id);
        self.next_id += 1;

        let mut rec = ServiceRecord::new(name, kind, config);
        rec.hard_deps = hard_deps.clone();
        rec.soft_deps = soft_deps.iter().map(|&to| SoftDep::new(to)).collect();
        self.records.insert(id, rec);

        for dep in hard_deps {
            self.rec_mut(dep).hard_dependents.push(id);
        }
        for dep in soft_deps {
            self.rec_mut(dep).soft_dependents.push(id);
        }
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Remove a record. Only allowed while Stopped and with no inbound
    /// dependency edges or activations.
    pub fn unload_service(&mut self, id: ServiceId) -> Result<(), EngineError> {
        let rec = self.rec(id);
        if rec.state != ServiceState::Stopped {
            return Err(EngineError::NotStopped);
        }
        if !rec.hard_dependents.is_empty() || !rec.soft_dependents.is_empty() || rec.required_by != 0
        {
            return Err(EngineError::HasDependents);
        }

        let hard_deps = rec.hard_deps.clone();
        let soft_targets: Vec<ServiceId> = rec.soft_deps.iter().map(|e| e.to).collect();
        let name = rec.name.clone();

        for dep in hard_deps {
            self.rec_mut(dep).hard_dependents.retain(|&d| d != id);
        }
        for dep in soft_targets {
            self.rec_mut(dep).soft_dependents.retain(|&d| d != id);
        }

        self.prop_queue.retain(|&q| q != id);
        self.start_queue.retain(|&q| q != id);
        self.stop_queue.retain(|&q| q != id);
        self.unqueue_console(id);

        self.by_name.remove(&name);
        self.records.remove(&id);
        Ok(())
    }

    pub fn find_service(&self, name: &str) -> Option<ServiceId> {
        self.by_name.get(name).copied()
    }

    pub fn contains(&self, id: ServiceId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn service_state(&self, id: ServiceId) -> Option<ServiceState> {
        self.records.get(&id).map(|r| r.state)
    }

    pub fn target_state(&self, id: ServiceId) -> Option<ServiceState> {
        self.records.get(&id).map(|r| r.desired_state)
    }

    pub fn required_by(&self, id: ServiceId) -> Option<u32> {
        self.records.get(&id).map(|r| r.required_by)
    }

    /// Iterate all loaded services.
    pub fn services(&self) -> impl Iterator<Item = (ServiceId, &ServiceRecord)> {
        self.records.iter().map(|(&id, rec)| (id, rec))
    }

    pub fn active_count(&self) -> u32 {
        self.active_services
    }

    // -- Control surface -----------------------------------------------

    /// Start a service. `activate` marks it explicitly activated; `pin`
    /// additionally pins it in the started state.
    pub fn start_service(&mut self, id: ServiceId, activate: bool, pin: bool) {
        if pin {
            self.pin_started(id);
        }
        self.start(id, activate);
        self.process_queues();
    }

    /// Stop (`bring_down`) or merely release a service. `pin` pins it in
    /// the stopped state.
    pub fn stop_service(&mut self, id: ServiceId, bring_down: bool, pin: bool) {
        if pin {
            self.pin_stopped(id);
        }
        self.stop(id, bring_down);
        self.process_queues();
    }

    /// Clear both pins; if the desired state disagrees with the current
    /// state, resume the pending transition.
    pub fn unpin_service(&mut self, id: ServiceId) {
        let rec = self.rec_mut(id);
        let was_pinned_started = std::mem::take(&mut rec.pinned_started);
        let was_pinned_stopped = std::mem::take(&mut rec.pinned_stopped);
        let desired = rec.desired_state;

        if was_pinned_started && desired == ServiceState::Stopped {
            self.do_stop(id);
        }
        if was_pinned_stopped && desired == ServiceState::Started {
            self.do_start(id);
        }
        self.process_queues();
    }

    /// Begin shutdown: disable restarts and stop every service. A
    /// `ShutdownComplete` event fires once no service remains active.
    pub fn stop_all_services(&mut self) {
        self.shutting_down = true;
        self.restart_enabled = false;
        let ids: Vec<ServiceId> = self.records.keys().copied().collect();
        for id in ids {
            self.stop(id, true);
        }
        self.process_queues();
        self.check_shutdown_complete();
    }

    fn pin_started(&mut self, id: ServiceId) {
        let rec = self.rec_mut(id);
        rec.pinned_stopped = false;
        rec.pinned_started = true;
    }

    fn pin_stopped(&mut self, id: ServiceId) {
        let rec = self.rec_mut(id);
        rec.pinned_started = false;
        rec.pinned_stopped = true;
    }

    // -- Queues --------------------------------------------------------

    pub(crate) fn add_to_prop_queue(&mut self, id: ServiceId) {
        let rec = self.rec_mut(id);
        if rec.in_prop_queue {
            return;
        }
        rec.in_prop_queue = true;
        self.prop_queue.push_back(id);
    }

    pub(crate) fn add_to_start_queue(&mut self, id: ServiceId) {
        let rec = self.rec_mut(id);
        if rec.in_start_queue {
            return;
        }
        rec.in_start_queue = true;
        self.start_queue.push_back(id);
    }

    pub(crate) fn add_to_stop_queue(&mut self, id: ServiceId) {
        let rec = self.rec_mut(id);
        if rec.in_stop_queue {
            return;
        }
        rec.in_stop_queue = true;
        self.stop_queue.push_back(id);
    }

    /// Drain the queues until quiescent: propagate first, then start, then
    /// stop, re-checking in that order after every dequeue.
    pub fn process_queues(&mut self) {
        loop {
            if let Some(id) = self.prop_queue.pop_front() {
                self.rec_mut(id).in_prop_queue = false;
                self.do_propagation(id);
            } else if let Some(id) = self.start_queue.pop_front() {
                self.rec_mut(id).in_start_queue = false;
                self.execute_transition(id);
            } else if let Some(id) = self.stop_queue.pop_front() {
                self.rec_mut(id).in_stop_queue = false;
                self.execute_transition(id);
            } else {
                break;
            }
        }
    }

    // -- Active-service accounting -------------------------------------

    pub(crate) fn service_active(&mut self, _id: ServiceId) {
        self.active_services += 1;
    }

    pub(crate) fn service_inactive(&mut self, _id: ServiceId) {
        self.active_services -= 1;
        self.check_shutdown_complete();
    }

    fn check_shutdown_complete(&mut self) {
        if self.shutting_down && self.active_services == 0 && !self.shutdown_notified {
            self.shutdown_notified = true;
            let _ = self.events.send(EngineEvent::ShutdownComplete);
        }
    }

    pub(crate) fn restart_enabled(&self) -> bool {
        self.restart_enabled
    }

    pub(crate) fn notify_listeners(&self, id: ServiceId, event: ServiceEvent) {
        let _ = self.events.send(EngineEvent::Service { id, event });
    }
}

impl Default for ServiceSet {
    fn default() -> Self {
        Self::new()
    }
}
