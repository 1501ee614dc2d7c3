//! supd - user-space service supervisor daemon
//!
//! Listens on a Unix stream socket for commands from supctl, supervises
//! service processes, and propagates starts/stops across the dependency
//! graph. Services named on the command line (default: "boot") are loaded
//! and activated at startup.

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use clap::Parser;
use log::{error, info, warn};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, Notify, RwLock};

use supd::engine::{EngineEvent, EngineHooks, ServiceSet};
use supd::load::ServiceLoader;
use supd::protocol::{self, Request, Response, SvcInfo};

#[derive(Parser)]
#[command(name = "supd")]
#[command(about = "User-space service supervisor")]
#[command(
    long_about = "supd supervises services described by simple key = value files, \
    starting and stopping them in dependency order. It listens on a Unix socket \
    for commands from supctl."
)]
struct Args {
    /// Run as the system supervisor (socket in /run)
    #[arg(short = 's', long)]
    system: bool,

    /// Service description directory (may be given multiple times)
    #[arg(short = 'd', long = "services-dir")]
    services_dir: Vec<PathBuf>,

    /// Control socket path override
    #[arg(long)]
    socket_path: Option<PathBuf>,

    /// Disable restart of services that die unexpectedly
    #[arg(long)]
    no_restart: bool,

    /// Services to load and activate at startup
    services: Vec<String>,
}

/// Shared engine state, mutated from connection tasks and the tick loop.
type SharedSet = Arc<RwLock<ServiceSet>>;

/// Engine side effects that need the daemon: incoming control-socket fds
/// from pass-cs-fd services, and readiness notifications.
struct DaemonHooks {
    set: Weak<RwLock<ServiceSet>>,
    loader: Arc<ServiceLoader>,
}

impl EngineHooks for DaemonHooks {
    fn control_socket_ready(&mut self) {
        info!("control socket ready notification");
    }

    fn log_ready(&mut self) {
        info!("external log ready notification");
    }

    fn control_conn_fd(&mut self, fd: OwnedFd) {
        let Some(set) = self.set.upgrade() else {
            return;
        };
        let loader = Arc::clone(&self.loader);
        let stream = std::os::unix::net::UnixStream::from(fd);
        match UnixStream::from_std(stream) {
            Ok(stream) => {
                tokio::spawn(handle_connection(stream, set, loader));
            }
            Err(e) => error!("cannot register service control connection: {}", e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let dirs = if args.services_dir.is_empty() {
        ServiceLoader::default_dirs(args.system)
    } else {
        args.services_dir.clone()
    };
    let loader = Arc::new(ServiceLoader::new(dirs));

    let set: SharedSet = Arc::new(RwLock::new(ServiceSet::new()));
    {
        let mut s = set.write().await;
        s.set_hooks(Box::new(DaemonHooks {
            set: Arc::downgrade(&set),
            loader: Arc::clone(&loader),
        }));
        if args.no_restart {
            s.set_auto_restart(false);
        }
    }

    // Bind the control socket before starting anything.
    let sock_path = args
        .socket_path
        .clone()
        .unwrap_or_else(|| protocol::socket_path(args.system));
    if let Some(parent) = sock_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::remove_file(&sock_path);
    let listener = UnixListener::bind(&sock_path)?;
    info!(
        "supd{} listening on {}",
        if args.system { " (system)" } else { "" },
        sock_path.display()
    );

    // Watch for shutdown completion from the engine.
    let shutdown = Arc::new(Notify::new());
    {
        let mut events = set.read().await.subscribe();
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(EngineEvent::ShutdownComplete) => {
                        shutdown.notify_one();
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // Load and activate the initial services.
    {
        let mut s = set.write().await;
        let names = if args.services.is_empty() {
            vec!["boot".to_string()]
        } else {
            args.services.clone()
        };
        for name in names {
            match loader.load(&mut s, &name) {
                Ok(id) => s.start_service(id, true, false),
                Err(e) => warn!("cannot start {}: {}", name, e),
            }
        }
    }

    // Supervision tick: child exits and restart timers.
    {
        let set = Arc::clone(&set);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(100));
            loop {
                interval.tick().await;
                let mut s = set.write().await;
                s.process_exits();
                s.process_restarts();
            }
        });
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = sigterm.recv() => {
                info!("SIGTERM received, stopping all services");
                set.write().await.stop_all_services();
            }
            _ = sigint.recv() => {
                info!("SIGINT received, stopping all services");
                set.write().await.stop_all_services();
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(handle_connection(stream, Arc::clone(&set), Arc::clone(&loader)));
                }
                Err(e) => error!("accept error: {}", e),
            }
        }
    }

    let _ = std::fs::remove_file(&sock_path);
    info!("all services stopped, exiting");
    Ok(())
}

/// Serve one control connection: answer requests and push service events.
/// Replies and events funnel through one writer task so frames never
/// interleave mid-write.
async fn handle_connection(stream: UnixStream, set: SharedSet, loader: Arc<ServiceLoader>) {
    let mut events = set.read().await.subscribe();
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Response>();

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if protocol::send_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    });

    let event_tx = tx.clone();
    let event_task = tokio::spawn(async move {
        loop {
            let frame = match events.recv().await {
                Ok(EngineEvent::Service { id, event }) => Response::Event { handle: id, event },
                Ok(EngineEvent::ShutdownComplete) => Response::ShutdownComplete,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if event_tx.send(frame).is_err() {
                break;
            }
        }
    });

    loop {
        let request = match protocol::recv_frame::<Request, _>(&mut reader).await {
            Ok(request) => request,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                warn!("control connection error: {}", e);
                break;
            }
        };
        let response = handle_request(request, &set, &loader).await;
        if tx.send(response).is_err() {
            break;
        }
    }

    event_task.abort();
    drop(tx);
    let _ = writer_task.await;
}

async fn handle_request(request: Request, set: &SharedSet, loader: &ServiceLoader) -> Response {
    match request {
        Request::Load { name } => {
            let mut s = set.write().await;
            match loader.load(&mut s, &name) {
                Ok(id) => record_reply(&s, id),
                Err(e) => {
                    warn!("cannot load {}: {}", name, e);
                    Response::NoService
                }
            }
        }

        Request::Find { name } => {
            let s = set.read().await;
            match s.find_service(&name) {
                Some(id) => record_reply(&s, id),
                None => Response::NoService,
            }
        }

        Request::Start { handle, pin } => {
            let mut s = set.write().await;
            if !s.contains(handle) {
                return Response::NoService;
            }
            let already = already_in_state(&s, handle, supd::ServiceState::Started);
            s.start_service(handle, true, pin);
            ack(already)
        }

        Request::Wake { handle, pin } => {
            let mut s = set.write().await;
            if !s.contains(handle) {
                return Response::NoService;
            }
            let already = already_in_state(&s, handle, supd::ServiceState::Started);
            s.start_service(handle, false, pin);
            ack(already)
        }

        Request::Stop { handle, pin } => {
            let mut s = set.write().await;
            if !s.contains(handle) {
                return Response::NoService;
            }
            let already = already_in_state(&s, handle, supd::ServiceState::Stopped);
            s.stop_service(handle, true, pin);
            ack(already)
        }

        Request::Release { handle, pin } => {
            let mut s = set.write().await;
            if !s.contains(handle) {
                return Response::NoService;
            }
            let already = already_in_state(&s, handle, supd::ServiceState::Stopped);
            s.stop_service(handle, false, pin);
            ack(already)
        }

        Request::Unpin { handle } => {
            let mut s = set.write().await;
            if !s.contains(handle) {
                return Response::NoService;
            }
            s.unpin_service(handle);
            Response::Ack
        }

        Request::Unload { handle } => {
            let mut s = set.write().await;
            if !s.contains(handle) {
                return Response::NoService;
            }
            match s.unload_service(handle) {
                Ok(()) => Response::Ack,
                Err(e) => {
                    warn!("cannot unload: {}", e);
                    Response::Nak
                }
            }
        }

        Request::List => {
            let s = set.read().await;
            let mut infos: Vec<SvcInfo> = s
                .services()
                .map(|(_, rec)| SvcInfo {
                    name: rec.name().to_string(),
                    state: rec.state(),
                    target: rec.target_state(),
                })
                .collect();
            infos.sort_by(|a, b| a.name.cmp(&b.name));
            Response::ServiceList(infos)
        }

        Request::Shutdown { kind } => {
            info!("shutdown requested ({:?})", kind);
            let mut s = set.write().await;
            s.stop_all_services();
            Response::Ack
        }
    }
}

fn record_reply(s: &ServiceSet, id: supd::ServiceId) -> Response {
    match (s.service_state(id), s.target_state(id)) {
        (Some(state), Some(target)) => Response::ServiceRecord {
            handle: id,
            state,
            target,
        },
        _ => Response::NoService,
    }
}

fn already_in_state(s: &ServiceSet, id: supd::ServiceId, wanted: supd::ServiceState) -> bool {
    s.service_state(id) == Some(wanted) && s.target_state(id) == Some(wanted)
}

fn ack(already: bool) -> Response {
    if already {
        Response::AlreadySS
    } else {
        Response::Ack
    }
}
