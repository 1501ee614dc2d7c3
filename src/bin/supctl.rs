//! supctl - control utility for supd
//!
//! Connects to the daemon's Unix socket, issues one command, and (unless
//! --no-wait) follows service events until the requested transition
//! completes or is cancelled.

use std::io;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::exit;

use clap::{Parser, Subcommand};

use supd::protocol::{
    recv_frame_blocking, send_frame_blocking, socket_path, Request, Response, ShutdownKind,
};
use supd::service::{ServiceEvent, ServiceId, ServiceState};

#[derive(Parser)]
#[command(name = "supctl")]
#[command(about = "Control the supd service supervisor")]
struct Args {
    /// Talk to the system daemon instead of the user daemon
    #[arg(short = 's', long, global = true)]
    system: bool,

    /// Suppress output (except errors)
    #[arg(long, global = true)]
    quiet: bool,

    /// Don't wait for the transition to complete
    #[arg(long, global = true)]
    no_wait: bool,

    /// Control socket path override
    #[arg(long, global = true)]
    socket_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start and activate a service
    Start {
        /// Pin the service in the started state
        #[arg(long)]
        pin: bool,
        name: String,
    },

    /// Start a service without marking it activated
    Wake {
        #[arg(long)]
        pin: bool,
        name: String,
    },

    /// Stop a service and cancel its explicit activation
    Stop {
        /// Pin the service in the stopped state
        #[arg(long)]
        pin: bool,
        name: String,
    },

    /// Release activation; the service stops if nothing requires it
    Release {
        #[arg(long)]
        pin: bool,
        name: String,
    },

    /// Remove a previously set pin
    Unpin { name: String },

    /// Unload a stopped service
    Unload { name: String },

    /// List loaded services
    List,

    /// Stop all services and terminate the daemon
    Shutdown,
}

fn main() {
    let args = Args::parse();

    let path = args
        .socket_path
        .clone()
        .unwrap_or_else(|| socket_path(args.system));

    let mut stream = match UnixStream::connect(&path) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("supctl: cannot connect to {}: {}", path.display(), e);
            if args.system {
                eprintln!("  is the system daemon running? start with: supd --system");
            } else {
                eprintln!("  is the daemon running? start with: supd");
            }
            exit(1);
        }
    };

    match run(&args, &mut stream) {
        Ok(code) => exit(code),
        Err(e) => {
            eprintln!("supctl: {}", e);
            exit(1);
        }
    }
}

fn run(args: &Args, stream: &mut UnixStream) -> io::Result<i32> {
    let verbose = !args.quiet;
    match &args.command {
        Command::Start { pin, name } => start_stop(stream, args, name, Verb::Start, *pin, verbose),
        Command::Wake { pin, name } => start_stop(stream, args, name, Verb::Wake, *pin, verbose),
        Command::Stop { pin, name } => start_stop(stream, args, name, Verb::Stop, *pin, verbose),
        Command::Release { pin, name } => {
            start_stop(stream, args, name, Verb::Release, *pin, verbose)
        }
        Command::Unpin { name } => unpin(stream, name, verbose),
        Command::Unload { name } => unload(stream, name, verbose),
        Command::List => list(stream),
        Command::Shutdown => shutdown(stream, verbose),
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Verb {
    Start,
    Wake,
    Stop,
    Release,
}

impl Verb {
    fn is_stop(self) -> bool {
        matches!(self, Verb::Stop | Verb::Release)
    }

    fn describe(self) -> &'static str {
        if self.is_stop() {
            "stop"
        } else {
            "start"
        }
    }
}

fn describe_state(stopping: bool) -> &'static str {
    if stopping {
        "stopped"
    } else {
        "started"
    }
}

/// Load the target service and return its handle and state, skipping any
/// interleaved information frames.
fn load_service(
    stream: &mut UnixStream,
    name: &str,
    find_only: bool,
) -> io::Result<Option<(ServiceId, ServiceState)>> {
    let request = if find_only {
        Request::Find {
            name: name.to_string(),
        }
    } else {
        Request::Load {
            name: name.to_string(),
        }
    };
    send_frame_blocking(stream, &request)?;

    match next_reply(stream, &mut Vec::new(), None)? {
        Response::ServiceRecord { handle, state, .. } => Ok(Some((handle, state))),
        Response::NoService => {
            eprintln!("supctl: failed to find/load service '{}'", name);
            Ok(None)
        }
        _ => Err(protocol_error()),
    }
}

/// Read frames until a reply arrives. Events for `watch` seen on the way
/// are stashed in `pending` so a fast transition is not missed.
fn next_reply(
    stream: &mut UnixStream,
    pending: &mut Vec<ServiceEvent>,
    watch: Option<ServiceId>,
) -> io::Result<Response> {
    loop {
        let frame: Response = recv_frame_blocking(stream)?;
        match frame {
            Response::Event { handle, event } if Some(handle) == watch => pending.push(event),
            frame if frame.is_info() => {}
            frame => return Ok(frame),
        }
    }
}

fn protocol_error() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "control protocol error")
}

fn start_stop(
    stream: &mut UnixStream,
    args: &Args,
    name: &str,
    verb: Verb,
    pin: bool,
    verbose: bool,
) -> io::Result<i32> {
    let Some((handle, state)) = load_service(stream, name, false)? else {
        return Ok(1);
    };

    let stopping = verb.is_stop();
    let wanted = if stopping {
        ServiceState::Stopped
    } else {
        ServiceState::Started
    };

    let request = match verb {
        Verb::Start => Request::Start { handle, pin },
        Verb::Wake => Request::Wake { handle, pin },
        Verb::Stop => Request::Stop { handle, pin },
        Verb::Release => Request::Release { handle, pin },
    };
    send_frame_blocking(stream, &request)?;

    let mut pending = Vec::new();
    match next_reply(stream, &mut pending, Some(handle))? {
        Response::AlreadySS => {
            if verbose {
                let already = if state == wanted { "(already) " } else { "" };
                println!("Service {}{}.", already, describe_state(stopping));
            }
            return Ok(0);
        }
        Response::Ack => {}
        _ => return Err(protocol_error()),
    }

    if args.no_wait {
        if verbose {
            println!("Issued {} command successfully.", verb.describe());
        }
        return Ok(0);
    }

    let completion = if stopping {
        ServiceEvent::Stopped
    } else {
        ServiceEvent::Started
    };
    let cancelled = if stopping {
        ServiceEvent::StopCancelled
    } else {
        ServiceEvent::StartCancelled
    };

    // Transitions that finished while we waited for the ack are in
    // `pending`; otherwise follow the event stream.
    let mut pending = pending.into_iter();
    loop {
        let event = match pending.next() {
            Some(event) => event,
            None => match recv_frame_blocking::<Response>(stream)? {
                Response::Event { handle: h, event } if h == handle => event,
                frame if frame.is_info() => continue,
                _ => return Err(protocol_error()),
            },
        };

        if event == completion {
            if verbose {
                println!("Service {}.", describe_state(stopping));
            }
            return Ok(0);
        }
        if event == cancelled {
            if verbose {
                println!("Service {} cancelled.", verb.describe());
            }
            return Ok(1);
        }
        if !stopping && event == ServiceEvent::FailedStart {
            if verbose {
                println!("Service failed to start.");
            }
            return Ok(1);
        }
    }
}

fn unpin(stream: &mut UnixStream, name: &str, verbose: bool) -> io::Result<i32> {
    let Some((handle, _)) = load_service(stream, name, false)? else {
        return Ok(1);
    };
    send_frame_blocking(stream, &Request::Unpin { handle })?;
    match next_reply(stream, &mut Vec::new(), None)? {
        Response::Ack => {
            if verbose {
                println!("Service unpinned.");
            }
            Ok(0)
        }
        _ => Err(protocol_error()),
    }
}

fn unload(stream: &mut UnixStream, name: &str, verbose: bool) -> io::Result<i32> {
    let Some((handle, _)) = load_service(stream, name, true)? else {
        return Ok(1);
    };
    send_frame_blocking(stream, &Request::Unload { handle })?;
    match next_reply(stream, &mut Vec::new(), None)? {
        Response::Ack => {
            if verbose {
                println!("Service unloaded.");
            }
            Ok(0)
        }
        Response::Nak => {
            eprintln!(
                "supctl: could not unload service; not stopped, or required by another service"
            );
            Ok(1)
        }
        _ => Err(protocol_error()),
    }
}

fn list(stream: &mut UnixStream) -> io::Result<i32> {
    send_frame_blocking(stream, &Request::List)?;
    match next_reply(stream, &mut Vec::new(), None)? {
        Response::ServiceList(services) => {
            if services.is_empty() {
                println!("No services loaded");
                return Ok(0);
            }
            println!("{:<32} {:>10} {:>10}", "SERVICE", "STATE", "TARGET");
            for svc in services {
                println!(
                    "{:<32} {:>10} {:>10}",
                    svc.name,
                    svc.state.as_str(),
                    svc.target.as_str()
                );
            }
            Ok(0)
        }
        _ => Err(protocol_error()),
    }
}

fn shutdown(stream: &mut UnixStream, verbose: bool) -> io::Result<i32> {
    send_frame_blocking(
        stream,
        &Request::Shutdown {
            kind: ShutdownKind::Halt,
        },
    )?;
    match next_reply(stream, &mut Vec::new(), None)? {
        Response::Ack => {}
        _ => return Err(protocol_error()),
    }

    // Wait for the rollback to finish. The daemon may exit before the
    // final frame is read; treat a closed connection as completion.
    loop {
        match recv_frame_blocking::<Response>(stream) {
            Ok(Response::ShutdownComplete) => break,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
    }
    if verbose {
        println!("All services stopped.");
    }
    Ok(0)
}
