//! Control protocol between the daemon and `supctl`.
//!
//! Requests and responses are MessagePack-encoded enums carried in
//! u32-length-prefixed frames over a Unix stream socket. Event and
//! shutdown-completion frames are pushed asynchronously and may be
//! interleaved with replies; clients skip them when waiting for a reply.

use std::io;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::service::{ServiceEvent, ServiceId, ServiceState};

/// Control socket for the system daemon.
pub const SYSTEM_SOCKET_PATH: &str = "/run/supd.sock";

/// Largest accepted frame; anything bigger is a protocol error.
pub const MAX_FRAME: usize = 1 << 20;

/// Control socket path for the per-user daemon.
pub fn user_socket_path() -> PathBuf {
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/run/user/{}/supd.sock", uid))
}

pub fn socket_path(system: bool) -> PathBuf {
    if system {
        PathBuf::from(SYSTEM_SOCKET_PATH)
    } else {
        user_socket_path()
    }
}

/// Requested shutdown disposition. The user daemon simply exits; the
/// distinction matters when running as an init process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownKind {
    Halt,
    Poweroff,
    Reboot,
}

/// Request from `supctl` to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Load a service description (or return the already-loaded record).
    Load { name: String },
    /// Find an already-loaded service without loading it.
    Find { name: String },
    /// Start and mark explicitly activated.
    Start { handle: ServiceId, pin: bool },
    /// Start without marking activated.
    Wake { handle: ServiceId, pin: bool },
    /// Stop and clear explicit activation.
    Stop { handle: ServiceId, pin: bool },
    /// Clear explicit activation; stops only if nothing else requires it.
    Release { handle: ServiceId, pin: bool },
    Unpin { handle: ServiceId },
    Unload { handle: ServiceId },
    List,
    Shutdown { kind: ShutdownKind },
}

/// One row of `List` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvcInfo {
    pub name: String,
    pub state: ServiceState,
    pub target: ServiceState,
}

/// Reply or asynchronous information frame from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ack,
    /// The target state already matched when the command was issued.
    AlreadySS,
    Nak,
    NoService,
    ServiceRecord {
        handle: ServiceId,
        state: ServiceState,
        target: ServiceState,
    },
    ServiceList(Vec<SvcInfo>),
    Error(String),

    /// Asynchronous service event (information frame).
    Event {
        handle: ServiceId,
        event: ServiceEvent,
    },
    /// All services stopped after a shutdown request (information frame).
    ShutdownComplete,
}

impl Response {
    /// Information frames are pushed outside the request/reply rhythm.
    pub fn is_info(&self) -> bool {
        matches!(self, Response::Event { .. } | Response::ShutdownComplete)
    }
}

fn encode<T: Serialize>(msg: &T) -> io::Result<Vec<u8>> {
    let body =
        rmp_serde::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if body.len() > MAX_FRAME {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "oversized frame"));
    }
    Ok(body)
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> io::Result<T> {
    rmp_serde::from_slice(body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write one frame (async side, daemon).
pub async fn send_frame<T, W>(writer: &mut W, msg: &T) -> io::Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let body = encode(msg)?;
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    Ok(())
}

/// Read one frame (async side, daemon).
pub async fn recv_frame<T, R>(reader: &mut R) -> io::Result<T>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "oversized frame"));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode(&body)
}

/// Write one frame (blocking side, `supctl`).
pub fn send_frame_blocking<T: Serialize>(writer: &mut impl io::Write, msg: &T) -> io::Result<()> {
    let body = encode(msg)?;
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&body)?;
    Ok(())
}

/// Read one frame (blocking side, `supctl`).
pub fn recv_frame_blocking<T: DeserializeOwned>(reader: &mut impl io::Read) -> io::Result<T> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "oversized frame"));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    decode(&body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let requests = vec![
            Request::Load {
                name: "mysql".into(),
            },
            Request::Start {
                handle: ServiceId(3),
                pin: true,
            },
            Request::Release {
                handle: ServiceId(0),
                pin: false,
            },
            Request::List,
            Request::Shutdown {
                kind: ShutdownKind::Halt,
            },
        ];

        for req in requests {
            let encoded = rmp_serde::to_vec(&req).unwrap();
            let decoded: Request = rmp_serde::from_slice(&encoded).unwrap();
            assert_eq!(format!("{:?}", req), format!("{:?}", decoded));
        }
    }

    #[test]
    fn response_roundtrip() {
        let responses = vec![
            Response::Ack,
            Response::AlreadySS,
            Response::NoService,
            Response::ServiceRecord {
                handle: ServiceId(7),
                state: ServiceState::Started,
                target: ServiceState::Started,
            },
            Response::ServiceList(vec![SvcInfo {
                name: "sshd".into(),
                state: ServiceState::Started,
                target: ServiceState::Started,
            }]),
            Response::Event {
                handle: ServiceId(7),
                event: ServiceEvent::Stopped,
            },
            Response::ShutdownComplete,
        ];

        for resp in responses {
            let encoded = rmp_serde::to_vec(&resp).unwrap();
            let decoded: Response = rmp_serde::from_slice(&encoded).unwrap();
            assert_eq!(format!("{:?}", resp), format!("{:?}", decoded));
        }
    }

    #[test]
    fn test_frame_roundtrip_blocking() {
        let mut buf = Vec::new();
        send_frame_blocking(&mut buf, &Request::List).unwrap();
        let decoded: Request = recv_frame_blocking(&mut buf.as_slice()).unwrap();
        assert!(matches!(decoded, Request::List));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME as u32 + 1).to_le_bytes());
        let err = recv_frame_blocking::<Request>(&mut buf.as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_socket_path() {
        assert_eq!(socket_path(true), PathBuf::from(SYSTEM_SOCKET_PATH));
        let user = socket_path(false);
        assert!(user.starts_with("/run/user"));
        assert!(user.ends_with("supd.sock"));
    }
}
