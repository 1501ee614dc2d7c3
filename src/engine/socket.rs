//! Activation socket setup.
//!
//! A service may declare a listening socket which the daemon creates before
//! launching the process; the listener is passed to the child as fd 3 with
//! `LISTEN_FDS`/`LISTEN_PID` set.

use std::fs;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;

use log::error;

use super::ServiceSet;
use crate::service::{ServiceId, SocketSpec};

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("error creating activation socket: {0}")]
    Bind(io::Error),

    #[error("error setting activation socket owner/group: {0}")]
    Owner(io::Error),

    #[error("error setting activation socket permissions: {0}")]
    Permissions(io::Error),
}

/// Create the listening socket described by `spec`. Stale paths from a
/// previous run are removed before binding.
pub(crate) fn open_activation_socket(spec: &SocketSpec) -> Result<OwnedFd, SocketError> {
    let _ = fs::remove_file(&spec.path);

    let listener = UnixListener::bind(&spec.path).map_err(SocketError::Bind)?;
    listener.set_nonblocking(true).map_err(SocketError::Bind)?;

    // fchown/fchmod are not required to work on sockets; operate on the
    // path instead.
    if spec.uid.is_some() || spec.gid.is_some() {
        std::os::unix::fs::chown(&spec.path, spec.uid, spec.gid).map_err(SocketError::Owner)?;
    }
    fs::set_permissions(&spec.path, fs::Permissions::from_mode(spec.perms))
        .map_err(SocketError::Permissions)?;

    Ok(listener.into())
}

impl ServiceSet {
    /// Open the activation socket if one is configured and not already
    /// open. Returns false when the start attempt must fail.
    pub(crate) fn open_socket(&mut self, id: ServiceId) -> bool {
        if self.rec(id).proc.socket_fd.is_some() {
            return true;
        }
        let Some(spec) = self.rec(id).config.socket.clone() else {
            return true;
        };
        match open_activation_socket(&spec) {
            Ok(fd) => {
                self.rec_mut(id).proc.socket_fd = Some(fd);
                true
            }
            Err(e) => {
                error!("service {}: {}", self.rec(id).name, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::path::PathBuf;

    fn temp_socket_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("supd-test-{}-{}.sock", std::process::id(), tag))
    }

    #[test]
    fn test_open_activation_socket_creates_listener() {
        let path = temp_socket_path("open");
        let spec = SocketSpec {
            path: path.clone(),
            uid: None,
            gid: None,
            perms: 0o600,
        };
        let fd = open_activation_socket(&spec).unwrap();
        assert!(fd.as_raw_fd() >= 0);
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        // A stale path from a previous run is replaced, not an error.
        drop(fd);
        let fd = open_activation_socket(&spec).unwrap();
        assert!(fd.as_raw_fd() >= 0);
        let _ = fs::remove_file(&path);
    }
}
