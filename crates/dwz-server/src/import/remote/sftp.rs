//! SFTP sessions over `ssh2`

use chrono::{DateTime, Utc};
use ssh2::{Session, Sftp};
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use tracing::{debug, warn};

use super::{RemoteConnector, RemoteEntry, RemoteSession};
use crate::import::config::RemoteConfig;
use crate::import::error::{ConnectionFailure, ImportError, ImportResult};

// libssh2 reports an elapsed session timeout with this code
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

/// Password or public-key authenticated SFTP
pub struct SftpConnector;

impl RemoteConnector for SftpConnector {
    fn connect(&self, config: &RemoteConfig) -> ImportResult<Box<dyn RemoteSession>> {
        let connection_error = |kind: ConnectionFailure, message: String| ImportError::Connection {
            host: config.address(),
            kind,
            message,
        };

        debug!(host = %config.host, port = config.port, "Connecting to SFTP server");
        let tcp = connect_tcp(config).map_err(|e| connection_error(io_failure(&e), e.to_string()))?;

        let mut session =
            Session::new().map_err(|e| connection_error(ConnectionFailure::Other, e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(config.timeout().as_millis()).unwrap_or(u32::MAX));
        session
            .handshake()
            .map_err(|e| connection_error(ssh_failure(&e), e.to_string()))?;

        let auth = match &config.private_key_path {
            Some(key) => session.userauth_pubkey_file(
                &config.username,
                None,
                key,
                (!config.password.is_empty()).then_some(config.password.as_str()),
            ),
            None => session.userauth_password(&config.username, &config.password),
        };
        if let Err(e) = auth {
            return Err(connection_error(ConnectionFailure::Authentication, e.to_string()));
        }
        if !session.authenticated() {
            return Err(connection_error(
                ConnectionFailure::Authentication,
                format!("user {} was not accepted", config.username),
            ));
        }

        let sftp = session
            .sftp()
            .map_err(|e| connection_error(ssh_failure(&e), e.to_string()))?;

        debug!(user = %config.username, "SFTP session established");
        Ok(Box::new(SftpSession {
            _session: session,
            sftp,
        }))
    }
}

fn connect_tcp(config: &RemoteConfig) -> std::io::Result<TcpStream> {
    let mut last_error = None;
    for addr in (config.host.as_str(), config.port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, config.timeout()) {
            Ok(stream) => {
                stream.set_read_timeout(Some(config.timeout()))?;
                stream.set_write_timeout(Some(config.timeout()))?;
                return Ok(stream);
            },
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "host resolved to no addresses")
    }))
}

pub(crate) fn io_failure(err: &std::io::Error) -> ConnectionFailure {
    match err.kind() {
        std::io::ErrorKind::ConnectionRefused => ConnectionFailure::Refused,
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ConnectionFailure::Timeout,
        _ => ConnectionFailure::Other,
    }
}

fn ssh_failure(err: &ssh2::Error) -> ConnectionFailure {
    match err.code() {
        ssh2::ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => ConnectionFailure::Timeout,
        _ => ConnectionFailure::Other,
    }
}

struct SftpSession {
    // Keeps the SSH transport alive for as long as the SFTP channel is used.
    _session: Session,
    sftp: Sftp,
}

impl RemoteSession for SftpSession {
    fn list(&mut self, path: &str) -> ImportResult<Vec<RemoteEntry>> {
        let entries = self
            .sftp
            .readdir(Path::new(path))
            .map_err(|e| ImportError::DirectoryRead {
                path: path.to_string(),
                message: e.to_string(),
            })?;

        Ok(entries
            .into_iter()
            .filter_map(|(entry_path, stat)| {
                let name = entry_path.file_name()?.to_string_lossy().into_owned();
                let mod_time = stat
                    .mtime
                    .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0))
                    .unwrap_or_else(|| {
                        warn!(file = %name, "Remote entry has no modification time");
                        DateTime::<Utc>::UNIX_EPOCH
                    });
                Some(RemoteEntry {
                    is_file: stat.is_file(),
                    size: stat.size.unwrap_or(0),
                    mod_time,
                    name,
                })
            })
            .collect())
    }

    fn open(&mut self, path: &str) -> ImportResult<Box<dyn Read + Send + '_>> {
        let file = self
            .sftp
            .open(Path::new(path))
            .map_err(|e| ImportError::Transfer {
                file: path.to_string(),
                message: e.to_string(),
            })?;
        Ok(Box::new(file))
    }
}
