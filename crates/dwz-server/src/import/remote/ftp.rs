//! Plain FTP sessions over `suppaftp`
//!
//! Uses Extended Passive Mode for NAT/firewall compatibility and binary transfers.
//! Modification times come from `MDTM`, falling back to the `LIST` line.
//! Both the control and the data connections carry the configured socket timeout.

use chrono::{DateTime, Utc};
use std::io::Read;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use suppaftp::{FtpError, FtpResult, FtpStream};
use tracing::{debug, warn};

use super::sftp::io_failure;
use super::{RemoteConnector, RemoteEntry, RemoteSession};
use crate::import::config::RemoteConfig;
use crate::import::error::{ConnectionFailure, ImportError, ImportResult};

pub struct FtpConnector;

impl RemoteConnector for FtpConnector {
    fn connect(&self, config: &RemoteConfig) -> ImportResult<Box<dyn RemoteSession>> {
        let connection_error = |kind: ConnectionFailure, message: String| ImportError::Connection {
            host: config.address(),
            kind,
            message,
        };

        debug!(host = %config.host, port = config.port, "Connecting to FTP server");
        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| connection_error(io_failure(&e), e.to_string()))?
            .next()
            .ok_or_else(|| {
                connection_error(ConnectionFailure::Other, "host resolved to no addresses".to_string())
            })?;

        let mut stream = FtpStream::connect_timeout(addr, config.timeout())
            .map_err(|e| connection_error(ftp_failure(&e), e.to_string()))?
            .passive_stream_builder(data_stream_builder(config.timeout()));
        if let Err(e) = stream.get_ref().set_read_timeout(Some(config.timeout())) {
            warn!(error = %e, "Failed to set FTP read timeout");
        }
        if let Err(e) = stream.get_ref().set_write_timeout(Some(config.timeout())) {
            warn!(error = %e, "Failed to set FTP write timeout");
        }

        stream
            .login(&config.username, &config.password)
            .map_err(|e| connection_error(ConnectionFailure::Authentication, e.to_string()))?;

        stream.set_mode(suppaftp::Mode::ExtendedPassive);
        stream
            .transfer_type(suppaftp::types::FileType::Binary)
            .map_err(|e| connection_error(ftp_failure(&e), e.to_string()))?;

        debug!(user = %config.username, "FTP session established");
        Ok(Box::new(FtpSession { stream }))
    }
}

/// Opens passive data connections with the same bounds as the control connection
fn data_stream_builder(
    timeout: Duration,
) -> impl Fn(SocketAddr) -> FtpResult<TcpStream> + Send + Sync + 'static {
    move |addr| {
        let stream =
            TcpStream::connect_timeout(&addr, timeout).map_err(FtpError::ConnectionError)?;
        stream
            .set_read_timeout(Some(timeout))
            .map_err(FtpError::ConnectionError)?;
        stream
            .set_write_timeout(Some(timeout))
            .map_err(FtpError::ConnectionError)?;
        Ok(stream)
    }
}

fn ftp_failure(err: &FtpError) -> ConnectionFailure {
    match err {
        FtpError::ConnectionError(io) => io_failure(io),
        _ => ConnectionFailure::Other,
    }
}

struct FtpSession {
    stream: FtpStream,
}

impl RemoteSession for FtpSession {
    fn list(&mut self, path: &str) -> ImportResult<Vec<RemoteEntry>> {
        let lines = self
            .stream
            .list(Some(path))
            .map_err(|e| ImportError::DirectoryRead {
                path: path.to_string(),
                message: e.to_string(),
            })?;

        let mut entries = Vec::with_capacity(lines.len());
        for line in &lines {
            let Ok(parsed) = line.parse::<suppaftp::list::File>() else {
                debug!(line = %line, "Skipping unparsable LIST line");
                continue;
            };

            let name = parsed.name().to_string();
            let full_path = format!("{}/{}", path.trim_end_matches('/'), name);
            let mod_time = match self.stream.mdtm(&full_path) {
                Ok(naive) => naive.and_utc(),
                Err(_) => DateTime::<Utc>::from(parsed.modified()),
            };

            entries.push(RemoteEntry {
                is_file: parsed.is_file(),
                size: parsed.size() as u64,
                mod_time,
                name,
            });
        }

        Ok(entries)
    }

    // RETR into memory, as a streamed data connection must be finalized on the
    // control stream before it can be reused.
    fn open(&mut self, path: &str) -> ImportResult<Box<dyn Read + Send + '_>> {
        let cursor = self
            .stream
            .retr_as_buffer(path)
            .map_err(|e| ImportError::Transfer {
                file: path.to_string(),
                message: e.to_string(),
            })?;
        Ok(Box::new(cursor))
    }
}

impl Drop for FtpSession {
    fn drop(&mut self) {
        if let Err(e) = self.stream.quit() {
            warn!("Failed to quit FTP session gracefully: {}", e);
        }
    }
}
