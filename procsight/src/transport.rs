// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! Byte transports for the metric, event, log and control channels.
//!
//! A transport is an endpoint plus an optional live connection. Connections
//! are only established from the reporter thread (and the load constructor);
//! interceptors never connect. Some targets close every descriptor they did
//! not open during their own initialization, so a dropped connection is a
//! normal condition: the reporter notices `needs_connection` each tick and
//! re-establishes.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Udp(String),
    File(PathBuf),
    Stderr,
    /// Discard everything; used when a channel is configured off.
    Null,
}

impl Endpoint {
    /// Parse `tcp://host:port`, `udp://host:port`, `file:///path`,
    /// `stderr`, or `none`.
    pub fn parse(spec: &str) -> Result<Self> {
        if let Some(addr) = spec.strip_prefix("tcp://") {
            return Ok(Endpoint::Tcp(addr.to_string()));
        }
        if let Some(addr) = spec.strip_prefix("udp://") {
            return Ok(Endpoint::Udp(addr.to_string()));
        }
        if let Some(path) = spec.strip_prefix("file://") {
            return Ok(Endpoint::File(PathBuf::from(path)));
        }
        match spec {
            "stderr" => Ok(Endpoint::Stderr),
            "none" => Ok(Endpoint::Null),
            other => bail!("unrecognized endpoint {other:?}"),
        }
    }

    pub fn to_spec(&self) -> String {
        match self {
            Endpoint::Tcp(a) => format!("tcp://{a}"),
            Endpoint::Udp(a) => format!("udp://{a}"),
            Endpoint::File(p) => format!("file://{}", p.display()),
            Endpoint::Stderr => "stderr".to_string(),
            Endpoint::Null => "none".to_string(),
        }
    }
}

enum Conn {
    Tcp(TcpStream),
    Udp(UdpSocket),
    File(File),
}

pub struct Transport {
    endpoint: Endpoint,
    conn: Option<Conn>,
}

impl Transport {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            conn: None,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Whether the reporter should attempt (re)connection this tick.
    pub fn needs_connection(&self) -> bool {
        match self.endpoint {
            Endpoint::Stderr | Endpoint::Null => false,
            _ => self.conn.is_none(),
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        let conn = match &self.endpoint {
            Endpoint::Tcp(addr) => {
                let resolved = addr
                    .to_socket_addrs()
                    .with_context(|| format!("resolving {addr}"))?
                    .next()
                    .with_context(|| format!("no address for {addr}"))?;
                let stream = TcpStream::connect_timeout(&resolved, CONNECT_TIMEOUT)?;
                stream.set_nodelay(true).ok();
                Conn::Tcp(stream)
            }
            Endpoint::Udp(addr) => {
                let socket = UdpSocket::bind("0.0.0.0:0")?;
                socket.connect(addr)?;
                Conn::Udp(socket)
            }
            Endpoint::File(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Conn::File(file)
            }
            Endpoint::Stderr | Endpoint::Null => return Ok(()),
        };
        self.conn = Some(conn);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.conn = None;
    }

    /// Send one framed payload. A transport-level failure drops the
    /// connection so the next tick reconnects; the caller only sees the
    /// error for accounting.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        match (&mut self.conn, &self.endpoint) {
            (_, Endpoint::Null) => Ok(()),
            (_, Endpoint::Stderr) => {
                std::io::stderr().write_all(payload)?;
                Ok(())
            }
            (Some(Conn::Tcp(stream)), _) => {
                if let Err(err) = stream.write_all(payload) {
                    self.conn = None;
                    return Err(err.into());
                }
                Ok(())
            }
            (Some(Conn::Udp(socket)), _) => {
                if let Err(err) = socket.send(payload) {
                    self.conn = None;
                    return Err(err.into());
                }
                Ok(())
            }
            (Some(Conn::File(file)), _) => {
                if let Err(err) = file.write_all(payload) {
                    self.conn = None;
                    return Err(err.into());
                }
                Ok(())
            }
            (None, _) => bail!("not connected"),
        }
    }

    pub fn flush(&mut self) {
        match &mut self.conn {
            Some(Conn::Tcp(stream)) => {
                stream.flush().ok();
            }
            Some(Conn::File(file)) => {
                file.flush().ok();
            }
            _ => {}
        }
    }

    /// Raw descriptor for the control channel's readable-poll.
    pub fn raw_fd(&self) -> Option<RawFd> {
        match &self.conn {
            Some(Conn::Tcp(stream)) => Some(stream.as_raw_fd()),
            Some(Conn::Udp(socket)) => Some(socket.as_raw_fd()),
            Some(Conn::File(file)) => Some(file.as_raw_fd()),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn endpoint_specs_round_trip() {
        for spec in [
            "tcp://127.0.0.1:9109",
            "udp://127.0.0.1:8125",
            "file:///tmp/out.log",
            "stderr",
            "none",
        ] {
            assert_eq!(Endpoint::parse(spec).unwrap().to_spec(), spec);
        }
        assert!(Endpoint::parse("smoke-signal://hill").is_err());
    }

    #[test]
    fn file_transport_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.out");
        let mut transport = Transport::new(Endpoint::File(path.clone()));
        assert!(transport.needs_connection());
        transport.connect().unwrap();
        transport.send(b"a:1|c\n").unwrap();
        transport.send(b"b:2|c\n").unwrap();
        transport.flush();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a:1|c\nb:2|c\n");
    }

    #[test]
    fn tcp_transport_reconnects_through_reporter_path() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut transport = Transport::new(Endpoint::Tcp(addr.to_string()));
        transport.connect().unwrap();
        assert!(!transport.needs_connection());
        transport.send(b"hello\n").unwrap();

        let (mut conn, _) = listener.accept().unwrap();
        let mut buf = [0u8; 6];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello\n");

        transport.disconnect();
        assert!(transport.needs_connection());
    }

    #[test]
    fn null_transport_swallows_everything() {
        let mut transport = Transport::new(Endpoint::Null);
        assert!(!transport.needs_connection());
        transport.send(b"dropped").unwrap();
    }
}
