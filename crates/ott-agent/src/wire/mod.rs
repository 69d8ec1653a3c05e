// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hand-framed HTTP/1.1 delivery of a single event.
//!
//! The sender opens a fresh connection per event, writes the request in one go and reads only
//! the status line. The response body is never consumed.

pub mod tls;

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use http::Uri;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::event::Event;

pub const EVENTS_PATH: &str = "/api/events";
pub const API_KEY_HEADER: &str = "X-API-Key";
const STATUS_LINE_LIMIT: u64 = 128;

/// Result of one delivery attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// 2xx or 3xx.
    Delivered(u16),
    /// Will not succeed on retry: 4xx other than 429, or an event that cannot be serialized.
    Rejected(String),
    /// Worth retrying later: network faults, 5xx, 429 or no readable status.
    Transient(String),
}

impl SendOutcome {
    #[must_use]
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered(_))
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, SendOutcome::Transient(_))
    }

    /// Maps a response status onto an outcome. `0` means no status line could be read.
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=399 => SendOutcome::Delivered(status),
            429 => SendOutcome::Transient("HTTP 429 received from server".to_string()),
            400..=499 => SendOutcome::Rejected(format!("HTTP {status} received from server")),
            0 => SendOutcome::Transient("no readable status line".to_string()),
            _ => SendOutcome::Transient(format!("HTTP {status} received from server")),
        }
    }
}

/// Anything able to deliver one event. Transports and the disk queue hold one of these.
pub trait EventSender: Send + Sync {
    fn send(&self, event: &Event) -> SendOutcome;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentEncoding {
    Gzip,
    Identity,
}

impl fmt::Display for ContentEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentEncoding::Gzip => f.write_str("gzip"),
            ContentEncoding::Identity => f.write_str("identity"),
        }
    }
}

pub fn gzip(data: &[u8], level: u32) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder.write_all(data)?;
    encoder.finish()
}

/// Gzips `json` when `level > 0`, falling back to the plain bytes when compression fails.
#[must_use]
pub fn compress(json: Vec<u8>, level: u32) -> (Vec<u8>, ContentEncoding) {
    if level == 0 {
        return (json, ContentEncoding::Identity);
    }
    match gzip(&json, level) {
        Ok(compressed) => (compressed, ContentEncoding::Gzip),
        Err(e) => {
            error!("WIRE | Gzip compression failed, sending uncompressed: {e}");
            (json, ContentEncoding::Identity)
        }
    }
}

/// Where events are posted, derived from the configured server URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub tls: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Endpoint {
    /// `None` when the URL cannot be parsed or carries no host.
    #[must_use]
    pub fn parse(server_url: &str) -> Option<Self> {
        let uri: Uri = server_url.trim().parse().ok()?;
        let host = uri.host().filter(|h| !h.is_empty())?.to_string();
        let tls = uri
            .scheme_str()
            .is_some_and(|s| s.eq_ignore_ascii_case("https"));
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
        let path = format!("{}{EVENTS_PATH}", uri.path().trim_end_matches('/'));
        Some(Self {
            tls,
            host,
            port,
            path,
        })
    }

    /// The host without the brackets an IPv6 literal carries in a URL.
    fn address_host(&self) -> &str {
        self.host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(&self.host)
    }

    fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Parses `HTTP/x.y NNN ...`, returning 0 when the line does not look like a status line.
#[must_use]
pub fn parse_status_line(line: &str) -> u16 {
    let bytes = line.as_bytes();
    let well_formed = bytes.len() >= 12
        && bytes[..5].eq_ignore_ascii_case(b"HTTP/")
        && bytes[5].is_ascii_digit()
        && bytes[6] == b'.'
        && bytes[7].is_ascii_digit()
        && bytes[8] == b' '
        && bytes[9..12].iter().all(u8::is_ascii_digit);
    if !well_formed {
        return 0;
    }
    line[9..12].parse().unwrap_or(0)
}

pub struct WireSender {
    server_url: String,
    api_key: String,
    timeout: Duration,
    compression_level: u32,
    tls_config: OnceLock<Option<Arc<ClientConfig>>>,
}

impl WireSender {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            server_url: config.server_url.clone(),
            api_key: config.api_key.clone(),
            timeout: config.network_timeout(),
            compression_level: config.compressed,
            tls_config: OnceLock::new(),
        }
    }

    /// Frames the full request: head and body.
    #[must_use]
    pub fn frame_request(
        &self,
        endpoint: &Endpoint,
        body: &[u8],
        encoding: ContentEncoding,
    ) -> Vec<u8> {
        let head = format!(
            "POST {path} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {len}\r\n\
             Content-Encoding: {encoding}\r\n\
             {API_KEY_HEADER}: {api_key}\r\n\
             Connection: close\r\n\
             \r\n",
            path = endpoint.path,
            host = endpoint.host_header(),
            len = body.len(),
            api_key = self.api_key,
        );
        let mut request = head.into_bytes();
        request.extend_from_slice(body);
        request
    }

    fn tls_config(&self) -> Option<Arc<ClientConfig>> {
        self.tls_config
            .get_or_init(|| match tls::client_config() {
                Ok(config) => Some(config),
                Err(e) => {
                    error!("WIRE | TLS is unavailable: {e}");
                    None
                }
            })
            .clone()
    }

    fn connect(&self, endpoint: &Endpoint) -> io::Result<TcpStream> {
        let addrs = (endpoint.address_host(), endpoint.port).to_socket_addrs()?;
        let mut last_err = io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} did not resolve", endpoint.host),
        );
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.timeout))?;
                    stream.set_write_timeout(Some(self.timeout))?;
                    return Ok(stream);
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    fn transmit(&self, endpoint: &Endpoint, request: &[u8]) -> SendOutcome {
        let tcp = match self.connect(endpoint) {
            Ok(tcp) => tcp,
            Err(e) => {
                return SendOutcome::Transient(format!(
                    "connect to {}:{} failed: {e}",
                    endpoint.host, endpoint.port
                ))
            }
        };

        if !endpoint.tls {
            return exchange(tcp, request);
        }

        let Some(config) = self.tls_config() else {
            return SendOutcome::Transient("TLS is unavailable".to_string());
        };
        let server_name = match ServerName::try_from(endpoint.address_host().to_string()) {
            Ok(name) => name,
            Err(e) => return SendOutcome::Transient(format!("invalid TLS server name: {e}")),
        };
        match ClientConnection::new(config, server_name) {
            Ok(conn) => exchange(StreamOwned::new(conn, tcp), request),
            Err(e) => SendOutcome::Transient(format!("TLS setup failed: {e}")),
        }
    }
}

/// Writes the request and reads back the status line.
fn exchange<S: Read + Write>(mut stream: S, request: &[u8]) -> SendOutcome {
    if let Err(e) = stream.write_all(request).and_then(|()| stream.flush()) {
        return SendOutcome::Transient(format!("failed to write full request: {e}"));
    }

    let mut line = String::new();
    let mut reader = BufReader::new(stream.take(STATUS_LINE_LIMIT));
    if let Err(e) = reader.read_line(&mut line) {
        debug!("WIRE | Could not read status line: {e}");
    }
    SendOutcome::from_status(parse_status_line(&line))
}

impl EventSender for WireSender {
    fn send(&self, event: &Event) -> SendOutcome {
        let json = match serde_json::to_vec(event) {
            Ok(json) => json,
            Err(e) => {
                error!("WIRE | Dropping event {}: JSON encode error: {e}", event.event_id());
                return SendOutcome::Rejected(format!("JSON encode error: {e}"));
            }
        };
        let (body, encoding) = compress(json, self.compression_level);

        let Some(endpoint) = Endpoint::parse(&self.server_url) else {
            warn!("WIRE | Invalid server URL: {}", self.server_url);
            return SendOutcome::Transient(format!("invalid server URL: {}", self.server_url));
        };

        let request = self.frame_request(&endpoint, &body, encoding);
        let outcome = self.transmit(&endpoint, &request);
        match &outcome {
            SendOutcome::Delivered(status) => {
                debug!("WIRE | Event {} delivered, status={status}", event.event_id());
            }
            SendOutcome::Rejected(reason) => {
                warn!("WIRE | Event {} rejected: {reason}", event.event_id());
            }
            SendOutcome::Transient(reason) => {
                warn!("WIRE | Event {} not delivered: {reason}", event.event_id());
            }
        }
        outcome
    }
}
