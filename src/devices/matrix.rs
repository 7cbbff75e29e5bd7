//! Video matrix switcher client
//!
//! Plain-text routing protocol over TCP (port 23 by default) or UDP.
//! A route is the ASCII command `<input>X<output>.`, sent with a trailing CRLF.
//! The switcher answers with a line containing `OK`, or `ERR`/`Error` on rejection.
//!
//! Example session with socat:
//! ```bash
//! printf '3X2.\r\n' | socat -t2 - tcp:10.0.0.50:23
//! ```
//!
//! No connection state survives a call: TCP opens one connection per command,
//! UDP sends one datagram and waits for one reply.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::bus::{BusEvent, SharedBus};
use crate::config::RoutingConfig;
use crate::error::{ControlError, ErrorKind};

pub const DEFAULT_TCP_PORT: u16 = 23;
pub const DEFAULT_UDP_PORT: u16 = 4000;

/// Largest reply we are willing to buffer from a switcher
const MAX_RESPONSE_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatrixProtocol {
    #[default]
    Tcp,
    Udp,
}

/// Identifies one matrix switcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixConfiguration {
    pub address: String,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    #[serde(default)]
    pub protocol: MatrixProtocol,
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_udp_port() -> u16 {
    DEFAULT_UDP_PORT
}

impl MatrixConfiguration {
    pub fn new(address: impl Into<String>, protocol: MatrixProtocol) -> Self {
        Self {
            address: address.into(),
            tcp_port: DEFAULT_TCP_PORT,
            udp_port: DEFAULT_UDP_PORT,
            protocol,
        }
    }

    /// `host:port` for the configured protocol
    pub fn endpoint(&self) -> String {
        let port = match self.protocol {
            MatrixProtocol::Tcp => self.tcp_port,
            MatrixProtocol::Udp => self.udp_port,
        };
        host_port(&self.address, port)
    }
}

/// Join host and port, bracketing bare IPv6 literals
fn host_port(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port).to_string(),
        Err(_) => format!("{}:{}", host, port),
    }
}

/// One input-to-output route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingCommand {
    pub source_input: u32,
    pub destination_output: u32,
}

impl RoutingCommand {
    /// Channels are 1-based on every switcher we drive
    pub fn new(source_input: u32, destination_output: u32) -> Result<Self, ControlError> {
        if source_input == 0 || destination_output == 0 {
            return Err(ControlError::InvalidArgument(format!(
                "matrix channels start at 1 (got input {}, output {})",
                source_input, destination_output
            )));
        }
        Ok(Self {
            source_input,
            destination_output,
        })
    }

    /// Command text without line terminator, e.g. `3X2.`
    pub fn encode(&self) -> String {
        format!("{}X{}.", self.source_input, self.destination_output)
    }

    /// Bytes written to the switcher
    pub fn wire_bytes(&self) -> Vec<u8> {
        format!("{}\r\n", self.encode()).into_bytes()
    }
}

/// Classification of whatever the switcher sent back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatrixReply {
    Ok,
    Rejected(String),
    /// Bytes arrived but carried no OK/ERR token
    Unrecognized(String),
    Empty,
}

pub fn classify_response(raw: &str) -> MatrixReply {
    let text = raw.trim();
    if text.is_empty() {
        MatrixReply::Empty
    } else if text.contains("OK") {
        MatrixReply::Ok
    } else if text.contains("ERR") || text.contains("Error") {
        MatrixReply::Rejected(text.to_string())
    } else {
        MatrixReply::Unrecognized(text.to_string())
    }
}

/// Outcome of one routing call
#[derive(Debug, Clone, Serialize)]
pub struct RoutingResult {
    pub success: bool,
    pub command: String,
    /// Trimmed reply text, if anything was received
    pub response: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

/// What a transport exchange produced before it ended
struct Exchange {
    received: String,
    failure: Option<ControlError>,
}

impl Exchange {
    fn failed(err: ControlError) -> Self {
        Self {
            received: String::new(),
            failure: Some(err),
        }
    }
}

/// Matrix switcher client
pub struct MatrixClient {
    settings: RoutingConfig,
    bus: SharedBus,
}

impl MatrixClient {
    pub fn new(settings: RoutingConfig, bus: SharedBus) -> Self {
        Self { settings, bus }
    }

    /// Route `input` to `output` on the given switcher.
    ///
    /// Returns `Err` only for invalid channel numbers; every device-side
    /// failure is reported through `RoutingResult`.
    pub async fn route(
        &self,
        config: &MatrixConfiguration,
        input: u32,
        output: u32,
    ) -> Result<RoutingResult, ControlError> {
        let command = RoutingCommand::new(input, output)?;
        let endpoint = config.endpoint();
        debug!(
            "Matrix route {} via {:?} to {}",
            command.encode(),
            config.protocol,
            endpoint
        );

        let exchange = match config.protocol {
            MatrixProtocol::Tcp => {
                self.exchange_tcp(&endpoint, &command.wire_bytes(), self.settings.tcp_timeout())
                    .await
            }
            MatrixProtocol::Udp => {
                self.exchange_udp(&endpoint, &command.wire_bytes(), self.settings.udp_timeout())
                    .await
            }
        };

        let result = evaluate(&command, exchange, self.settings.require_ok);
        if result.success {
            info!("Matrix routed input {} to output {}", input, output);
        } else {
            warn!(
                "Matrix route {} failed: {}",
                result.command,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }

        self.bus.publish(BusEvent::MatrixRouted {
            address: config.address.clone(),
            input,
            output,
            success: result.success,
        });

        Ok(result)
    }

    /// Check that the switcher accepts TCP connections
    pub async fn probe(&self, config: &MatrixConfiguration) -> Result<(), ControlError> {
        let endpoint = host_port(&config.address, config.tcp_port);
        let deadline = self.settings.tcp_timeout();
        timeout(deadline, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| ControlError::timeout("matrix connect", deadline))?
            .map_err(|e| ControlError::io(&format!("connect to {}", endpoint), &e))?;
        Ok(())
    }

    async fn exchange_tcp(&self, endpoint: &str, payload: &[u8], limit: Duration) -> Exchange {
        let deadline = Instant::now() + limit;

        let mut stream = match timeout_at(deadline, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Exchange::failed(ControlError::io(&format!("connect to {}", endpoint), &e))
            }
            Err(_) => return Exchange::failed(ControlError::timeout("matrix connect", limit)),
        };

        if let Err(e) = stream.write_all(payload).await {
            return Exchange::failed(ControlError::io("write command", &e));
        }

        let mut received = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            match timeout_at(deadline, stream.read(&mut chunk)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    received.extend_from_slice(&chunk[..n]);
                    let text = String::from_utf8_lossy(&received);
                    let done = matches!(
                        classify_response(&text),
                        MatrixReply::Ok | MatrixReply::Rejected(_)
                    );
                    if done || received.len() >= MAX_RESPONSE_BYTES {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    return Exchange {
                        received: String::from_utf8_lossy(&received).into_owned(),
                        failure: Some(ControlError::io("read response", &e)),
                    };
                }
                Err(_) => {
                    return Exchange {
                        received: String::from_utf8_lossy(&received).into_owned(),
                        failure: Some(ControlError::timeout("matrix response", limit)),
                    };
                }
            }
        }

        Exchange {
            received: String::from_utf8_lossy(&received).into_owned(),
            failure: None,
        }
    }

    async fn exchange_udp(&self, endpoint: &str, payload: &[u8], limit: Duration) -> Exchange {
        let peer = match lookup_host(endpoint).await.map(|mut addrs| addrs.next()) {
            Ok(Some(peer)) => peer,
            Ok(None) => {
                return Exchange::failed(ControlError::Connection(format!(
                    "{} resolved to no addresses",
                    endpoint
                )))
            }
            Err(e) => return Exchange::failed(ControlError::io(&format!("resolve {}", endpoint), &e)),
        };

        let socket = match UdpSocket::bind(local_bind_addr(&peer)).await {
            Ok(socket) => socket,
            Err(e) => return Exchange::failed(ControlError::io("bind UDP socket", &e)),
        };
        if let Err(e) = socket.connect(peer).await {
            return Exchange::failed(ControlError::io(&format!("connect {}", peer), &e));
        }

        match timeout(limit, socket.send(payload)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Exchange::failed(ControlError::io("send datagram", &e)),
            Err(_) => return Exchange::failed(ControlError::timeout("matrix UDP send", limit)),
        }

        let mut buf = vec![0u8; MAX_RESPONSE_BYTES];
        match timeout(limit, socket.recv(&mut buf)).await {
            Ok(Ok(n)) => Exchange {
                received: String::from_utf8_lossy(&buf[..n]).into_owned(),
                failure: None,
            },
            Ok(Err(e)) => Exchange::failed(ControlError::io("receive reply", &e)),
            Err(_) => Exchange::failed(ControlError::timeout("matrix UDP reply", limit)),
        }
    }
}

/// Wildcard local address in the same family as the switcher
fn local_bind_addr(peer: &SocketAddr) -> SocketAddr {
    let ip = match peer {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}

fn evaluate(command: &RoutingCommand, exchange: Exchange, require_ok: bool) -> RoutingResult {
    let response = Some(exchange.received.trim().to_string()).filter(|s| !s.is_empty());

    let failure = match classify_response(&exchange.received) {
        MatrixReply::Ok => None,
        MatrixReply::Rejected(raw) => Some(ControlError::Protocol(raw)),
        _ if exchange.failure.is_some() => exchange.failure,
        MatrixReply::Unrecognized(raw) if require_ok => Some(ControlError::Protocol(format!(
            "no OK acknowledgement in reply: {}",
            raw
        ))),
        MatrixReply::Unrecognized(raw) => {
            debug!("Matrix reply without OK/ERR treated as success: {}", raw);
            None
        }
        MatrixReply::Empty => Some(ControlError::Connection(
            "connection closed without a response".to_string(),
        )),
    };

    RoutingResult {
        success: failure.is_none(),
        command: command.encode(),
        response,
        error: failure.as_ref().map(|e| e.to_string()),
        error_kind: failure.as_ref().map(ControlError::kind),
    }
}
