#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Mock HDMI matrix switcher
//!
//! Listens on TCP and UDP at the same time and answers every command with a
//! configurable reply. With no reply configured it stays silent and keeps TCP
//! connections open until the client gives up.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct MockMatrixState {
    reply: Option<String>,
    /// Raw bytes of each command received, TCP and UDP alike
    received: Vec<Vec<u8>>,
}

pub struct MockMatrix {
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    state: Arc<Mutex<MockMatrixState>>,
    handles: Vec<JoinHandle<()>>,
}

impl MockMatrix {
    /// Start a switcher that answers with `reply` (None = never answers)
    pub async fn start(reply: Option<&str>) -> Self {
        let state = Arc::new(Mutex::new(MockMatrixState {
            reply: reply.map(str::to_string),
            received: Vec::new(),
        }));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tcp_addr = listener.local_addr().unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_addr = socket.local_addr().unwrap();

        let tcp_state = state.clone();
        let tcp = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = tcp_state.clone();
                tokio::spawn(handle_tcp(stream, state));
            }
        });

        let udp_state = state.clone();
        let udp = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let reply = {
                    let mut state = udp_state.lock().unwrap();
                    state.received.push(buf[..n].to_vec());
                    state.reply.clone()
                };
                if let Some(reply) = reply {
                    let _ = socket.send_to(reply.as_bytes(), peer).await;
                }
            }
        });

        Self {
            tcp_addr,
            udp_addr,
            state,
            handles: vec![tcp, udp],
        }
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_addr.port()
    }

    pub fn udp_port(&self) -> u16 {
        self.udp_addr.port()
    }

    /// Commands received so far
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().received.clone()
    }

    /// Stop the mock server
    pub async fn stop(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

async fn handle_tcp(mut stream: TcpStream, state: Arc<Mutex<MockMatrixState>>) {
    let mut command = Vec::new();
    let mut chunk = [0u8; 256];

    // Commands end with CRLF
    while !command.ends_with(b"\r\n") {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => command.extend_from_slice(&chunk[..n]),
        }
    }

    let reply = {
        let mut state = state.lock().unwrap();
        state.received.push(command);
        state.reply.clone()
    };

    match reply {
        Some(reply) => {
            let _ = stream.write_all(reply.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
        None => {
            // Hold the connection open until the client closes it
            while let Ok(n) = stream.read(&mut chunk).await {
                if n == 0 {
                    break;
                }
            }
        }
    }
}
