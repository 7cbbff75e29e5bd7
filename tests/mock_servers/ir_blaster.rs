#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Mock network IR blaster
//!
//! Simulates the carriage-return terminated ASCII protocol on port 4998:
//! `get_IRL` / `stop_IRL` learning and `sendir` playback.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// How the blaster reacts to commands
#[derive(Debug, Clone, Default)]
pub struct MockBlasterBehavior {
    /// Chunks written after `get_IRL`, with a short pause between each
    pub learn_chunks: Vec<String>,
    /// Drop the connection after the learn chunks are written
    pub close_after_learn: bool,
    /// Line written after a `sendir` command (None = stay silent)
    pub send_reply: Option<String>,
}

impl MockBlasterBehavior {
    /// Enables learning and delivers one code split across reads
    pub fn captures(code: &str) -> Self {
        let (head, tail) = code.split_at(code.len() / 2);
        Self {
            learn_chunks: vec![
                "IR Learner En".to_string(),
                "abled\r".to_string(),
                head.to_string(),
                format!("{}\r", tail),
            ],
            ..Default::default()
        }
    }

    /// Enables learning and then waits for a button press that never comes
    pub fn waits() -> Self {
        Self {
            learn_chunks: vec!["IR Learner Enabled\r".to_string()],
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct Counters {
    live: AtomicUsize,
    accepted: AtomicUsize,
}

pub struct MockIrBlaster {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<u8>>>,
    counters: Arc<Counters>,
    handle: JoinHandle<()>,
}

impl MockIrBlaster {
    /// Start a mock blaster on a random port
    pub async fn start(behavior: MockBlasterBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let behavior = Arc::new(behavior);
        let received = Arc::new(Mutex::new(Vec::new()));
        let counters = Arc::new(Counters::default());

        let (b, r, c) = (behavior, received.clone(), counters.clone());
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                c.accepted.fetch_add(1, Ordering::SeqCst);
                c.live.fetch_add(1, Ordering::SeqCst);
                let (b, r, c) = (b.clone(), r.clone(), c.clone());
                tokio::spawn(async move {
                    handle_connection(stream, b, r).await;
                    c.live.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            addr,
            received,
            counters,
            handle,
        }
    }

    /// Address as `127.0.0.1:port`
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Every byte received across all connections
    pub fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_text(&self) -> String {
        String::from_utf8_lossy(&self.received()).into_owned()
    }

    /// Connections currently open
    pub fn live_connections(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    pub fn accepted_connections(&self) -> usize {
        self.counters.accepted.load(Ordering::SeqCst)
    }

    /// Poll until the live connection count reaches `expected`
    pub async fn wait_for_live(&self, expected: usize) -> bool {
        for _ in 0..100 {
            if self.live_connections() == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Stop the mock server
    pub async fn stop(self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    behavior: Arc<MockBlasterBehavior>,
    received: Arc<Mutex<Vec<u8>>>,
) {
    let mut pending = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        received.lock().unwrap().extend_from_slice(&chunk[..n]);
        pending.extend_from_slice(&chunk[..n]);

        while let Some(pos) = pending.iter().position(|&b| b == b'\r') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line).trim().to_string();

            if line == "get_IRL" {
                for piece in &behavior.learn_chunks {
                    if stream.write_all(piece.as_bytes()).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                if behavior.close_after_learn {
                    return;
                }
            } else if line.starts_with("sendir") {
                if let Some(reply) = &behavior.send_reply {
                    if stream.write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
