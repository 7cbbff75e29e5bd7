//! Network IR blaster client
//!
//! Speaks the line-based ASCII protocol of Global Caché style blasters on TCP
//! port 4998. Commands end with `\r`; replies may be split across reads and are
//! reassembled by `LineBuffer` before they are inspected.
//!
//! ## Learning
//!
//! ```text
//! Idle --(connect, "get_IRL")--> AwaitingEnable
//! AwaitingEnable --"IR Learner Enabled"--> Learning
//! AwaitingEnable --"IR Learner Unavailable"--> Failed
//! Learning --line starting "sendir"--> Captured --("stop_IRL", close)--> done
//! Learning --learn timeout--> Failed
//! ```
//!
//! The captured `sendir,...` line is opaque: it is stored and replayed byte for
//! byte by `send_code`.
//!
//! At most one learning session exists per blaster. Starting a new one tears
//! down the previous session's socket first; the superseded call resolves with
//! `StateConflict`.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusEvent, SharedBus};
use crate::config::IrConfig;
use crate::error::{ControlError, ErrorKind};

pub const DEFAULT_PORT: u16 = 4998;

const ENABLE_LEARNING: &[u8] = b"get_IRL\r";
const STOP_LEARNING: &[u8] = b"stop_IRL\r";
const LEARNER_ENABLED: &str = "IR Learner Enabled";
const LEARNER_UNAVAILABLE: &str = "IR Learner Unavailable";
const CODE_PREFIX: &str = "sendir";
const SEND_COMPLETE_PREFIX: &str = "completeir";

// =============================================================================
// Line reassembly
// =============================================================================

/// Accumulates socket reads and yields complete lines (split on CR or LF)
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a read and return every line it completed, empty lines skipped
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\r' || b == b'\n' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            } else {
                self.pending.push(b);
            }
        }
        lines
    }

    /// Unterminated trailing text, if any (used when the peer closes)
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

// =============================================================================
// Learning state machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningState {
    Idle,
    AwaitingEnable,
    Learning,
    Captured,
    Failed,
}

/// State of one learn operation against one blaster
#[derive(Debug, Clone)]
pub struct IrLearningSession {
    pub target_address: String,
    pub state: LearningState,
    pub captured_code: Option<String>,
    pub failure: Option<ControlError>,
}

impl IrLearningSession {
    pub fn new(target_address: impl Into<String>) -> Self {
        Self {
            target_address: target_address.into(),
            state: LearningState::Idle,
            captured_code: None,
            failure: None,
        }
    }

    /// `get_IRL` has been written
    pub fn enable_requested(&mut self) {
        if self.state == LearningState::Idle {
            self.state = LearningState::AwaitingEnable;
        }
    }

    /// Feed one complete line from the blaster
    pub fn on_line(&mut self, line: &str) -> LearningState {
        let line = line.trim();
        match self.state {
            LearningState::AwaitingEnable | LearningState::Learning
                if line.contains(LEARNER_UNAVAILABLE) =>
            {
                self.fail(ControlError::Protocol(
                    "IR Learner Unavailable (blaster busy or learning disabled)".to_string(),
                ));
            }
            LearningState::AwaitingEnable if line.contains(LEARNER_ENABLED) => {
                self.state = LearningState::Learning;
            }
            LearningState::Learning if line.starts_with(CODE_PREFIX) => {
                self.captured_code = Some(line.to_string());
                self.state = LearningState::Captured;
            }
            _ => debug!("IR {}: ignoring '{}' in {:?}", self.target_address, line, self.state),
        }
        self.state
    }

    pub fn fail(&mut self, err: ControlError) {
        if !self.is_terminal() {
            self.state = LearningState::Failed;
            self.failure = Some(err);
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, LearningState::Captured | LearningState::Failed)
    }
}

// =============================================================================
// Results
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct LearnResult {
    pub success: bool,
    pub learned_code: Option<String>,
    pub state: LearningState,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl From<IrLearningSession> for LearnResult {
    fn from(session: IrLearningSession) -> Self {
        let success = session.state == LearningState::Captured;
        Self {
            success,
            learned_code: session.captured_code,
            state: session.state,
            error: session.failure.as_ref().map(|e| e.to_string()),
            error_kind: session.failure.as_ref().map(ControlError::kind),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StopResult {
    pub success: bool,
    /// Whether a learning session was running when stop was requested
    pub was_active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendResult {
    pub success: bool,
    /// First line the blaster answered with, if any
    pub response: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl SendResult {
    fn failed(err: ControlError, response: Option<String>) -> Self {
        Self {
            success: false,
            response,
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
        }
    }
}

// =============================================================================
// Client
// =============================================================================

/// Registry entry for a live learning session
struct SessionHandle {
    id: u64,
    cancel: CancellationToken,
    /// Cancelled once the session's socket has been dropped
    closed: CancellationToken,
}

/// Clears a learning session's registry entry however `start_learning` ends,
/// including when its future is dropped mid-session
struct SessionGuard<'a> {
    client: &'a IrBlasterClient,
    endpoint: String,
    id: u64,
    closed: CancellationToken,
}

impl SessionGuard<'_> {
    /// A newer session has taken this blaster's registry slot
    fn superseded(&self) -> bool {
        self.client
            .registry()
            .get(&self.endpoint)
            .is_some_and(|handle| handle.id != self.id)
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.closed.cancel();
        let mut registry = self.client.registry();
        if registry
            .get(&self.endpoint)
            .is_some_and(|handle| handle.id == self.id)
        {
            registry.remove(&self.endpoint);
        }
    }
}

/// IR blaster client
pub struct IrBlasterClient {
    settings: IrConfig,
    sessions: std::sync::Mutex<HashMap<String, SessionHandle>>,
    next_session_id: AtomicU64,
    bus: SharedBus,
}

impl IrBlasterClient {
    pub fn new(settings: IrConfig, bus: SharedBus) -> Self {
        Self {
            settings,
            sessions: std::sync::Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            bus,
        }
    }

    /// Normalize `host` or `host:port` into a socket endpoint
    pub fn endpoint(&self, blaster: &str) -> String {
        let blaster = blaster.trim();
        if let Some((host, port)) = blaster.rsplit_once(':') {
            let bracketed = host.starts_with('[') && host.ends_with(']');
            if (bracketed || !host.contains(':')) && port.parse::<u16>().is_ok() {
                return blaster.to_string();
            }
            if !blaster.starts_with('[') {
                // Bare IPv6 literal
                return format!("[{}]:{}", blaster, self.settings.port);
            }
        }
        format!("{}:{}", blaster, self.settings.port)
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pause between codes of a multi-key sequence
    pub fn key_delay(&self) -> Duration {
        self.settings.key_delay()
    }

    /// Whether a learning session is currently registered for this blaster
    pub fn is_learning(&self, blaster: &str) -> bool {
        self.registry().contains_key(&self.endpoint(blaster))
    }

    /// Put the blaster in learning mode and wait for one captured code.
    ///
    /// Any session already open against the same blaster is torn down before
    /// the new socket is opened.
    pub async fn start_learning(&self, blaster: &str) -> Result<LearnResult, ControlError> {
        if blaster.trim().is_empty() {
            return Err(ControlError::InvalidArgument(
                "blaster address is required".to_string(),
            ));
        }
        let endpoint = self.endpoint(blaster);
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let closed = CancellationToken::new();

        let prior = self.registry().insert(
            endpoint.clone(),
            SessionHandle {
                id,
                cancel: cancel.clone(),
                closed: closed.clone(),
            },
        );
        let guard = SessionGuard {
            client: self,
            endpoint: endpoint.clone(),
            id,
            closed,
        };
        if let Some(prior) = prior {
            info!("IR {}: tearing down previous learning session", endpoint);
            prior.cancel.cancel();
            if timeout(self.settings.connect_timeout(), prior.closed.cancelled())
                .await
                .is_err()
            {
                warn!("IR {}: previous session did not close in time", endpoint);
            }
        }

        self.bus.publish(BusEvent::IrLearningStarted {
            blaster: endpoint.clone(),
        });

        let mut session = self.run_learning(&endpoint, &cancel).await;
        let superseded = guard.superseded();
        drop(guard);

        if superseded && session.failure == Some(ControlError::Cancelled) {
            session.failure = Some(ControlError::StateConflict(
                "superseded by a newer learning session on this blaster".to_string(),
            ));
        }

        match (&session.captured_code, &session.failure) {
            (Some(_), _) => {
                info!("IR {}: code captured", endpoint);
                self.bus.publish(BusEvent::IrCodeLearned {
                    blaster: endpoint.clone(),
                });
            }
            (None, failure) => {
                let error = failure
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "learning ended without a code".to_string());
                warn!("IR {}: learning failed: {}", endpoint, error);
                self.bus.publish(BusEvent::IrLearningFailed {
                    blaster: endpoint.clone(),
                    error,
                });
            }
        }

        Ok(session.into())
    }

    /// Drive one learning session to a terminal state. The socket is dropped
    /// before this returns.
    async fn run_learning(&self, endpoint: &str, cancel: &CancellationToken) -> IrLearningSession {
        let mut session = IrLearningSession::new(endpoint);

        let connect_timeout = self.settings.connect_timeout();
        let connect = tokio::select! {
            _ = cancel.cancelled() => {
                session.fail(ControlError::Cancelled);
                return session;
            }
            result = timeout(connect_timeout, TcpStream::connect(endpoint)) => result,
        };
        let mut stream = match connect {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                session.fail(ControlError::io(&format!("connect to {}", endpoint), &e));
                return session;
            }
            Err(_) => {
                session.fail(ControlError::timeout("IR blaster connect", connect_timeout));
                return session;
            }
        };

        if let Err(e) = stream.write_all(ENABLE_LEARNING).await {
            session.fail(ControlError::io("write get_IRL", &e));
            return session;
        }
        session.enable_requested();
        debug!("IR {}: learning requested", endpoint);

        let learn_timeout = self.settings.learn_timeout();
        let timer = sleep_until(Instant::now() + learn_timeout);
        tokio::pin!(timer);

        let mut buffer = LineBuffer::new();
        let mut chunk = [0u8; 1024];

        while !session.is_terminal() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    session.fail(ControlError::Cancelled);
                }
                _ = &mut timer => {
                    session.fail(ControlError::timeout("IR learning", learn_timeout));
                }
                read = stream.read(&mut chunk) => match read {
                    Ok(0) => {
                        if let Some(line) = buffer.take_remainder() {
                            session.on_line(&line);
                        }
                        session.fail(ControlError::ClosedBeforeCompletion);
                    }
                    Ok(n) => {
                        for line in buffer.push(&chunk[..n]) {
                            session.on_line(&line);
                            if session.is_terminal() {
                                break;
                            }
                        }
                    }
                    Err(e) => session.fail(ControlError::io("read from blaster", &e)),
                },
            }
        }

        // Leave the blaster out of learning mode; the socket is closed on drop
        if session.failure != Some(ControlError::ClosedBeforeCompletion) {
            let _ = timeout(self.settings.send_timeout(), stream.write_all(STOP_LEARNING)).await;
            let _ = stream.shutdown().await;
        }
        session
    }

    /// Cancel the learning session for this blaster, if one is running
    pub async fn stop_learning(&self, blaster: &str) -> StopResult {
        let endpoint = self.endpoint(blaster);
        let handle = self.registry().remove(&endpoint);

        let Some(handle) = handle else {
            debug!("IR {}: stop requested with no active session", endpoint);
            return StopResult {
                success: true,
                was_active: false,
            };
        };

        handle.cancel.cancel();
        let closed = timeout(self.settings.connect_timeout(), handle.closed.cancelled())
            .await
            .is_ok();
        if !closed {
            warn!("IR {}: learning session did not close in time", endpoint);
        }
        info!("IR {}: learning stopped", endpoint);

        StopResult {
            success: closed,
            was_active: true,
        }
    }

    /// Send `stop_IRL` on a fresh connection. Used to clear learning mode left
    /// behind by another process.
    pub async fn reset_learner(&self, blaster: &str) -> Result<(), ControlError> {
        let endpoint = self.endpoint(blaster);
        let connect_timeout = self.settings.connect_timeout();
        let mut stream = timeout(connect_timeout, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| ControlError::timeout("IR blaster connect", connect_timeout))?
            .map_err(|e| ControlError::io(&format!("connect to {}", endpoint), &e))?;

        stream
            .write_all(STOP_LEARNING)
            .await
            .map_err(|e| ControlError::io("write stop_IRL", &e))?;
        let _ = stream.shutdown().await;
        info!("IR {}: learner reset", endpoint);
        Ok(())
    }

    /// Transmit a previously learned `sendir,...` line.
    ///
    /// The blaster does not always confirm a send, so silence until the send
    /// deadline counts as success; only an explicit error line fails it.
    pub async fn send_code(&self, blaster: &str, code: &str) -> Result<SendResult, ControlError> {
        let code = code.trim_end_matches(['\r', '\n']);
        if code.trim().is_empty() {
            return Err(ControlError::InvalidArgument(
                "IR code is empty".to_string(),
            ));
        }
        if code.contains(['\r', '\n']) {
            return Err(ControlError::InvalidArgument(
                "IR code must be a single line".to_string(),
            ));
        }
        if blaster.trim().is_empty() {
            return Err(ControlError::InvalidArgument(
                "blaster address is required".to_string(),
            ));
        }

        let endpoint = self.endpoint(blaster);
        let result = self.transmit(&endpoint, code).await;

        if !result.success {
            warn!(
                "IR {}: send failed: {}",
                endpoint,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        self.bus.publish(BusEvent::IrCodeSent {
            blaster: endpoint,
            success: result.success,
        });
        Ok(result)
    }

    async fn transmit(&self, endpoint: &str, code: &str) -> SendResult {
        let connect_timeout = self.settings.connect_timeout();
        let mut stream = match timeout(connect_timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return SendResult::failed(
                    ControlError::io(&format!("connect to {}", endpoint), &e),
                    None,
                )
            }
            Err(_) => {
                return SendResult::failed(
                    ControlError::timeout("IR blaster connect", connect_timeout),
                    None,
                )
            }
        };

        let mut payload = Vec::with_capacity(code.len() + 1);
        payload.extend_from_slice(code.as_bytes());
        payload.push(b'\r');
        if let Err(e) = stream.write_all(&payload).await {
            return SendResult::failed(ControlError::io("write IR code", &e), None);
        }
        debug!("IR {}: sent {} bytes", endpoint, payload.len());

        let timer = sleep_until(Instant::now() + self.settings.send_timeout());
        tokio::pin!(timer);
        let mut buffer = LineBuffer::new();
        let mut chunk = [0u8; 512];

        loop {
            tokio::select! {
                _ = &mut timer => break,
                read = stream.read(&mut chunk) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        for line in buffer.push(&chunk[..n]) {
                            let line = line.trim().to_string();
                            if line.starts_with(SEND_COMPLETE_PREFIX) {
                                return SendResult {
                                    success: true,
                                    response: Some(line),
                                    error: None,
                                    error_kind: None,
                                };
                            }
                            if line.starts_with("ERR") || line.starts_with("busyIR") {
                                return SendResult::failed(
                                    ControlError::Protocol(line.clone()),
                                    Some(line),
                                );
                            }
                        }
                    }
                    Err(e) => return SendResult::failed(ControlError::io("read from blaster", &e), None),
                },
            }
        }

        SendResult {
            success: true,
            response: None,
            error: None,
            error_kind: None,
        }
    }

    /// Send several codes in order with a pause between them, stopping at the
    /// first failure
    pub async fn send_sequence(
        &self,
        blaster: &str,
        codes: &[String],
        gap: Duration,
    ) -> Result<SendResult, ControlError> {
        let mut last = None;
        for (i, code) in codes.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(gap).await;
            }
            let result = self.send_code(blaster, code).await?;
            if !result.success {
                return Ok(result);
            }
            last = Some(result);
        }
        last.ok_or_else(|| ControlError::InvalidArgument("no IR codes to send".to_string()))
    }
}
