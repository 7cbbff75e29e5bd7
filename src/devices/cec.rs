//! HDMI-CEC bridge over the libCEC command-line client
//!
//! Every command is one invocation of `cec-client` in single-command mode,
//! with the command line written to its stdin:
//! ```bash
//! echo 'on 0' | cec-client -s -d 1
//! ```
//! The client is spawned directly rather than through a shell pipeline, so a
//! timed-out invocation is killed along with its hold on the adapter.
//! The client's combined output is scanned for bus traffic to decide whether a
//! device responded. CEC is best-effort: many displays never acknowledge an
//! opcode in a way the client prints, so `device_responded` is reported
//! separately from `success` (the client's exit status).
//!
//! All invocations against one adapter go through that adapter's `CecSession`,
//! so the bus never sees two commands from this process at once.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::bus::{BusEvent, SharedBus};
use crate::config::CecConfig;
use crate::error::{ControlError, ErrorKind};

/// Logical address of the TV on every CEC bus
pub const TV_ADDRESS: u8 = 0;
/// Broadcast address (`all`)
pub const BROADCAST_ADDRESS: u8 = 0xF;
/// We speak as "recording device 1" when sending raw frames
const INITIATOR_ADDRESS: u8 = 0x1;

/// Output markers that prove the client saw traffic on the bus
const BUS_ACTIVITY_MARKERS: &[&str] = &["TRAFFIC", ">>", "<<", "power status:", "waiting for input"];

/// Which device on which adapter a command is aimed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CecTarget {
    /// Logical bus address, 0-15 (0 = TV, 15 = broadcast)
    #[serde(default)]
    pub address: u8,
    /// Local adapter index passed as `-d`; falls back to the configured default
    #[serde(default)]
    pub device_number: Option<u8>,
}

impl Default for CecTarget {
    fn default() -> Self {
        Self::tv()
    }
}

impl CecTarget {
    pub fn tv() -> Self {
        Self {
            address: TV_ADDRESS,
            device_number: None,
        }
    }

    pub fn broadcast() -> Self {
        Self {
            address: BROADCAST_ADDRESS,
            device_number: None,
        }
    }

    pub fn on_adapter(mut self, device_number: u8) -> Self {
        self.device_number = Some(device_number);
        self
    }

    /// Parse `all`, a decimal address (0-15) or a single hex digit
    pub fn parse_address(text: &str) -> Result<u8, ControlError> {
        let text = text.trim();
        if text.eq_ignore_ascii_case("all") {
            return Ok(BROADCAST_ADDRESS);
        }
        let address = text
            .parse::<u8>()
            .ok()
            .or_else(|| u8::from_str_radix(text, 16).ok())
            .ok_or_else(|| {
                ControlError::InvalidArgument(format!("invalid CEC address '{}'", text))
            })?;
        if address > BROADCAST_ADDRESS {
            return Err(ControlError::InvalidArgument(format!(
                "CEC address {} out of range 0-15",
                address
            )));
        }
        Ok(address)
    }

    pub fn hex_address(&self) -> String {
        format!("{:X}", self.address)
    }
}

/// Remote-control keys sent as user-control frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CecKey {
    Digit(u8),
    Enter,
}

impl CecKey {
    /// CEC user-control code (digits 0x20..0x29, enter 0x2B)
    fn code(self) -> u8 {
        match self {
            CecKey::Digit(d) => 0x20 + d.min(9),
            CecKey::Enter => 0x2B,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CecCommand {
    On,
    Standby,
    VolumeUp,
    VolumeDown,
    Mute,
    PowerStatus,
    ActiveSource,
    Key(CecKey),
}

impl CecCommand {
    /// Parse the client command names used by operators (`on`, `standby`, ...)
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "on" => Some(Self::On),
            "standby" | "off" => Some(Self::Standby),
            "volup" => Some(Self::VolumeUp),
            "voldown" => Some(Self::VolumeDown),
            "mute" => Some(Self::Mute),
            "pow" => Some(Self::PowerStatus),
            "as" => Some(Self::ActiveSource),
            "enter" => Some(Self::Key(CecKey::Enter)),
            other => match other.as_bytes() {
                [d @ b'0'..=b'9'] => Some(Self::Key(CecKey::Digit(d - b'0'))),
                _ => None,
            },
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Standby => "standby",
            Self::VolumeUp => "volup",
            Self::VolumeDown => "voldown",
            Self::Mute => "mute",
            Self::PowerStatus => "pow",
            Self::ActiveSource => "as",
            Self::Key(_) => "tx",
        }
    }

    /// Line fed to the client's stdin
    pub fn script_line(&self, target: &CecTarget) -> String {
        match self {
            Self::Key(key) => format!(
                "tx {:X}{:X}:44:{:02X}",
                INITIATOR_ADDRESS,
                target.address,
                key.code()
            ),
            _ => format!("{} {}", self.name(), target.hex_address()),
        }
    }

    /// User Control Released frame that ends a keypress
    pub fn release_line(&self, target: &CecTarget) -> Option<String> {
        match self {
            Self::Key(_) => Some(format!("tx {:X}{:X}:45", INITIATOR_ADDRESS, target.address)),
            _ => None,
        }
    }

    fn is_status_query(&self) -> bool {
        matches!(self, Self::PowerStatus)
    }
}

/// How a client invocation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecStatus {
    Success,
    Failed(Option<i32>),
    TimedOut,
    SpawnFailed(String),
}

/// Captured output of one client invocation
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// stdout and stderr, in arrival order
    pub output: String,
    pub status: ExecStatus,
}

/// Runs one line through the CEC client
#[async_trait]
pub trait CecExecutor: Send + Sync {
    async fn run(&self, line: &str, device_number: Option<u8>, deadline: Duration) -> ExecOutput;
}

/// Default executor: spawns `<binary> -s [-d <n>]` and writes the line to its stdin.
///
/// `binary` may carry leading arguments (`"sh /opt/fake-cec"`); they are
/// passed before the client flags. The client is the direct child, so a
/// timeout kill reaches the process that holds the adapter.
pub struct ProcessCecExecutor {
    binary: String,
}

impl ProcessCecExecutor {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Program and arguments for one invocation
    pub fn invocation(&self, device_number: Option<u8>) -> Option<(String, Vec<String>)> {
        let mut words = self.binary.split_whitespace().map(str::to_string);
        let program = words.next()?;
        let mut args: Vec<String> = words.collect();
        args.push("-s".to_string());
        if let Some(n) = device_number {
            args.push("-d".to_string());
            args.push(n.to_string());
        }
        Some((program, args))
    }
}

#[async_trait]
impl CecExecutor for ProcessCecExecutor {
    async fn run(&self, line: &str, device_number: Option<u8>, deadline: Duration) -> ExecOutput {
        let Some((program, args)) = self.invocation(device_number) else {
            return ExecOutput {
                output: String::new(),
                status: ExecStatus::SpawnFailed("no CEC client binary configured".to_string()),
            };
        };
        debug!("CEC exec: {} {} <<< {}", program, args.join(" "), line);

        let mut child = match Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return ExecOutput {
                    output: String::new(),
                    status: ExecStatus::SpawnFailed(e.to_string()),
                }
            }
        };

        let (Some(mut stdin), Some(mut stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return ExecOutput {
                output: String::new(),
                status: ExecStatus::SpawnFailed("client stdio not captured".to_string()),
            };
        };

        let expires = Instant::now() + deadline;

        // One line then EOF, like `echo` into a pipe. A client that exits
        // without reading closes the pipe; its exit status decides the result.
        let script = format!("{}\n", line);
        let write = async {
            stdin.write_all(script.as_bytes()).await?;
            stdin.shutdown().await
        };
        if let Ok(Err(e)) = tokio::time::timeout_at(expires, write).await {
            debug!("CEC client stdin closed early: {}", e);
        }
        drop(stdin);

        let timer = tokio::time::sleep_until(expires);
        tokio::pin!(timer);

        let mut captured = Vec::new();
        let mut out_buf = [0u8; 1024];
        let mut err_buf = [0u8; 1024];
        let (mut out_open, mut err_open) = (true, true);

        // Read until both pipes close; partial output survives a timeout
        while out_open || err_open {
            tokio::select! {
                _ = &mut timer => {
                    let _ = child.kill().await;
                    return ExecOutput {
                        output: String::from_utf8_lossy(&captured).into_owned(),
                        status: ExecStatus::TimedOut,
                    };
                }
                read = stdout.read(&mut out_buf), if out_open => match read {
                    Ok(0) | Err(_) => out_open = false,
                    Ok(n) => captured.extend_from_slice(&out_buf[..n]),
                },
                read = stderr.read(&mut err_buf), if err_open => match read {
                    Ok(0) | Err(_) => err_open = false,
                    Ok(n) => captured.extend_from_slice(&err_buf[..n]),
                },
            }
        }

        let output = String::from_utf8_lossy(&captured).into_owned();
        let status = match tokio::time::timeout_at(expires, child.wait()).await {
            Ok(Ok(status)) if status.success() => ExecStatus::Success,
            Ok(Ok(status)) => ExecStatus::Failed(status.code()),
            Ok(Err(e)) => ExecStatus::SpawnFailed(e.to_string()),
            Err(_) => {
                let _ = child.kill().await;
                ExecStatus::TimedOut
            }
        };

        ExecOutput { output, status }
    }
}

/// True if the client printed anything that proves bus traffic
pub fn detect_bus_activity(output: &str) -> bool {
    BUS_ACTIVITY_MARKERS.iter().any(|marker| output.contains(marker))
}

fn power_status_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"power status:\s*([A-Za-z_-]+)").expect("valid regex"))
}

/// Extract the word after `power status:`
pub fn parse_power_status(output: &str) -> Option<String> {
    power_status_re()
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
}

/// A device reported by `scan`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CecBusDevice {
    pub address: u8,
    pub name: String,
    pub vendor: Option<String>,
    pub power_status: Option<String>,
}

/// Parse the `device #N: Name` blocks printed by `scan`
pub fn parse_scan(output: &str) -> Vec<CecBusDevice> {
    static DEVICE_RE: OnceLock<Regex> = OnceLock::new();
    let device_re =
        DEVICE_RE.get_or_init(|| Regex::new(r"^device #([0-9A-Fa-f]+):\s*(.+)$").expect("valid regex"));

    let mut devices: Vec<CecBusDevice> = Vec::new();
    for line in output.lines().map(str::trim) {
        if let Some(caps) = device_re.captures(line) {
            let address = u8::from_str_radix(&caps[1], 16).unwrap_or(BROADCAST_ADDRESS);
            devices.push(CecBusDevice {
                address,
                name: caps[2].trim().to_string(),
                vendor: None,
                power_status: None,
            });
            continue;
        }

        let Some(current) = devices.last_mut() else {
            continue;
        };
        if let Some(vendor) = line.strip_prefix("vendor:") {
            current.vendor = Some(vendor.trim().to_string());
        } else if line.starts_with("power status:") {
            current.power_status = parse_power_status(line);
        }
    }
    devices
}

/// Result of a CEC command (or key sequence)
#[derive(Debug, Clone, Serialize)]
pub struct CecCommandResult {
    pub success: bool,
    /// Line(s) fed to the client
    pub command: String,
    pub device_responded: bool,
    pub power_status: Option<String>,
    pub raw_output: String,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl CecCommandResult {
    fn from_exec(command: String, exec: ExecOutput, deadline: Duration) -> Self {
        let failure = match exec.status {
            ExecStatus::Success => None,
            ExecStatus::TimedOut => Some(ControlError::timeout("CEC command", deadline)),
            ExecStatus::Failed(Some(code)) => Some(ControlError::Connection(format!(
                "CEC client exited with status {}",
                code
            ))),
            ExecStatus::Failed(None) => Some(ControlError::Connection(
                "CEC client terminated by signal".to_string(),
            )),
            ExecStatus::SpawnFailed(reason) => Some(ControlError::Connection(format!(
                "failed to start CEC client: {}",
                reason
            ))),
        };

        Self {
            success: failure.is_none(),
            command,
            device_responded: detect_bus_activity(&exec.output),
            power_status: parse_power_status(&exec.output),
            raw_output: exec.output,
            error: failure.as_ref().map(|e| e.to_string()),
            error_kind: failure.as_ref().map(ControlError::kind),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CecScanResult {
    pub success: bool,
    pub devices: Vec<CecBusDevice>,
    pub raw_output: String,
    pub error: Option<String>,
}

/// Exclusive handle on one local adapter
struct CecSession {
    device_number: Option<u8>,
    commands_sent: u64,
}

/// CEC bridge
pub struct CecBridge {
    settings: CecConfig,
    executor: Arc<dyn CecExecutor>,
    sessions: std::sync::Mutex<HashMap<Option<u8>, Arc<Mutex<CecSession>>>>,
    bus: SharedBus,
}

impl CecBridge {
    /// Bridge that shells out to the configured client binary
    pub fn new(settings: CecConfig, bus: SharedBus) -> Self {
        let executor = Arc::new(ProcessCecExecutor::new(settings.binary.clone()));
        Self::with_executor(settings, executor, bus)
    }

    pub fn with_executor(settings: CecConfig, executor: Arc<dyn CecExecutor>, bus: SharedBus) -> Self {
        Self {
            settings,
            executor,
            sessions: std::sync::Mutex::new(HashMap::new()),
            bus,
        }
    }

    fn session_for(&self, device_number: Option<u8>) -> Arc<Mutex<CecSession>> {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions
            .entry(device_number)
            .or_insert_with(|| {
                Arc::new(Mutex::new(CecSession {
                    device_number,
                    commands_sent: 0,
                }))
            })
            .clone()
    }

    fn resolve_device(&self, target: &CecTarget) -> Option<u8> {
        target.device_number.or(self.settings.device_number)
    }

    fn validate(target: &CecTarget) -> Result<(), ControlError> {
        if target.address > BROADCAST_ADDRESS {
            return Err(ControlError::InvalidArgument(format!(
                "CEC address {} out of range 0-15",
                target.address
            )));
        }
        Ok(())
    }

    /// Run one line inside an already-locked session
    async fn run_locked(
        &self,
        session: &mut CecSession,
        line: String,
        deadline: Duration,
    ) -> CecCommandResult {
        session.commands_sent += 1;
        let exec = self
            .executor
            .run(&line, session.device_number, deadline)
            .await;
        let result = CecCommandResult::from_exec(line, exec, deadline);

        debug!(
            "CEC '{}' on adapter {:?} (#{}): success={} responded={}",
            result.command,
            session.device_number,
            session.commands_sent,
            result.success,
            result.device_responded
        );
        self.bus.publish(BusEvent::CecCommandSent {
            device_number: session.device_number,
            command: result.command.clone(),
            success: result.success,
            device_responded: result.device_responded,
        });
        result
    }

    /// Run a command inside a locked session; keys are pressed then released
    async fn run_command_locked(
        &self,
        session: &mut CecSession,
        command: CecCommand,
        target: &CecTarget,
        deadline: Duration,
    ) -> CecCommandResult {
        let press = self
            .run_locked(session, command.script_line(target), deadline)
            .await;
        let Some(release_line) = command.release_line(target) else {
            return press;
        };
        if !press.success {
            return press;
        }

        let release = self.run_locked(session, release_line, deadline).await;
        CecCommandResult {
            success: release.success,
            command: format!("{}; {}", press.command, release.command),
            device_responded: press.device_responded || release.device_responded,
            power_status: press.power_status.or(release.power_status),
            raw_output: press.raw_output + &release.raw_output,
            error: release.error,
            error_kind: release.error_kind,
        }
    }

    /// Send a single command
    pub async fn send(
        &self,
        target: &CecTarget,
        command: CecCommand,
    ) -> Result<CecCommandResult, ControlError> {
        Self::validate(target)?;
        let deadline = if command.is_status_query() {
            self.settings.status_timeout()
        } else {
            self.settings.command_timeout()
        };

        let session = self.session_for(self.resolve_device(target));
        let mut session = session.lock().await;
        let result = self
            .run_command_locked(&mut session, command, target, deadline)
            .await;

        if !result.success {
            warn!(
                "CEC command '{}' failed: {}",
                result.command,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(result)
    }

    /// Enter a channel number as digit keypresses followed by enter.
    /// Each key is a pressed frame followed by a released frame.
    ///
    /// The adapter stays locked for the whole sequence so another command
    /// cannot land between two digits.
    pub async fn send_channel(
        &self,
        target: &CecTarget,
        digits: &str,
    ) -> Result<CecCommandResult, ControlError> {
        Self::validate(target)?;
        let keys = parse_channel_digits(digits)?
            .into_iter()
            .map(CecKey::Digit)
            .chain(std::iter::once(CecKey::Enter))
            .collect::<Vec<_>>();

        let deadline = self.settings.command_timeout();
        let session = self.session_for(self.resolve_device(target));
        let mut session = session.lock().await;

        let mut lines = Vec::with_capacity(keys.len());
        let mut output = String::new();
        let mut responded = false;
        let mut failure: Option<(String, Option<ErrorKind>)> = None;

        for (i, key) in keys.iter().enumerate() {
            if i > 0 {
                sleep(self.settings.digit_delay()).await;
            }
            let step = self
                .run_command_locked(&mut session, CecCommand::Key(*key), target, deadline)
                .await;
            lines.push(step.command);
            output.push_str(&step.raw_output);
            responded |= step.device_responded;
            if !step.success {
                failure = Some((step.error.unwrap_or_default(), step.error_kind));
                break;
            }
        }

        if failure.is_none() {
            sleep(self.settings.enter_settle()).await;
        }

        let (error, error_kind) = match failure {
            Some((error, kind)) => (Some(error), kind),
            None => (None, None),
        };
        info!("CEC channel {} sent ({} keys)", digits, lines.len());

        Ok(CecCommandResult {
            success: error.is_none(),
            command: lines.join("; "),
            device_responded: responded,
            power_status: parse_power_status(&output),
            raw_output: output,
            error,
            error_kind,
        })
    }

    /// Query the power status of a device (5s status deadline)
    pub async fn power_status(&self, target: &CecTarget) -> Result<CecCommandResult, ControlError> {
        let result = self.send(target, CecCommand::PowerStatus).await?;
        if let Some(ref status) = result.power_status {
            self.bus.publish(BusEvent::CecPowerStatus {
                device_number: self.resolve_device(target),
                address: target.hex_address(),
                status: status.clone(),
            });
        }
        Ok(result)
    }

    /// List devices visible on an adapter's bus
    pub async fn scan(&self, device_number: Option<u8>) -> CecScanResult {
        let device_number = device_number.or(self.settings.device_number);
        let deadline = self.settings.status_timeout();

        let session = self.session_for(device_number);
        let mut session = session.lock().await;
        let result = self
            .run_locked(&mut session, "scan".to_string(), deadline)
            .await;

        CecScanResult {
            success: result.success,
            devices: parse_scan(&result.raw_output),
            raw_output: result.raw_output,
            error: result.error,
        }
    }
}

/// Digits of a channel number; at least one, ASCII 0-9 only
pub fn parse_channel_digits(digits: &str) -> Result<Vec<u8>, ControlError> {
    let digits = digits.trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ControlError::InvalidArgument(format!(
            "channel must be one or more digits, got '{}'",
            digits
        )));
    }
    Ok(digits.bytes().map(|b| b - b'0').collect())
}
