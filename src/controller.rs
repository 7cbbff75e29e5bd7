//! Unified display control
//!
//! Chooses CEC or IR for a display, runs the command, and retries once through
//! the other method when the first attempt fails. Attempts for one display are
//! always sequential so a CEC adapter and an IR emitter never hit the same set
//! within milliseconds of each other.
//!
//! ```text
//! forced method   → [forced]                 (no fallback)
//! preferred CEC   → [CEC, IR?]
//! preferred IR    → [IR, CEC?]
//! AUTO            → [CEC, IR?] if CEC supported, else [IR]
//! ```

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bus::{BusEvent, SharedBus};
use crate::devices::cec::{parse_channel_digits, CecBridge, CecCommand, CecCommandResult, CecTarget};
use crate::devices::ir::{IrBlasterClient, SendResult};
use crate::error::{ControlError, ErrorKind};

// =============================================================================
// Device records and commands
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PreferredMethod {
    #[default]
    Auto,
    Cec,
    Ir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlMethod {
    Cec,
    Ir,
}

impl ControlMethod {
    fn other(self) -> Self {
        match self {
            Self::Cec => Self::Ir,
            Self::Ir => Self::Cec,
        }
    }
}

impl fmt::Display for ControlMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cec => write!(f, "CEC"),
            Self::Ir => write!(f, "IR"),
        }
    }
}

/// Blaster and stored codes for an IR-controlled display
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IrProfile {
    pub blaster_address: String,
    /// Command key (`power_on`, `digit_4`, `enter`, ...) to learned `sendir` line
    #[serde(default)]
    pub codes: HashMap<String, String>,
}

/// A display as supplied by the caller; never modified here
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TvDevice {
    pub id: String,
    pub name: String,
    pub output_number: u32,
    #[serde(default)]
    pub supports_cec: bool,
    #[serde(default)]
    pub supports_ir: bool,
    #[serde(default)]
    pub preferred_method: PreferredMethod,
    /// Defaults to the TV address on the configured adapter
    #[serde(default)]
    pub cec: Option<CecTarget>,
    #[serde(default)]
    pub ir: Option<IrProfile>,
}

impl TvDevice {
    fn supports(&self, method: ControlMethod) -> bool {
        match method {
            ControlMethod::Cec => self.supports_cec,
            ControlMethod::Ir => self.supports_ir,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TvCommand {
    PowerOn,
    PowerOff,
    VolumeUp,
    VolumeDown,
    Mute,
    Channel(String),
}

impl TvCommand {
    /// Reject malformed commands before any device is touched
    pub fn validate(&self) -> Result<(), ControlError> {
        if let Self::Channel(digits) = self {
            parse_channel_digits(digits)?;
        }
        Ok(())
    }

    /// Stored IR code keys, in transmit order
    fn ir_keys(&self) -> Vec<String> {
        match self {
            Self::PowerOn => vec!["power_on".to_string()],
            Self::PowerOff => vec!["power_off".to_string()],
            Self::VolumeUp => vec!["volume_up".to_string()],
            Self::VolumeDown => vec!["volume_down".to_string()],
            Self::Mute => vec!["mute".to_string()],
            Self::Channel(digits) => digits
                .trim()
                .chars()
                .map(|c| format!("digit_{}", c))
                .chain(std::iter::once("enter".to_string()))
                .collect(),
        }
    }
}

impl FromStr for TvCommand {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(digits) = s
            .strip_prefix("channel:")
            .or_else(|| s.strip_prefix("channel "))
        {
            let command = Self::Channel(digits.trim().to_string());
            command.validate()?;
            return Ok(command);
        }
        match s.to_ascii_lowercase().as_str() {
            "power_on" | "on" => Ok(Self::PowerOn),
            "power_off" | "off" | "standby" => Ok(Self::PowerOff),
            "volume_up" | "volup" => Ok(Self::VolumeUp),
            "volume_down" | "voldown" => Ok(Self::VolumeDown),
            "mute" => Ok(Self::Mute),
            "" => Err(ControlError::InvalidArgument("command is required".to_string())),
            other => Err(ControlError::InvalidArgument(format!(
                "unknown TV command '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for TvCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PowerOn => write!(f, "power_on"),
            Self::PowerOff => write!(f, "power_off"),
            Self::VolumeUp => write!(f, "volume_up"),
            Self::VolumeDown => write!(f, "volume_down"),
            Self::Mute => write!(f, "mute"),
            Self::Channel(digits) => write!(f, "channel:{}", digits),
        }
    }
}

// =============================================================================
// Options and results
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct ControlOptions {
    /// Use only this method, with no fallback
    pub force_method: Option<ControlMethod>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Process devices one at a time in list order
    pub sequential: bool,
    /// Pause between devices when sequential
    pub delay_between: Duration,
    pub force_method: Option<ControlMethod>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlResult {
    pub device_id: String,
    pub success: bool,
    /// Method of the last attempt (None when nothing could be attempted)
    pub method_used: Option<ControlMethod>,
    pub device_responded: bool,
    pub raw_output: String,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub fallback_used: bool,
    /// Methods tried, in order
    pub attempts: Vec<ControlMethod>,
    pub power_status: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    /// True only if every device succeeded
    pub success: bool,
    pub results: Vec<ControlResult>,
}

/// Outcome of a single method attempt
struct Attempt {
    success: bool,
    device_responded: bool,
    raw_output: String,
    error: Option<String>,
    error_kind: Option<ErrorKind>,
    power_status: Option<String>,
}

impl Attempt {
    fn failed(err: ControlError) -> Self {
        Self {
            success: false,
            device_responded: false,
            raw_output: String::new(),
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
            power_status: None,
        }
    }
}

impl From<CecCommandResult> for Attempt {
    fn from(result: CecCommandResult) -> Self {
        Self {
            success: result.success,
            device_responded: result.device_responded,
            raw_output: result.raw_output,
            error: result.error,
            error_kind: result.error_kind,
            power_status: result.power_status,
        }
    }
}

impl From<SendResult> for Attempt {
    fn from(result: SendResult) -> Self {
        Self {
            success: result.success,
            device_responded: result.response.is_some(),
            raw_output: result.response.unwrap_or_default(),
            error: result.error,
            error_kind: result.error_kind,
            power_status: None,
        }
    }
}

// =============================================================================
// Method seams
// =============================================================================

/// Something that can run a TV command over CEC
#[async_trait]
pub trait CecPort: Send + Sync {
    async fn execute(
        &self,
        target: &CecTarget,
        command: &TvCommand,
    ) -> Result<CecCommandResult, ControlError>;
}

/// Something that can transmit stored IR codes
#[async_trait]
pub trait IrPort: Send + Sync {
    async fn transmit(&self, blaster: &str, codes: &[String]) -> Result<SendResult, ControlError>;
}

#[async_trait]
impl CecPort for CecBridge {
    async fn execute(
        &self,
        target: &CecTarget,
        command: &TvCommand,
    ) -> Result<CecCommandResult, ControlError> {
        let cec_command = match command {
            TvCommand::Channel(digits) => return self.send_channel(target, digits).await,
            TvCommand::PowerOn => CecCommand::On,
            TvCommand::PowerOff => CecCommand::Standby,
            TvCommand::VolumeUp => CecCommand::VolumeUp,
            TvCommand::VolumeDown => CecCommand::VolumeDown,
            TvCommand::Mute => CecCommand::Mute,
        };
        self.send(target, cec_command).await
    }
}

#[async_trait]
impl IrPort for IrBlasterClient {
    async fn transmit(&self, blaster: &str, codes: &[String]) -> Result<SendResult, ControlError> {
        self.send_sequence(blaster, codes, self.key_delay()).await
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Unified CEC/IR display controller
pub struct DeviceController {
    cec: Arc<dyn CecPort>,
    ir: Arc<dyn IrPort>,
    bus: SharedBus,
}

impl DeviceController {
    pub fn new(cec: Arc<dyn CecPort>, ir: Arc<dyn IrPort>, bus: SharedBus) -> Self {
        Self { cec, ir, bus }
    }

    /// Ordered methods to try for this device (at most two)
    pub fn plan(device: &TvDevice, options: &ControlOptions) -> Vec<ControlMethod> {
        if let Some(forced) = options.force_method {
            return vec![forced];
        }

        let primary = match device.preferred_method {
            PreferredMethod::Cec => ControlMethod::Cec,
            PreferredMethod::Ir => ControlMethod::Ir,
            PreferredMethod::Auto if device.supports_cec => ControlMethod::Cec,
            PreferredMethod::Auto => ControlMethod::Ir,
        };

        [primary, primary.other()]
            .into_iter()
            .filter(|method| device.supports(*method))
            .collect()
    }

    /// Control one display, falling back to the other method on failure
    pub async fn control_tv(
        &self,
        device: &TvDevice,
        command: &TvCommand,
        options: &ControlOptions,
    ) -> Result<ControlResult, ControlError> {
        command.validate()?;
        let result = self.run_plan(device, command, options).await;

        self.bus.publish(BusEvent::DeviceControlled {
            device_id: device.id.clone(),
            command: command.to_string(),
            method: result.method_used.map(|m| m.to_string()),
            success: result.success,
            fallback_used: result.fallback_used,
        });
        Ok(result)
    }

    async fn run_plan(
        &self,
        device: &TvDevice,
        command: &TvCommand,
        options: &ControlOptions,
    ) -> ControlResult {
        let plan = Self::plan(device, options);
        let mut result = ControlResult {
            device_id: device.id.clone(),
            success: false,
            method_used: None,
            device_responded: false,
            raw_output: String::new(),
            error: None,
            error_kind: None,
            fallback_used: false,
            attempts: Vec::with_capacity(plan.len()),
            power_status: None,
        };

        if plan.is_empty() {
            let err = ControlError::UnsupportedMethod(format!(
                "{} supports neither CEC nor IR",
                device.name
            ));
            warn!("{}: {}", device.id, err);
            result.error = Some(err.to_string());
            result.error_kind = Some(err.kind());
            return result;
        }

        for method in plan {
            // Only a forced method can be unsupported; nothing is sent for it
            if !device.supports(method) {
                let err = ControlError::UnsupportedMethod(format!(
                    "{} does not support {}",
                    device.name, method
                ));
                warn!("{}: {}", device.id, err);
                result.error = Some(err.to_string());
                result.error_kind = Some(err.kind());
                continue;
            }

            if !result.attempts.is_empty() {
                info!(
                    "{}: {} failed, falling back to {}",
                    device.id,
                    result.attempts[result.attempts.len() - 1],
                    method
                );
                result.fallback_used = true;
            }
            result.attempts.push(method);

            let attempt = self.attempt(device, command, method).await;

            result.method_used = Some(method);
            result.success = attempt.success;
            result.device_responded = attempt.device_responded;
            result.raw_output = attempt.raw_output;
            result.power_status = attempt.power_status.or(result.power_status.take());
            result.error = attempt.error;
            result.error_kind = attempt.error_kind;

            if result.success {
                debug!("{}: {} via {}", device.id, command, method);
                break;
            }
        }

        result
    }

    async fn attempt(&self, device: &TvDevice, command: &TvCommand, method: ControlMethod) -> Attempt {
        match method {
            ControlMethod::Cec => {
                let target = device.cec.unwrap_or_default();
                match self.cec.execute(&target, command).await {
                    Ok(result) => result.into(),
                    Err(err) => Attempt::failed(err),
                }
            }
            ControlMethod::Ir => {
                let Some(profile) = device.ir.as_ref() else {
                    return Attempt::failed(ControlError::UnsupportedMethod(format!(
                        "{} has no IR blaster configured",
                        device.name
                    )));
                };
                let codes = match resolve_ir_codes(profile, command) {
                    Ok(codes) => codes,
                    Err(err) => return Attempt::failed(err),
                };
                match self.ir.transmit(&profile.blaster_address, &codes).await {
                    Ok(sent) => sent.into(),
                    Err(err) => Attempt::failed(err),
                }
            }
        }
    }

    /// Control several displays, either all at once or one after another
    pub async fn control_multiple_tvs(
        &self,
        devices: &[TvDevice],
        command: &TvCommand,
        options: &BatchOptions,
    ) -> Result<BatchResult, ControlError> {
        command.validate()?;
        let per_device = ControlOptions {
            force_method: options.force_method,
        };

        let results = if options.sequential {
            let mut results = Vec::with_capacity(devices.len());
            for (i, device) in devices.iter().enumerate() {
                if i > 0 && !options.delay_between.is_zero() {
                    tokio::time::sleep(options.delay_between).await;
                }
                results.push(self.control_tv(device, command, &per_device).await?);
            }
            results
        } else {
            join_all(
                devices
                    .iter()
                    .map(|device| self.control_tv(device, command, &per_device)),
            )
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?
        };

        let success = results.iter().all(|r| r.success);
        info!(
            "{} on {} displays: {}/{} succeeded",
            command,
            results.len(),
            results.iter().filter(|r| r.success).count(),
            results.len()
        );
        Ok(BatchResult { success, results })
    }
}

/// Look up the stored codes for a command. `enter` is optional after digits.
fn resolve_ir_codes(profile: &IrProfile, command: &TvCommand) -> Result<Vec<String>, ControlError> {
    let mut codes = Vec::new();
    for key in command.ir_keys() {
        match profile.codes.get(&key) {
            Some(code) => codes.push(code.clone()),
            None if key == "enter" => {}
            None => {
                return Err(ControlError::UnsupportedMethod(format!(
                    "no stored IR code for '{}'",
                    key
                )))
            }
        }
    }
    Ok(codes)
}
