//! avctl - operator CLI for venue AV hardware
//!
//! Usage:
//!   avctl route <input> <output>
//!   avctl probe
//!   avctl cec <command> [address] [device]
//!   avctl power-status [address] [device]
//!   avctl scan [device]
//!   avctl learn <blaster>
//!   avctl stop-learn <blaster>
//!   avctl send-ir <blaster> <code>
//!
//! Results are printed to stdout as JSON; logs go to stderr.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::env;
use std::process;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use venue_av_control::bus::{create_bus, SharedBus};
use venue_av_control::config::{load_config, Config};
use venue_av_control::devices::{
    CecBridge, CecCommand, CecTarget, IrBlasterClient, MatrixClient, MatrixConfiguration,
};
use venue_av_control::error::ControlError;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs on stderr so stdout stays valid JSON
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "venue_av_control=debug,avctl=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print_usage();
        process::exit(2);
    };

    match command.as_str() {
        "help" | "-h" | "--help" => {
            print_usage();
            return Ok(());
        }
        "version" | "-V" | "--version" => {
            println!("avctl {} ({})", env!("AVC_VERSION"), env!("AVC_GIT_SHA"));
            return Ok(());
        }
        _ => {}
    }

    let config = load_config().context("Failed to load configuration")?;
    tracing::debug!("Config dir: {:?}", venue_av_control::config::get_config_dir());
    let bus = create_bus();

    match run(command, &args[1..], &config, bus).await {
        Ok(true) => Ok(()),
        Ok(false) => process::exit(1),
        Err(e) => {
            print_json(&json!({
                "success": false,
                "error": e.to_string(),
                "error_kind": e.kind(),
            }));
            process::exit(1);
        }
    }
}

/// Run one subcommand; returns whether the hardware action succeeded
async fn run(
    command: &str,
    args: &[String],
    config: &Config,
    bus: SharedBus,
) -> Result<bool, ControlError> {
    match command {
        "route" => {
            let (Some(input), Some(output)) = (args.first(), args.get(1)) else {
                usage_error("route needs <input> <output>");
            };
            let matrix = configured_matrix(config)?;
            let client = MatrixClient::new(config.routing.clone(), bus);
            let result = client
                .route(matrix, parse_number(input, "input")?, parse_number(output, "output")?)
                .await?;
            print_json(&result);
            Ok(result.success)
        }
        "probe" => {
            let matrix = configured_matrix(config)?;
            let client = MatrixClient::new(config.routing.clone(), bus);
            client.probe(matrix).await?;
            print_json(&json!({
                "success": true,
                "endpoint": format!("{}:{}", matrix.address, matrix.tcp_port),
            }));
            Ok(true)
        }
        "cec" => {
            let Some(name) = args.first() else {
                usage_error("cec needs <command>");
            };
            let cec_command = CecCommand::parse(name).ok_or_else(|| {
                ControlError::InvalidArgument(format!("unknown CEC command '{}'", name))
            })?;
            let target = parse_target(args.get(1), args.get(2))?;
            let bridge = CecBridge::new(config.cec.clone(), bus);
            let result = bridge.send(&target, cec_command).await?;
            print_json(&result);
            Ok(result.success)
        }
        "power-status" => {
            let target = parse_target(args.first(), args.get(1))?;
            let bridge = CecBridge::new(config.cec.clone(), bus);
            let result = bridge.power_status(&target).await?;
            print_json(&result);
            Ok(result.success)
        }
        "scan" => {
            let device_number = args
                .first()
                .map(|d| parse_number::<u8>(d, "device"))
                .transpose()?;
            let bridge = CecBridge::new(config.cec.clone(), bus);
            let result = bridge.scan(device_number).await;
            print_json(&result);
            Ok(result.success)
        }
        "learn" => {
            let Some(blaster) = args.first() else {
                usage_error("learn needs <blaster>");
            };
            let client = IrBlasterClient::new(config.ir.clone(), bus);
            eprintln!("Point the remote at the blaster and press the button (Ctrl-C to cancel)");

            let learn = client.start_learning(blaster);
            tokio::pin!(learn);
            let result = tokio::select! {
                result = &mut learn => result?,
                _ = tokio::signal::ctrl_c() => {
                    let (_, result) = tokio::join!(client.stop_learning(blaster), &mut learn);
                    result?
                }
            };
            print_json(&result);
            Ok(result.success)
        }
        "stop-learn" => {
            let Some(blaster) = args.first() else {
                usage_error("stop-learn needs <blaster>");
            };
            let client = IrBlasterClient::new(config.ir.clone(), bus);
            client.reset_learner(blaster).await?;
            print_json(&json!({ "success": true, "blaster": client.endpoint(blaster) }));
            Ok(true)
        }
        "send-ir" => {
            let (Some(blaster), Some(code)) = (args.first(), args.get(1)) else {
                usage_error("send-ir needs <blaster> <code>");
            };
            let client = IrBlasterClient::new(config.ir.clone(), bus);
            let result = client.send_code(blaster, code).await?;
            print_json(&result);
            Ok(result.success)
        }
        other => usage_error(&format!("Unknown command: {}", other)),
    }
}

fn configured_matrix(config: &Config) -> Result<&MatrixConfiguration, ControlError> {
    config.matrix.as_ref().ok_or_else(|| {
        ControlError::InvalidArgument(
            "no matrix configured (set MATRIX_HOST or [matrix] in config.toml)".to_string(),
        )
    })
}

fn parse_target(address: Option<&String>, device: Option<&String>) -> Result<CecTarget, ControlError> {
    let mut target = CecTarget::tv();
    if let Some(address) = address {
        target.address = CecTarget::parse_address(address)?;
    }
    if let Some(device) = device {
        target = target.on_adapter(parse_number(device, "device")?);
    }
    Ok(target)
}

fn parse_number<T: std::str::FromStr>(value: &str, name: &str) -> Result<T, ControlError> {
    value
        .trim()
        .parse()
        .map_err(|_| ControlError::InvalidArgument(format!("invalid {} '{}'", name, value)))
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Error encoding result: {}", e),
    }
}

fn usage_error(message: &str) -> ! {
    eprintln!("Error: {}", message);
    eprintln!();
    print_usage();
    process::exit(2);
}

fn print_usage() {
    eprintln!("avctl - venue AV control");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  avctl route <input> <output>          Route a matrix input to an output");
    eprintln!("  avctl probe                           Check the matrix is reachable");
    eprintln!("  avctl cec <command> [addr] [device]   on, standby, volup, voldown, mute, pow, as");
    eprintln!("  avctl power-status [addr] [device]    Query a display's power state");
    eprintln!("  avctl scan [device]                   List devices on the CEC bus");
    eprintln!("  avctl learn <blaster>                 Capture one IR code");
    eprintln!("  avctl stop-learn <blaster>            Take a blaster out of learning mode");
    eprintln!("  avctl send-ir <blaster> <code>        Transmit a learned sendir line");
    eprintln!();
    eprintln!("Configuration: $AVC_CONFIG_DIR/config.toml, AVC_* and MATRIX_HOST/MATRIX_PORT env vars");
}
