//! Hardware protocol clients (matrix switcher, HDMI-CEC, IR blaster)

pub mod cec;
pub mod ir;
pub mod matrix;

pub use cec::{CecBridge, CecCommand, CecTarget};
pub use ir::IrBlasterClient;
pub use matrix::{MatrixClient, MatrixConfiguration, MatrixProtocol};
