//! Mock hardware for integration testing
//!
//! These mock servers stand in for the matrix switcher and the IR blaster so
//! the protocol clients can be exercised over real sockets.
#![allow(dead_code)]

pub mod ir_blaster;
pub mod matrix;

pub use ir_blaster::{MockBlasterBehavior, MockIrBlaster};
pub use matrix::MockMatrix;
