//! Venue AV Control
//!
//! A unified control layer for the displays and switchers in a venue.
//!
//! This library provides:
//! - HDMI matrix routing over TCP or UDP (`3X2.` style commands)
//! - HDMI-CEC control through the libCEC `cec-client` utility
//! - IR learning and playback through Global Caché style blasters
//! - A controller that picks CEC or IR per display and falls back between them
//! - An event bus for observers of every hardware action

pub mod bus;
pub mod config;
pub mod controller;
pub mod devices;
pub mod error;
