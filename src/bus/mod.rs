//! Event bus for observers of device activity
//!
//! Uses tokio::sync::broadcast for pub/sub pattern.
//! The core never depends on a subscriber being present; logging and UI layers
//! subscribe to learn what happened on the hardware.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Event types that can be published on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BusEvent {
    // Matrix events
    MatrixRouted {
        address: String,
        input: u32,
        output: u32,
        success: bool,
    },

    // CEC events
    CecCommandSent {
        device_number: Option<u8>,
        command: String,
        success: bool,
        device_responded: bool,
    },
    CecPowerStatus {
        device_number: Option<u8>,
        address: String,
        status: String,
    },

    // IR events
    IrLearningStarted { blaster: String },
    IrCodeLearned { blaster: String },
    IrLearningFailed { blaster: String, error: String },
    IrCodeSent { blaster: String, success: bool },

    // Controller events
    DeviceControlled {
        device_id: String,
        command: String,
        method: Option<String>,
        success: bool,
        fallback_used: bool,
    },
}

/// Event bus handle for publishing and subscribing
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl EventBus {
    /// Create a new event bus with specified capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: BusEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    /// Default capacity of 256 events
    fn default() -> Self {
        Self::new(256)
    }
}

/// Shared event bus wrapped in Arc for thread-safe sharing
pub type SharedBus = Arc<EventBus>;

/// Create a new shared event bus
pub fn create_bus() -> SharedBus {
    Arc::new(EventBus::default())
}
