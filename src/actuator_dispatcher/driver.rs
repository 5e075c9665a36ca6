//! Relay driver abstraction
//!
//! Real deployments wire a GPIO-backed implementation; the in-tree mock
//! keeps pin states in memory and logs transitions.

use std::collections::HashMap;
use std::sync::Mutex;

/// Low-level relay interface
///
/// Implementations must be cheap to call; the dispatcher invokes `set`
/// while holding its command lock.
pub trait RelayDriver: Send + Sync {
    /// Prepare the pins. Returns false if the interface is unavailable.
    fn init(&self, relay_pins: &HashMap<String, u8>) -> bool;

    /// Drive one relay. `on` is the logical state; active-low wiring is the
    /// driver's concern.
    fn set(&self, name: &str, pin: u8, on: bool);

    /// Release the underlying interface
    fn release(&self);
}

/// In-memory relay driver for tests and GPIO-less hosts
pub struct MockRelayDriver {
    pins: Mutex<HashMap<u8, bool>>,
}

impl MockRelayDriver {
    pub fn new() -> Self {
        Self {
            pins: Mutex::new(HashMap::new()),
        }
    }

    /// Raw pin level, for assertions
    pub fn pin_level(&self, pin: u8) -> Option<bool> {
        self.pins.lock().expect("mock pin map poisoned").get(&pin).copied()
    }
}

impl Default for MockRelayDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayDriver for MockRelayDriver {
    fn init(&self, relay_pins: &HashMap<String, u8>) -> bool {
        let mut pins = self.pins.lock().expect("mock pin map poisoned");
        for pin in relay_pins.values() {
            pins.insert(*pin, false);
        }
        tracing::debug!(pin_count = relay_pins.len(), "Mock relay driver initialized");
        true
    }

    fn set(&self, name: &str, pin: u8, on: bool) {
        let mut pins = self.pins.lock().expect("mock pin map poisoned");
        pins.insert(pin, on);
        tracing::debug!(actuator = %name, pin = pin, on = on, "Mock relay set");
    }

    fn release(&self) {
        let mut pins = self.pins.lock().expect("mock pin map poisoned");
        pins.clear();
        tracing::debug!("Mock relay driver released");
    }
}
