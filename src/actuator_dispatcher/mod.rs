//! ActuatorDispatcher - Relay/actuator command serialization
//!
//! ## Responsibilities
//!
//! - Apply actuator commands (fan, buzzer, light) through a relay driver
//! - Timed holds: apply a state, auto-revert after a duration
//! - Guarantee at most one pending revert per actuator (last scheduling wins)
//! - Cleanup: cancel reverts, force safe/off state, release the driver
//!
//! The driver is a trait so platform GPIO and the in-memory mock are selected
//! at construction time, never by a runtime platform check in business logic.

mod driver;

pub use driver::{MockRelayDriver, RelayDriver};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Actuator name -> relay pin (BCM numbering)
    pub relay_pins: HashMap<String, u8>,
    /// Initial states applied at initialization (true = ON)
    pub initial_states: HashMap<String, bool>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let mut relay_pins = HashMap::new();
        relay_pins.insert("fan".to_string(), 17);
        relay_pins.insert("buzzer".to_string(), 27);
        relay_pins.insert("light".to_string(), 22);

        let initial_states = relay_pins.keys().map(|k| (k.clone(), false)).collect();

        Self {
            relay_pins,
            initial_states,
        }
    }
}

#[derive(Default)]
struct Inner {
    initialized: bool,
    init_failed: bool,
    states: HashMap<String, bool>,
    /// At most one pending revert per actuator
    timers: HashMap<String, JoinHandle<()>>,
}

/// ActuatorDispatcher instance
pub struct ActuatorDispatcher {
    driver: Arc<dyn RelayDriver>,
    config: DispatcherConfig,
    inner: Mutex<Inner>,
}

impl ActuatorDispatcher {
    /// Create new dispatcher; the driver is not touched until `initialize`
    /// or the first command
    pub fn new(driver: Arc<dyn RelayDriver>, config: DispatcherConfig) -> Self {
        Self {
            driver,
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Initialize the relay driver and apply initial states.
    ///
    /// Returns false if the driver cannot access its interface. A failed
    /// initialization is remembered; later commands fail fast.
    pub async fn initialize(&self) -> bool {
        let mut inner = self.inner.lock().await;
        self.init_locked(&mut inner)
    }

    fn init_locked(&self, inner: &mut Inner) -> bool {
        if inner.initialized {
            return true;
        }
        if inner.init_failed {
            return false;
        }

        if !self.driver.init(&self.config.relay_pins) {
            tracing::error!("Relay driver initialization failed");
            inner.init_failed = true;
            return false;
        }

        for (name, pin) in &self.config.relay_pins {
            let initial = self
                .config
                .initial_states
                .get(name)
                .copied()
                .unwrap_or(false);
            self.driver.set(name, *pin, initial);
            inner.states.insert(name.clone(), initial);
            tracing::info!(actuator = %name, pin = *pin, "Relay pin initialized");
        }

        inner.initialized = true;
        true
    }

    /// Set an actuator state. Cancels any pending revert for that actuator.
    ///
    /// Returns false for unknown actuators or when the driver is unavailable.
    pub async fn set_state(&self, name: &str, state: bool) -> bool {
        let mut inner = self.inner.lock().await;
        self.apply_locked(&mut inner, name, state)
    }

    fn apply_locked(&self, inner: &mut Inner, name: &str, state: bool) -> bool {
        if !self.init_locked(inner) {
            return false;
        }

        let Some(pin) = self.config.relay_pins.get(name) else {
            tracing::warn!(actuator = %name, "Unknown actuator, ignoring command");
            return false;
        };

        if let Some(timer) = inner.timers.remove(name) {
            timer.abort();
        }

        self.driver.set(name, *pin, state);
        inner.states.insert(name.to_string(), state);

        tracing::info!(
            actuator = %name,
            state = if state { "ON" } else { "OFF" },
            "Actuator state set"
        );
        true
    }

    /// Apply a state, then revert to the complementary state after
    /// `duration`. A newer command or timed hold supersedes the revert.
    pub async fn set_timed(self: &Arc<Self>, name: &str, state: bool, duration: Duration) -> bool {
        let mut inner = self.inner.lock().await;
        if !self.apply_locked(&mut inner, name, state) {
            return false;
        }

        // The deadline is fixed now, at scheduling time, so a busy executor
        // cannot stretch the hold past the requested duration.
        let deadline = tokio::time::Instant::now() + duration;
        let dispatcher = self.clone();
        let actuator = name.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;

            let mut inner = dispatcher.inner.lock().await;
            // Another command may have superseded this hold while we slept;
            // only the registered timer is allowed to fire the revert.
            if inner.timers.remove(&actuator).is_some() {
                dispatcher.apply_locked(&mut inner, &actuator, !state);
                tracing::info!(actuator = %actuator, "Timed hold reverted");
            }
        });

        // apply_locked already cancelled the previous timer
        inner.timers.insert(name.to_string(), handle);
        tracing::info!(actuator = %name, duration_sec = duration.as_secs_f64(), "Timed hold scheduled");
        true
    }

    /// Trigger the buzzer alarm for `duration`
    pub async fn trigger_alarm(self: &Arc<Self>, duration: Duration) -> bool {
        self.set_timed("buzzer", true, duration).await
    }

    /// Get current state of an actuator
    pub async fn get_state(&self, name: &str) -> Option<bool> {
        let inner = self.inner.lock().await;
        inner.states.get(name).copied()
    }

    /// Get all actuator states
    pub async fn get_all_states(&self) -> HashMap<String, bool> {
        let inner = self.inner.lock().await;
        inner.states.clone()
    }

    /// Cancel all pending reverts, force every actuator off, release the
    /// driver. Idempotent.
    pub async fn cleanup(&self) {
        let mut inner = self.inner.lock().await;

        for (_, timer) in inner.timers.drain() {
            timer.abort();
        }

        if inner.initialized {
            for (name, pin) in &self.config.relay_pins {
                self.driver.set(name, *pin, false);
                inner.states.insert(name.clone(), false);
            }
            self.driver.release();
            inner.initialized = false;
        }

        tracing::info!("Actuator dispatcher cleaned up");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> Arc<ActuatorDispatcher> {
        Arc::new(ActuatorDispatcher::new(
            Arc::new(MockRelayDriver::new()),
            DispatcherConfig::default(),
        ))
    }

    async fn settle() {
        // Let the revert task observe the advanced clock
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn set_state_lazy_initializes() {
        let d = dispatcher();
        assert!(d.set_state("fan", true).await);
        assert_eq!(d.get_state("fan").await, Some(true));
    }

    struct BrokenDriver;

    impl RelayDriver for BrokenDriver {
        fn init(&self, _pins: &HashMap<String, u8>) -> bool {
            false
        }
        fn set(&self, _name: &str, _pin: u8, _on: bool) {
            panic!("set called on a driver that failed to initialize");
        }
        fn release(&self) {}
    }

    #[tokio::test]
    async fn failed_driver_init_is_remembered() {
        let d = Arc::new(ActuatorDispatcher::new(
            Arc::new(BrokenDriver),
            DispatcherConfig::default(),
        ));
        assert!(!d.initialize().await);
        // Later commands fail fast instead of retrying the driver
        assert!(!d.set_state("fan", true).await);
        assert!(!d.set_timed("buzzer", true, Duration::from_secs(5)).await);
        assert_eq!(d.get_state("fan").await, None);
    }

    #[tokio::test]
    async fn unknown_actuator_is_rejected() {
        let d = dispatcher();
        assert!(!d.set_state("sprinkler", true).await);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_hold_reverts_after_duration() {
        let d = dispatcher();
        assert!(d.set_timed("buzzer", true, Duration::from_secs(5)).await);
        assert_eq!(d.get_state("buzzer").await, Some(true));

        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(d.get_state("buzzer").await, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn revert_deadline_counts_from_scheduling() {
        let d = dispatcher();
        d.set_timed("buzzer", true, Duration::from_secs(5)).await;

        // Advance the clock before the revert task has ever been polled;
        // the hold still ends exactly `duration` after scheduling.
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(d.get_state("buzzer").await, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn newer_timed_hold_supersedes_pending_revert() {
        let d = dispatcher();
        d.set_timed("buzzer", true, Duration::from_secs(5)).await;
        d.set_timed("buzzer", true, Duration::from_secs(10)).await;

        // The 5s revert must never fire
        tokio::time::advance(Duration::from_secs(7)).await;
        settle().await;
        assert_eq!(d.get_state("buzzer").await, Some(true));

        tokio::time::advance(Duration::from_secs(4)).await;
        settle().await;
        assert_eq!(d.get_state("buzzer").await, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn set_state_cancels_pending_revert() {
        let d = dispatcher();
        d.set_timed("fan", true, Duration::from_secs(5)).await;
        d.set_state("fan", true).await;

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        // Revert was cancelled; fan stays on
        assert_eq!(d.get_state("fan").await, Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_cancels_reverts_and_forces_off() {
        let d = dispatcher();
        d.set_timed("buzzer", true, Duration::from_secs(5)).await;
        d.cleanup().await;
        assert_eq!(d.get_state("buzzer").await, Some(false));

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(d.get_state("buzzer").await, Some(false));

        // Idempotent
        d.cleanup().await;
    }
}
