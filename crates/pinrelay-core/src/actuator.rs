//! The seam between pin commands and whatever drives the physical outputs.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{PinCommand, PinRegistry};

/// Drives a logical pin to a state.
///
/// Implementations must be idempotent: the dispatch protocol is
/// at-least-once, so the same command may arrive twice.
pub trait Actuator: Send + Sync {
    /// Applies `state` to `pin`, returning whether it was applied.
    fn apply(&self, pin: &str, state: bool) -> bool;

    /// Applies a command. Defaults to [`Actuator::apply`].
    fn apply_command(&self, command: &PinCommand) -> bool {
        self.apply(&command.pin, command.state)
    }
}

/// Actuator that only records states in a [`PinRegistry`].
///
/// Used when no hardware is attached and in tests.
#[derive(Debug, Clone)]
pub struct SimulatedActuator {
    pins: Arc<PinRegistry>,
}

impl SimulatedActuator {
    pub fn new(pins: Arc<PinRegistry>) -> Self {
        Self { pins }
    }

    pub fn pins(&self) -> &Arc<PinRegistry> {
        &self.pins
    }
}

impl Actuator for SimulatedActuator {
    fn apply(&self, pin: &str, state: bool) -> bool {
        match self.pins.set(pin, state) {
            Ok(changed) => {
                debug!(pin, state, changed, "Pin applied");
                true
            }
            Err(e) => {
                warn!(pin, state, error = %e, "Pin not applied");
                false
            }
        }
    }
}

impl<A: Actuator + ?Sized> Actuator for Arc<A> {
    fn apply(&self, pin: &str, state: bool) -> bool {
        (**self).apply(pin, state)
    }
}
