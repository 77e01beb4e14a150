//! Node-local table of logical pin states.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::{DomainError, DomainResult};

/// Last commanded state of every configured pin.
///
/// Pins are fixed at construction; setting an unknown pin is an error.
/// Safe to share between the poll loop and the scheduler's fire consumer.
#[derive(Debug, Default)]
pub struct PinRegistry {
    states: Mutex<HashMap<String, bool>>,
}

impl PinRegistry {
    /// Creates a registry with every pin off.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let states = names.into_iter().map(|name| (name.into(), false)).collect();
        Self {
            states: Mutex::new(states),
        }
    }

    // Recover from poisoning: the map only holds plain bools.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, bool>> {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state, or `None` if the pin is not configured.
    pub fn get(&self, pin: &str) -> Option<bool> {
        self.lock().get(pin).copied()
    }

    /// Sets a pin, returning whether the state changed.
    pub fn set(&self, pin: &str, state: bool) -> DomainResult<bool> {
        let mut states = self.lock();
        let slot = states.get_mut(pin).ok_or_else(|| DomainError::UnknownPin {
            pin: pin.to_string(),
        })?;
        let changed = *slot != state;
        *slot = state;
        Ok(changed)
    }

    pub fn contains(&self, pin: &str) -> bool {
        self.lock().contains_key(pin)
    }

    /// Configured pin names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Drives every pin low.
    pub fn clear_all(&self) {
        for state in self.lock().values_mut() {
            *state = false;
        }
    }
}
