//! In-memory list of known devices and their latest samples.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::{Address, Word};
use crate::discovery::ScanResult;
use crate::error::{PollError, ValidationError};
use crate::identity::{DeviceKey, EndpointIdentity, DEFAULT_UNIT_ID};
use crate::poller::{PollSettings, PollSink, Sample};
use crate::request::{DataKind, ReadRange};

/// Polling rate given to new devices, in milliseconds.
pub const DEFAULT_RATE_MS: u64 = 1000;

/// Operator-facing state of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub key: DeviceKey,
    pub name: Option<String>,
    pub auto_poll: bool,
    pub rate_ms: u64,
    pub online: bool,
}

impl DeviceRecord {
    fn new(key: DeviceKey, rate_ms: u64) -> Self {
        Self {
            key,
            name: None,
            auto_poll: false,
            rate_ms,
            online: false,
        }
    }

    pub fn rate(&self) -> Duration {
        Duration::from_millis(self.rate_ms)
    }

    /// Poll settings for reading `range` at this device's rate.
    pub fn poll_settings(&self, range: ReadRange) -> PollSettings {
        PollSettings::new(self.auto_poll, self.rate(), range)
    }
}

/// Partial update of a [`DeviceRecord`]; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DevicePatch {
    /// `Some(None)` clears the name.
    pub name: Option<Option<String>>,
    pub auto_poll: Option<bool>,
    pub rate_ms: Option<i64>,
    pub online: Option<bool>,
}

#[derive(Debug, Default)]
struct State {
    devices: Vec<DeviceRecord>,
    selected: Option<DeviceKey>,
    samples: HashMap<(DeviceKey, DataKind), Sample>,
    last_error: Option<String>,
}

impl State {
    fn device_mut(&mut self, key: &DeviceKey) -> Option<&mut DeviceRecord> {
        self.devices.iter_mut().find(|device| &device.key == key)
    }

    fn contains(&self, key: &DeviceKey) -> bool {
        self.devices.iter().any(|device| &device.key == key)
    }
}

/// Thread-safe registry; also the [`PollSink`] that collects poll results.
#[derive(Debug)]
pub struct DeviceRegistry {
    default_rate_ms: u64,
    state: Mutex<State>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_RATE_MS))
    }
}

impl DeviceRegistry {
    pub fn new(default_rate: Duration) -> Self {
        let default_rate_ms = u64::try_from(default_rate.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        Self {
            default_rate_ms,
            state: Mutex::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `key` with default settings. Returns `false` if it was already known.
    pub fn add(&self, key: DeviceKey) -> bool {
        let mut state = self.state();
        if state.contains(&key) {
            return false;
        }
        debug!(device = %key, "device added");
        state.devices.push(DeviceRecord::new(key, self.default_rate_ms));
        true
    }

    /// Add a discovered endpoint under unit id 1.
    pub fn add_discovered(&self, found: &ScanResult) -> Result<DeviceKey, ValidationError> {
        let key = EndpointIdentity::new(found.host.as_str(), found.port, DEFAULT_UNIT_ID)?.key();
        self.add(key.clone());
        Ok(key)
    }

    /// Forget a device together with its samples and selection.
    pub fn remove(&self, key: &DeviceKey) -> Option<DeviceRecord> {
        let mut state = self.state();
        let index = state.devices.iter().position(|device| &device.key == key)?;
        let removed = state.devices.remove(index);
        state.samples.retain(|(sampled, _), _| sampled != key);
        if state.selected.as_ref() == Some(key) {
            state.selected = None;
        }
        debug!(device = %key, "device removed");
        Some(removed)
    }

    /// Select a known device, or clear the selection. Unknown keys are ignored.
    pub fn select(&self, key: Option<DeviceKey>) -> bool {
        let mut state = self.state();
        match key {
            Some(key) if !state.contains(&key) => false,
            key => {
                state.selected = key;
                true
            }
        }
    }

    pub fn selected(&self) -> Option<DeviceKey> {
        self.state().selected.clone()
    }

    /// Apply `patch` to a device. Returns the updated record, or `None` for
    /// an unknown key.
    pub fn update(
        &self,
        key: &DeviceKey,
        patch: DevicePatch,
    ) -> Result<Option<DeviceRecord>, ValidationError> {
        let rate_ms = patch
            .rate_ms
            .map(|rate| {
                if rate < 1 {
                    return Err(ValidationError::out_of_range("rate_ms", rate, 1, i64::MAX));
                }
                Ok(rate as u64)
            })
            .transpose()?;

        let mut state = self.state();
        let Some(device) = state.device_mut(key) else {
            return Ok(None);
        };
        if let Some(name) = patch.name {
            device.name = name;
        }
        if let Some(auto_poll) = patch.auto_poll {
            device.auto_poll = auto_poll;
        }
        if let Some(rate_ms) = rate_ms {
            device.rate_ms = rate_ms;
        }
        if let Some(online) = patch.online {
            device.online = online;
        }
        Ok(Some(device.clone()))
    }

    pub fn get(&self, key: &DeviceKey) -> Option<DeviceRecord> {
        self.state()
            .devices
            .iter()
            .find(|device| &device.key == key)
            .cloned()
    }

    /// Every device in insertion order.
    pub fn list(&self) -> Vec<DeviceRecord> {
        self.state().devices.clone()
    }

    pub fn sample(&self, key: &DeviceKey, kind: DataKind) -> Option<Sample> {
        self.state().samples.get(&(key.clone(), kind)).cloned()
    }

    /// Reflect a successful single write in the stored sample, if it covers
    /// `address`.
    pub fn patch_sample(
        &self,
        key: &DeviceKey,
        kind: DataKind,
        address: Address,
        value: Word,
    ) -> bool {
        let mut state = self.state();
        let Some(sample) = state.samples.get_mut(&(key.clone(), kind)) else {
            return false;
        };
        let Some(offset) = address.checked_sub(sample.address) else {
            return false;
        };
        match sample.values.get_mut(usize::from(offset)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Message of the most recent surfaced poll failure.
    pub fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }

    pub fn clear_error(&self) {
        self.state().last_error = None;
    }
}

impl PollSink for DeviceRegistry {
    fn publish(&self, key: &DeviceKey, kind: DataKind, sample: Sample) {
        let mut state = self.state();
        if state.contains(key) {
            state.samples.insert((key.clone(), kind), sample);
        }
    }

    fn set_online(&self, key: &DeviceKey, online: bool) {
        if let Some(device) = self.state().device_mut(key) {
            device.online = online;
        }
    }

    fn report_error(&self, key: &DeviceKey, error: &PollError) {
        self.state().last_error = Some(format!("{key}: {error}"));
    }
}
