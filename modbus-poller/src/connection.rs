//! Keyed pool of Modbus sessions.
//!
//! Each [`DeviceKey`] owns at most one session. The session sits behind an
//! async mutex so a session never carries more than one request at a time,
//! while requests for different keys proceed in parallel.
//!
//! Operations never dial: a key without a session fails with
//! [`OpError::NotConnected`]. Callers that want auto-connect call
//! [`ConnectionManager::connect`] first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::codec::{flags_from_bits, Address, Flag, Quantity, Word};
use crate::config::ConnectionConfig;
use crate::error::{ConnError, OpError, TransportError};
use crate::identity::{DeviceKey, EndpointIdentity};
use crate::transport::{Connector, Request, Response, Session};

/// A pooled session and its failure streak.
struct Link {
    session: tokio::sync::Mutex<Box<dyn Session>>,
    failures: AtomicU32,
}

/// Per-key initialization guard; concurrent connects share one dial.
type Slot = Arc<OnceCell<Arc<Link>>>;

/// Owns every live session and serves reads and writes through them.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    pool: Mutex<HashMap<DeviceKey, Slot>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("connected", &self.connected_keys())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
        Self {
            connector,
            config,
            pool: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn pool(&self) -> MutexGuard<'_, HashMap<DeviceKey, Slot>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ensure a session exists for `id`, dialing if needed.
    ///
    /// Returns immediately when the key is already connected. A concurrent
    /// caller for the same key waits for the in-flight dial and reuses it.
    pub async fn connect(&self, id: &EndpointIdentity) -> Result<DeviceKey, ConnError> {
        let key = id.key();
        let slot = self.pool().entry(key.clone()).or_default().clone();

        let result = slot.get_or_try_init(|| self.dial(id, &key)).await;
        if result.is_err() {
            self.forget_failed_slot(&key, &slot);
        }
        result.map(|_| key)
    }

    async fn dial(&self, id: &EndpointIdentity, key: &DeviceKey) -> Result<Arc<Link>, ConnError> {
        let after = self.config.connect_timeout;
        debug!(device = %key, ?after, "dialing");

        // Dropping the dial future on timeout releases the half-open socket.
        let session = match tokio::time::timeout(after, self.connector.dial(id)).await {
            Ok(Ok(session)) => session,
            Ok(Err(source)) => {
                warn!(device = %key, error = %source, "connection refused");
                return Err(ConnError::Refused {
                    key: key.clone(),
                    source,
                });
            }
            Err(_) => {
                warn!(device = %key, ?after, "connection timed out");
                return Err(ConnError::Timeout {
                    key: key.clone(),
                    after,
                });
            }
        };

        info!(device = %key, "connected");
        Ok(Arc::new(Link {
            session: tokio::sync::Mutex::new(session),
            failures: AtomicU32::new(0),
        }))
    }

    /// Drop an empty slot nobody else is waiting on.
    fn forget_failed_slot(&self, key: &DeviceKey, slot: &Slot) {
        let mut pool = self.pool();
        if let Some(current) = pool.get(key) {
            // One reference in the map, one held by the caller.
            if Arc::ptr_eq(current, slot)
                && current.get().is_none()
                && Arc::strong_count(slot) == 2
            {
                pool.remove(key);
            }
        }
    }

    /// Close the session for `id`. Returns whether one existed.
    ///
    /// A dial still in flight is left alone; its session lands in the pool.
    pub fn disconnect(&self, id: &EndpointIdentity) -> bool {
        let key = id.key();
        let mut pool = self.pool();
        let connected = pool.get(&key).is_some_and(|slot| slot.get().is_some());
        if connected {
            pool.remove(&key);
            info!(device = %key, "disconnected");
        }
        connected
    }

    pub fn is_connected(&self, id: &EndpointIdentity) -> bool {
        self.pool()
            .get(&id.key())
            .is_some_and(|slot| slot.get().is_some())
    }

    /// Keys with an established session, sorted.
    pub fn connected_keys(&self) -> Vec<DeviceKey> {
        let mut keys: Vec<_> = self
            .pool()
            .iter()
            .filter(|(_, slot)| slot.get().is_some())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    fn link(&self, key: &DeviceKey) -> Result<Arc<Link>, OpError> {
        self.pool()
            .get(key)
            .and_then(|slot| slot.get().cloned())
            .ok_or_else(|| OpError::NotConnected(key.clone()))
    }

    async fn call(&self, id: &EndpointIdentity, request: Request) -> Result<Response, OpError> {
        let key = id.key();
        let link = self.link(&key)?;

        let result = {
            let mut session = link.session.lock().await;
            match tokio::time::timeout(self.config.request_timeout, session.call(request)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(self.config.request_timeout)),
            }
        };

        match result {
            Ok(response) => {
                link.failures.store(0, Ordering::Relaxed);
                Ok(response)
            }
            Err(source) => {
                if source.is_link_failure() {
                    self.record_failure(&key, &link);
                }
                Err(OpError::Transport { key, source })
            }
        }
    }

    fn record_failure(&self, key: &DeviceKey, link: &Arc<Link>) {
        let limit = self.config.max_consecutive_failures;
        let failures = link.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if limit == 0 || failures < limit {
            return;
        }

        let mut pool = self.pool();
        let same_link = pool
            .get(key)
            .and_then(|slot| slot.get())
            .is_some_and(|current| Arc::ptr_eq(current, link));
        if same_link {
            pool.remove(key);
            warn!(device = %key, failures, "evicting session after repeated failures");
        }
    }

    pub async fn read_coils(
        &self,
        id: &EndpointIdentity,
        address: Address,
        length: Quantity,
    ) -> Result<Vec<Flag>, OpError> {
        let response = self.call(id, Request::ReadCoils(address, length)).await?;
        self.decode(id, response.into_bits()).map(|bits| flags_from_bits(&bits))
    }

    pub async fn read_discrete_inputs(
        &self,
        id: &EndpointIdentity,
        address: Address,
        length: Quantity,
    ) -> Result<Vec<Flag>, OpError> {
        let response = self.call(id, Request::ReadDiscreteInputs(address, length)).await?;
        self.decode(id, response.into_bits()).map(|bits| flags_from_bits(&bits))
    }

    pub async fn read_holding_registers(
        &self,
        id: &EndpointIdentity,
        address: Address,
        length: Quantity,
    ) -> Result<Vec<Word>, OpError> {
        let response = self.call(id, Request::ReadHoldingRegisters(address, length)).await?;
        self.decode(id, response.into_words())
    }

    pub async fn read_input_registers(
        &self,
        id: &EndpointIdentity,
        address: Address,
        length: Quantity,
    ) -> Result<Vec<Word>, OpError> {
        let response = self.call(id, Request::ReadInputRegisters(address, length)).await?;
        self.decode(id, response.into_words())
    }

    pub async fn write_coil(
        &self,
        id: &EndpointIdentity,
        address: Address,
        state: bool,
    ) -> Result<(), OpError> {
        let response = self.call(id, Request::WriteSingleCoil(address, state)).await?;
        self.decode(id, response.into_written())
    }

    pub async fn write_register(
        &self,
        id: &EndpointIdentity,
        address: Address,
        value: Word,
    ) -> Result<(), OpError> {
        let response = self.call(id, Request::WriteSingleRegister(address, value)).await?;
        self.decode(id, response.into_written())
    }

    fn decode<T>(
        &self,
        id: &EndpointIdentity,
        result: Result<T, TransportError>,
    ) -> Result<T, OpError> {
        result.map_err(|source| OpError::Transport {
            key: id.key(),
            source,
        })
    }
}
