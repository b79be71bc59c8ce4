use std::collections::{HashMap, HashSet};
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio_modbus::Exception;

use crate::codec::{Address, Quantity, Word};
use crate::discovery::{Prober, StaticInterfaces};
use crate::error::TransportError;
use crate::identity::EndpointIdentity;
use crate::transport::{Connector, Request, Response, Session};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
/// A raw Modbus data space; reading or writing an unset address is an
/// `IllegalDataAddress` exception.
pub struct Registers<T>(HashMap<Address, T>);

impl<T> Default for Registers<T> {
    fn default() -> Self {
        Self(HashMap::new())
    }
}

impl<T: Copy> Registers<T> {
    /// Insert new consecutive values starting at `addr` address.
    pub fn insert(&mut self, addr: Address, values: &[T]) {
        for (i, value) in values.iter().enumerate() {
            let reg_addr = addr.wrapping_add(i as Address);
            self.0.insert(reg_addr, *value);
        }
    }

    /// Read `cnt` consecutive values starting at `addr`.
    pub fn read(&self, addr: Address, cnt: Quantity) -> Result<Vec<T>, Exception> {
        (0..cnt)
            .map(|i| {
                let reg_addr = addr.checked_add(i).ok_or(Exception::IllegalDataAddress)?;
                self.0
                    .get(&reg_addr)
                    .copied()
                    .ok_or(Exception::IllegalDataAddress)
            })
            .collect()
    }

    /// Write `values` into existing consecutive addresses starting at `addr`.
    pub fn write(&mut self, addr: Address, values: &[T]) -> Result<(), Exception> {
        // Check the whole range first so a failed write leaves no partial update.
        self.read(addr, values.len() as Quantity)?;
        self.insert(addr, values);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
/// The four Modbus data spaces of one simulated device.
pub struct DataStore {
    pub coils: Registers<bool>,
    pub discrete_inputs: Registers<bool>,
    pub holding_registers: Registers<Word>,
    pub input_registers: Registers<Word>,
}

impl DataStore {
    /// Serve one request against the store.
    pub fn service_call(&mut self, req: Request) -> Result<Response, Exception> {
        match req {
            Request::ReadCoils(addr, cnt) => self.coils.read(addr, cnt).map(Response::Bits),
            Request::ReadDiscreteInputs(addr, cnt) => {
                self.discrete_inputs.read(addr, cnt).map(Response::Bits)
            }
            Request::ReadHoldingRegisters(addr, cnt) => {
                self.holding_registers.read(addr, cnt).map(Response::Words)
            }
            Request::ReadInputRegisters(addr, cnt) => {
                self.input_registers.read(addr, cnt).map(Response::Words)
            }
            Request::WriteSingleCoil(addr, coil) => self
                .coils
                .write(addr, std::slice::from_ref(&coil))
                .map(|_| Response::Written),
            Request::WriteSingleRegister(addr, word) => self
                .holding_registers
                .write(addr, std::slice::from_ref(&word))
                .map(|_| Response::Written),
        }
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    store: DataStore,
    offline: bool,
    latency: Duration,
    in_flight: usize,
    max_in_flight: usize,
    requests: usize,
}

/// Modbus device living in memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct SimulatedDevice(Arc<Mutex<DeviceState>>);

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        lock(&self.0)
    }

    pub fn set_coils(&self, addr: Address, values: &[bool]) {
        self.state().store.coils.insert(addr, values);
    }

    pub fn set_discrete_inputs(&self, addr: Address, values: &[bool]) {
        self.state().store.discrete_inputs.insert(addr, values);
    }

    pub fn set_holding_registers(&self, addr: Address, values: &[Word]) {
        self.state().store.holding_registers.insert(addr, values);
    }

    pub fn set_input_registers(&self, addr: Address, values: &[Word]) {
        self.state().store.input_registers.insert(addr, values);
    }

    pub fn holding_registers(&self, addr: Address, cnt: Quantity) -> Result<Vec<Word>, Exception> {
        self.state().store.holding_registers.read(addr, cnt)
    }

    pub fn coils(&self, addr: Address, cnt: Quantity) -> Result<Vec<bool>, Exception> {
        self.state().store.coils.read(addr, cnt)
    }

    /// While offline the device refuses dials and open sessions fail with I/O errors.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    pub fn is_offline(&self) -> bool {
        self.state().offline
    }

    /// Delay applied to every request before it is served.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Highest number of requests observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }

    pub fn request_count(&self) -> usize {
        self.state().requests
    }

    async fn serve(&self, request: Request) -> Result<Response, TransportError> {
        let latency = {
            let mut state = self.state();
            state.requests += 1;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.latency
        };
        // Leaves the in-flight count balanced when the caller drops the future.
        let _in_flight = InFlight(self);

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        if state.offline {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device offline").into());
        }
        state
            .store
            .service_call(request)
            .map_err(TransportError::Exception)
    }
}

struct InFlight<'a>(&'a SimulatedDevice);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.state().in_flight -= 1;
    }
}

struct SimulatedSession {
    device: SimulatedDevice,
    requests: Arc<AtomicUsize>,
}

#[async_trait]
impl Session for SimulatedSession {
    async fn call(&mut self, request: Request) -> Result<Response, TransportError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.device.serve(request).await
    }
}

/// [`Connector`] resolving `host:port` to attached [`SimulatedDevice`]s.
#[derive(Debug, Default)]
pub struct SimulatedConnector {
    devices: Mutex<HashMap<(String, u16), SimulatedDevice>>,
    dial_latency: Mutex<Duration>,
    dials: AtomicUsize,
    requests: Arc<AtomicUsize>,
}

impl SimulatedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `device` reachable at `host:port`, for every unit id.
    pub fn attach(&self, host: &str, port: u16, device: SimulatedDevice) {
        lock(&self.devices).insert((host.to_string(), port), device);
    }

    pub fn detach(&self, host: &str, port: u16) -> Option<SimulatedDevice> {
        lock(&self.devices).remove(&(host.to_string(), port))
    }

    pub fn set_dial_latency(&self, latency: Duration) {
        *lock(&self.dial_latency) = latency;
    }

    /// Number of dial attempts so far.
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Number of requests issued over every session so far.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn dial(&self, id: &EndpointIdentity) -> io::Result<Box<dyn Session>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let latency = *lock(&self.dial_latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let device = lock(&self.devices)
            .get(&(id.host().to_string(), id.port()))
            .cloned()
            .filter(|device| !device.is_offline())
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;

        Ok(Box::new(SimulatedSession {
            device,
            requests: self.requests.clone(),
        }))
    }
}

#[derive(Debug, Default)]
struct ProbeStats {
    in_flight: usize,
    max_in_flight: usize,
    probes: usize,
}

/// [`Prober`] answering from a fixed set of listening hosts.
///
/// Listening hosts answer after `latency`; every other host stays silent
/// until the probe times out.
#[derive(Debug, Default)]
pub struct SimulatedProber {
    listening: Mutex<HashSet<(Ipv4Addr, u16)>>,
    latency: Mutex<Duration>,
    stats: Mutex<ProbeStats>,
}

impl SimulatedProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&self, host: Ipv4Addr, port: u16) {
        lock(&self.listening).insert((host, port));
    }

    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Highest number of probes observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        lock(&self.stats).max_in_flight
    }

    pub fn probe_count(&self) -> usize {
        lock(&self.stats).probes
    }
}

#[async_trait]
impl Prober for SimulatedProber {
    async fn probe(&self, host: Ipv4Addr, port: u16, timeout: Duration) -> bool {
        {
            let mut stats = lock(&self.stats);
            stats.probes += 1;
            stats.in_flight += 1;
            stats.max_in_flight = stats.max_in_flight.max(stats.in_flight);
        }

        let listening = lock(&self.listening).contains(&(host, port));
        let latency = *lock(&self.latency);
        let reachable = listening && latency < timeout;
        tokio::time::sleep(if reachable { latency } else { timeout }).await;

        lock(&self.stats).in_flight -= 1;
        reachable
    }
}

/// A small simulated plant: one local interface and a few devices behind it.
#[derive(Debug)]
pub struct SimulatedLab {
    pub connector: Arc<SimulatedConnector>,
    pub prober: Arc<SimulatedProber>,
    pub interfaces: StaticInterfaces,
    pub devices: Vec<(Ipv4Addr, SimulatedDevice)>,
}

impl SimulatedLab {
    /// Devices at `10.0.0.5` and `10.0.0.7` on port `port`, seen from `10.0.0.10`.
    pub fn new(port: u16) -> Self {
        let connector = Arc::new(SimulatedConnector::new());
        let prober = Arc::new(SimulatedProber::new());
        prober.set_latency(Duration::from_millis(5));

        let mut devices = Vec::new();
        for (last, seed) in [(5u8, 100u16), (7, 200)] {
            let host = Ipv4Addr::new(10, 0, 0, last);
            let device = SimulatedDevice::new();
            device.set_coils(0, &[true, false, true, false, false, true, false, true]);
            device.set_discrete_inputs(0, &[false, true, true, false, true, false, false, true]);
            let words: Vec<Word> = (0..16).map(|i| seed + i).collect();
            device.set_holding_registers(0, &words);
            device.set_input_registers(0, &words);

            connector.attach(&host.to_string(), port, device.clone());
            prober.listen(host, port);
            devices.push((host, device));
        }

        Self {
            connector,
            prober,
            interfaces: StaticInterfaces::new(vec![Ipv4Addr::new(10, 0, 0, 10)]),
            devices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_reject_unset_addresses() {
        let mut registers = Registers::default();
        registers.insert(10, &[1u16, 2, 3]);

        assert_eq!(registers.read(10, 3), Ok(vec![1, 2, 3]));
        assert_eq!(registers.read(9, 2), Err(Exception::IllegalDataAddress));
        assert_eq!(registers.write(12, &[7, 8]), Err(Exception::IllegalDataAddress));
        assert_eq!(registers.read(12, 1), Ok(vec![3]));
        assert_eq!(registers.write(11, &[9]), Ok(()));
        assert_eq!(registers.read(10, 3), Ok(vec![1, 9, 3]));
    }

    #[test]
    fn data_store_routes_requests() {
        let mut store = DataStore::default();
        store.coils.insert(0, &[false, true]);
        store.input_registers.insert(3, &[42]);

        assert_eq!(
            store.service_call(Request::ReadCoils(0, 2)),
            Ok(Response::Bits(vec![false, true]))
        );
        assert_eq!(
            store.service_call(Request::ReadInputRegisters(3, 1)),
            Ok(Response::Words(vec![42]))
        );
        assert_eq!(
            store.service_call(Request::WriteSingleCoil(0, true)),
            Ok(Response::Written)
        );
        assert_eq!(
            store.service_call(Request::WriteSingleRegister(0, 1)),
            Err(Exception::IllegalDataAddress)
        );
    }

    #[tokio::test]
    async fn offline_device_refuses_dial() {
        let connector = SimulatedConnector::new();
        let device = SimulatedDevice::new();
        connector.attach("plc", 502, device.clone());
        let id = EndpointIdentity::new("plc", 502, 1).unwrap();

        device.set_offline(true);
        assert!(connector.dial(&id).await.is_err());
        device.set_offline(false);
        assert!(connector.dial(&id).await.is_ok());
        assert_eq!(connector.dial_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn prober_times_out_silent_hosts() {
        let prober = SimulatedProber::new();
        prober.listen(Ipv4Addr::new(10, 0, 0, 5), 502);
        let timeout = Duration::from_millis(100);

        assert!(prober.probe(Ipv4Addr::new(10, 0, 0, 5), 502, timeout).await);
        assert!(!prober.probe(Ipv4Addr::new(10, 0, 0, 5), 503, timeout).await);
        assert!(!prober.probe(Ipv4Addr::new(10, 0, 0, 6), 502, timeout).await);
        assert_eq!(prober.probe_count(), 3);
    }
}
