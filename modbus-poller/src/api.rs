//! Operation surface for presentation layers.
//!
//! Every call takes raw parameters, validates them, and only then touches the
//! network. [`ApiHandle`] stands for an environment that may lack a Modbus
//! transport; an empty handle fails every call with [`Error::Unavailable`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::codec::{Flag, Word};
use crate::config::PollerConfig;
use crate::connection::ConnectionManager;
use crate::discovery::{ScanResult, Scanner};
use crate::error::{Error, Result};
use crate::identity::DeviceKey;
use crate::request::{
    ConnectParams, DataKind, ReadParams, ScanParams, WriteCoilParams, WriteRegisterParams,
};
use crate::transport::TcpConnector;

/// Answer to a successful connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connected {
    pub ok: bool,
    pub device: DeviceKey,
}

#[async_trait]
pub trait ModbusApi: Send + Sync {
    async fn connect(&self, params: ConnectParams) -> Result<Connected>;

    async fn read_coils(&self, params: ReadParams) -> Result<Vec<Flag>>;

    async fn read_discrete_inputs(&self, params: ReadParams) -> Result<Vec<Flag>>;

    async fn read_holding_registers(&self, params: ReadParams) -> Result<Vec<Word>>;

    async fn read_input_registers(&self, params: ReadParams) -> Result<Vec<Word>>;

    async fn write_coil(&self, params: WriteCoilParams) -> Result<bool>;

    async fn write_register(&self, params: WriteRegisterParams) -> Result<bool>;

    async fn scan(&self, params: ScanParams) -> Result<Vec<ScanResult>>;
}

/// [`ModbusApi`] served in-process.
#[derive(Debug, Clone)]
pub struct LocalApi {
    manager: Arc<ConnectionManager>,
    scanner: Scanner,
}

impl LocalApi {
    pub fn new(manager: Arc<ConnectionManager>, scanner: Scanner) -> Self {
        Self { manager, scanner }
    }

    /// API over real Modbus TCP sockets and the host's interfaces.
    pub fn tcp(config: &PollerConfig) -> Self {
        let manager = ConnectionManager::new(Arc::new(TcpConnector), config.connection.clone());
        Self::new(Arc::new(manager), Scanner::system(config.discovery.clone()))
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }
}

#[async_trait]
impl ModbusApi for LocalApi {
    async fn connect(&self, params: ConnectParams) -> Result<Connected> {
        let id = params.validate()?;
        let device = self.manager.connect(&id).await?;
        Ok(Connected { ok: true, device })
    }

    async fn read_coils(&self, params: ReadParams) -> Result<Vec<Flag>> {
        let req = params.validate(DataKind::Coils)?;
        let values = self
            .manager
            .read_coils(&req.id, req.range.address(), req.range.length())
            .await?;
        Ok(values)
    }

    async fn read_discrete_inputs(&self, params: ReadParams) -> Result<Vec<Flag>> {
        let req = params.validate(DataKind::DiscreteInputs)?;
        let values = self
            .manager
            .read_discrete_inputs(&req.id, req.range.address(), req.range.length())
            .await?;
        Ok(values)
    }

    async fn read_holding_registers(&self, params: ReadParams) -> Result<Vec<Word>> {
        let req = params.validate(DataKind::HoldingRegisters)?;
        let values = self
            .manager
            .read_holding_registers(&req.id, req.range.address(), req.range.length())
            .await?;
        Ok(values)
    }

    async fn read_input_registers(&self, params: ReadParams) -> Result<Vec<Word>> {
        let req = params.validate(DataKind::InputRegisters)?;
        let values = self
            .manager
            .read_input_registers(&req.id, req.range.address(), req.range.length())
            .await?;
        Ok(values)
    }

    async fn write_coil(&self, params: WriteCoilParams) -> Result<bool> {
        let req = params.validate()?;
        self.manager
            .write_coil(&req.id, req.address, req.state)
            .await?;
        info!(device = %req.id, address = req.address, state = req.state, "coil written");
        Ok(true)
    }

    async fn write_register(&self, params: WriteRegisterParams) -> Result<bool> {
        let req = params.validate()?;
        self.manager
            .write_register(&req.id, req.address, req.value)
            .await?;
        info!(device = %req.id, address = req.address, value = req.value, "register written");
        Ok(true)
    }

    async fn scan(&self, params: ScanParams) -> Result<Vec<ScanResult>> {
        Ok(self.scanner.scan(params).await?)
    }
}

/// Possibly absent [`ModbusApi`].
#[derive(Clone, Default)]
pub struct ApiHandle(Option<Arc<dyn ModbusApi>>);

impl std::fmt::Debug for ApiHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ApiHandle")
            .field(&self.is_available())
            .finish()
    }
}

impl ApiHandle {
    pub fn available(api: Arc<dyn ModbusApi>) -> Self {
        Self(Some(api))
    }

    pub fn unavailable() -> Self {
        Self(None)
    }

    pub fn is_available(&self) -> bool {
        self.0.is_some()
    }

    fn api(&self) -> Result<&dyn ModbusApi> {
        self.0.as_deref().ok_or(Error::Unavailable)
    }
}

#[async_trait]
impl ModbusApi for ApiHandle {
    async fn connect(&self, params: ConnectParams) -> Result<Connected> {
        self.api()?.connect(params).await
    }

    async fn read_coils(&self, params: ReadParams) -> Result<Vec<Flag>> {
        self.api()?.read_coils(params).await
    }

    async fn read_discrete_inputs(&self, params: ReadParams) -> Result<Vec<Flag>> {
        self.api()?.read_discrete_inputs(params).await
    }

    async fn read_holding_registers(&self, params: ReadParams) -> Result<Vec<Word>> {
        self.api()?.read_holding_registers(params).await
    }

    async fn read_input_registers(&self, params: ReadParams) -> Result<Vec<Word>> {
        self.api()?.read_input_registers(params).await
    }

    async fn write_coil(&self, params: WriteCoilParams) -> Result<bool> {
        self.api()?.write_coil(params).await
    }

    async fn write_register(&self, params: WriteRegisterParams) -> Result<bool> {
        self.api()?.write_register(params).await
    }

    async fn scan(&self, params: ScanParams) -> Result<Vec<ScanResult>> {
        self.api()?.scan(params).await
    }
}
