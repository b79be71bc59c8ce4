//! Raw operation parameters and their validated forms.
//!
//! Raw parameters arrive from a presentation layer with wide integer fields and
//! optional defaults. `validate` turns them into typed requests or a
//! [`ValidationError`]; nothing reaches the network before that.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{Address, Quantity, Word, MAX_BITS_PER_READ, MAX_WORDS_PER_READ};
use crate::error::ValidationError;
use crate::identity::{EndpointIdentity, DEFAULT_PORT, DEFAULT_UNIT_ID, MAX_UNIT_ID, MIN_UNIT_ID};

/// Bounds of the per-host discovery timeout, in milliseconds.
pub const SCAN_TIMEOUT_RANGE_MS: (i64, i64) = (100, 5000);

/// Readable Modbus data spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    DiscreteInputs,
    Coils,
    InputRegisters,
    HoldingRegisters,
}

impl DataKind {
    pub fn is_bits(self) -> bool {
        matches!(self, Self::DiscreteInputs | Self::Coils)
    }

    /// Largest read length accepted for this space.
    pub fn max_read_len(self) -> Quantity {
        if self.is_bits() {
            MAX_BITS_PER_READ
        } else {
            MAX_WORDS_PER_READ
        }
    }
}

impl std::fmt::Display for DataKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DiscreteInputs => "discrete inputs",
            Self::Coils => "coils",
            Self::InputRegisters => "input registers",
            Self::HoldingRegisters => "holding registers",
        };
        f.write_str(s)
    }
}

fn default_port() -> i64 {
    DEFAULT_PORT.into()
}

fn default_unit_id() -> i64 {
    DEFAULT_UNIT_ID.into()
}

fn check_range(field: &'static str, value: i64, min: i64, max: i64) -> Result<i64, ValidationError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ValidationError::out_of_range(field, value, min, max))
    }
}

fn address(value: i64) -> Result<Address, ValidationError> {
    let value = check_range("address", value, 0, Address::MAX.into())?;
    Ok(value as Address)
}

/// Endpoint part shared by every operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: i64,
    #[serde(default = "default_unit_id")]
    pub unit_id: i64,
}

impl ConnectParams {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            unit_id: default_unit_id(),
        }
    }

    pub fn validate(&self) -> Result<EndpointIdentity, ValidationError> {
        let port = check_range("port", self.port, 1, u16::MAX.into())?;
        let unit_id = check_range("unit_id", self.unit_id, MIN_UNIT_ID.into(), MAX_UNIT_ID.into())?;
        EndpointIdentity::new(self.host.clone(), port as u16, unit_id as u8)
    }
}

impl From<&EndpointIdentity> for ConnectParams {
    fn from(id: &EndpointIdentity) -> Self {
        Self {
            host: id.host().to_string(),
            port: id.port().into(),
            unit_id: id.unit_id().into(),
        }
    }
}

/// Raw block read parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadParams {
    #[serde(flatten)]
    pub endpoint: ConnectParams,
    pub address: i64,
    pub length: i64,
}

/// A block read that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub id: EndpointIdentity,
    pub range: ReadRange,
}

impl ReadParams {
    pub fn validate(&self, kind: DataKind) -> Result<ReadRequest, ValidationError> {
        let id = self.endpoint.validate()?;
        let range = ReadRange::new(kind, self.address, self.length)?;
        Ok(ReadRequest { id, range })
    }
}

/// Address and length of a block read, checked against the per-kind cap.
///
/// Only built through [`ReadRange::new`] or [`ReadRange::single`]. A range
/// checked for one kind may still exceed the cap of another, so consumers
/// holding a range for a different kind re-run [`ReadRange::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ReadRange {
    address: Address,
    length: Quantity,
}

impl ReadRange {
    pub fn new(kind: DataKind, address_value: i64, length: i64) -> Result<Self, ValidationError> {
        let address = address(address_value)?;
        let length = check_range("length", length, 1, kind.max_read_len().into())? as Quantity;
        if u32::from(address) + u32::from(length) > u32::from(Address::MAX) + 1 {
            return Err(ValidationError::AddressOverflow { address, length });
        }
        Ok(Self { address, length })
    }

    /// One item at `address`; valid for every kind.
    pub const fn single(address: Address) -> Self {
        Self { address, length: 1 }
    }

    /// Re-validate against the cap of `kind`.
    pub fn check(self, kind: DataKind) -> Result<Self, ValidationError> {
        Self::new(kind, self.address.into(), self.length.into())
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn length(&self) -> Quantity {
        self.length
    }
}

/// Raw single coil write parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCoilParams {
    #[serde(flatten)]
    pub endpoint: ConnectParams,
    pub address: i64,
    pub state: bool,
}

/// A single coil write that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCoilRequest {
    pub id: EndpointIdentity,
    pub address: Address,
    pub state: bool,
}

impl WriteCoilParams {
    pub fn validate(&self) -> Result<WriteCoilRequest, ValidationError> {
        Ok(WriteCoilRequest {
            id: self.endpoint.validate()?,
            address: address(self.address)?,
            state: self.state,
        })
    }
}

/// Raw single register write parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRegisterParams {
    #[serde(flatten)]
    pub endpoint: ConnectParams,
    pub address: i64,
    pub value: i64,
}

/// A single register write that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRegisterRequest {
    pub id: EndpointIdentity,
    pub address: Address,
    pub value: Word,
}

impl WriteRegisterParams {
    pub fn validate(&self) -> Result<WriteRegisterRequest, ValidationError> {
        let id = self.endpoint.validate()?;
        let address = address(self.address)?;
        let value = check_range("value", self.value, 0, Word::MAX.into())? as Word;
        Ok(WriteRegisterRequest { id, address, value })
    }
}

/// Raw discovery parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanParams {
    /// Per-host probe timeout; the scanner's configured default when absent.
    #[serde(default)]
    pub timeout_ms: Option<i64>,
}

impl ScanParams {
    pub fn with_timeout_ms(timeout_ms: i64) -> Self {
        Self {
            timeout_ms: Some(timeout_ms),
        }
    }

    /// Per-host probe timeout, falling back to `default`.
    pub fn validate(&self, default: Duration) -> Result<Duration, ValidationError> {
        let (min, max) = SCAN_TIMEOUT_RANGE_MS;
        let requested = self
            .timeout_ms
            .unwrap_or_else(|| i64::try_from(default.as_millis()).unwrap_or(i64::MAX));
        let ms = check_range("timeout_ms", requested, min, max)?;
        Ok(Duration::from_millis(ms as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(length: i64) -> ReadParams {
        ReadParams {
            endpoint: ConnectParams::new("10.0.0.2"),
            address: 0,
            length,
        }
    }

    fn write_register(value: i64) -> WriteRegisterParams {
        WriteRegisterParams {
            endpoint: ConnectParams::new("10.0.0.2"),
            address: 10,
            value,
        }
    }

    #[test]
    fn coil_read_length_is_capped_at_200() {
        assert!(read(200).validate(DataKind::Coils).is_ok());
        assert_eq!(
            read(201).validate(DataKind::Coils),
            Err(ValidationError::out_of_range("length", 201, 1, 200))
        );
        assert!(read(0).validate(DataKind::DiscreteInputs).is_err());
    }

    #[test]
    fn register_read_length_is_capped_at_125() {
        assert!(read(125).validate(DataKind::HoldingRegisters).is_ok());
        assert!(read(126).validate(DataKind::HoldingRegisters).is_err());
        assert!(read(126).validate(DataKind::InputRegisters).is_err());
    }

    #[test]
    fn read_range_stays_inside_address_space() {
        assert!(ReadRange::new(DataKind::HoldingRegisters, 65535, 1).is_ok());
        assert_eq!(
            ReadRange::new(DataKind::HoldingRegisters, 65535, 2),
            Err(ValidationError::AddressOverflow {
                address: 65535,
                length: 2
            })
        );
        assert!(ReadRange::new(DataKind::Coils, -1, 1).is_err());
        assert!(ReadRange::new(DataKind::Coils, 65536, 1).is_err());
    }

    #[test]
    fn register_value_is_sixteen_bits() {
        assert_eq!(write_register(65535).validate().unwrap().value, 65535);
        assert!(write_register(65536).validate().is_err());
        assert!(write_register(-1).validate().is_err());
    }

    #[test]
    fn connect_params_apply_defaults() {
        let params: ConnectParams = serde_json::from_str(r#"{"host":"10.1.1.1"}"#).unwrap();
        let id = params.validate().unwrap();
        assert_eq!((id.port(), id.unit_id()), (502, 1));

        let params: ConnectParams =
            serde_json::from_str(r#"{"host":"10.1.1.1","port":1502,"unitId":9}"#).unwrap();
        assert_eq!(params.validate().unwrap().key().as_str(), "10.1.1.1:1502:9");
    }

    #[test]
    fn connect_params_reject_out_of_range() {
        let mut params = ConnectParams::new("10.1.1.1");
        params.unit_id = 248;
        assert!(params.validate().is_err());
        params.unit_id = 1;
        params.port = 0;
        assert!(params.validate().is_err());
        params.port = 70000;
        assert!(params.validate().is_err());
    }

    #[test]
    fn read_params_deserialize_flat() {
        let params: ReadParams =
            serde_json::from_str(r#"{"host":"plc","address":4,"length":8}"#).unwrap();
        let req = params.validate(DataKind::Coils).unwrap();
        assert_eq!((req.range.address(), req.range.length()), (4, 8));
        assert_eq!(req.id.key().as_str(), "plc:502:1");
    }

    #[test]
    fn coil_range_is_rechecked_for_registers() {
        let coils = ReadRange::new(DataKind::Coils, 0, 200).unwrap();
        assert_eq!(coils.check(DataKind::DiscreteInputs), Ok(coils));
        assert_eq!(
            coils.check(DataKind::HoldingRegisters),
            Err(ValidationError::out_of_range("length", 200, 1, 125))
        );
        assert!(ReadRange::single(65535).check(DataKind::InputRegisters).is_ok());
    }

    #[test]
    fn scan_timeout_bounds() {
        let default = Duration::from_millis(500);
        assert_eq!(ScanParams::default().validate(default).unwrap(), default);
        assert!(ScanParams::with_timeout_ms(99).validate(default).is_err());
        assert!(ScanParams::with_timeout_ms(100).validate(default).is_ok());
        assert!(ScanParams::with_timeout_ms(5000).validate(default).is_ok());
        assert!(ScanParams::with_timeout_ms(5001).validate(default).is_err());
    }

    #[test]
    fn scan_timeout_falls_back_to_default() {
        let params: ScanParams = serde_json::from_str("{}").unwrap();
        assert_eq!(
            params.validate(Duration::from_millis(1500)).unwrap(),
            Duration::from_millis(1500)
        );
        assert!(params.validate(Duration::from_millis(20)).is_err());

        let params: ScanParams = serde_json::from_str(r#"{"timeoutMs":300}"#).unwrap();
        assert_eq!(
            params.validate(Duration::from_millis(1500)).unwrap(),
            Duration::from_millis(300)
        );
    }
}
