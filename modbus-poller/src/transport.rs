use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio_modbus::client::{tcp, Context, Reader, Writer};
use tokio_modbus::slave::Slave;

use crate::codec::{Address, Quantity, Word};
use crate::error::TransportError;
use crate::identity::EndpointIdentity;

/// One Modbus request as understood by a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    ReadCoils(Address, Quantity),
    ReadDiscreteInputs(Address, Quantity),
    ReadHoldingRegisters(Address, Quantity),
    ReadInputRegisters(Address, Quantity),
    WriteSingleCoil(Address, bool),
    WriteSingleRegister(Address, Word),
}

/// Decoded answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Bits(Vec<bool>),
    Words(Vec<Word>),
    Written,
}

impl Response {
    pub fn into_bits(self) -> Result<Vec<bool>, TransportError> {
        match self {
            Self::Bits(bits) => Ok(bits),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }

    pub fn into_words(self) -> Result<Vec<Word>, TransportError> {
        match self {
            Self::Words(words) => Ok(words),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }

    pub fn into_written(self) -> Result<(), TransportError> {
        match self {
            Self::Written => Ok(()),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }
}

#[async_trait]
/// An open, unit-bound transport handle able to serve one request at a time.
pub trait Session: Send {
    async fn call(&mut self, request: Request) -> Result<Response, TransportError>;
}

#[async_trait]
/// Opens sessions to Modbus endpoints.
///
/// Dialing is not time-bounded here; the caller owns the timeout and drops the
/// future to abandon an attempt.
pub trait Connector: Send + Sync {
    async fn dial(&self, id: &EndpointIdentity) -> io::Result<Box<dyn Session>>;
}

/// Modbus TCP [`Connector`] backed by [tokio-modbus](https://github.com/slowtec/tokio-modbus).
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn dial(&self, id: &EndpointIdentity) -> io::Result<Box<dyn Session>> {
        let socket_addr = resolve(id).await?;
        let context = tcp::connect_slave(socket_addr, Slave(id.unit_id())).await?;
        Ok(Box::new(TcpSession(context)))
    }
}

async fn resolve(id: &EndpointIdentity) -> io::Result<SocketAddr> {
    tokio::net::lookup_host((id.host(), id.port()))
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for {}", id.host()),
            )
        })
}

/// [`Session`] over a tokio-modbus client context.
pub struct TcpSession(Context);

fn flatten<T>(result: tokio_modbus::Result<T>) -> Result<T, TransportError> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(exc)) => Err(TransportError::Exception(exc)),
        Err(err) => Err(TransportError::Client(err)),
    }
}

#[async_trait]
impl Session for TcpSession {
    async fn call(&mut self, request: Request) -> Result<Response, TransportError> {
        let client = &mut self.0;
        let response = match request {
            Request::ReadCoils(addr, cnt) => {
                Response::Bits(flatten(client.read_coils(addr, cnt).await)?)
            }
            Request::ReadDiscreteInputs(addr, cnt) => {
                Response::Bits(flatten(client.read_discrete_inputs(addr, cnt).await)?)
            }
            Request::ReadHoldingRegisters(addr, cnt) => {
                Response::Words(flatten(client.read_holding_registers(addr, cnt).await)?)
            }
            Request::ReadInputRegisters(addr, cnt) => {
                Response::Words(flatten(client.read_input_registers(addr, cnt).await)?)
            }
            Request::WriteSingleCoil(addr, coil) => {
                flatten(client.write_single_coil(addr, coil).await)?;
                Response::Written
            }
            Request::WriteSingleRegister(addr, word) => {
                flatten(client.write_single_register(addr, word).await)?;
                Response::Written
            }
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_shape_is_checked() {
        assert_eq!(Response::Bits(vec![true]).into_bits().unwrap(), vec![true]);
        assert!(matches!(
            Response::Written.into_words(),
            Err(TransportError::UnexpectedResponse)
        ));
        assert!(Response::Words(vec![1]).into_written().is_err());
    }

    #[test]
    fn flatten_separates_exceptions() {
        let ok: tokio_modbus::Result<u16> = Ok(Ok(7));
        assert_eq!(flatten(ok).unwrap(), 7);

        let exc: tokio_modbus::Result<u16> = Ok(Err(tokio_modbus::Exception::IllegalFunction));
        assert!(matches!(flatten(exc), Err(TransportError::Exception(_))));
    }

    #[tokio::test]
    async fn dial_to_closed_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let id = EndpointIdentity::new("127.0.0.1", port, 1).unwrap();
        assert!(TcpConnector.dial(&id).await.is_err());
    }
}
