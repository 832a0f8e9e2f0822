use std::net::SocketAddr;
use std::time::Duration;

use tokio_modbus::ExceptionCode;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot reach charger at {addr}: {source}")]
    StartupConnection {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("reconnecting to charger at {addr} failed: {source}")]
    Connection {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("forwarding to charger failed: {0}")]
    Forwarding(#[from] tokio_modbus::Error),
    #[error("charger did not answer within {0:?}")]
    Timeout(Duration),
    #[error("charger answered with exception {0:?}")]
    Exception(ExceptionCode),
    #[error("pushing setpoint {value}W failed: {source}")]
    ProactivePush {
        value: i16,
        #[source]
        source: Box<Error>,
    },
    #[error("load balancer is not running")]
    Stopped,
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
