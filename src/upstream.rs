use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_modbus::Slave;
use tokio_modbus::client::{Client, Context, tcp};
use tokio_modbus::prelude::{Request, Response};
use tracing::{debug, error, info, warn};

use crate::codec::decode_signed_power;
use crate::error::{Error, Result};
use crate::interceptor::SetpointWriter;
use crate::registers::RegisterAddress;

/// The one persistent Modbus TCP connection to the charger, shared by all forwarded requests.
///
/// Requests are sent one at a time. After a transport failure the connection is dropped and
/// re-established by the next request.
#[derive(Clone)]
pub struct Upstream {
    socket_addr: SocketAddr,
    slave: Slave,
    timeout: Duration,
    ctx: Arc<Mutex<Option<Context>>>,
}

impl fmt::Debug for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upstream")
            .field("socket_addr", &self.socket_addr)
            .field("slave", &self.slave)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Upstream {
    /// Opens the charger connection. Failing here is fatal for the proxy.
    pub async fn connect(socket_addr: SocketAddr, unit_id: u8, timeout: Duration) -> Result<Self> {
        let slave = Slave(unit_id);
        let ctx = open(socket_addr, slave, timeout)
            .await
            .map_err(|source| Error::StartupConnection {
                addr: socket_addr,
                source,
            })?;
        info!("TCP client on {}", socket_addr);

        Ok(Self {
            socket_addr,
            slave,
            timeout,
            ctx: Arc::new(Mutex::new(Some(ctx))),
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    /// Sends `request` to the charger and waits for its response. No retry.
    pub async fn call(&self, request: Request<'static>) -> Result<Response> {
        let mut guard = self.ctx.lock().await;
        let mut ctx = match guard.take() {
            Some(ctx) => ctx,
            None => {
                info!("reconnecting to charger at {}", self.socket_addr);
                open(self.socket_addr, self.slave, self.timeout)
                    .await
                    .map_err(|source| Error::Connection {
                        addr: self.socket_addr,
                        source,
                    })?
            }
        };

        match tokio::time::timeout(self.timeout, ctx.call(request)).await {
            Err(_) => {
                warn!("charger at {} timed out, dropping connection", self.socket_addr);
                Err(Error::Timeout(self.timeout))
            }
            Ok(Err(err)) => {
                warn!("charger at {} failed: {}, dropping connection", self.socket_addr, err);
                Err(err.into())
            }
            Ok(Ok(response)) => {
                *guard = Some(ctx);
                response.map_err(Error::Exception)
            }
        }
    }
}

async fn open(socket_addr: SocketAddr, slave: Slave, timeout: Duration) -> io::Result<Context> {
    match tokio::time::timeout(timeout, tcp::connect_slave(socket_addr, slave)).await {
        Ok(ctx) => ctx,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect timed out after {timeout:?}"),
        )),
    }
}

impl SetpointWriter for Upstream {
    fn write_setpoint(&self, raw: u16) {
        let upstream = self.clone();
        tokio::spawn(async move {
            let request =
                Request::WriteSingleRegister(RegisterAddress::PowerSetpoint.addr(), raw);
            match upstream.call(request).await {
                Ok(response) => debug!("setpoint pushed: {:?}", response),
                Err(source) => {
                    let err = Error::ProactivePush {
                        value: decode_signed_power(raw),
                        source: Box::new(source),
                    };
                    error!("{}", err);
                }
            }
        });
    }
}
