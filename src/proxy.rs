use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

use tokio::net::{TcpListener, TcpStream};
use tokio_modbus::ExceptionCode;
use tokio_modbus::prelude::{Request, Response};
use tokio_modbus::server::Service;
use tokio_modbus::server::tcp::{Server, accept_tcp_connection};
use tracing::{error, info, warn};

use crate::error::Error;
use crate::upstream::Upstream;

/// Interception point for requests travelling from the controller to the charger.
pub trait PduHook: Clone + Send + Sync + 'static {
    /// Called before a request is forwarded and may rewrite it.
    /// `None` refuses the request, the controller then gets a server failure.
    fn on_request(
        &self,
        request: Request<'static>,
    ) -> impl Future<Output = Option<Request<'static>>> + Send;

    /// Called with the charger's answer to a forwarded request.
    fn on_response(
        &self,
        request: Request<'static>,
        response: Response,
    ) -> impl Future<Output = ()> + Send;
}

/// Modbus TCP server relaying every request from the controller to the charger.
#[derive(Debug)]
pub struct ProxyServer<H> {
    upstream: Upstream,
    hook: H,
}

impl<H: PduHook> ProxyServer<H> {
    pub fn new(upstream: Upstream, hook: H) -> Self {
        Self { upstream, hook }
    }

    /// Binds `bind_addr` and serves until the process stops.
    pub async fn listen(self, bind_addr: SocketAddr) -> io::Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> io::Result<()> {
        info!("serving on {}", listener.local_addr()?);

        let server = Server::new(listener);
        let service = ProxyService {
            upstream: self.upstream,
            hook: self.hook,
        };
        let on_connected = |stream: TcpStream, socket_addr: SocketAddr| {
            let service = service.clone();
            async move {
                info!("controller connected from {}", socket_addr);
                accept_tcp_connection(stream, socket_addr, move |_| Ok(Some(service.clone())))
            }
        };
        let on_process_error = |err: io::Error| {
            warn!("controller connection closed: {}", err);
        };
        server.serve(&on_connected, on_process_error).await
    }
}

#[derive(Debug, Clone)]
struct ProxyService<H> {
    upstream: Upstream,
    hook: H,
}

impl<H: PduHook> Service for ProxyService<H> {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = Pin<Box<dyn Future<Output = Result<Response, ExceptionCode>> + Send>>;

    fn call(&self, request: Self::Request) -> Self::Future {
        let upstream = self.upstream.clone();
        let hook = self.hook.clone();
        Box::pin(async move {
            let Some(request) = hook.on_request(request).await else {
                return Err(ExceptionCode::ServerDeviceFailure);
            };

            match upstream.call(request.clone()).await {
                Ok(response) => {
                    hook.on_response(request, response.clone()).await;
                    Ok(response)
                }
                Err(Error::Exception(code)) => {
                    warn!("charger rejected {:?} with {:?}", request, code);
                    Err(code)
                }
                Err(err) => {
                    error!("forwarding {:?} failed: {}", request, err);
                    Err(ExceptionCode::GatewayTargetDevice)
                }
            }
        })
    }
}
