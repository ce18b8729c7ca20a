//! gRPC server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::tollgate::limiter::v1::rate_limiter_server::RateLimiterServer;
use super::service::RateLimiterServiceImpl;
use crate::error::{Result, TollgateError};
use crate::ratelimit::LimiterBackend;

/// gRPC server for the limiter service.
pub struct GrpcServer<B: LimiterBackend + 'static> {
    /// Address to bind to
    addr: SocketAddr,
    /// The backend serving requests
    backend: Arc<B>,
}

impl<B: LimiterBackend + 'static> GrpcServer<B> {
    pub fn new(addr: SocketAddr, backend: Arc<B>) -> Self {
        Self { addr, backend }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn router(self) -> RateLimiterServer<RateLimiterServiceImpl<B>> {
        RateLimiterServer::new(RateLimiterServiceImpl::new(self.backend))
    }

    /// Start the gRPC server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        let addr = self.addr;
        info!(addr = %addr, "Starting gRPC server for RateLimiter");

        Server::builder()
            .add_service(self.router())
            .serve(addr)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                TollgateError::Transport(e)
            })
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = self.addr;
        info!(
            addr = %addr,
            "Starting gRPC server for RateLimiter with graceful shutdown"
        );

        Server::builder()
            .add_service(self.router())
            .serve_with_shutdown(addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                TollgateError::Transport(e)
            })
    }

    /// Serve on an already-bound listener until `signal` resolves.
    ///
    /// The configured address is ignored; useful for binding port 0.
    pub async fn serve_with_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let local = listener.local_addr()?;
        info!(addr = %local, "Starting gRPC server for RateLimiter on bound listener");

        Server::builder()
            .add_service(self.router())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                TollgateError::Transport(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::LimiterService;
    use crate::store::MemoryStore;

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8081".parse().unwrap();
        let backend = Arc::new(LimiterService::new(Arc::new(MemoryStore::new())));
        let server = GrpcServer::new(addr, backend);
        assert_eq!(server.addr(), addr);
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let backend = Arc::new(LimiterService::new(Arc::new(MemoryStore::new())));

        let result = GrpcServer::new(addr, backend)
            .serve_with_listener(listener, async {})
            .await;
        assert!(result.is_ok());
    }
}
