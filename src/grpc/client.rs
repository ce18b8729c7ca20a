//! Remote limiter backend over gRPC.

use async_trait::async_trait;
use tonic::transport::Channel;
use tracing::debug;

use super::convert::max_wait_to_proto;
use super::proto::tollgate::limiter::v1::{
    rate_limiter_client::RateLimiterClient, CancelReservationRequest, GetStateRequest,
    GetTokensRequest, ReserveNRequest, SetRateRequest,
};
use crate::error::Result;
use crate::ratelimit::{Limit, LimiterBackend, LimiterState, MaxWait, Reservation};

/// A [`LimiterBackend`] that forwards every operation to a remote tollgate server.
///
/// Plugging this into [`crate::ratelimit::Limiter`] gives callers `wait_n`
/// against a shared, remote limiter.
#[derive(Debug, Clone)]
pub struct GrpcLimiterBackend {
    client: RateLimiterClient<Channel>,
}

impl GrpcLimiterBackend {
    /// Connect to a server, e.g. `http://127.0.0.1:8081`.
    pub async fn connect(endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        debug!(endpoint = %endpoint, "Connecting to limiter server");
        let client = RateLimiterClient::connect(endpoint).await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl LimiterBackend for GrpcLimiterBackend {
    async fn state(&self, key: &str) -> Result<LimiterState> {
        let response = self
            .client
            .clone()
            .get_state(GetStateRequest {
                key: key.to_string(),
            })
            .await?;
        response.into_inner().try_into()
    }

    async fn tokens(&self, key: &str) -> Result<f64> {
        let response = self
            .client
            .clone()
            .get_tokens(GetTokensRequest {
                key: key.to_string(),
            })
            .await?;
        Ok(response.into_inner().tokens)
    }

    async fn reserve_n(&self, key: &str, n: u32, max_wait: MaxWait) -> Result<Reservation> {
        let response = self
            .client
            .clone()
            .reserve_n(ReserveNRequest {
                key: key.to_string(),
                n,
                max_wait: max_wait_to_proto(max_wait),
            })
            .await?;
        response.into_inner().try_into()
    }

    async fn set_rate(&self, key: &str, limit: Option<Limit>, burst: Option<u32>) -> Result<()> {
        self.client
            .clone()
            .set_rate(SetRateRequest {
                key: key.to_string(),
                limit: limit.map(Into::into),
                burst,
            })
            .await?;
        Ok(())
    }

    async fn cancel_reservation(&self, key: &str, reservation: &Reservation) -> Result<()> {
        self.client
            .clone()
            .cancel_reservation(CancelReservationRequest {
                key: key.to_string(),
                reservation: Some(reservation.into()),
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TollgateError;
    use crate::grpc::GrpcServer;
    use crate::ratelimit::{Limiter, LimiterService};
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    async fn start_server() -> (String, oneshot::Sender<()>, tokio::task::JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let backend = Arc::new(LimiterService::new(Arc::new(MemoryStore::new())));
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(GrpcServer::new(addr, backend).serve_with_listener(
            listener,
            async move {
                rx.await.ok();
            },
        ));
        (format!("http://{}", addr), tx, handle)
    }

    #[tokio::test]
    async fn test_remote_round_trip() {
        let (endpoint, shutdown, handle) = start_server().await;
        let backend = GrpcLimiterBackend::connect(endpoint).await.unwrap();

        backend
            .set_rate("remote", Some(Limit::PerSecond(1.0)), Some(3))
            .await
            .unwrap();
        let state = backend.state("remote").await.unwrap();
        assert_eq!(state.limit, Limit::PerSecond(1.0));
        assert_eq!(state.burst, 3);

        let mut last = None;
        for _ in 0..4 {
            let r = backend
                .reserve_n("remote", 1, MaxWait::Unbounded)
                .await
                .unwrap();
            assert!(r.ok);
            last = Some(r);
        }
        let fourth = last.unwrap();
        assert!(fourth.time_to_act > fourth.creation_time);

        backend.cancel_reservation("remote", &fourth).await.unwrap();
        let tokens = backend.tokens("remote").await.unwrap();
        assert!((0.0..1.0).contains(&tokens), "tokens = {}", tokens);

        shutdown.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_remote_invalid_argument() {
        let (endpoint, shutdown, handle) = start_server().await;
        let backend = GrpcLimiterBackend::connect(endpoint).await.unwrap();

        let err = backend.tokens("").await.unwrap_err();
        assert!(matches!(err, TollgateError::InvalidArgument(_)));

        let err = backend
            .set_rate("remote", Some(Limit::PerSecond(f64::INFINITY)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TollgateError::InvalidArgument(_)));

        shutdown.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_limiter_handle_over_grpc() {
        let (endpoint, shutdown, handle) = start_server().await;
        let backend = GrpcLimiterBackend::connect(endpoint).await.unwrap();
        let limiter = Limiter::new(Arc::new(backend), "shared");

        limiter.set_rate(Limit::PerSecond(100.0), 1).await.unwrap();
        assert!(limiter.allow().await.unwrap());
        tokio::time::timeout(Duration::from_secs(5), limiter.wait())
            .await
            .unwrap()
            .unwrap();

        // More than the burst is rejected without waiting
        let err = limiter.wait_n(2, MaxWait::Unbounded).await.unwrap_err();
        assert!(err.is_rate_limited());

        shutdown.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wait_errors_over_grpc_are_terminal() {
        let (endpoint, shutdown, handle) = start_server().await;
        let backend = GrpcLimiterBackend::connect(endpoint).await.unwrap();
        let limiter = Limiter::new(Arc::new(backend), "interrupted");

        limiter.set_rate(Limit::PerSecond(1.0), 1).await.unwrap();
        assert!(limiter.allow().await.unwrap());

        let err = limiter
            .wait_n_or_cancel(1, MaxWait::Unbounded, async {})
            .await
            .unwrap_err();
        assert!(matches!(err, TollgateError::Cancelled));

        let err = limiter
            .wait_n(1, MaxWait::Within(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, TollgateError::WaitExceeded { ref key, n: 1 } if key == "interrupted"));
        assert!(!err.is_retryable());

        shutdown.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
