//! Rate limiter gRPC service implementation.

use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};

use super::convert::max_wait_from_proto;
use super::proto::tollgate::limiter::v1::{
    rate_limiter_server::RateLimiter, CancelReservationRequest, CancelReservationResponse,
    GetStateRequest, GetTokensRequest, GetTokensResponse, LimiterState, ReserveNRequest,
    Reservation, SetRateRequest, SetRateResponse,
};
use crate::ratelimit::{self, Limit, LimiterBackend};

/// Implementation of the `tollgate.limiter.v1.RateLimiter` gRPC interface.
pub struct RateLimiterServiceImpl<B: LimiterBackend> {
    /// The backend every call is delegated to
    backend: Arc<B>,
}

impl<B: LimiterBackend> RateLimiterServiceImpl<B> {
    /// Create a new service over the given backend.
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }
}

fn require_key(key: &str) -> Result<(), Status> {
    if key.is_empty() {
        warn!("Received limiter request with empty key");
        return Err(Status::invalid_argument("key is required"));
    }
    Ok(())
}

#[tonic::async_trait]
impl<B: LimiterBackend + 'static> RateLimiter for RateLimiterServiceImpl<B> {
    #[instrument(skip(self, request), fields(key = %request.get_ref().key))]
    async fn get_state(
        &self,
        request: Request<GetStateRequest>,
    ) -> Result<Response<LimiterState>, Status> {
        let req = request.into_inner();
        require_key(&req.key)?;

        let state = self.backend.state(&req.key).await?;
        Ok(Response::new(LimiterState::from(&state)))
    }

    #[instrument(skip(self, request), fields(key = %request.get_ref().key))]
    async fn get_tokens(
        &self,
        request: Request<GetTokensRequest>,
    ) -> Result<Response<GetTokensResponse>, Status> {
        let req = request.into_inner();
        require_key(&req.key)?;

        let tokens = self.backend.tokens(&req.key).await?;
        Ok(Response::new(GetTokensResponse { tokens }))
    }

    /// Reserve `n` permits. A rejection is an OK response with `ok == false`.
    #[instrument(
        skip(self, request),
        fields(key = %request.get_ref().key, n = request.get_ref().n)
    )]
    async fn reserve_n(
        &self,
        request: Request<ReserveNRequest>,
    ) -> Result<Response<Reservation>, Status> {
        let req = request.into_inner();
        require_key(&req.key)?;
        let max_wait = max_wait_from_proto(req.max_wait)?;

        let reservation = self.backend.reserve_n(&req.key, req.n, max_wait).await?;

        debug!(
            key = %req.key,
            ok = reservation.ok,
            time_to_act = %reservation.time_to_act,
            "Reservation decided"
        );

        Ok(Response::new(Reservation::from(&reservation)))
    }

    #[instrument(skip(self, request), fields(key = %request.get_ref().key))]
    async fn set_rate(
        &self,
        request: Request<SetRateRequest>,
    ) -> Result<Response<SetRateResponse>, Status> {
        let req = request.into_inner();
        require_key(&req.key)?;
        let limit = req.limit.map(Limit::try_from).transpose()?;

        self.backend.set_rate(&req.key, limit, req.burst).await?;
        Ok(Response::new(SetRateResponse {}))
    }

    #[instrument(skip(self, request), fields(key = %request.get_ref().key))]
    async fn cancel_reservation(
        &self,
        request: Request<CancelReservationRequest>,
    ) -> Result<Response<CancelReservationResponse>, Status> {
        let req = request.into_inner();
        require_key(&req.key)?;
        let reservation: ratelimit::Reservation = req
            .reservation
            .ok_or_else(|| Status::invalid_argument("reservation is required"))?
            .try_into()?;

        self.backend
            .cancel_reservation(&req.key, &reservation)
            .await?;
        Ok(Response::new(CancelReservationResponse {}))
    }
}
