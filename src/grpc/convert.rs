//! Conversions between protobuf messages and limiter types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tonic::{Code, Status};
use uuid::Uuid;

use super::proto::tollgate::limiter::v1 as pb;
use super::proto::tollgate::limiter::v1::limit::Kind;
use crate::error::TollgateError;
use crate::ratelimit::{Limit, LimiterState, MaxWait, Reservation};

fn invalid(msg: impl Into<String>) -> TollgateError {
    TollgateError::InvalidArgument(msg.into())
}

pub(crate) fn timestamp_to_proto(t: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: t.timestamp(),
        nanos: t.timestamp_subsec_nanos() as i32,
    }
}

pub(crate) fn timestamp_from_proto(
    t: Option<prost_types::Timestamp>,
    field: &str,
) -> Result<DateTime<Utc>, TollgateError> {
    let t = t.ok_or_else(|| invalid(format!("{} is required", field)))?;
    u32::try_from(t.nanos)
        .ok()
        .and_then(|nanos| DateTime::from_timestamp(t.seconds, nanos))
        .ok_or_else(|| invalid(format!("{} is out of range", field)))
}

/// Unset means the caller accepts any wait.
pub(crate) fn max_wait_from_proto(
    d: Option<prost_types::Duration>,
) -> Result<MaxWait, TollgateError> {
    match d {
        None => Ok(MaxWait::Unbounded),
        Some(d) => Duration::try_from(d)
            .map(MaxWait::Within)
            .map_err(|e| invalid(format!("max_wait: {}", e))),
    }
}

pub(crate) fn max_wait_to_proto(max_wait: MaxWait) -> Option<prost_types::Duration> {
    match max_wait {
        MaxWait::Unbounded => None,
        // Waits beyond the protobuf range are as good as unbounded
        MaxWait::Within(d) => prost_types::Duration::try_from(d).ok(),
    }
}

impl From<Limit> for pb::Limit {
    fn from(limit: Limit) -> Self {
        let kind = match limit {
            Limit::Infinite => Kind::Infinite(true),
            Limit::PerSecond(rate) => Kind::PerSecond(rate),
        };
        pb::Limit { kind: Some(kind) }
    }
}

impl TryFrom<pb::Limit> for Limit {
    type Error = TollgateError;

    fn try_from(limit: pb::Limit) -> Result<Self, Self::Error> {
        match limit.kind {
            Some(Kind::Infinite(true)) => Ok(Limit::Infinite),
            Some(Kind::PerSecond(rate)) => Ok(Limit::PerSecond(rate)),
            Some(Kind::Infinite(false)) | None => Err(invalid("limit must be infinite or per_second")),
        }
    }
}

impl From<&LimiterState> for pb::LimiterState {
    fn from(state: &LimiterState) -> Self {
        pb::LimiterState {
            limit: Some(state.limit.into()),
            burst: state.burst,
            tokens: state.tokens,
            last: Some(timestamp_to_proto(state.last)),
            last_event: Some(timestamp_to_proto(state.last_event)),
        }
    }
}

impl TryFrom<pb::LimiterState> for LimiterState {
    type Error = TollgateError;

    /// Pending reservations are server-side bookkeeping and do not travel.
    fn try_from(state: pb::LimiterState) -> Result<Self, Self::Error> {
        Ok(LimiterState {
            limit: state
                .limit
                .ok_or_else(|| invalid("limit is required"))?
                .try_into()?,
            burst: state.burst,
            tokens: state.tokens,
            last: timestamp_from_proto(state.last, "last")?,
            last_event: timestamp_from_proto(state.last_event, "last_event")?,
            pending: Default::default(),
        })
    }
}

impl From<&Reservation> for pb::Reservation {
    fn from(r: &Reservation) -> Self {
        pb::Reservation {
            id: r.id.to_string(),
            ok: r.ok,
            tokens: r.tokens,
            creation_time: Some(timestamp_to_proto(r.creation_time)),
            time_to_act: Some(timestamp_to_proto(r.time_to_act)),
            limit: Some(r.limit.into()),
        }
    }
}

impl TryFrom<pb::Reservation> for Reservation {
    type Error = TollgateError;

    fn try_from(r: pb::Reservation) -> Result<Self, Self::Error> {
        Ok(Reservation {
            id: Uuid::parse_str(&r.id).map_err(|e| invalid(format!("reservation id: {}", e)))?,
            ok: r.ok,
            tokens: r.tokens,
            creation_time: timestamp_from_proto(r.creation_time, "creation_time")?,
            time_to_act: timestamp_from_proto(r.time_to_act, "time_to_act")?,
            limit: r
                .limit
                .ok_or_else(|| invalid("limit is required"))?
                .try_into()?,
        })
    }
}

impl From<TollgateError> for Status {
    fn from(err: TollgateError) -> Self {
        let message = err.to_string();
        match err {
            TollgateError::InvalidArgument(_) => Status::invalid_argument(message),
            TollgateError::BurstExceeded { .. } | TollgateError::WaitExceeded { .. } => {
                Status::resource_exhausted(message)
            }
            TollgateError::Storage(_) | TollgateError::Io(_) => Status::unavailable(message),
            TollgateError::Cancelled => Status::cancelled(message),
            TollgateError::Rpc { code, .. } => Status::new(code, message),
            _ => Status::internal(message),
        }
    }
}

impl From<Status> for TollgateError {
    fn from(status: Status) -> Self {
        match status.code() {
            Code::InvalidArgument => TollgateError::InvalidArgument(status.message().to_string()),
            Code::Cancelled => TollgateError::Cancelled,
            code => TollgateError::Rpc {
                code,
                message: status.message().to_string(),
            },
        }
    }
}
