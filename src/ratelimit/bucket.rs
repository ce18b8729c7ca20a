//! Token bucket state and arithmetic.
//!
//! Everything here is pure: operations take the current time as an argument
//! and mutate a [`LimiterState`] in place. Persisting the result and
//! serializing access per key is the job of [`super::LimiterService`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TollgateError;

/// Sustained event rate of a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Limit {
    /// Limiting is disabled; every request is granted immediately.
    Infinite,
    /// Permits per second. Zero or negative admits nothing beyond banked tokens.
    PerSecond(f64),
}

impl Default for Limit {
    fn default() -> Self {
        Limit::PerSecond(0.0)
    }
}

impl Limit {
    pub fn is_infinite(&self) -> bool {
        matches!(self, Limit::Infinite)
    }

    /// Tokens accumulated over `d` at this rate.
    pub fn tokens_from_duration(&self, d: Duration) -> f64 {
        match *self {
            Limit::Infinite if d.is_zero() => 0.0,
            Limit::Infinite => f64::INFINITY,
            Limit::PerSecond(rate) if rate <= 0.0 => 0.0,
            Limit::PerSecond(rate) => d.as_secs_f64() * rate,
        }
    }

    /// Time needed to accumulate `tokens` at this rate.
    pub fn duration_from_tokens(&self, tokens: f64) -> Wait {
        match *self {
            Limit::Infinite => Wait::For(Duration::ZERO),
            Limit::PerSecond(rate) if rate <= 0.0 => Wait::Forever,
            Limit::PerSecond(rate) => Duration::try_from_secs_f64(tokens / rate)
                .map(Wait::For)
                .unwrap_or(Wait::Forever),
        }
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Infinite => write!(f, "inf"),
            Limit::PerSecond(rate) => write!(f, "{}/s", rate),
        }
    }
}

impl FromStr for Limit {
    type Err = TollgateError;

    /// Parses `inf`/`infinite`/`unlimited` or a number of permits per second.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inf" | "infinite" | "unlimited" => Ok(Limit::Infinite),
            other => {
                let rate: f64 = other
                    .trim_end_matches("/s")
                    .parse()
                    .map_err(|_| TollgateError::InvalidArgument(format!("invalid limit '{}'", s)))?;
                if !rate.is_finite() {
                    return Err(TollgateError::InvalidArgument(format!(
                        "limit must be finite or 'inf', got '{}'",
                        s
                    )));
                }
                Ok(Limit::PerSecond(rate))
            }
        }
    }
}

/// How long a caller is willing to wait for a reservation to become actionable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxWait {
    /// Any finite wait is acceptable.
    Unbounded,
    /// Only waits up to and including this duration are acceptable.
    Within(Duration),
}

impl MaxWait {
    /// Accept only requests that can be served right now.
    pub const NONE: MaxWait = MaxWait::Within(Duration::ZERO);
}

/// A wait time that may never end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    For(Duration),
    Forever,
}

impl Wait {
    /// Whether this wait is acceptable under `max`. `Forever` never is.
    pub fn fits(&self, max: MaxWait) -> bool {
        match (self, max) {
            (Wait::Forever, _) => false,
            (Wait::For(_), MaxWait::Unbounded) => true,
            (Wait::For(d), MaxWait::Within(max)) => *d <= max,
        }
    }
}

/// Persisted state of one keyed limiter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimiterState {
    pub limit: Limit,
    pub burst: u32,
    /// Current token count. Negative while reservations are waiting on debt.
    pub tokens: f64,
    /// When `tokens` was last brought up to date
    pub last: DateTime<Utc>,
    /// Latest time-to-act handed out, possibly in the future
    pub last_event: DateTime<Utc>,
    /// Granted reservations whose time-to-act has not yet passed
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub pending: HashMap<Uuid, DateTime<Utc>>,
}

/// Outcome of a reservation request.
///
/// A reservation carries everything needed to cancel it later, including the
/// limit in force when it was made, so it can be handed across task or
/// process boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub ok: bool,
    pub tokens: u32,
    pub creation_time: DateTime<Utc>,
    pub time_to_act: DateTime<Utc>,
    pub limit: Limit,
}

impl Reservation {
    fn granted(now: DateTime<Utc>, n: u32, time_to_act: DateTime<Utc>, limit: Limit) -> Self {
        Self {
            id: Uuid::new_v4(),
            ok: true,
            tokens: n,
            creation_time: now,
            time_to_act,
            limit,
        }
    }

    fn rejected(now: DateTime<Utc>, limit: Limit) -> Self {
        Self {
            id: Uuid::new_v4(),
            ok: false,
            tokens: 0,
            creation_time: now,
            time_to_act: now,
            limit,
        }
    }

    /// How long the holder must wait from `t` before acting.
    ///
    /// Zero means act immediately; `Forever` means the reservation was not granted.
    pub fn delay_from(&self, t: DateTime<Utc>) -> Wait {
        if !self.ok {
            return Wait::Forever;
        }
        Wait::For((self.time_to_act - t).to_std().unwrap_or(Duration::ZERO))
    }
}

fn checked_add(t: DateTime<Utc>, d: Duration) -> Option<DateTime<Utc>> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| t.checked_add_signed(delta))
}

fn checked_sub(t: DateTime<Utc>, d: Duration) -> Option<DateTime<Utc>> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| t.checked_sub_signed(delta))
}

impl LimiterState {
    /// A full bucket: `burst` tokens available at `now`.
    pub fn new(limit: Limit, burst: u32, now: DateTime<Utc>) -> Self {
        Self {
            limit,
            burst,
            tokens: burst as f64,
            last: now,
            last_event: now,
            pending: HashMap::new(),
        }
    }

    /// Token count as of `now`, capped at `burst`.
    ///
    /// A `now` earlier than `last` counts as no elapsed time.
    pub fn advance(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = (now - self.last).to_std().unwrap_or(Duration::ZERO);
        let tokens = self.tokens + self.limit.tokens_from_duration(elapsed);
        tokens.min(self.burst as f64)
    }

    /// Tokens available at `now`, without consuming any.
    pub fn tokens_available(&self, now: DateTime<Utc>) -> f64 {
        self.advance(now)
    }

    /// Reserve `n` permits, granting only if they are actionable within `max_wait`.
    ///
    /// State changes only when the reservation is granted.
    pub fn reserve_n(&mut self, now: DateTime<Utc>, n: u32, max_wait: MaxWait) -> Reservation {
        if self.limit.is_infinite() {
            return Reservation::granted(now, n, now, Limit::Infinite);
        }

        let tokens = self.advance(now) - n as f64;
        let wait = if tokens < 0.0 {
            self.limit.duration_from_tokens(-tokens)
        } else {
            Wait::For(Duration::ZERO)
        };

        let time_to_act = match wait {
            Wait::For(d) if n <= self.burst && wait.fits(max_wait) => checked_add(now, d),
            _ => None,
        };
        let Some(time_to_act) = time_to_act else {
            return Reservation::rejected(now, self.limit);
        };

        self.last = now;
        self.tokens = tokens;
        self.last_event = time_to_act;
        self.prune(now);

        let reservation = Reservation::granted(now, n, time_to_act, self.limit);
        if n > 0 {
            self.pending.insert(reservation.id, time_to_act);
        }
        reservation
    }

    /// Give back the tokens of a reservation that will not be acted upon, as far
    /// as later reservations allow.
    ///
    /// Returns `true` if any tokens were restored. Cancelling the same
    /// reservation again is a no-op.
    pub fn cancel(&mut self, now: DateTime<Utc>, r: &Reservation) -> bool {
        if !r.ok || r.limit.is_infinite() || r.tokens == 0 || r.time_to_act < now {
            return false;
        }
        if self.pending.remove(&r.id).is_none() {
            return false;
        }

        // Tokens reserved by later reservations stay reserved.
        let reserved_after = (self.last_event - r.time_to_act)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let restore = r.tokens as f64 - r.limit.tokens_from_duration(reserved_after);
        if restore <= 0.0 {
            self.prune(now);
            return false;
        }

        let tokens = self.advance(now) + restore;
        self.tokens = tokens.min(self.burst as f64);
        self.last = now;

        if r.time_to_act == self.last_event {
            if let Wait::For(d) = r.limit.duration_from_tokens(r.tokens as f64) {
                if let Some(prev_event) = checked_sub(r.time_to_act, d) {
                    if prev_event >= now {
                        self.last_event = prev_event;
                    }
                }
            }
        }

        self.prune(now);
        true
    }

    /// Change `limit` and/or `burst` from `now` on.
    ///
    /// Tokens are first brought up to date under the old settings. Returns
    /// `false` when neither field is supplied.
    pub fn set_rate(&mut self, now: DateTime<Utc>, limit: Option<Limit>, burst: Option<u32>) -> bool {
        if limit.is_none() && burst.is_none() {
            return false;
        }

        self.tokens = self.advance(now);
        self.last = now;

        if let Some(limit) = limit {
            self.limit = limit;
        }
        if let Some(burst) = burst {
            self.burst = burst;
        }

        self.prune(now);
        true
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        self.pending.retain(|_, time_to_act| *time_to_act >= now);
    }
}
