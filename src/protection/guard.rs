//! Run a unit of work behind [`DoSProtector::protect`].

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::error::ProtectionError;
use crate::protection::protector::{DoSProtector, ProtectionResult};
use crate::rate_limit::RateLimitConfig;
use crate::resilience::circuit_breaker::short_type_name;
use crate::resilience::CallError;
use crate::threat::{RequestContext, DEFAULT_PROFILE};

#[derive(Debug, Error)]
pub enum GuardError<E> {
    /// Denied before the work started.
    #[error(transparent)]
    Rejected(ProtectionError),

    /// The work did not finish within the request timeout.
    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("{0}")]
    Inner(E),
}

impl<E> GuardError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, GuardError::Rejected(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GuardError::Rejected(e) => e.retry_after(),
            _ => None,
        }
    }
}

/// Builder returned by [`DoSProtector::guard`].
///
/// The outcome of the work is fed back into the breaker registered for the
/// kind, when there is one.
#[must_use = "a guard does nothing until run"]
pub struct Guard<'a> {
    protector: &'a DoSProtector,
    kind: String,
    context: Option<RequestContext>,
    limits: Option<RateLimitConfig>,
    profile: String,
    timeout: Option<Duration>,
}

impl DoSProtector {
    pub fn guard(&self, kind: impl Into<String>) -> Guard<'_> {
        Guard {
            protector: self,
            kind: kind.into(),
            context: None,
            limits: None,
            profile: DEFAULT_PROFILE.to_string(),
            timeout: None,
        }
    }
}

impl<'a> Guard<'a> {
    pub fn context(mut self, context: RequestContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn limits(mut self, limits: RateLimitConfig) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    /// Override the configured request timeout for [`run_async`](Self::run_async).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn admit(&self) -> Result<ProtectionResult, ProtectionError> {
        self.protector
            .protect(&self.kind, self.context.as_ref(), self.limits.as_ref(), &self.profile)
    }

    /// Protect, then run `f`.
    pub fn run<T, E, F>(self, f: F) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.admit().map_err(GuardError::Rejected)?;
        match self.protector.circuit_breaker(&self.kind) {
            Some(breaker) => breaker.call(f).map_err(|e| match e {
                CallError::Rejected(e) => GuardError::Rejected(e),
                CallError::Inner(e) => GuardError::Inner(e),
            }),
            None => f().map_err(GuardError::Inner),
        }
    }

    /// Protect, then await `fut` under the request timeout. A timeout is
    /// recorded as a breaker failure.
    pub async fn run_async<T, E, Fut>(self, fut: Fut) -> Result<T, GuardError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit().map_err(GuardError::Rejected)?;
        let limit = self
            .timeout
            .unwrap_or_else(|| self.protector.resource_monitor().limits().request_timeout());

        let Some(breaker) = self.protector.circuit_breaker(&self.kind) else {
            return match tokio::time::timeout(limit, fut).await {
                Ok(result) => result.map_err(GuardError::Inner),
                Err(_) => Err(GuardError::TimedOut(limit)),
            };
        };

        let call = breaker.enter().map_err(GuardError::Rejected)?;
        match tokio::time::timeout(limit, fut).await {
            Ok(Ok(value)) => {
                call.success();
                Ok(value)
            }
            Ok(Err(e)) => {
                call.failure(short_type_name::<E>());
                Err(GuardError::Inner(e))
            }
            Err(_) => {
                call.failure("timeout");
                tracing::warn!(kind = %self.kind, timeout_secs = limit.as_secs_f64(), "Guarded operation timed out");
                Err(GuardError::TimedOut(limit))
            }
        }
    }
}
