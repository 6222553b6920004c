use std::{future::Future, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::time::{Instant, timeout};

/// Wraps `tokio::time::timeout`, converting elapsed deadlines and inner errors into contextual
/// `anyhow::Error` values for consistent diagnostics.
pub async fn timeout_with_context<F, T, E>(
    duration: Duration,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    timeout(duration, future)
        .await
        .map_err(|_| anyhow!("timed out {context}"))?
        .with_context(|| format!("failed while {context}"))
}

/// Time left until `deadline`; errors once the deadline has passed.
pub fn remaining_until(deadline: Instant, context: &str) -> Result<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|remaining| !remaining.is_zero())
        .ok_or_else(|| anyhow!("timed out {context}"))
}

/// Like [`timeout_with_context`], but bounded by an absolute deadline shared across several
/// operations.
pub async fn deadline_with_context<F, T, E>(
    deadline: Instant,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    let remaining = remaining_until(deadline, &context)?;
    timeout_with_context(remaining, future, context).await
}
