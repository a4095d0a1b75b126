use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Fixed-delay retry for remote store calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

/// Whether a remote error is worth another attempt. Answers that will not
/// change on retry are final: missing objects, bad paths, unsupported calls,
/// failed preconditions and rejected credentials.
pub fn is_transient(err: &object_store::Error) -> bool {
    use object_store::Error;
    !matches!(
        err,
        Error::NotFound { .. }
            | Error::AlreadyExists { .. }
            | Error::Precondition { .. }
            | Error::NotModified { .. }
            | Error::NotSupported { .. }
            | Error::NotImplemented
            | Error::InvalidPath { .. }
            | Error::UnknownConfigurationKey { .. }
            | Error::PermissionDenied { .. }
            | Error::Unauthenticated { .. }
    )
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are spent. Dropping the returned future cancels it.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, object_store::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, object_store::Error>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && is_transient(&err) => {
                warn!(operation = what, attempt, error = %err, "remote call failed; retrying");
                attempt += 1;
                tokio::time::sleep(policy.delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
