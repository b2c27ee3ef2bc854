use std::future::Future;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

/// Deadline and error wrapping applied to every store round-trip.
#[derive(Debug, Clone, Copy)]
pub struct RemoteCall {
    timeout: Duration,
}

impl Default for RemoteCall {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl RemoteCall {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run a read; failures are safe to retry.
    pub async fn read<T, F>(&self, op: &'static str, key: String, call: F) -> CoreResult<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(CoreError::RemoteRead {
                op,
                key,
                source: source.into(),
            }),
            Err(_) => Err(self.timed_out(op, key)),
        }
    }

    /// Run a write; a timeout leaves the outcome unknown, nothing is rolled back.
    pub async fn write<T, F>(&self, op: &'static str, key: String, call: F) -> CoreResult<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(CoreError::RemoteWrite {
                op,
                key,
                source: source.into(),
            }),
            Err(_) => Err(self.timed_out(op, key)),
        }
    }

    fn timed_out(&self, op: &'static str, key: String) -> CoreError {
        CoreError::Timeout {
            op,
            key,
            after_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}
