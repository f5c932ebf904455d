use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::utils::error::Result;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }
}

pub async fn retry_with_backoff<F, Fut, T>(operation: F, policy: &RetryPolicy) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut current_delay = policy.initial_delay;
    let mut attempts = 0;

    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempts > policy.max_retries {
                    return Err(e);
                }

                warn!(
                    attempt = attempts,
                    max_retries = policy.max_retries,
                    error = %e,
                    delay = ?current_delay,
                    "Operation failed, retrying"
                );

                sleep(current_delay).await;

                current_delay = (current_delay.mul_f64(policy.backoff_factor)).min(policy.max_delay);
            }
        }
    }
}
