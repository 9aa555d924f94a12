//! Exponential-backoff retry for transient remote errors.
//!
//! Backoff schedule: 1s, 2s, 4s, 8s, 16s (max 5 retries). Both the upload
//! manager and the delta loop classify failures the same way, by
//! string-matching the error's `Display` output for network, rate-limit
//! and 5xx substrings — the remote client's `anyhow::Result` carries no
//! structured error type to match on instead.

use std::time::Duration;

use tracing::{info, warn};

const MAX_RETRIES: u32 = 5;
const BASE_DELAY_SECS: u64 = 1;

pub fn is_transient_error(err: &anyhow::Error) -> bool {
    let err_str = format!("{err:#}").to_lowercase();

    if err_str.contains("network")
        || err_str.contains("connection")
        || err_str.contains("timeout")
        || err_str.contains("dns")
        || err_str.contains("reset by peer")
        || err_str.contains("broken pipe")
    {
        return true;
    }

    if err_str.contains("429") || err_str.contains("too many requests") || err_str.contains("rate limit") {
        return true;
    }

    if err_str.contains("500")
        || err_str.contains("502")
        || err_str.contains("503")
        || err_str.contains("504")
        || err_str.contains("server error")
    {
        return true;
    }

    false
}

/// Retries `f` up to [`MAX_RETRIES`] times on a transient error, with
/// exponential backoff. Non-transient errors return immediately.
pub async fn with_retry<F, Fut, T>(operation_name: &str, f: F) -> anyhow::Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let mut last_error: Option<anyhow::Error> = None;

    for attempt in 0..=MAX_RETRIES {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation = operation_name, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if attempt < MAX_RETRIES && is_transient_error(&err) {
                    let delay_secs = BASE_DELAY_SECS * 2u64.pow(attempt);
                    warn!(
                        operation = operation_name,
                        attempt,
                        delay_secs,
                        error = %err,
                        "transient error, retrying"
                    );
                    tokio::time::sleep(Duration::from_secs(delay_secs)).await;
                    last_error = Some(err);
                } else {
                    return Err(err);
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("retry exhausted for {operation_name}")))
}
