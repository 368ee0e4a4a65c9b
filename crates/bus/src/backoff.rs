use std::time::Duration;

/// Exponential backoff with deterministic jitter. The jitter spreads retries
/// from concurrent callers by hashing wall-clock nanos instead of pulling in
/// a random number generator.
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(10));
    let capped = exp.min(cap_ms);
    // +/- 25% jitter
    let seed = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0) as u64;
    let jitter_span = capped / 2;
    let jitter = if jitter_span > 0 { seed % jitter_span } else { 0 };
    Duration::from_millis(capped - capped / 4 + jitter)
}

/// Retry an operation while it fails with a transient error, backing off
/// between attempts. Non-transient errors propagate immediately.
pub async fn retry_transient<T, F, Fut>(max_retries: u32, base_ms: u64, mut op: F) -> murmur_core::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = murmur_core::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_retries => {
                let delay = backoff_delay(attempt, base_ms, 30_000);
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Transient failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_core::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let d0 = backoff_delay(0, 100, 5_000);
        let d4 = backoff_delay(4, 100, 5_000);
        assert!(d0 < Duration::from_millis(400));
        assert!(d4 >= Duration::from_millis(1_200));
        assert!(backoff_delay(20, 100, 5_000) <= Duration::from_millis(7_500));
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_cap() {
        let attempts = AtomicU32::new(0);
        let result: murmur_core::Result<()> = retry_transient(2, 1, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::TransientAdapter("down".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_passes_through_structural_errors() {
        let attempts = AtomicU32::new(0);
        let result: murmur_core::Result<()> = retry_transient(5, 1, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::PermissionDenied("no".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(Error::PermissionDenied(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
