//! Cashu wallet utility functions

use std::future::Future;
use std::time::Duration;

use url::Url;

use super::errors::{CashuResult, CashuWalletError};
use super::types::Proof;

/// Normalize a mint URL to prevent duplicates like "mint.coinos.io" vs "mint.coinos.io/"
/// This should be called when storing or comparing mint URLs.
pub fn normalize_mint_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');

    let lower = trimmed.to_ascii_lowercase();
    let with_scheme = if lower.starts_with("http://") || lower.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    // The parser lower-cases scheme and host and leaves the path alone
    match Url::parse(&with_scheme) {
        Ok(parsed) => parsed.as_str().trim_end_matches('/').to_string(),
        Err(_) => with_scheme,
    }
}

/// Fill in the issuing mint on proofs returned without one
pub fn with_mint_url(proofs: Vec<Proof>, mint_url: &str) -> Vec<Proof> {
    proofs
        .into_iter()
        .map(|mut p| {
            if p.mint_url.is_empty() {
                p.mint_url = mint_url.to_string();
            }
            p
        })
        .collect()
}

/// Get current timestamp in seconds
pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

// =============================================================================
// Bounded Retry (idempotent reads only)
// =============================================================================

/// Retry an idempotent read on storage/network failures with exponential backoff.
///
/// Only `StorageUnavailable` and `NetworkUnavailable` are retried. Mutating
/// calls must never go through here.
pub async fn with_read_retry<T, F, Fut>(
    label: &str,
    attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> CashuResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CashuResult<T>>,
{
    let attempts = attempts.max(1);
    let mut delay = base_delay;
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable_read() && attempt < attempts => {
                log::warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    label,
                    attempt,
                    attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_normalize_mint_url() {
        assert_eq!(
            normalize_mint_url("mint.example.com"),
            "https://mint.example.com"
        );
        assert_eq!(
            normalize_mint_url("https://mint.example.com/"),
            "https://mint.example.com"
        );
        assert_eq!(
            normalize_mint_url("https://MINT.Example.COM"),
            "https://mint.example.com"
        );
        assert_eq!(
            normalize_mint_url("  https://mint.example.com/  "),
            "https://mint.example.com"
        );
        assert_eq!(
            normalize_mint_url("HTTPS://Mint.Example.com/Cashu/"),
            "https://mint.example.com/Cashu"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_retry_recovers_from_transient_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_read_retry("quote status", 3, Duration::from_millis(10), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(CashuWalletError::NetworkUnavailable("flaky".to_string()))
                } else {
                    Ok(7u64)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_retry_does_not_retry_terminal_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: CashuResult<u64> =
            with_read_retry("quote status", 5, Duration::from_millis(10), || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(CashuWalletError::QuoteNotFound {
                        quote_id: "q".to_string(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_retry_gives_up_after_bound() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: CashuResult<u64> =
            with_read_retry("balance", 3, Duration::from_millis(10), || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(CashuWalletError::StorageUnavailable("down".to_string()))
                }
            })
            .await;
        assert_eq!(
            result,
            Err(CashuWalletError::StorageUnavailable("down".to_string()))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
