//! Utility functions for ringkv

use rand::Rng;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

/// Get current Unix timestamp (nanoseconds)
pub fn timestamp_now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Calculate CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// CRC32 over several slices, as if they were concatenated
pub fn crc32_parts(parts: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

/// Keep running `f` until `cancel` fires.
///
/// There is no attempt limit: after every return of `f`, success or not, the
/// loop sleeps a jittered `[interval, 2*interval)` and runs it again. Errors
/// are logged once when they start and again on every repeat; recovery is
/// logged when a previously failing call returns Ok.
pub async fn retry_forever<F, Fut>(
    name: &str,
    cancel: &CancellationToken,
    interval: Duration,
    mut f: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<()>>,
{
    let mut has_failed_before = false;

    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = f() => outcome,
        };

        match outcome {
            Ok(()) if has_failed_before => {
                has_failed_before = false;
                tracing::info!("{} recovered", name);
            }
            Ok(()) => tracing::debug!("{} finished, restarting", name),
            Err(e) if has_failed_before => tracing::warn!("{} still failing: {}", name, e),
            Err(e) => {
                has_failed_before = true;
                tracing::warn!("{} failed: {}", name, e);
            }
        }

        let jitter: f64 = rand::thread_rng().gen_range(1.0..2.0);
        let delay = interval.mul_f64(jitter);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::debug!("{} cancelled", name);
}
