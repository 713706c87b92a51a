//! Small filesystem helpers shared by the Zarr backend and the collective protocol

use chrono::Utc;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A token no other worker or earlier run will produce, safe as a file name.
pub fn unique_token() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!(
        "{:x}-{nanos:x}-{:x}",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Write `contents` to `path` so that readers never observe a partial file.
///
/// The data goes to a uniquely named sibling first and is then renamed into place.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("entry");
    let temp = path.with_file_name(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    tokio::fs::write(&temp, contents).await?;
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e);
    }
    Ok(())
}

/// Path components that can never name a dataset.
///
/// Dot-prefixed entries hold store metadata (`.zarray`, `.zgroup`, the collective
/// session directory).
#[must_use]
pub fn is_reserved_component(part: &str) -> bool {
    part.starts_with('.') || part.contains('\\')
}
