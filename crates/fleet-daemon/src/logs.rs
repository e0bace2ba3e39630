//! Bounded-memory tail reads over task log files.
//!
//! Small files are read whole and return exact trailing lines. Large files
//! get a single positioned read of an approximate trailing window;
//! exactness is deliberately sacrificed there to bound memory on
//! arbitrarily large logs.

use std::io::SeekFrom;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use fleet_core::config::TailConfig;

/// Result of a tail read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTail {
    pub lines: Vec<String>,
    /// True when only a trailing window of the file was read.
    pub truncated: bool,
    /// Rough total-line estimate, present only on partial reads.
    pub estimated_total_lines: Option<u64>,
    pub file_size: u64,
}

/// Read the trailing `max_lines` lines of `path`.
///
/// `max_lines` is clamped to the configured hard bound. At or below the
/// safe-read threshold the whole file is read and the result is exact with
/// no omission marker; above it, a window of `max_lines *
/// window_bytes_per_line` trailing bytes is read, the possibly-truncated
/// leading line is dropped, and an estimated total-line count is attached.
pub async fn tail(path: &Path, max_lines: usize, cfg: &TailConfig) -> std::io::Result<LogTail> {
    let requested = max_lines.clamp(1, cfg.max_lines.max(1));

    let metadata = tokio::fs::metadata(path).await?;
    let file_size = metadata.len();

    if file_size <= cfg.safe_read_bytes {
        let content = tokio::fs::read_to_string(path).await?;
        let all: Vec<&str> = content.lines().collect();
        let start = all.len().saturating_sub(requested);
        return Ok(LogTail {
            lines: all[start..].iter().map(ToString::to_string).collect(),
            truncated: false,
            estimated_total_lines: None,
            file_size,
        });
    }

    let window = (requested as u64)
        .saturating_mul(cfg.window_bytes_per_line)
        .min(file_size);
    let start_pos = file_size - window;

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(start_pos)).await?;
    #[allow(clippy::cast_possible_truncation)]
    let mut buf = Vec::with_capacity(window as usize);
    let mut limited = file.take(window);
    limited.read_to_end(&mut buf).await?;

    let mut content = String::from_utf8_lossy(&buf).into_owned();
    // The window almost certainly starts mid-line; drop the partial head.
    if start_pos > 0
        && let Some(newline) = content.find('\n')
    {
        content.drain(..=newline);
    }

    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(requested);
    Ok(LogTail {
        lines: all[start..].iter().map(ToString::to_string).collect(),
        truncated: true,
        estimated_total_lines: Some(file_size / cfg.estimate_bytes_per_line.max(1)),
        file_size,
    })
}
