// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::path::{Path, PathBuf};

use mixkit_core::AudioBuffer;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// What the writer saw once the aggregator closed the channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutputSummary {
    pub path: PathBuf,
    pub buffers: u64,
    /// Buffers flagged as gap (nothing overlapped the block).
    pub gap_buffers: u64,
    pub bytes: u64,
}

/// Writes every received buffer's payload to `path` as raw interleaved PCM.
///
/// Returns when the sending side is dropped.
///
/// # Errors
///
/// Returns an error when the file cannot be created or written.
pub async fn write_raw(
    mut rx: mpsc::Receiver<AudioBuffer>,
    path: &Path,
) -> anyhow::Result<OutputSummary> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await?;
    }
    let file = tokio::fs::File::create(path).await?;
    let mut writer = BufWriter::new(file);
    let mut summary = OutputSummary { path: path.to_path_buf(), ..OutputSummary::default() };

    while let Some(buffer) = rx.recv().await {
        writer.write_all(&buffer.data).await?;
        summary.buffers += 1;
        summary.bytes += buffer.data.len() as u64;
        if buffer.flags.gap {
            summary.gap_buffers += 1;
        }
        debug!(offset = ?buffer.offset, pts = ?buffer.pts, gap = buffer.flags.gap, "Wrote buffer");
    }

    writer.flush().await?;
    info!(path = %path.display(), buffers = summary.buffers, bytes = summary.bytes, "Output closed");
    Ok(summary)
}
