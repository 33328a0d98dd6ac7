use crate::{TransferEvent, TransferHooks};
use crate::transfer::constants::MAX_FILENAME_LENGTH;
use std::path::Path;
use std::time::Instant;
use tokio::fs::{File, OpenOptions};

/// Windows device names that must never be used as a file name
const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Reduce a peer-supplied file name to a safe base name.
///
/// Returns `None` when nothing usable remains (empty, `.`, `..`, reserved
/// device names).
pub fn sanitize_file_name(file_name: &str) -> Option<String> {
    // Take the last component for both separators to ignore directories
    let base = file_name
        .split(|c: char| c == '/' || c == '\\')
        .last()
        .unwrap_or_default();

    let mut clean_name: String = base.chars().filter(|c| !c.is_control()).collect();

    if clean_name.trim().is_empty() || clean_name == "." || clean_name == ".." {
        return None;
    }

    if RESERVED_NAMES
        .iter()
        .any(|r| clean_name.eq_ignore_ascii_case(r))
    {
        return None;
    }

    if clean_name.len() > MAX_FILENAME_LENGTH {
        truncate_preserving_extension(&mut clean_name);
    }

    Some(clean_name)
}

/// Whether `file_name` is already a plain base name that sanitizes to itself
pub fn is_plain_file_name(file_name: &str) -> bool {
    sanitize_file_name(file_name).as_deref() == Some(file_name)
}

fn truncate_preserving_extension(name: &mut String) {
    if let Some(idx) = name.rfind('.') {
        let ext_len = name.len() - idx;
        // Only keep the extension if it's a reasonable length
        if idx > 0 && ext_len < 20 {
            let ext = name[idx..].to_string();
            name.truncate(floor_char_boundary(name, MAX_FILENAME_LENGTH - ext_len));
            name.push_str(&ext);
            return;
        }
    }
    name.truncate(floor_char_boundary(name, MAX_FILENAME_LENGTH));
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Open a file with secure permissions (0o600 on Unix) for writing, truncating it
pub async fn open_secure_file(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    options.open(path).await
}

/// Format a byte count as a human-readable size ("1.50 KB")
pub fn format_size(size: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = size as f64;
    let mut unit_index = 0;
    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }
    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format transfer speed from bytes and elapsed time
pub fn format_transfer_speed(bytes_transferred: u64, elapsed_secs: f64) -> String {
    if elapsed_secs <= 0.0 {
        return "Starting...".to_string();
    }

    let speed_bps = bytes_transferred as f64 / elapsed_secs;
    if speed_bps > 1_000_000.0 {
        format!("{:.2} MB/s", speed_bps / 1_000_000.0)
    } else if speed_bps > 1_000.0 {
        format!("{:.1} KB/s", speed_bps / 1_000.0)
    } else {
        format!("{:.0} B/s", speed_bps)
    }
}

/// Percentage of chunks done; an empty transfer counts as complete
pub fn chunk_progress(done: u64, total: u64) -> f32 {
    if total == 0 {
        100.0
    } else {
        (done as f32 / total as f32) * 100.0
    }
}

/// Report transfer progress to the event channel, if any
pub async fn report_progress(
    hooks: &TransferHooks,
    file_name: &str,
    chunks_done: u64,
    total_chunks: u64,
    bytes_done: u64,
    start_time: Instant,
    is_sending: bool,
) {
    let Some(event_tx) = hooks.events.as_ref() else {
        return;
    };

    let elapsed = start_time.elapsed().as_secs_f64();
    let _ = event_tx
        .send(TransferEvent::Progress {
            file_name: file_name.to_string(),
            progress: chunk_progress(chunks_done, total_chunks),
            chunks_done,
            total_chunks,
            bytes_done,
            speed: format_transfer_speed(bytes_done, elapsed),
            is_sending,
        })
        .await;
}

/// Emit a single non-progress event, if anyone is listening
pub async fn report_event(hooks: &TransferHooks, event: TransferEvent) {
    if let Some(event_tx) = hooks.events.as_ref() {
        let _ = event_tx.send(event).await;
    }
}
