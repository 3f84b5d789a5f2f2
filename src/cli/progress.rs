//! Progress display module
//!
//! Prints download progress for the `get` command. It is registered as a
//! controller event listener, so it redraws on every stored piece.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::controller::ControlEventListener;
use crate::storage::FileManifest;
use crate::sync;

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed to human readable string
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

/// Format duration to human readable string
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

struct DisplayState {
    last_update: Option<Instant>,
    available: u32,
}

/// Progress bar for one download
pub struct ProgressDisplay {
    file_hash: String,
    file_size: u64,
    piece_size: u32,
    start_time: Instant,
    update_interval: Duration,
    quiet: bool,
    state: Mutex<DisplayState>,
}

impl ProgressDisplay {
    pub fn new(manifest: &FileManifest, quiet: bool) -> Self {
        Self {
            file_hash: manifest.file_hash.clone(),
            file_size: manifest.file_size,
            piece_size: manifest.piece_size,
            start_time: Instant::now(),
            update_interval: Duration::from_millis(200),
            quiet,
            state: Mutex::new(DisplayState { last_update: None, available: 0 }),
        }
    }

    /// Render the progress line for `available` of `total` pieces
    pub fn render(&self, available: u32, total: u32) -> String {
        let ratio = if total == 0 { 1.0 } else { available as f64 / total as f64 };
        let bar_width: usize = 40;
        let filled = ((ratio * bar_width as f64) as usize).min(bar_width);
        let bar = "=".repeat(filled) + &" ".repeat(bar_width - filled);

        let bytes = (available as u64 * self.piece_size as u64).min(self.file_size);
        let elapsed = self.start_time.elapsed();
        let speed = if elapsed.as_secs_f64() > 0.0 { bytes as f64 / elapsed.as_secs_f64() } else { 0.0 };

        format!(
            "[{}] {:.1}% | {}/{} pieces | {} / {} | {}",
            bar,
            ratio * 100.0,
            available,
            total,
            format_bytes(bytes),
            format_bytes(self.file_size),
            format_speed(speed),
        )
    }

    /// Print a status message
    pub fn print_status(&self, message: &str) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        println!("\r\x1b[2K{}", message);
        Ok(())
    }

    /// Print an error message
    pub fn print_error(&self, message: &str) -> io::Result<()> {
        eprintln!("\r\x1b[2KError: {}", message);
        Ok(())
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Pieces seen so far
    pub fn available(&self) -> u32 {
        sync::lock(&self.state).available
    }

    fn redraw(&self, available: u32, total: u32) -> io::Result<()> {
        let mut state = sync::lock(&self.state);
        state.available = state.available.max(available);
        if self.quiet {
            return Ok(());
        }
        let due = state.last_update.map_or(true, |at| at.elapsed() >= self.update_interval);
        if !due && available < total {
            return Ok(());
        }
        state.last_update = Some(Instant::now());

        print!("\r\x1b[2K{}", self.render(available, total));
        io::stdout().flush()
    }
}

impl ControlEventListener for ProgressDisplay {
    fn on_piece_received(&self, file_hash: &str, _index: u32, available: u32, total: u32) -> Result<()> {
        if file_hash == self.file_hash {
            self.redraw(available, total)?;
        }
        Ok(())
    }

    fn on_download_completed(&self, file_hash: &str, output: Option<&Path>) -> Result<()> {
        if file_hash != self.file_hash || self.quiet {
            return Ok(());
        }
        println!();
        println!("Download Complete!");
        println!("  Size: {}", format_bytes(self.file_size));
        if let Some(output) = output {
            println!("  Saved to: {}", output.display());
        }
        println!("  Elapsed Time: {}", format_duration(self.elapsed()));
        Ok(())
    }

    fn on_download_failed(&self, file_hash: &str, reason: &str) -> Result<()> {
        if file_hash == self.file_hash {
            self.print_error(&format!("Download failed: {}", reason))?;
        }
        Ok(())
    }
}
