//! Render progress from `ffmpeg -progress pipe:2`.
//!
//! ffmpeg prints `key=value` lines and closes each block with
//! `progress=continue` or `progress=end`.

use std::time::Duration;

use serde::Serialize;

/// Snapshot of one progress block.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RenderProgress {
    pub frame: u64,
    /// Media time written so far
    pub out_time: Duration,
    /// Encode speed relative to realtime, if ffmpeg reported one
    pub speed: Option<f64>,
    pub finished: bool,
}

impl RenderProgress {
    /// Apply one stderr line. Returns a snapshot when the line closes a block.
    pub fn feed(&mut self, line: &str) -> Option<RenderProgress> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();

        match key {
            "frame" => {
                if let Ok(frame) = value.parse() {
                    self.frame = frame;
                }
            }
            "out_time_us" | "out_time_ms" => {
                // Both keys carry microseconds
                if let Ok(us) = value.parse::<u64>() {
                    self.out_time = Duration::from_micros(us);
                }
            }
            "speed" => {
                self.speed = value.strip_suffix('x').and_then(|s| s.trim().parse().ok());
            }
            "progress" => {
                self.finished = value == "end";
                return Some(self.clone());
            }
            _ => {}
        }
        None
    }
}

/// True for lines that belong to the progress protocol rather than
/// diagnostics.
pub(crate) fn is_progress_line(line: &str) -> bool {
    line.split_once('=')
        .is_some_and(|(key, _)| !key.is_empty() && !key.contains(char::is_whitespace))
}
