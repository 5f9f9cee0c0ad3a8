//! Parser for ffmpeg's `-progress pipe:1` key=value stream

/// Accumulated state of one ffmpeg progress stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressParser {
    pub out_time_us: u64,
    pub speed: Option<f64>,
    pub frame: Option<u64>,
    pub is_complete: bool,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns true when a progress block ended
    ///
    /// ffmpeg emits blocks of `key=value` lines terminated by
    /// `progress=continue` or `progress=end`.
    pub fn parse_line(&mut self, line: &str) -> bool {
        let Some((key, value)) = line.split_once('=') else {
            return false;
        };
        let value = value.trim();
        match key.trim() {
            // Older builds report out_time_ms in microseconds as well
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<u64>() {
                    self.out_time_us = us;
                }
            }
            "out_time" => {
                if let Some(us) = parse_timestamp_us(value) {
                    self.out_time_us = us;
                }
            }
            "frame" => {
                self.frame = value.parse().ok();
            }
            "speed" => {
                self.speed = value.trim_end_matches('x').parse().ok();
            }
            "progress" => {
                if value == "end" {
                    self.is_complete = true;
                }
                return true;
            }
            _ => {}
        }
        false
    }

    pub fn out_time_secs(&self) -> f64 {
        self.out_time_us as f64 / 1_000_000.0
    }

    /// Fraction of `duration_secs` processed so far, in [0, 1]
    ///
    /// Without a known duration only the end marker moves the value.
    pub fn fraction(&self, duration_secs: Option<f64>) -> f32 {
        if self.is_complete {
            return 1.0;
        }
        match duration_secs {
            Some(total) if total > 0.0 => (self.out_time_secs() / total).clamp(0.0, 1.0) as f32,
            _ => 0.0,
        }
    }
}

/// Parse `HH:MM:SS.micro` into microseconds
fn parse_timestamp_us(value: &str) -> Option<u64> {
    let mut parts = value.splitn(3, ':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some((hours * 3600 + minutes * 60) * 1_000_000 + (seconds * 1_000_000.0).round() as u64)
}
