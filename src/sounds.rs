//! Pre-recorded call sounds and the time-of-day greeting choice.

use crate::audio::{decode_wav, i16_slice_to_u8};
use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, warn};

/// Part of the day used to pick a greeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DayPeriod {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl DayPeriod {
    pub const ALL: [DayPeriod; 4] = [
        DayPeriod::Morning,
        DayPeriod::Afternoon,
        DayPeriod::Evening,
        DayPeriod::Night,
    ];

    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=11 => DayPeriod::Morning,
            12..=16 => DayPeriod::Afternoon,
            17..=20 => DayPeriod::Evening,
            _ => DayPeriod::Night,
        }
    }

    /// Period at `now` in an IANA timezone. Unknown zones are treated as UTC.
    pub fn at(timezone: &str, now: DateTime<Utc>) -> Self {
        let hour = match timezone.parse::<Tz>() {
            Ok(tz) => now.with_timezone(&tz).hour(),
            Err(_) => {
                warn!("Unknown timezone {:?}, using UTC", timezone);
                now.hour()
            }
        };
        Self::from_hour(hour)
    }

    pub fn now_in(timezone: &str) -> Self {
        Self::at(timezone, Utc::now())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DayPeriod::Morning => "morning",
            DayPeriod::Afternoon => "afternoon",
            DayPeriod::Evening => "evening",
            DayPeriod::Night => "night",
        }
    }

    /// Transcript text for the spoken greeting.
    pub fn greeting_text(self) -> String {
        format!("Good {}.", self.as_str())
    }
}

/// PCM for the ring, pickup and greeting prompts at the call sample rate.
#[derive(Debug, Clone, Default)]
pub struct SoundBank {
    pub ring: Vec<u8>,
    pub pickup: Vec<u8>,
    greetings: HashMap<DayPeriod, Vec<u8>>,
}

impl SoundBank {
    /// Load `ring.wav`, `pickup.wav` and `greetings/<period>.wav` from `dir`.
    ///
    /// Missing or unreadable files are logged and left empty.
    pub fn load(dir: &Path, sample_rate: u32) -> Self {
        let greetings = DayPeriod::ALL
            .iter()
            .map(|&period| {
                let path = dir.join("greetings").join(format!("{}.wav", period.as_str()));
                (period, load_sound(&path, sample_rate))
            })
            .collect();

        Self {
            ring: load_sound(&dir.join("ring.wav"), sample_rate),
            pickup: load_sound(&dir.join("pickup.wav"), sample_rate),
            greetings,
        }
    }

    pub fn with_greeting(mut self, period: DayPeriod, pcm: Vec<u8>) -> Self {
        self.greetings.insert(period, pcm);
        self
    }

    /// Greeting audio for the period; empty when none was loaded.
    pub fn greeting(&self, period: DayPeriod) -> &[u8] {
        self.greetings.get(&period).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn load_sound(path: &Path, sample_rate: u32) -> Vec<u8> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(_) => {
            warn!("Sound file not found: {}", path.display());
            return Vec::new();
        }
    };
    match decode_wav(BufReader::new(file), sample_rate) {
        Ok(samples) => {
            debug!("Loaded {} ({} samples)", path.display(), samples.len());
            i16_slice_to_u8(&samples)
        }
        Err(e) => {
            warn!("Failed to decode {}: {}", path.display(), e);
            Vec::new()
        }
    }
}
