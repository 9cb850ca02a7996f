//! PCM stream tracking, timing, and lifecycle

mod controller;
mod record;
mod timer;
mod tracker;

pub use controller::{LifecycleController, PrepareOutcome, StreamPosition, Trigger};
pub use record::{StreamRecord, StreamState, TransferBuffer};
pub use timer::{PeriodicTimer, StopOutcome};
pub use tracker::{PeriodElapsed, PositionCell, PositionTracker, COUNTER_SPACE};

use crate::error::{PcmError, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Data-flow direction of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Samples flow out through the down-link ring (counter = bytes read)
    Playback,
    /// Samples flow in through the up-link ring (counter = bytes written)
    Capture,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Playback => write!(f, "playback"),
            Direction::Capture => write!(f, "capture"),
        }
    }
}

/// Sample encodings supported by the ring-buffer device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    S8,
    U8,
    S16Le,
    /// 24-bit samples packed in 3 bytes
    S24_3Le,
    S32Le,
    FloatLe,
}

impl SampleFormat {
    /// Every format the device can carry
    pub const ALL: [SampleFormat; 6] = [
        SampleFormat::S8,
        SampleFormat::U8,
        SampleFormat::S16Le,
        SampleFormat::S24_3Le,
        SampleFormat::S32Le,
        SampleFormat::FloatLe,
    ];

    /// Significant bits per sample
    pub fn width_bits(&self) -> u16 {
        match self {
            SampleFormat::S8 | SampleFormat::U8 => 8,
            SampleFormat::S16Le => 16,
            SampleFormat::S24_3Le => 24,
            SampleFormat::S32Le | SampleFormat::FloatLe => 32,
        }
    }

    /// Bytes occupied by one sample in memory
    pub fn physical_bytes(&self) -> u32 {
        match self {
            SampleFormat::S8 | SampleFormat::U8 => 1,
            SampleFormat::S16Le => 2,
            SampleFormat::S24_3Le => 3,
            SampleFormat::S32Le | SampleFormat::FloatLe => 4,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, SampleFormat::FloatLe)
    }
}

/// Format descriptors recorded at Configure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub sample_width_bits: u16,
    pub is_float: bool,
    /// Bytes per frame (all channels)
    pub frame_bytes: u32,
}

impl PcmFormat {
    /// Calculate bytes per second
    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.frame_bytes as u64
    }

    /// Calculate number of frames for given bytes
    pub fn bytes_to_frames(&self, bytes: u64) -> u64 {
        if self.frame_bytes == 0 {
            return 0;
        }
        bytes / self.frame_bytes as u64
    }
}

impl std::fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}Hz {}ch {}bit{}",
            self.sample_rate,
            self.channels,
            self.sample_width_bits,
            if self.is_float { " float" } else { "" }
        )
    }
}

/// Parameters requested by the client at Configure (hw_params)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwParams {
    pub channels: u16,
    pub sample_rate: u32,
    pub format: SampleFormat,
    /// Size of the transfer buffer in bytes
    pub buffer_bytes: usize,
    /// Size of one period in bytes
    pub period_bytes: usize,
}

impl HwParams {
    /// Parameters for a ring of `periods` periods of `period_bytes` each
    pub fn from_periods(
        channels: u16,
        sample_rate: u32,
        format: SampleFormat,
        period_bytes: usize,
        periods: usize,
    ) -> Result<Self> {
        let buffer_bytes = period_bytes.checked_mul(periods).ok_or_else(|| {
            PcmError::InvalidParams(format!(
                "{} periods of {} bytes overflow the buffer size",
                periods, period_bytes
            ))
        })?;
        Ok(Self {
            channels,
            sample_rate,
            format,
            buffer_bytes,
            period_bytes,
        })
    }

    /// Format descriptors derived from these parameters
    pub fn pcm_format(&self) -> PcmFormat {
        PcmFormat {
            channels: self.channels,
            sample_rate: self.sample_rate,
            sample_width_bits: self.format.width_bits(),
            is_float: self.format.is_float(),
            frame_bytes: self.format.physical_bytes() * self.channels as u32,
        }
    }
}

/// Capability table advertised by the ring-buffer device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HwConstraints {
    pub formats: Vec<SampleFormat>,
    pub rate_min: u32,
    pub rate_max: u32,
    pub channels_min: u16,
    pub channels_max: u16,
    pub buffer_bytes_max: usize,
    pub period_bytes_min: usize,
    pub period_bytes_max: usize,
    pub periods_min: usize,
    pub periods_max: usize,
}

impl Default for HwConstraints {
    fn default() -> Self {
        Self {
            formats: SampleFormat::ALL.to_vec(),
            rate_min: 8000,
            rate_max: 48000,
            channels_min: 1,
            channels_max: 2,
            buffer_bytes_max: 15360,
            period_bytes_min: 16,
            period_bytes_max: 7680,
            periods_min: 2,
            periods_max: 4,
        }
    }
}

impl HwConstraints {
    /// Check requested parameters against the capability table
    pub fn validate(&self, params: &HwParams) -> Result<()> {
        if !self.formats.contains(&params.format) {
            return Err(PcmError::InvalidParams(format!(
                "unsupported sample format {:?}",
                params.format
            )));
        }
        if !(self.rate_min..=self.rate_max).contains(&params.sample_rate) {
            return Err(PcmError::InvalidParams(format!(
                "rate {} outside {}..={}",
                params.sample_rate, self.rate_min, self.rate_max
            )));
        }
        if !(self.channels_min..=self.channels_max).contains(&params.channels) {
            return Err(PcmError::InvalidParams(format!(
                "{} channels outside {}..={}",
                params.channels, self.channels_min, self.channels_max
            )));
        }
        if !(self.period_bytes_min..=self.period_bytes_max).contains(&params.period_bytes) {
            return Err(PcmError::InvalidParams(format!(
                "period of {} bytes outside {}..={}",
                params.period_bytes, self.period_bytes_min, self.period_bytes_max
            )));
        }
        if params.period_bytes == 0
            || params.buffer_bytes == 0
            || params.buffer_bytes % params.period_bytes != 0
        {
            return Err(PcmError::InvalidParams(format!(
                "buffer of {} bytes is not a whole number of {}-byte periods",
                params.buffer_bytes, params.period_bytes
            )));
        }
        let periods = params.buffer_bytes / params.period_bytes;
        if !(self.periods_min..=self.periods_max).contains(&periods) {
            return Err(PcmError::InvalidParams(format!(
                "{} periods outside {}..={}",
                periods, self.periods_min, self.periods_max
            )));
        }
        let frame_bytes = params.pcm_format().frame_bytes as usize;
        if frame_bytes == 0 || params.period_bytes % frame_bytes != 0 {
            return Err(PcmError::InvalidParams(format!(
                "period of {} bytes splits a {}-byte frame",
                params.period_bytes, frame_bytes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> HwParams {
        HwParams {
            channels: 2,
            sample_rate: 48000,
            format: SampleFormat::S16Le,
            buffer_bytes: 1920,
            period_bytes: 480,
        }
    }

    #[test]
    fn test_format_descriptors() {
        let format = params().pcm_format();
        assert_eq!(format.sample_width_bits, 16);
        assert_eq!(format.frame_bytes, 4);
        assert!(!format.is_float);
        assert_eq!(format.bytes_per_second(), 192_000);
        assert_eq!(format.bytes_to_frames(960), 240);
        assert_eq!(format.to_string(), "48000Hz 2ch 16bit");

        let float = HwParams {
            format: SampleFormat::FloatLe,
            ..params()
        };
        assert!(float.pcm_format().is_float);
        assert_eq!(SampleFormat::S24_3Le.physical_bytes(), 3);
    }

    #[test]
    fn test_from_periods() {
        let built = HwParams::from_periods(2, 48000, SampleFormat::S16Le, 480, 4).unwrap();
        assert_eq!(built, params());

        assert!(matches!(
            HwParams::from_periods(2, 48000, SampleFormat::S16Le, usize::MAX, 2),
            Err(PcmError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_constraints_accept_default_stream() {
        assert!(HwConstraints::default().validate(&params()).is_ok());
    }

    #[test]
    fn test_constraints_reject_out_of_range() {
        let hw = HwConstraints::default();

        let too_fast = HwParams {
            sample_rate: 96000,
            ..params()
        };
        assert!(matches!(
            hw.validate(&too_fast),
            Err(PcmError::InvalidParams(_))
        ));

        let surround = HwParams {
            channels: 6,
            ..params()
        };
        assert!(hw.validate(&surround).is_err());

        // 8 periods
        let many_periods = HwParams {
            buffer_bytes: 3840,
            ..params()
        };
        assert!(hw.validate(&many_periods).is_err());

        let ragged = HwParams {
            buffer_bytes: 1000,
            ..params()
        };
        assert!(hw.validate(&ragged).is_err());
    }
}
