//! Latency-class profile shared by every stage that has a buffering or
//! probing choice to make.

use std::str::FromStr;

/// Buffering/probing profile. Lower numeric value = lower latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LatencyClass {
    UltraLow = 0,
    Low = 1,
    #[default]
    Standard = 2,
}

impl LatencyClass {
    /// Demuxer probe size in bytes.
    pub fn probe_size(self) -> u32 {
        match self {
            LatencyClass::UltraLow => 32 * 1024,
            LatencyClass::Low => 200 * 1024,
            LatencyClass::Standard => 1024 * 1024,
        }
    }

    /// Demuxer analyze-duration in microseconds; only UltraLow specifies an
    /// explicit value, the others use the source's default.
    pub fn analyze_duration_us(self) -> Option<u32> {
        match self {
            LatencyClass::UltraLow => Some(50_000),
            _ => None,
        }
    }

    /// `nobuffer`/`low_delay`-equivalent flags wanted on the source.
    pub fn low_delay(self) -> bool {
        matches!(self, LatencyClass::UltraLow | LatencyClass::Low)
    }

    /// ScreenGrab capture queue depth: max 1 for UltraLow/Low, 3 for
    /// Standard.
    pub fn capture_queue_depth(self) -> usize {
        match self {
            LatencyClass::UltraLow | LatencyClass::Low => 1,
            LatencyClass::Standard => 3,
        }
    }
}

impl FromStr for LatencyClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "0" | "ultralow" | "ultra-low" | "ultra_low" => Ok(LatencyClass::UltraLow),
            "1" | "low" => Ok(LatencyClass::Low),
            "2" | "standard" => Ok(LatencyClass::Standard),
            other => Err(format!("unrecognized latency level: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_and_named_levels() {
        assert_eq!("0".parse::<LatencyClass>().unwrap(), LatencyClass::UltraLow);
        assert_eq!("Low".parse::<LatencyClass>().unwrap(), LatencyClass::Low);
        assert_eq!(
            "standard".parse::<LatencyClass>().unwrap(),
            LatencyClass::Standard
        );
        assert!("bogus".parse::<LatencyClass>().is_err());
    }

    #[test]
    fn queue_depth_matches_spec_table() {
        assert_eq!(LatencyClass::UltraLow.capture_queue_depth(), 1);
        assert_eq!(LatencyClass::Low.capture_queue_depth(), 1);
        assert_eq!(LatencyClass::Standard.capture_queue_depth(), 3);
    }

    #[test]
    fn ordering_is_latency_rank() {
        assert!(LatencyClass::UltraLow < LatencyClass::Low);
        assert!(LatencyClass::Low < LatencyClass::Standard);
    }
}
