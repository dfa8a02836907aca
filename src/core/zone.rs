//! Temperature zones by distance from the map center

use crate::error::{PixelMapError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Zone {
    Hot,
    Warm,
    Temperate,
    Cool,
    Cold,
}

impl Zone {
    pub const ALL: [Zone; 5] = [Zone::Hot, Zone::Warm, Zone::Temperate, Zone::Cool, Zone::Cold];

    pub fn as_str(&self) -> &'static str {
        match self {
            Zone::Hot => "HOT",
            Zone::Warm => "WARM",
            Zone::Temperate => "TEMPERATE",
            Zone::Cool => "COOL",
            Zone::Cold => "COLD",
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upper distance bound (exclusive) of each zone; COLD is everything past `cool`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneThresholds {
    pub hot: f64,
    pub warm: f64,
    pub temperate: f64,
    pub cool: f64,
}

impl Default for ZoneThresholds {
    fn default() -> Self {
        ZoneThresholds {
            hot: 128.0,
            warm: 384.0,
            temperate: 768.0,
            cool: 1536.0,
        }
    }
}

impl ZoneThresholds {
    /// Thresholds must be positive and strictly increasing
    pub fn validate(&self) -> Result<()> {
        let bounds = [self.hot, self.warm, self.temperate, self.cool];
        if bounds.iter().any(|b| !b.is_finite() || *b <= 0.0) {
            return Err(PixelMapError::Config(format!(
                "zone thresholds must be positive: {:?}",
                bounds
            )));
        }
        if bounds.windows(2).any(|w| w[0] >= w[1]) {
            return Err(PixelMapError::Config(format!(
                "zone thresholds must be strictly increasing: {:?}",
                bounds
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ZoneClassifier {
    thresholds: ZoneThresholds,
}

impl ZoneClassifier {
    pub fn new(thresholds: ZoneThresholds) -> Self {
        ZoneClassifier { thresholds }
    }

    pub fn thresholds(&self) -> &ZoneThresholds {
        &self.thresholds
    }

    /// Distance at which the COLD band begins
    pub fn cold_threshold(&self) -> f64 {
        self.thresholds.cool
    }

    pub fn classify(&self, distance: f64) -> Zone {
        let t = &self.thresholds;
        if distance < t.hot {
            Zone::Hot
        } else if distance < t.warm {
            Zone::Warm
        } else if distance < t.temperate {
            Zone::Temperate
        } else if distance < t.cool {
            Zone::Cool
        } else {
            // NaN lands here too
            Zone::Cold
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bands() {
        let zones = ZoneClassifier::default();
        assert_eq!(zones.classify(0.0), Zone::Hot);
        assert_eq!(zones.classify(127.9), Zone::Hot);
        assert_eq!(zones.classify(128.0), Zone::Warm);
        assert_eq!(zones.classify(383.0), Zone::Warm);
        assert_eq!(zones.classify(384.0), Zone::Temperate);
        assert_eq!(zones.classify(1000.0), Zone::Cool);
        assert_eq!(zones.classify(1536.0), Zone::Cold);
        assert_eq!(zones.classify(f64::NAN), Zone::Cold);
    }

    #[test]
    fn test_custom_thresholds() {
        let zones = ZoneClassifier::new(ZoneThresholds {
            hot: 4.0,
            warm: 8.0,
            temperate: 16.0,
            cool: 32.0,
        });
        assert_eq!(zones.classify(5.0), Zone::Warm);
        assert_eq!(zones.classify(40.0), Zone::Cold);
        assert_eq!(zones.cold_threshold(), 32.0);
    }

    #[test]
    fn test_validation() {
        assert!(ZoneThresholds::default().validate().is_ok());
        let bad = ZoneThresholds {
            hot: 10.0,
            warm: 5.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_zone_names() {
        assert_eq!(Zone::Temperate.to_string(), "TEMPERATE");
        assert_eq!(serde_json::to_string(&Zone::Cold).unwrap(), "\"COLD\"");
    }
}
