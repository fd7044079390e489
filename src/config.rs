//! Target configuration (spec.md §4.8).
//!
//! Parsed from `key=value` option strings supplied by the host at attach
//! time, following the same "fail loudly, synchronously" posture the
//! teacher applies to its own CLI arguments (`oetiker-fat32expander/src/main.rs`).

use crate::error::{Error, Result};

/// Default quarantine threshold (spec.md §4.8: "Default 10", though §4.3
/// notes tests commonly use a smaller value such as 3).
pub const DEFAULT_ERROR_THRESHOLD: u8 = 10;

/// Default number of redundant on-spare superblock copies (spec.md §3, §4.8).
pub const DEFAULT_METADATA_COPIES: u8 = 3;

/// Default fast-path threshold in bytes: requests at or below this size use
/// the sector-fast-path when unmapped (spec.md §4.8).
pub const DEFAULT_FAST_PATH_THRESHOLD: u32 = 64 * 1024;

/// Saturating cap for per-sector error counters (spec.md §4.3).
pub const ERROR_COUNTER_CAP: u8 = 255;

/// Recognized configuration options for an attached target (spec.md §4.8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Quarantine triggers when either error counter reaches this value.
    pub error_threshold: u8,
    /// If false, quarantine marks the sector but does not enqueue a remap.
    pub auto_remap: bool,
    /// Requests at or below this size use the sector-fast-path when unmapped.
    pub fast_path_threshold: u32,
    /// Diagnostic verbosity, 0-3.
    pub debug_level: u8,
    /// Number of redundant superblock copies, K (odd, >= 1).
    pub metadata_copies: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            auto_remap: true,
            fast_path_threshold: DEFAULT_FAST_PATH_THRESHOLD,
            debug_level: 0,
            metadata_copies: DEFAULT_METADATA_COPIES,
        }
    }
}

impl Config {
    /// Parse a list of `key=value` strings into a `Config`, starting from
    /// defaults. Unknown keys or out-of-range values are rejected
    /// synchronously (spec.md §7: `ConstructionError`).
    pub fn parse(options: &[String]) -> Result<Self> {
        let mut config = Self::default();
        for opt in options {
            let (key, value) = opt.split_once('=').ok_or_else(|| Error::UnknownOption(opt.clone()))?;
            config.apply(key, value)?;
        }
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "error_threshold" => {
                self.error_threshold = parse_in_range(key, value, 1, ERROR_COUNTER_CAP)?;
            }
            "auto_remap" => {
                self.auto_remap = parse_bool(key, value)?;
            }
            "fast_path_threshold" => {
                self.fast_path_threshold = value.parse().map_err(|_| Error::InvalidOptionValue {
                    key: key.to_string(),
                    value: value.to_string(),
                    reason: "expected a byte count".to_string(),
                })?;
            }
            "debug_level" => {
                self.debug_level = parse_in_range(key, value, 0, 3)?;
            }
            "metadata_copies" => {
                self.metadata_copies = parse_in_range(key, value, 1, 99)?;
            }
            _ => return Err(Error::UnknownOption(key.to_string())),
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.metadata_copies % 2 == 0 {
            return Err(Error::InvalidOptionValue {
                key: "metadata_copies".to_string(),
                value: self.metadata_copies.to_string(),
                reason: "must be odd".to_string(),
            });
        }
        Ok(())
    }

    /// The host's `log` verbosity filter implied by `debug_level`.
    pub fn log_filter(&self) -> log::LevelFilter {
        match self.debug_level {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "0" | "false" => Ok(false),
        "1" | "true" => Ok(true),
        _ => Err(Error::InvalidOptionValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected 0/1 or true/false".to_string(),
        }),
    }
}

fn parse_in_range(key: &str, value: &str, min: u8, max: u8) -> Result<u8> {
    let parsed: u8 = value.parse().map_err(|_| Error::InvalidOptionValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: "expected an integer".to_string(),
    })?;
    if parsed < min || parsed > max {
        return Err(Error::InvalidOptionValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: format!("must be between {} and {}", min, max),
        });
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.error_threshold, DEFAULT_ERROR_THRESHOLD);
        assert!(config.auto_remap);
        assert_eq!(config.metadata_copies, 3);
    }

    #[test]
    fn test_parse_overrides() {
        let opts = vec![
            "error_threshold=2".to_string(),
            "auto_remap=0".to_string(),
            "debug_level=3".to_string(),
        ];
        let config = Config::parse(&opts).unwrap();
        assert_eq!(config.error_threshold, 2);
        assert!(!config.auto_remap);
        assert_eq!(config.debug_level, 3);
    }

    #[test]
    fn test_unknown_option_rejected() {
        let opts = vec!["bogus=1".to_string()];
        assert!(matches!(
            Config::parse(&opts),
            Err(Error::UnknownOption(_))
        ));
    }

    #[test]
    fn test_even_metadata_copies_rejected() {
        let opts = vec!["metadata_copies=4".to_string()];
        assert!(Config::parse(&opts).is_err());
    }

    #[test]
    fn test_out_of_range_debug_level_rejected() {
        let opts = vec!["debug_level=9".to_string()];
        assert!(Config::parse(&opts).is_err());
    }
}
