// src/sync/cadence.rs
//! Human cadence expressions such as `every 5 minutes`.

use std::time::Duration;

use once_cell::sync::OnceCell;
use regex::Regex;

use crate::error::ConfigFault;

/// Longest accepted period.
pub const MAX_PERIOD: Duration = Duration::from_secs(366 * 86_400);

/// Parsed recurring trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cadence {
    pub expression: String,
    pub period: Duration,
}

impl Cadence {
    /// Accepts `every <n> <unit>` and `every <unit>`; units are seconds,
    /// minutes, hours or days with the usual abbreviations. Periods above
    /// [`MAX_PERIOD`] are refused.
    pub fn parse(expression: &str) -> Result<Self, ConfigFault> {
        static RE: OnceCell<Regex> = OnceCell::new();
        let re = RE.get_or_init(|| {
            Regex::new(
                r"(?i)^\s*every\s+(?:(?P<n>\d+)\s*)?(?P<unit>seconds?|secs?|s|minutes?|mins?|m|hours?|hrs?|h|days?|d)\s*$",
            )
            .expect("cadence regex")
        });

        let fail = || ConfigFault::Cadence(expression.to_string());
        let caps = re.captures(expression).ok_or_else(fail)?;

        let n: u64 = match caps.name("n") {
            Some(m) => m.as_str().parse().map_err(|_| fail())?,
            None => 1,
        };
        if n == 0 {
            return Err(fail());
        }

        let unit = caps
            .name("unit")
            .map(|m| m.as_str().to_ascii_lowercase())
            .unwrap_or_default();
        let unit_secs: u64 = match unit.chars().next() {
            Some('s') => 1,
            Some('m') => 60,
            Some('h') => 3_600,
            Some('d') => 86_400,
            _ => return Err(fail()),
        };

        let period = n
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .filter(|p| *p <= MAX_PERIOD)
            .ok_or_else(fail)?;
        Ok(Self {
            expression: expression.trim().to_string(),
            period,
        })
    }
}
