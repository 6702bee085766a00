use core::{error::Error, time::Duration};
use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    cmd::{Cmd, LoadCmd, ModeCmd},
    scenario::http::Config as HttpConfig,
    threshold::{ThresholdParseError, ThresholdSpec},
};

/// Errors that reject a configuration before the run starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("rate must be positive")]
    ZeroRate,
    #[error("time unit must be positive")]
    ZeroTimeUnit,
    #[error("duration must be positive")]
    ZeroDuration,
    #[error("max VUs must be positive")]
    ZeroMaxVus,
    #[error("pre-allocated VUs must be positive")]
    ZeroPreAllocatedVus,
    #[error("pre-allocated VUs ({pre_allocated}) must not exceed max VUs ({max_vus})")]
    VusAboveCeiling { pre_allocated: usize, max_vus: usize },
    #[error("invalid threshold '{expr}': {source}")]
    Threshold {
        expr: String,
        source: ThresholdParseError,
    },
    #[error("no request templates loaded")]
    NoRequests,
}

#[derive(Debug)]
pub struct Config {
    pub mode: ModeConfig,
    pub load: LoadConfig,
    /// Thresholds evaluated against the final snapshot.
    pub thresholds: Vec<ThresholdSpec>,
    /// Scenario tag every recorded iteration is attributed to.
    pub tag: String,
}

#[derive(Debug, Clone)]
pub enum ModeConfig {
    Http(HttpConfig),
}

/// Load profile: arrival rate, worker limits and thresholds, in
/// file-friendly units. This is what `--profile` files contain.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoadProfile {
    /// Iterations started per time unit.
    pub rate: u64,
    /// Time unit in seconds the rate is measured against.
    #[serde(default = "default_time_unit")]
    pub time_unit: u64,
    /// Duration in seconds.
    pub duration: u64,
    /// Number of workers created eagerly at start.
    pub pre_allocated_vus: usize,
    /// Upper bound on the number of workers.
    pub max_vus: usize,
    /// Per-iteration timeout in milliseconds.
    #[serde(default = "default_iteration_timeout_ms")]
    pub iteration_timeout_ms: u64,
    /// Grace period in seconds for in-flight iterations at shutdown.
    #[serde(default = "default_drain_grace")]
    pub drain_grace: u64,
    #[serde(default)]
    pub thresholds: Vec<ThresholdSpec>,
}

fn default_time_unit() -> u64 {
    1
}

fn default_iteration_timeout_ms() -> u64 {
    4000
}

fn default_drain_grace() -> u64 {
    30
}

impl LoadProfile {
    /// Loads a profile from the given YAML file.
    pub fn from_fs<P>(path: P) -> Result<Self, Box<dyn Error>>
    where
        P: AsRef<Path>,
    {
        let data = fs::read(path)?;
        let profile = serde_yaml::from_slice(&data)?;

        Ok(profile)
    }
}

impl From<LoadCmd> for LoadProfile {
    fn from(v: LoadCmd) -> Self {
        let LoadCmd {
            rate,
            time_unit,
            duration,
            pre_allocated_vus,
            max_vus,
            iteration_timeout,
            drain_grace,
        } = v;

        Self {
            rate,
            time_unit,
            duration,
            pre_allocated_vus,
            max_vus,
            iteration_timeout_ms: iteration_timeout,
            drain_grace,
            thresholds: Vec::new(),
        }
    }
}

/// Validated runtime load settings.
///
/// Never mutated once the run controller leaves the configured state.
#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub rate: u64,
    pub time_unit: Duration,
    pub duration: Duration,
    pub pre_allocated_vus: usize,
    pub max_vus: usize,
    pub iteration_timeout: Duration,
    pub drain_grace: Duration,
}

impl TryFrom<LoadProfile> for LoadConfig {
    type Error = ConfigError;

    fn try_from(v: LoadProfile) -> Result<Self, Self::Error> {
        if v.rate == 0 {
            return Err(ConfigError::ZeroRate);
        }
        if v.time_unit == 0 {
            return Err(ConfigError::ZeroTimeUnit);
        }
        if v.duration == 0 {
            return Err(ConfigError::ZeroDuration);
        }
        if v.max_vus == 0 {
            return Err(ConfigError::ZeroMaxVus);
        }
        if v.pre_allocated_vus == 0 {
            return Err(ConfigError::ZeroPreAllocatedVus);
        }
        if v.pre_allocated_vus > v.max_vus {
            return Err(ConfigError::VusAboveCeiling {
                pre_allocated: v.pre_allocated_vus,
                max_vus: v.max_vus,
            });
        }

        let m = Self {
            rate: v.rate,
            time_unit: Duration::from_secs(v.time_unit),
            duration: Duration::from_secs(v.duration),
            pre_allocated_vus: v.pre_allocated_vus,
            max_vus: v.max_vus,
            iteration_timeout: Duration::from_millis(v.iteration_timeout_ms),
            drain_grace: Duration::from_secs(v.drain_grace),
        };

        Ok(m)
    }
}

impl TryFrom<Cmd> for Config {
    type Error = Box<dyn Error>;

    fn try_from(v: Cmd) -> Result<Self, Self::Error> {
        let (load, mode) = match v.mode {
            ModeCmd::Http(http) => (http.load.clone(), ModeConfig::Http(http.try_into()?)),
        };

        let mut profile: LoadProfile = match &v.profile {
            Some(path) => LoadProfile::from_fs(path)?,
            None => load.into(),
        };

        let mut thresholds = core::mem::take(&mut profile.thresholds);
        for expr in &v.thresholds {
            let spec = expr.parse().map_err(|source| ConfigError::Threshold {
                expr: expr.clone(),
                source,
            })?;
            thresholds.push(spec);
        }

        let m = Self {
            mode,
            load: profile.try_into()?,
            thresholds,
            tag: v.tag,
        };

        Ok(m)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn profile() -> LoadProfile {
        LoadProfile {
            rate: 1000,
            time_unit: 1,
            duration: 60,
            pre_allocated_vus: 200,
            max_vus: 1000,
            iteration_timeout_ms: 4000,
            drain_grace: 30,
            thresholds: Vec::new(),
        }
    }

    #[test]
    fn test_valid_profile() {
        let cfg = LoadConfig::try_from(profile()).unwrap();

        assert_eq!(cfg.rate, 1000);
        assert_eq!(cfg.time_unit, Duration::from_secs(1));
        assert_eq!(cfg.duration, Duration::from_secs(60));
        assert_eq!(cfg.iteration_timeout, Duration::from_millis(4000));
    }

    #[test]
    fn test_rejects_invalid_profiles() {
        let cases = [
            LoadProfile { rate: 0, ..profile() },
            LoadProfile { time_unit: 0, ..profile() },
            LoadProfile { duration: 0, ..profile() },
            LoadProfile { max_vus: 0, ..profile() },
            LoadProfile { pre_allocated_vus: 0, ..profile() },
            LoadProfile {
                pre_allocated_vus: 1001,
                ..profile()
            },
        ];

        for case in cases {
            assert!(LoadConfig::try_from(case).is_err());
        }
    }

    #[test]
    fn test_profile_yaml() {
        let data = r#"
rate: 1000
duration: 60
pre_allocated_vus: 200
max_vus: 1000
thresholds:
  - "iteration_duration{scenario:main_scenario}:p(99.99)<50"
  - "iteration_failed{scenario:main_scenario}:rate<0.0001"
"#;

        let profile: LoadProfile = serde_yaml::from_str(data).unwrap();
        assert_eq!(profile.time_unit, 1);
        assert_eq!(profile.iteration_timeout_ms, 4000);
        assert_eq!(profile.thresholds.len(), 2);
        assert_eq!(
            profile.thresholds[0].to_string(),
            "iteration_duration{scenario:main_scenario}:p(99.99)<50"
        );

        // Malformed threshold expressions must fail the load, not slip
        // through as strings.
        let data = r#"
rate: 1000
duration: 60
pre_allocated_vus: 200
max_vus: 1000
thresholds: ["iteration_duration:median<50"]
"#;
        assert!(serde_yaml::from_str::<LoadProfile>(data).is_err());
    }
}
