//! Configuration loading and representation.
//!
//! Sources, later ones overriding earlier ones:
//! 1. built-in defaults
//! 2. a JSON document (`STUDIO_CONFIG` names the file when loading from env)
//! 3. individual `STUDIO_*` variables

use std::time::Duration;

use chrono::Weekday;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use studio_agency::GameRules;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("rejected game rules: {0}")]
    Rules(#[from] studio_core::DomainError),
    #[error("{0}")]
    Invalid(String),
}

/// When and how often the auto-pilot checks for a due settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoPilotConfig {
    pub weekday: Weekday,
    /// Earliest UTC hour on `weekday` at which the settlement may run.
    pub hour: u32,
    pub poll_interval_secs: u64,
}

impl Default for AutoPilotConfig {
    fn default() -> Self {
        Self {
            weekday: Weekday::Mon,
            hour: 8,
            poll_interval_secs: 60,
        }
    }
}

impl AutoPilotConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudioConfig {
    pub rules: GameRules,
    pub auto_pilot: AutoPilotConfig,
    /// Starting VE of an agency founded through the Mercato.
    pub new_agency_ve: i64,
    pub new_agency_budget: i64,
    /// Attempts for a command that keeps losing the compare-and-swap race.
    pub max_dispatch_attempts: u32,
    /// Fixed seed for black-market rolls; entropy-seeded when absent.
    pub rng_seed: Option<u64>,
    pub database_url: Option<String>,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            rules: GameRules::default(),
            auto_pilot: AutoPilotConfig::default(),
            new_agency_ve: 50,
            new_agency_budget: 0,
            max_dispatch_attempts: 3,
            rng_seed: None,
            database_url: None,
        }
    }
}

impl StudioConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key lookup (the environment in production, a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup("STUDIO_CONFIG") {
            Some(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                serde_json::from_str(&raw)?
            }
            None => Self::default(),
        };

        let rules = &mut config.rules;
        override_num(&lookup, "STUDIO_VE_MULTIPLIER", &mut rules.ve_multiplier)?;
        override_num(&lookup, "STUDIO_REVENUE_BONUS", &mut rules.revenue_bonus)?;
        override_num(&lookup, "STUDIO_REVENUE_BASE", &mut rules.revenue_base)?;
        override_num(&lookup, "STUDIO_RENT", &mut rules.rent)?;
        override_num(&lookup, "STUDIO_SALARY_MULTIPLIER", &mut rules.salary_multiplier)?;
        override_num(&lookup, "STUDIO_SALARY_CAP", &mut rules.salary_cap)?;
        override_num(&lookup, "STUDIO_COST_OF_LIVING", &mut rules.cost_of_living)?;
        override_num(&lookup, "STUDIO_POVERTY_PENALTY", &mut rules.poverty_penalty)?;
        override_num(&lookup, "STUDIO_BANKRUPTCY_THRESHOLD", &mut rules.bankruptcy_threshold)?;
        override_num(&lookup, "STUDIO_HIRE_QUORUM_PCT", &mut rules.hire_quorum_pct)?;
        override_num(&lookup, "STUDIO_FIRE_QUORUM_PCT", &mut rules.fire_quorum_pct)?;
        override_num(&lookup, "STUDIO_FOUND_AGENCY_QUORUM_PCT", &mut rules.found_agency_quorum_pct)?;

        let pilot = &mut config.auto_pilot;
        override_num(&lookup, "STUDIO_AUTOPILOT_WEEKDAY", &mut pilot.weekday)?;
        override_num(&lookup, "STUDIO_AUTOPILOT_HOUR", &mut pilot.hour)?;
        override_num(&lookup, "STUDIO_AUTOPILOT_POLL_SECS", &mut pilot.poll_interval_secs)?;

        override_num(&lookup, "STUDIO_NEW_AGENCY_VE", &mut config.new_agency_ve)?;
        override_num(&lookup, "STUDIO_NEW_AGENCY_BUDGET", &mut config.new_agency_budget)?;
        override_num(&lookup, "STUDIO_DISPATCH_ATTEMPTS", &mut config.max_dispatch_attempts)?;
        if let Some(raw) = lookup("STUDIO_RNG_SEED") {
            config.rng_seed = Some(parse("STUDIO_RNG_SEED", &raw)?);
        }
        if let Some(url) = lookup("DATABASE_URL") {
            config.database_url = Some(url);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rules.validate()?;
        if self.auto_pilot.hour > 23 {
            return Err(ConfigError::Invalid(format!(
                "auto_pilot.hour must be within 0..=23, got {}",
                self.auto_pilot.hour
            )));
        }
        if self.max_dispatch_attempts == 0 {
            return Err(ConfigError::Invalid("max_dispatch_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
    })
}

fn override_num<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(raw) = lookup(key) {
        *target = parse(key, &raw)?;
    }
    Ok(())
}
