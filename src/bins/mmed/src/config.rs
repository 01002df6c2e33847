//! MME configuration
//!
//! Loaded from the `mme:` section of a YAML file. Every field has a
//! default, so a missing file or a partial section still yields a usable
//! configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use mme_crypt::{CipheringAlgorithm, IntegrityAlgorithm};
use mme_nas::types::UeNetworkCapability;
use mme_nas::PlmnId;

use crate::context::TimerKind;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(String),
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// ============================================================================
// Sections
// ============================================================================

/// Served GUMMEI: the identity GUTIs are allocated under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GummeiConfig {
    pub mcc: String,
    pub mnc: String,
    pub mme_gid: u16,
    pub mme_code: u8,
    /// Tracking area code advertised in TAI lists
    pub tac: u16,
}

impl Default for GummeiConfig {
    fn default() -> Self {
        Self {
            mcc: "001".to_string(),
            mnc: "01".to_string(),
            mme_gid: 2,
            mme_code: 1,
            tac: 1,
        }
    }
}

/// NAS algorithm preference, most preferred first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub integrity_order: Vec<String>,
    pub ciphering_order: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            integrity_order: vec!["EIA2".to_string(), "EIA1".to_string(), "EIA0".to_string()],
            ciphering_order: vec!["EEA0".to_string(), "EEA2".to_string(), "EEA1".to_string()],
        }
    }
}

/// Interval and retry budget of one procedure timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerValue {
    pub duration_ms: u64,
    pub max_retries: u32,
}

impl TimerValue {
    pub const fn new(duration_ms: u64, max_retries: u32) -> Self {
        Self { duration_ms, max_retries }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Procedure timers (TS 24.301 clause 10.2)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimersConfig {
    pub t3422: TimerValue,
    pub t3450: TimerValue,
    pub t3460: TimerValue,
    pub t3470: TimerValue,
    pub mobile_reachable: TimerValue,
    pub implicit_detach: TimerValue,
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            t3422: TimerValue::new(6_000, 4),
            t3450: TimerValue::new(6_000, 4),
            t3460: TimerValue::new(6_000, 4),
            t3470: TimerValue::new(6_000, 4),
            // T3412 (54 min) plus 4 min
            mobile_reachable: TimerValue::new(58 * 60 * 1_000, 1),
            implicit_detach: TimerValue::new(58 * 60 * 1_000, 1),
        }
    }
}

impl TimersConfig {
    pub fn get(&self, kind: TimerKind) -> TimerValue {
        match kind {
            TimerKind::T3422 => self.t3422,
            TimerKind::T3450 => self.t3450,
            TimerKind::T3460 => self.t3460,
            TimerKind::T3470 => self.t3470,
            TimerKind::MobileReachable => self.mobile_reachable,
            TimerKind::ImplicitDetach => self.implicit_detach,
        }
    }
}

/// MME configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MmeConfig {
    pub mme_name: String,
    pub gummei: GummeiConfig,
    pub security: SecurityConfig,
    pub timers: TimersConfig,
    /// Periodic TAU timer, encoded as a GPRS timer octet (default 54 min)
    pub t3412: u8,
}

impl Default for MmeConfig {
    fn default() -> Self {
        Self {
            mme_name: "mme".to_string(),
            gummei: GummeiConfig::default(),
            security: SecurityConfig::default(),
            timers: TimersConfig::default(),
            t3412: 0x49,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    mme: Option<MmeConfig>,
}

impl MmeConfig {
    /// Parse the `mme:` section out of a YAML document
    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let file: ConfigFile =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let config = match file.mme {
            Some(config) => config,
            None => {
                log::warn!("No 'mme' section in config, using defaults");
                Self::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from a file. A missing file yields the defaults.
    pub fn load(path: &str) -> ConfigResult<Self> {
        log::info!("Loading configuration from: {}", path);
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Could not read config file '{}': {}. Using defaults.", path, e);
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e.to_string())),
        };
        Self::from_yaml_str(&content)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.plmn_id()?;
        let policy = self.security_policy()?;
        if policy.integrity.is_empty() {
            return Err(ConfigError::Validation("integrity_order is empty".into()));
        }
        if policy.ciphering.is_empty() {
            return Err(ConfigError::Validation("ciphering_order is empty".into()));
        }

        for kind in TimerKind::ALL {
            let value = self.timers.get(kind);
            if value.duration_ms == 0 {
                return Err(ConfigError::Validation(format!("{} duration must be non-zero", kind)));
            }
            if value.max_retries == 0 {
                return Err(ConfigError::Validation(format!("{} max_retries must be at least 1", kind)));
            }
        }
        Ok(())
    }

    pub fn plmn_id(&self) -> ConfigResult<PlmnId> {
        PlmnId::new(&self.gummei.mcc, &self.gummei.mnc)
            .map_err(|e| ConfigError::Validation(format!("gummei: {}", e)))
    }

    pub fn security_policy(&self) -> ConfigResult<SecurityPolicy> {
        let integrity = self
            .security
            .integrity_order
            .iter()
            .map(|name| parse_integrity(name))
            .collect::<ConfigResult<Vec<_>>>()?;
        let ciphering = self
            .security
            .ciphering_order
            .iter()
            .map(|name| parse_ciphering(name))
            .collect::<ConfigResult<Vec<_>>>()?;
        Ok(SecurityPolicy { integrity, ciphering })
    }
}

fn algorithm_id(name: &str, prefix: &str) -> ConfigResult<u8> {
    let upper = name.trim().to_ascii_uppercase();
    upper
        .strip_prefix(prefix)
        .and_then(|n| n.parse::<u8>().ok())
        .filter(|n| *n <= 3)
        .ok_or_else(|| ConfigError::Validation(format!("unknown algorithm '{}'", name)))
}

fn parse_integrity(name: &str) -> ConfigResult<IntegrityAlgorithm> {
    let id = algorithm_id(name, "EIA")?;
    IntegrityAlgorithm::from_u8(id).map_err(|e| ConfigError::Validation(e.to_string()))
}

fn parse_ciphering(name: &str) -> ConfigResult<CipheringAlgorithm> {
    let id = algorithm_id(name, "EEA")?;
    CipheringAlgorithm::from_u8(id).map_err(|e| ConfigError::Validation(e.to_string()))
}

// ============================================================================
// Algorithm selection
// ============================================================================

/// Resolved algorithm preference lists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPolicy {
    pub integrity: Vec<IntegrityAlgorithm>,
    pub ciphering: Vec<CipheringAlgorithm>,
}

impl SecurityPolicy {
    /// First configured pair the UE supports and this MME implements
    pub fn select(
        &self,
        capability: &UeNetworkCapability,
    ) -> Option<(IntegrityAlgorithm, CipheringAlgorithm)> {
        let integrity = self
            .integrity
            .iter()
            .copied()
            .find(|alg| alg.is_supported() && capability.supports_eia(*alg as u8))?;
        let ciphering = self
            .ciphering
            .iter()
            .copied()
            .find(|alg| alg.is_supported() && capability.supports_eea(*alg as u8))?;
        Some((integrity, ciphering))
    }
}
