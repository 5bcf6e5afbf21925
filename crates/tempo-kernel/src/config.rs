//! Already-parsed configuration values.
//!
//! The kernel performs no parsing of its own: frequencies and domain topology
//! arrive as plain values (the CLI decodes them from JSON, language bindings
//! build them directly).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tempo_time::PS_PER_SEC;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("clock domain `{0}` has zero frequency")]
    ZeroFrequency(String),
    #[error("clock domain `{0}` frequency exceeds 1 THz")]
    FrequencyTooHigh(String),
    #[error("duplicate clock domain `{0}`")]
    DuplicateDomain(String),
}

/// One independently-clocked region of the simulated hardware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainConfig {
    pub name: String,
    pub freq_hz: u64,
}

/// Domain topology handed to [`Kernel::open`](crate::Kernel::open).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default)]
    pub domains: Vec<DomainConfig>,
}

impl KernelConfig {
    /// Convenience builder used by tests and embedders.
    pub fn with_domain(mut self, name: impl Into<String>, freq_hz: u64) -> Self {
        self.domains.push(DomainConfig {
            name: name.into(),
            freq_hz,
        });
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, domain) in self.domains.iter().enumerate() {
            if domain.freq_hz == 0 {
                return Err(ConfigError::ZeroFrequency(domain.name.clone()));
            }
            if domain.freq_hz > PS_PER_SEC {
                return Err(ConfigError::FrequencyTooHigh(domain.name.clone()));
            }
            if self.domains[..i].iter().any(|d| d.name == domain.name) {
                return Err(ConfigError::DuplicateDomain(domain.name.clone()));
            }
        }
        Ok(())
    }
}
