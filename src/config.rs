use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::types::{Amount, COIN};
use crate::mix::charger::ChargePolicy;
use crate::mix::denom::COLLATERAL_AMOUNT;
use crate::network::protocol::MIN_MIX_PROTO_VERSION;

/// Mixing pool settings. Every field has a default, so a config file only
/// needs the keys it changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixConfig {
    /// Participants per session; also the number of entries mixed.
    pub max_participants: usize,
    /// Queue and entry collection timeout, and entry/announcement lifetime.
    pub queue_timeout_secs: u64,
    pub signing_timeout_secs: u64,
    /// Time spent in Success or Error before returning to Idle.
    pub cooldown_secs: u64,
    /// Extra slack a participant gives its coordinator before timing out.
    pub participant_lag_secs: u64,
    pub min_protocol_version: u32,
    /// Fee a collateral transaction must pay.
    pub collateral_amount: Amount,
    /// Largest input total one entry may bring.
    pub pool_max: Amount,
    pub tick_interval_ms: u64,
    /// Start mixing automatically when a participant is idle.
    pub auto_denominate: bool,
    /// Ticks between automatic mixing attempts.
    pub auto_denominate_ticks: u64,
    /// Fixed seed for the pool RNG. Entropy is used when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rng_seed: Option<u64>,
    pub charge: ChargePolicy,
}

impl Default for MixConfig {
    fn default() -> Self {
        Self {
            max_participants: 3,
            queue_timeout_secs: 30,
            signing_timeout_secs: 15,
            cooldown_secs: 10,
            participant_lag_secs: 10,
            min_protocol_version: MIN_MIX_PROTO_VERSION,
            collateral_amount: COLLATERAL_AMOUNT,
            pool_max: 99_999 * COIN + 99 * COIN / 100,
            tick_interval_ms: 1_000,
            auto_denominate: true,
            auto_denominate_ticks: 15,
            rng_seed: None,
            charge: ChargePolicy::default(),
        }
    }
}

impl MixConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: MixConfig = toml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_participants < 2 {
            bail!("max_participants must be at least 2, got {}", self.max_participants);
        }
        if self.tick_interval_ms == 0 {
            bail!("tick_interval_ms must be positive");
        }
        if self.collateral_amount <= 0 {
            bail!("collateral_amount must be positive");
        }
        let p = &self.charge;
        for (name, v) in [
            ("charge_percent", p.charge_percent),
            ("mostly_offending_skip_percent", p.mostly_offending_skip_percent),
            ("multi_offender_threshold", p.multi_offender_threshold),
            ("success_charge_percent", p.success_charge_percent),
        ] {
            if v > 100 {
                bail!("charge.{} must be within 0..=100, got {}", name, v);
            }
        }
        Ok(())
    }

    pub fn queue_timeout_ms(&self) -> u64 {
        self.queue_timeout_secs * 1_000
    }

    pub fn signing_timeout_ms(&self) -> u64 {
        self.signing_timeout_secs * 1_000
    }

    pub fn cooldown_ms(&self) -> u64 {
        self.cooldown_secs * 1_000
    }

    pub fn participant_lag_ms(&self) -> u64 {
        self.participant_lag_secs * 1_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "max_participants = 5\nrng_seed = 42\n[charge]\ncharge_percent = 50").unwrap();

        let config = MixConfig::load(file.path()).unwrap();
        assert_eq!(config.max_participants, 5);
        assert_eq!(config.rng_seed, Some(42));
        assert_eq!(config.charge.charge_percent, 50);
        assert_eq!(config.charge.multi_offender_threshold, 50);
        assert_eq!(config.signing_timeout_secs, 15);
    }

    #[test]
    fn default_round_trips_through_toml() {
        let text = MixConfig::default().to_toml().unwrap();
        let parsed: MixConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, MixConfig::default());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "max_participants = 1").unwrap();
        assert!(MixConfig::load(file.path()).is_err());

        let bad = MixConfig {
            charge: ChargePolicy { charge_percent: 101, ..ChargePolicy::default() },
            ..MixConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MixConfig::load(&dir.path().join("nope.toml")).is_err());
    }
}
