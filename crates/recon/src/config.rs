use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ReconError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Reconciliation settings. Every section is optional; missing values take
/// the defaults below.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub feed: Option<FeedConfig>,
}

fn default_name() -> String {
    "fleetlink".into()
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            matching: MatchingConfig::default(),
            policy: PolicyConfig::default(),
            normalizer: NormalizerConfig::default(),
            run: RunConfig::default(),
            timeouts: TimeoutConfig::default(),
            feed: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Matching + policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MatchingConfig {
    /// Maximum candidates kept per device.
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    /// Minimum Levenshtein similarity for a `fuzzy_match` candidate.
    #[serde(default = "default_fuzzy_floor")]
    pub fuzzy_floor: f64,
}

fn default_top_n() -> usize {
    3
}

fn default_fuzzy_floor() -> f64 {
    0.6
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
            fuzzy_floor: default_fuzzy_floor(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_auto_apply_threshold")]
    pub auto_apply_threshold: f64,
    /// A runner-up this close to the top score makes the match ambiguous.
    #[serde(default = "default_ambiguity_margin")]
    pub ambiguity_margin: f64,
    #[serde(default = "default_suggestion_floor")]
    pub suggestion_floor: f64,
}

fn default_auto_apply_threshold() -> f64 {
    0.95
}

fn default_ambiguity_margin() -> f64 {
    0.05
}

fn default_suggestion_floor() -> f64 {
    0.6
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            auto_apply_threshold: default_auto_apply_threshold(),
            ambiguity_margin: default_ambiguity_margin(),
            suggestion_floor: default_suggestion_floor(),
        }
    }
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct NormalizerConfig {
    /// Regional segments ignored by the `prefix_variant` rule. Compared after
    /// normalization, so they are written in their normalized (upper-case) form.
    #[serde(default = "default_region_tokens")]
    pub region_tokens: Vec<String>,
    /// Extra single-character transliterations; override the built-in table.
    #[serde(default)]
    pub letters: BTreeMap<String, String>,
}

pub fn default_region_tokens() -> Vec<String> {
    ["KSA", "SA", "SAUDI", "UAE", "DXB", "AUH", "SHJ"]
        .iter()
        .map(|t| t.to_string())
        .collect()
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            region_tokens: default_region_tokens(),
            letters: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Run, timeouts, feed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// How many raw devices are echoed into `discoveredDevices`.
    #[serde(default = "default_discovered_sample")]
    pub discovered_sample: usize,
}

fn default_discovered_sample() -> usize {
    20
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            discovered_sample: default_discovered_sample(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_feed_secs")]
    pub feed_secs: u64,
    #[serde(default = "default_repository_ms")]
    pub repository_ms: u64,
}

fn default_feed_secs() -> u64 {
    15
}

fn default_repository_ms() -> u64 {
    5_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            feed_secs: default_feed_secs(),
            repository_ms: default_repository_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn feed(&self) -> Duration {
        Duration::from_secs(self.feed_secs)
    }

    pub fn repository(&self) -> Duration {
        Duration::from_millis(self.repository_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    #[serde(default)]
    pub url: Option<String>,
    /// Environment variable holding the provider's bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

pub fn default_token_env() -> String {
    "FLEETLINK_FEED_TOKEN".into()
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: None,
            token_env: default_token_env(),
        }
    }
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl ReconConfig {
    pub fn from_toml(input: &str) -> Result<Self, ReconError> {
        let mut config: ReconConfig =
            toml::from_str(input).map_err(|e| ReconError::ConfigParse(e.to_string()))?;
        for token in &mut config.normalizer.region_tokens {
            *token = token.trim().to_ascii_uppercase();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ReconError> {
        let unit = [
            ("matching.fuzzy_floor", self.matching.fuzzy_floor),
            ("policy.auto_apply_threshold", self.policy.auto_apply_threshold),
            ("policy.ambiguity_margin", self.policy.ambiguity_margin),
            ("policy.suggestion_floor", self.policy.suggestion_floor),
        ];
        for (key, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(ReconError::ConfigValidation(format!(
                    "{key} must be within 0..=1, got {value}"
                )));
            }
        }

        if self.policy.suggestion_floor > self.policy.auto_apply_threshold {
            return Err(ReconError::ConfigValidation(
                "policy.suggestion_floor cannot exceed policy.auto_apply_threshold".into(),
            ));
        }

        if self.matching.top_n == 0 {
            return Err(ReconError::ConfigValidation(
                "matching.top_n must be at least 1".into(),
            ));
        }

        for (from, to) in &self.normalizer.letters {
            if from.chars().count() != 1 {
                return Err(ReconError::ConfigValidation(format!(
                    "normalizer.letters key '{from}' must be a single character"
                )));
            }
            if !to.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(ReconError::ConfigValidation(format!(
                    "normalizer.letters['{from}'] must map to ASCII letters or digits"
                )));
            }
        }

        for token in &self.normalizer.region_tokens {
            let normalized = !token.is_empty()
                && token.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
            if !normalized {
                return Err(ReconError::ConfigValidation(format!(
                    "normalizer.region_tokens entry '{token}' must be upper-case ASCII letters or digits"
                )));
            }
        }

        if self.timeouts.feed_secs == 0 || self.timeouts.repository_ms == 0 {
            return Err(ReconError::ConfigValidation(
                "timeouts must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
