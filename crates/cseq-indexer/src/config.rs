//! Configuration for the change number indexer.

use crate::error::IndexerError;
use cseq_core::DomainId;
use serde::{Deserialize, Serialize};

/// Indexer configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Name used for the worker's tracing span.
    pub name: String,
    /// Domains that never take part in global sequencing.
    pub excluded_domains: Vec<DomainId>,
    /// Maximum records appended in one cycle before the worker re-checks
    /// shutdown requests and newly registered replicas.
    pub max_records_per_cycle: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            name: "change-number-indexer".to_string(),
            excluded_domains: Vec::new(),
            max_records_per_cycle: 1000,
        }
    }
}

impl IndexerConfig {
    /// Load a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, IndexerError> {
        let config: IndexerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.max_records_per_cycle == 0 {
            return Err(IndexerError::InvalidConfig(
                "max_records_per_cycle must be at least 1".to_string(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(IndexerError::InvalidConfig(
                "name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_excluded(&self, domain: &DomainId) -> bool {
        self.excluded_domains.contains(domain)
    }
}

/// Builder for indexer configuration.
pub struct IndexerConfigBuilder {
    config: IndexerConfig,
}

impl IndexerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: IndexerConfig::default(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn exclude_domain(mut self, domain: DomainId) -> Self {
        if !self.config.excluded_domains.contains(&domain) {
            self.config.excluded_domains.push(domain);
        }
        self
    }

    pub fn max_records_per_cycle(mut self, max: usize) -> Self {
        self.config.max_records_per_cycle = max;
        self
    }

    pub fn build(self) -> IndexerConfig {
        self.config
    }
}

impl Default for IndexerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let admin = DomainId::new("cn=admin data").unwrap();
        let config = IndexerConfigBuilder::new()
            .name("cni-test")
            .exclude_domain(admin.clone())
            .exclude_domain(admin.clone())
            .max_records_per_cycle(10)
            .build();

        assert_eq!(config.name, "cni-test");
        assert_eq!(config.excluded_domains, vec![admin.clone()]);
        assert!(config.is_excluded(&admin));
        assert_eq!(config.max_records_per_cycle, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_json() {
        let config =
            IndexerConfig::from_json(r#"{"excluded_domains": ["cn=admin data"]}"#).unwrap();
        assert_eq!(config.name, "change-number-indexer");
        assert_eq!(config.max_records_per_cycle, 1000);
        assert_eq!(config.excluded_domains.len(), 1);

        assert!(matches!(
            IndexerConfig::from_json(r#"{"max_records_per_cycle": 0}"#),
            Err(IndexerError::InvalidConfig(_))
        ));
        assert!(IndexerConfig::from_json(r#"{"excluded_domains": ["a;b"]}"#).is_err());
        assert!(IndexerConfig::from_json("not json").is_err());
    }
}
