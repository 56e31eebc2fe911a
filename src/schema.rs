use std::collections::BTreeSet;

use crate::bundle::{Bundle, MalformedBundle};
use crate::config::HandoffConfig;

const CORE_RESOURCES: &[&str] = &["server", "image", "keypairname", "security_group", "rule"];
const VOLUME_RESOURCES: &[&str] = &["volume1", "volume2", "metadata", "attachment"];
const SNAPSHOT_RESOURCE: &str = "snapshot";

/// Resource names a bundle must carry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleSchema {
    required: BTreeSet<String>,
}

impl BundleSchema {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The resources an isolation run hands over, given which services are enabled.
    pub fn from_config(config: &HandoffConfig) -> Self {
        let mut schema = Self::empty().require_all(CORE_RESOURCES.iter().copied());
        if config.volumes_enabled {
            schema = schema.require_all(VOLUME_RESOURCES.iter().copied());
        }
        if config.snapshot_enabled {
            schema = schema.require(SNAPSHOT_RESOURCE);
        }
        schema
    }

    pub fn require(mut self, name: impl Into<String>) -> Self {
        self.required.insert(name.into());
        self
    }

    pub fn require_all<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn required(&self) -> impl Iterator<Item = &str> {
        self.required.iter().map(String::as_str)
    }

    pub fn check(&self, bundle: &Bundle) -> Result<(), MalformedBundle> {
        let missing: Vec<&str> = self
            .required()
            .filter(|name| !bundle.contains(name))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(MalformedBundle::new(format!(
            "missing required resource(s): {}",
            missing.join(", ")
        )))
    }
}
