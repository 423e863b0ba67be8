use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Declared index over one or more fields of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexDefinition {
    pub fn on(fields: &[&str]) -> Self {
        Self {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            unique: false,
        }
    }

    /// Whether the index can serve lookups on `field` (leading column).
    pub fn leads_with(&self, field: &str) -> bool {
        self.fields.first().map(String::as_str) == Some(field)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectMetadata {
    pub datasource: Option<String>,
    pub indexes: Vec<IndexDefinition>,
}

/// Object metadata consumed by the services: which datasource an object
/// lives in and which indexes are declared for it.
pub trait MetadataProvider: Send + Sync {
    fn datasource_for(&self, object: &str) -> Option<String>;

    fn indexes(&self, object: &str) -> Vec<IndexDefinition>;
}

/// Metadata held in memory, usually loaded from the `[objects]` table of
/// the engine config.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    objects: BTreeMap<String, ObjectMetadata>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_objects(objects: BTreeMap<String, ObjectMetadata>) -> Self {
        Self { objects }
    }

    pub fn bind(mut self, object: impl Into<String>, datasource: impl Into<String>) -> Self {
        self.objects.entry(object.into()).or_default().datasource = Some(datasource.into());
        self
    }

    pub fn with_index(mut self, object: impl Into<String>, index: IndexDefinition) -> Self {
        self.objects.entry(object.into()).or_default().indexes.push(index);
        self
    }
}

impl MetadataProvider for StaticMetadata {
    fn datasource_for(&self, object: &str) -> Option<String> {
        self.objects.get(object)?.datasource.clone()
    }

    fn indexes(&self, object: &str) -> Vec<IndexDefinition> {
        self.objects
            .get(object)
            .map(|o| o.indexes.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_metadata() {
        let metadata = StaticMetadata::new()
            .bind("users", "main")
            .with_index("users", IndexDefinition::on(&["email"]));
        assert_eq!(metadata.datasource_for("users").as_deref(), Some("main"));
        assert_eq!(metadata.datasource_for("tasks"), None);
        assert_eq!(metadata.indexes("users").len(), 1);
        assert!(metadata.indexes("tasks").is_empty());
    }

    #[test]
    fn test_leads_with() {
        let index = IndexDefinition::on(&["last_name", "first_name"]);
        assert!(index.leads_with("last_name"));
        assert!(!index.leads_with("first_name"));
    }
}
