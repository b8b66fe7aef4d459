use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// One permitted relation and its permitted columns, in source order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllowlistEntry {
    pub relation: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AllowlistSource {
    #[serde(default)]
    schema: Option<String>,
    tables: BTreeMap<String, Vec<String>>,
}

/// Closed set of relations and columns a query may touch.
///
/// Built once at startup and only read afterwards, so it can be shared by
/// reference (or behind an `Arc`) across any number of concurrent requests.
#[derive(Debug, Clone, Default)]
pub struct AllowlistRegistry {
    schema: Option<String>,
    entries: Vec<AllowlistEntry>,
}

impl AllowlistRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            RegistryError::SchemaLoad(format!("read {} failed: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, RegistryError> {
        let source: AllowlistSource =
            serde_json::from_str(text).map_err(|e| RegistryError::SchemaLoad(e.to_string()))?;
        let entries = source
            .tables
            .into_iter()
            .map(|(relation, columns)| AllowlistEntry { relation, columns })
            .collect();
        Self::from_entries(source.schema, entries)
    }

    pub fn from_entries(
        schema: Option<String>,
        entries: Vec<AllowlistEntry>,
    ) -> Result<Self, RegistryError> {
        let mut seen_relations = HashSet::new();
        for entry in &entries {
            if entry.relation.trim().is_empty() {
                return Err(RegistryError::SchemaLoad(
                    "relation name must not be empty".to_string(),
                ));
            }
            if !seen_relations.insert(entry.relation.to_lowercase()) {
                return Err(RegistryError::SchemaLoad(format!(
                    "relation {} listed more than once",
                    entry.relation
                )));
            }
            let mut seen_columns = HashSet::new();
            for column in &entry.columns {
                if column.trim().is_empty() {
                    return Err(RegistryError::SchemaLoad(format!(
                        "relation {} has an empty column name",
                        entry.relation
                    )));
                }
                if !seen_columns.insert(column.to_lowercase()) {
                    return Err(RegistryError::SchemaLoad(format!(
                        "relation {} lists column {} more than once",
                        entry.relation, column
                    )));
                }
            }
        }
        Ok(Self { schema, entries })
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn contains(&self, relation: &str) -> bool {
        self.find(relation).is_some()
    }

    pub fn columns_of(&self, relation: &str) -> Result<&[String], RegistryError> {
        self.find(relation)
            .map(|entry| entry.columns.as_slice())
            .ok_or_else(|| RegistryError::UnknownRelation(relation.to_string()))
    }

    pub fn relations(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.relation.clone()).collect()
    }

    pub fn entries(&self) -> &[AllowlistEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find(&self, relation: &str) -> Option<&AllowlistEntry> {
        let wanted = relation.trim();
        self.entries
            .iter()
            .find(|e| e.relation.eq_ignore_ascii_case(wanted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"{
        "schema": "bank",
        "tables": {
            "satislar": ["tarih", "tutar", "musteri_id"],
            "musteriler": ["musteri_id", "ad"]
        }
    }"#;

    #[test]
    fn loads_relations_and_ordered_columns() {
        let registry = AllowlistRegistry::from_json_str(SOURCE).unwrap();
        assert_eq!(registry.schema(), Some("bank"));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("satislar"));
        assert!(registry.contains("SATISLAR"));
        assert_eq!(
            registry.columns_of("satislar").unwrap(),
            ["tarih", "tutar", "musteri_id"]
        );
    }

    #[test]
    fn unknown_relation_is_reported_as_data() {
        let registry = AllowlistRegistry::from_json_str(SOURCE).unwrap();
        assert!(!registry.contains("kartlar"));
        assert_eq!(
            registry.columns_of("kartlar"),
            Err(RegistryError::UnknownRelation("kartlar".to_string()))
        );
    }

    #[test]
    fn malformed_source_fails_to_load() {
        assert!(matches!(
            AllowlistRegistry::from_json_str("{\"tables\": [1, 2]}"),
            Err(RegistryError::SchemaLoad(_))
        ));
        assert!(matches!(
            AllowlistRegistry::from_json_str("not json"),
            Err(RegistryError::SchemaLoad(_))
        ));
        assert!(matches!(
            AllowlistRegistry::from_json_str(r#"{"tables": {"t": ["a", "A"]}}"#),
            Err(RegistryError::SchemaLoad(_))
        ));
    }

    #[test]
    fn missing_source_fails_to_load() {
        assert!(matches!(
            AllowlistRegistry::load("/nonexistent/allowlist.json"),
            Err(RegistryError::SchemaLoad(_))
        ));
    }

    #[test]
    fn empty_table_map_is_allowed() {
        let registry = AllowlistRegistry::from_json_str(r#"{"tables": {}}"#).unwrap();
        assert!(registry.is_empty());
        assert!(registry.relations().is_empty());
    }
}
