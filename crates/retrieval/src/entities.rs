//! Entity schema documents and column-value records.
//!
//! These are produced offline by the data dictionary tooling and loaded
//! read-only at startup; the JSON field names are the storage contract.

use serde::{Deserialize, Serialize};
use sql_agent_common::{DatabaseEngine, Result, Text2SqlError};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_values: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ForeignKeyPair {
    pub column: String,
    pub foreign_column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EntityRelationship {
    #[serde(rename = "ForeignFQN")]
    pub foreign_fqn: String,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyPair>,
}

/// One logical table or view exposed for querying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EntitySchema {
    #[serde(rename = "FQN")]
    pub fqn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    pub schema: String,
    pub entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_name: Option<String>,
    pub definition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warehouse: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<String>,
    #[serde(default)]
    pub columns: Vec<ColumnSchema>,
    #[serde(default)]
    pub entity_relationships: Vec<EntityRelationship>,
    /// Multi-hop join paths as "A -> B -> C" strings.
    #[serde(default, rename = "CompleteEntityRelationshipsGraph")]
    pub complete_entity_relationships_graph: Vec<String>,
}

impl EntitySchema {
    /// The identifier queries should select from on the target engine.
    /// Warehouse engines need the level above `schema.entity`.
    pub fn select_from_entity(&self, engine: DatabaseEngine) -> String {
        match engine {
            DatabaseEngine::Snowflake => match &self.database {
                Some(database) => format!("{database}.{}.{}", self.schema, self.entity),
                None => format!("{}.{}", self.schema, self.entity),
            },
            DatabaseEngine::Databricks => match &self.catalog {
                Some(catalog) => format!("{catalog}.{}.{}", self.schema, self.entity),
                None => format!("{}.{}", self.schema, self.entity),
            },
            _ => format!("{}.{}", self.schema, self.entity),
        }
    }

    /// Text fed to the embedder and keyword leg when indexing.
    pub fn embed_text(&self) -> String {
        let mut parts = vec![
            self.entity_name.clone().unwrap_or_else(|| self.entity.clone()),
            self.definition.clone(),
        ];
        for column in &self.columns {
            parts.push(column.name.clone());
            if let Some(definition) = &column.definition {
                parts.push(definition.clone());
            }
        }
        parts.join(" ")
    }

    /// Strip engine-specific prefixes (warehouse/catalog) from the
    /// relationship-graph strings so prompts stay engine-neutral.
    pub fn trim_engine_fields(&mut self, engine: DatabaseEngine) {
        let prefix = match engine {
            DatabaseEngine::Snowflake => self.warehouse.clone(),
            DatabaseEngine::Databricks => self.catalog.clone(),
            _ => None,
        };
        if let Some(prefix) = prefix {
            let marker = format!("{prefix}.");
            for path in &mut self.complete_entity_relationships_graph {
                *path = path.replace(&marker, "");
            }
        }
    }
}

/// One distinct string dimension value, JSON Lines on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ColumnValueRecord {
    #[serde(rename = "FQN")]
    pub fqn: String,
    pub entity: String,
    pub schema: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    pub column: String,
    pub value: String,
    #[serde(default)]
    pub synonyms: Vec<String>,
}

impl ColumnValueRecord {
    pub fn embed_text(&self) -> String {
        let mut parts = vec![self.entity.clone(), self.column.clone(), self.value.clone()];
        parts.extend(self.synonyms.iter().cloned());
        parts.join(" ")
    }
}

/// Load entity documents from a directory of `*.json` files. Each file
/// holds either a single document or an array of them.
pub fn load_entities_from_dir(dir: impl AsRef<Path>) -> Result<Vec<EntitySchema>> {
    let mut entities = Vec::new();
    for entry in std::fs::read_dir(dir.as_ref())? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let raw = std::fs::read_to_string(&path)?;
        let parsed: serde_json::Value = serde_json::from_str(&raw)?;
        match parsed {
            serde_json::Value::Array(items) => {
                for item in items {
                    entities.push(serde_json::from_value(item)?);
                }
            }
            item => entities.push(serde_json::from_value(item)?),
        }
    }
    Ok(entities)
}

/// Load column-value records from a JSON Lines file.
pub fn load_column_values_jsonl(path: impl AsRef<Path>) -> Result<Vec<ColumnValueRecord>> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| {
                Text2SqlError::Config(format!("Malformed column value record: {e}"))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_header() -> EntitySchema {
        serde_json::from_value(json!({
            "FQN": "adventureworks.SalesLT.SalesOrderHeader",
            "Database": "adventureworks",
            "Schema": "SalesLT",
            "Entity": "SalesOrderHeader",
            "EntityName": "Sales Order Header",
            "Definition": "One row per customer order with totals and dates.",
            "Columns": [
                {"Name": "OrderDate", "DataType": "datetime"},
                {"Name": "TotalDue", "DataType": "money", "Definition": "Total amount due"}
            ],
            "EntityRelationships": [
                {"ForeignFQN": "adventureworks.SalesLT.Address",
                 "ForeignKeys": [{"Column": "ShipToAddressID", "ForeignColumn": "AddressID"}]}
            ],
            "CompleteEntityRelationshipsGraph": [
                "adventureworks.SalesLT.SalesOrderHeader -> adventureworks.SalesLT.Address"
            ]
        }))
        .unwrap()
    }

    #[test]
    fn document_fields_round_trip() {
        let entity = order_header();
        let value = serde_json::to_value(&entity).unwrap();
        assert_eq!(value["FQN"], "adventureworks.SalesLT.SalesOrderHeader");
        assert_eq!(value["EntityRelationships"][0]["ForeignFQN"], "adventureworks.SalesLT.Address");
        let back: EntitySchema = serde_json::from_value(value).unwrap();
        assert_eq!(back, entity);
    }

    #[test]
    fn select_from_entity_per_engine() {
        let mut entity = order_header();
        assert_eq!(entity.select_from_entity(DatabaseEngine::Tsql), "SalesLT.SalesOrderHeader");
        assert_eq!(
            entity.select_from_entity(DatabaseEngine::Snowflake),
            "adventureworks.SalesLT.SalesOrderHeader"
        );
        entity.catalog = Some("analytics".into());
        assert_eq!(
            entity.select_from_entity(DatabaseEngine::Databricks),
            "analytics.SalesLT.SalesOrderHeader"
        );
    }

    #[test]
    fn embed_text_includes_columns() {
        let text = order_header().embed_text();
        assert!(text.contains("Sales Order Header"));
        assert!(text.contains("TotalDue"));
        assert!(text.contains("Total amount due"));
    }

    #[test]
    fn column_value_jsonl_round_trip() {
        let record = ColumnValueRecord {
            fqn: "db.SalesLT.Address".into(),
            entity: "Address".into(),
            schema: "SalesLT".into(),
            database: Some("db".into()),
            column: "CountryRegion".into(),
            value: "United Kingdom".into(),
            synonyms: vec!["UK".into(), "Great Britain".into()],
        };
        let line = serde_json::to_string(&record).unwrap();
        let back: ColumnValueRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back, record);
    }
}
