//! # Schema Snapshot Capture
//!
//! Structural schema of a collection as of split creation.
//!
//! The schema is captured once per collection, right before its first split
//! is generated, and shared by every split of that collection. Readers decode
//! all chunks of one collection against this one schema even if the source
//! schema changes while the snapshot is running.

use crate::error::{Result, SplitError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use tokio::sync::RwLock;

/// Identifier of a source collection (`database.collection`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CollectionId {
    pub database: String,
    pub collection: String,
}

impl CollectionId {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

impl FromStr for CollectionId {
    type Err = SplitError;

    /// Parse `database.collection`; the collection part may itself contain dots.
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(SplitError::config(format!(
                "Invalid collection id '{}': expected database.collection",
                s
            ))),
        }
    }
}

impl From<CollectionId> for String {
    fn from(id: CollectionId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for CollectionId {
    type Error = SplitError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Definition of one field of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    /// Field name
    pub name: String,
    /// Source-native type (e.g., "int64", "varchar(255)", "objectId")
    pub type_name: String,
    /// Field position (1-indexed)
    pub position: u32,
    /// Is nullable
    pub nullable: bool,
    /// Is part of the shard key
    pub key: bool,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, position: u32) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            position,
            nullable: true,
            key: false,
        }
    }

    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn as_key(mut self) -> Self {
        self.key = true;
        self.nullable = false;
        self
    }
}

/// Structural schema of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub collection: CollectionId,
    pub fields: Vec<FieldDefinition>,
    /// Capture time (epoch millis)
    pub captured_at: i64,
}

impl CollectionSchema {
    pub fn new(collection: CollectionId, fields: Vec<FieldDefinition>) -> Self {
        Self {
            collection,
            fields,
            captured_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Collection id → schema mapping attached to every split.
pub type SchemaSnapshot = BTreeMap<CollectionId, CollectionSchema>;

/// Supplies the structural schema of a collection.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn capture_schema(&self, collection: &CollectionId) -> Result<CollectionSchema>;
}

/// In-memory schema provider for testing.
///
/// Can be told to fail the next `n` captures of a collection to exercise
/// planning retries.
#[derive(Default)]
pub struct MemorySchemaProvider {
    schemas: RwLock<HashMap<CollectionId, Vec<FieldDefinition>>>,
    failures: RwLock<HashMap<CollectionId, (u32, String)>>,
}

impl MemorySchemaProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, collection: CollectionId, fields: Vec<FieldDefinition>) {
        self.schemas.write().await.insert(collection, fields);
    }

    /// Fail the next `times` captures for a collection with a schema error.
    pub async fn fail_next(&self, collection: CollectionId, times: u32, message: impl Into<String>) {
        self.failures
            .write()
            .await
            .insert(collection, (times, message.into()));
    }
}

#[async_trait]
impl SchemaProvider for MemorySchemaProvider {
    async fn capture_schema(&self, collection: &CollectionId) -> Result<CollectionSchema> {
        if let Some((remaining, message)) = self.failures.write().await.get_mut(collection) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SplitError::schema(message.clone()));
            }
        }

        let schemas = self.schemas.read().await;
        let fields = schemas
            .get(collection)
            .ok_or_else(|| SplitError::schema(format!("Unknown collection {}", collection)))?;
        Ok(CollectionSchema::new(collection.clone(), fields.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_id_parse() {
        let id: CollectionId = "shop.orders.archive".parse().unwrap();
        assert_eq!(id.database, "shop");
        assert_eq!(id.collection, "orders.archive");
        assert_eq!(id.to_string(), "shop.orders.archive");

        assert!("orders".parse::<CollectionId>().is_err());
        assert!(".orders".parse::<CollectionId>().is_err());
    }

    #[test]
    fn test_collection_id_serializes_as_string() {
        let mut snapshot = SchemaSnapshot::new();
        let id = CollectionId::new("shop", "orders");
        snapshot.insert(
            id.clone(),
            CollectionSchema::new(id.clone(), vec![FieldDefinition::new("_id", "int64", 1).as_key()]),
        );

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"shop.orders\""));

        let back: SchemaSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back[&id].fields.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_provider_failures() {
        let provider = MemorySchemaProvider::new();
        let id = CollectionId::new("shop", "orders");
        provider
            .insert(id.clone(), vec![FieldDefinition::new("_id", "int64", 1).as_key()])
            .await;
        provider.fail_next(id.clone(), 1, "temporarily unavailable").await;

        assert!(provider.capture_schema(&id).await.is_err());
        let schema = provider.capture_schema(&id).await.unwrap();
        assert!(schema.field("_id").unwrap().key);

        let missing = CollectionId::new("shop", "missing");
        assert!(provider.capture_schema(&missing).await.is_err());
    }
}
