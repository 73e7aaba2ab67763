//! Entity Mapper - pure conversions between the three record shapes
//!
//! - Domain model (`T: SyncEntity`) used by business logic
//! - [`LocalRecord`]: the row stored in the local store
//! - [`RemoteDto`]: the JSON object exchanged with the backend
//!
//! Conversions are stateless. The remote shape follows the Supabase/PostgREST
//! conventions: the owner is `user_id` and timestamps are RFC 3339 strings.

use crate::models::SyncEntity;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const META_FIELDS: [&str; 4] = ["id", "owner_id", "created_at", "updated_at"];

// ============================================================================
// Local Record
// ============================================================================

/// Type-erased local store row
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRecord {
    pub entity_type: String,
    pub id: String,
    pub owner_id: String,
    pub created_at: i64,
    pub updated_at: i64,
    /// Entity-specific fields (everything except the sync metadata)
    pub payload: Map<String, Value>,
}

impl LocalRecord {
    /// Convert a domain entity into a local row
    pub fn from_entity<T: SyncEntity>(entity: &T) -> Result<Self, MapperError> {
        let value = serde_json::to_value(entity)
            .map_err(|e| MapperError::Serialization(e.to_string()))?;

        let Value::Object(mut payload) = value else {
            return Err(MapperError::NotAnObject(T::ENTITY_TYPE.to_string()));
        };
        for field in META_FIELDS {
            payload.remove(field);
        }

        let meta = entity.meta();
        Ok(Self {
            entity_type: T::ENTITY_TYPE.to_string(),
            id: meta.id.clone(),
            owner_id: meta.owner_id.clone(),
            created_at: meta.created_at,
            updated_at: meta.updated_at,
            payload,
        })
    }

    /// Convert a local row back into its domain entity
    pub fn into_entity<T: SyncEntity>(self) -> Result<T, MapperError> {
        if self.entity_type != T::ENTITY_TYPE {
            return Err(MapperError::TypeMismatch {
                expected: T::ENTITY_TYPE.to_string(),
                actual: self.entity_type,
            });
        }

        let mut map = self.payload;
        map.insert("id".into(), Value::String(self.id));
        map.insert("owner_id".into(), Value::String(self.owner_id));
        map.insert("created_at".into(), Value::from(self.created_at));
        map.insert("updated_at".into(), Value::from(self.updated_at));

        serde_json::from_value(Value::Object(map))
            .map_err(|e| MapperError::Serialization(e.to_string()))
    }

    /// Serialized payload column
    pub fn payload_json(&self) -> Result<String, MapperError> {
        serde_json::to_string(&self.payload).map_err(|e| MapperError::Serialization(e.to_string()))
    }

    /// Parse a payload column back into fields
    pub fn parse_payload(json: &str) -> Result<Map<String, Value>, MapperError> {
        serde_json::from_str(json).map_err(|e| MapperError::Serialization(e.to_string()))
    }
}

// ============================================================================
// Remote DTO
// ============================================================================

/// JSON object as exchanged with the remote store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteDto(pub Map<String, Value>);

impl RemoteDto {
    pub fn from_value(value: Value) -> Result<Self, MapperError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(MapperError::NotAnObject(other.to_string())),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

// ============================================================================
// Mapper Contract
// ============================================================================

/// Stateless conversion between local rows and remote DTOs
pub trait EntityMapper: Send + Sync {
    fn to_remote(&self, record: &LocalRecord) -> Result<RemoteDto, MapperError>;

    fn from_remote(&self, entity_type: &str, dto: RemoteDto) -> Result<LocalRecord, MapperError>;
}

/// Mapper for Supabase-style tables (`user_id`, RFC 3339 timestamps)
#[derive(Debug, Clone, Copy, Default)]
pub struct SupabaseMapper;

impl EntityMapper for SupabaseMapper {
    fn to_remote(&self, record: &LocalRecord) -> Result<RemoteDto, MapperError> {
        let mut map = record.payload.clone();
        map.insert("id".into(), Value::String(record.id.clone()));
        map.insert("user_id".into(), Value::String(record.owner_id.clone()));
        map.insert("created_at".into(), Value::String(millis_to_rfc3339(record.created_at)?));
        map.insert("updated_at".into(), Value::String(millis_to_rfc3339(record.updated_at)?));
        Ok(RemoteDto(map))
    }

    fn from_remote(&self, entity_type: &str, dto: RemoteDto) -> Result<LocalRecord, MapperError> {
        let mut map = dto.0;

        let id = match map.remove("id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(MapperError::MissingField("id")),
        };

        let owner_id = match map.remove("user_id") {
            Some(Value::String(owner)) => owner,
            _ => String::new(),
        };
        map.remove("owner_id");

        let updated_at = map
            .remove("updated_at")
            .map(|v| parse_timestamp(&v))
            .transpose()?
            .ok_or(MapperError::MissingField("updated_at"))?;

        let created_at = map
            .remove("created_at")
            .map(|v| parse_timestamp(&v))
            .transpose()?
            .unwrap_or(updated_at);

        Ok(LocalRecord {
            entity_type: entity_type.to_string(),
            id,
            owner_id,
            created_at,
            updated_at,
            payload: map,
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Format epoch milliseconds as RFC 3339 with millisecond precision
pub fn millis_to_rfc3339(millis: i64) -> Result<String, MapperError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or(MapperError::InvalidTimestamp(millis.to_string()))
}

/// Accept RFC 3339 strings or integer milliseconds
fn parse_timestamp(value: &Value) -> Result<i64, MapperError> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
            .map_err(|_| MapperError::InvalidTimestamp(s.clone())),
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| MapperError::InvalidTimestamp(n.to_string())),
        other => Err(MapperError::InvalidTimestamp(other.to_string())),
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MapperError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Expected a JSON object, got {0}")]
    NotAnObject(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Entity type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },
}

// ============================================================================
// Tests
// ============================================================================
