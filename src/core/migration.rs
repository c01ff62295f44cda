//! Tag index schema versioning and in-memory migration.
//!
//! - **Version field**: `metadata.schema_version` (documents written before the
//!   field existed carry `metadata.version` or nothing and are treated as v1)
//! - **Idempotent migrations**: each step only fills in what is missing
//! - **Persisted lazily**: a migrated document is rewritten by the next index
//!   write, never by a read
//! - **Newer versions are refused**: a document from a future schema is
//!   reported as corrupt instead of being downgraded

use serde_json::{Map, Value};

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u64 = 2;

/// Migration definition
pub struct SchemaMigration {
    /// Version this migration upgrades from
    pub from_version: u64,
    /// Human-readable description
    pub description: &'static str,
    /// Migration function; must be idempotent
    pub up: fn(&mut Map<String, Value>),
}

/// All migrations in chronological order
pub fn all_migrations() -> Vec<SchemaMigration> {
    vec![SchemaMigration {
        from_version: 1,
        description: "Add chains array and metadata.schema_version; drop metadata.version",
        up: migrate_v1_chains_and_version,
    }]
}

/// Reads the schema version of a raw document.
pub fn detect_version(doc: &Value) -> u64 {
    let meta = doc.get("metadata");
    meta.and_then(|m| m.get("schema_version"))
        .and_then(Value::as_u64)
        .or_else(|| {
            meta.and_then(|m| m.get("version"))
                .and_then(|v| v.as_u64().or_else(|| v.as_str()?.split('.').next()?.parse().ok()))
        })
        .unwrap_or(1)
}

/// Upgrade `doc` in place to `CURRENT_SCHEMA_VERSION`.
///
/// Returns `Ok(true)` when any migration ran, `Ok(false)` for a current
/// document, and an error message for a document that cannot be upgraded.
pub fn migrate(doc: &mut Value) -> Result<bool, String> {
    let mut version = detect_version(doc);
    if version > CURRENT_SCHEMA_VERSION {
        return Err(format!(
            "schema_version {} is newer than supported version {}",
            version, CURRENT_SCHEMA_VERSION
        ));
    }
    if version == CURRENT_SCHEMA_VERSION {
        return Ok(false);
    }
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| "index document is not a JSON object".to_string())?;

    for migration in all_migrations() {
        if migration.from_version != version {
            continue;
        }
        tracing::debug!(
            from = migration.from_version,
            "migrating tag index: {}",
            migration.description
        );
        (migration.up)(obj);
        version = migration.from_version + 1;
    }
    if version != CURRENT_SCHEMA_VERSION {
        return Err(format!("no migration path from schema_version {}", version));
    }
    Ok(true)
}

fn migrate_v1_chains_and_version(doc: &mut Map<String, Value>) {
    doc.entry("chains").or_insert_with(|| Value::Array(Vec::new()));
    doc.entry("files").or_insert_with(|| Value::Object(Map::new()));
    let meta = doc
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(meta) = meta.as_object_mut() {
        meta.remove("version");
        meta.insert(
            "schema_version".to_string(),
            Value::from(CURRENT_SCHEMA_VERSION),
        );
    }
}
