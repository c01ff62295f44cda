//! Tag index: the persisted traceability document and its sole writer.
//!
//! The document lives at `.spectrail/tag_index.json` (configurable). Every
//! write goes through a temp file + fsync + rename, so readers only ever see
//! a complete document. A file's tags are always replaced wholesale: the
//! previous occurrences keyed by that file are dropped before the fresh scan
//! is inserted, which makes re-indexing idempotent.
//!
//! # Invariants
//!
//! - `metadata.total_tags` equals the number of entries across all buckets
//! - every spec_id under `files` has exactly one bucket entry
//! - a spec_id's bucket is fixed by its directive, so no id spans categories

use crate::core::audit::AuditLog;
use crate::core::config::SpectrailConfig;
use crate::core::error::SpectrailError;
use crate::core::migration::{self, CURRENT_SCHEMA_VERSION};
use crate::core::tags::{self, Category, TagMatch, Verb};
use crate::core::time;
use crate::core::workspace::{STATE_DIR_NAME, Workspace};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use walkdir::WalkDir;

/// Directories never walked by `rebuild_workspace`.
const SKIP_DIRS: &[&str] = &[".git", STATE_DIR_NAME, "target", "node_modules", ".venv"];
/// Files above this size are not scanned during a rebuild.
const MAX_SCAN_BYTES: u64 = 2 * 1024 * 1024;
/// Optimistic write attempts before giving up on a concurrently changing file.
const WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexMetadata {
    pub created_at: String,
    pub updated_at: String,
    pub schema_version: u64,
    pub total_tags: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct SourceLocation {
    pub file: String,
    pub line: usize,
    pub verb: Verb,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    pub description: Option<String>,
    /// Every occurrence of the spec_id; duplicates stay distinct.
    pub locations: Vec<SourceLocation>,
    pub first_seen: String,
    pub last_seen: String,
}

pub type Bucket = BTreeMap<String, IndexEntry>;

/// Fixed category skeleton; each category maps directive → bucket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "UPPERCASE")]
pub struct Categories {
    pub primary: BTreeMap<String, Bucket>,
    pub steering: BTreeMap<String, Bucket>,
    pub implementation: BTreeMap<String, Bucket>,
    pub quality: BTreeMap<String, Bucket>,
}

impl Categories {
    fn skeleton() -> Self {
        let buckets = |category: Category| {
            tags::directives_in(category)
                .map(|d| (d.to_string(), Bucket::new()))
                .collect::<BTreeMap<_, _>>()
        };
        Self {
            primary: buckets(Category::Primary),
            steering: buckets(Category::Steering),
            implementation: buckets(Category::Implementation),
            quality: buckets(Category::Quality),
        }
    }

    pub fn get(&self, category: Category) -> &BTreeMap<String, Bucket> {
        match category {
            Category::Primary => &self.primary,
            Category::Steering => &self.steering,
            Category::Implementation => &self.implementation,
            Category::Quality => &self.quality,
        }
    }

    fn get_mut(&mut self, category: Category) -> &mut BTreeMap<String, Bucket> {
        match category {
            Category::Primary => &mut self.primary,
            Category::Steering => &mut self.steering,
            Category::Implementation => &mut self.implementation,
            Category::Quality => &mut self.quality,
        }
    }

    fn buckets(&self) -> impl Iterator<Item = &Bucket> {
        Category::ALL
            .into_iter()
            .flat_map(move |c| self.get(c).values())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChainLink {
    pub from_tag: String,
    pub to_tag: String,
    pub relation: Verb,
    /// File that declared the relation; the link goes away with it.
    pub file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexDocument {
    pub metadata: IndexMetadata,
    pub categories: Categories,
    pub chains: Vec<ChainLink>,
    pub files: BTreeMap<String, Vec<String>>,
}

/// A spec_id resolved against the index.
#[derive(Debug, Clone, Serialize)]
pub struct TagRecord<'a> {
    pub spec_id: &'a str,
    pub category: Category,
    pub directive: &'a str,
    pub entry: &'a IndexEntry,
}

impl IndexDocument {
    /// Empty, schema-valid document.
    pub fn skeleton() -> Self {
        let now = time::now_epoch_z();
        Self {
            metadata: IndexMetadata {
                created_at: now.clone(),
                updated_at: now,
                schema_version: CURRENT_SCHEMA_VERSION,
                total_tags: 0,
            },
            categories: Categories::skeleton(),
            chains: Vec::new(),
            files: BTreeMap::new(),
        }
    }

    pub fn bucket(&self, directive: &str) -> Option<&Bucket> {
        let category = tags::category_of(directive)?;
        self.categories.get(category).get(directive)
    }

    fn bucket_mut(&mut self, directive: &str) -> Option<&mut Bucket> {
        let category = tags::category_of(directive)?;
        Some(
            self.categories
                .get_mut(category)
                .entry(directive.to_string())
                .or_default(),
        )
    }

    pub fn query(&self, spec_id: &str) -> Option<TagRecord<'_>> {
        let directive = tags::directive_of(spec_id);
        let category = tags::category_of(directive)?;
        let (key, entry) = self.bucket(directive)?.get_key_value(spec_id)?;
        Some(TagRecord {
            spec_id: key,
            category,
            directive: tags::directive_of(key),
            entry,
        })
    }

    pub fn contains(&self, spec_id: &str) -> bool {
        self.query(spec_id).is_some()
    }

    pub fn entry_count(&self) -> usize {
        self.categories.buckets().map(BTreeMap::len).sum()
    }

    /// Occurrences attributed to `file`.
    pub fn occurrences_in(&self, file: &str) -> usize {
        self.files
            .get(file)
            .into_iter()
            .flatten()
            .filter_map(|id| self.query(id))
            .map(|r| r.entry.locations.iter().filter(|l| l.file == file).count())
            .sum()
    }

    /// Drop every occurrence and chain declared by `file`.
    pub fn remove_file(&mut self, file: &str) {
        let Some(ids) = self.files.remove(file) else {
            self.chains.retain(|c| c.file != file);
            return;
        };
        for id in ids {
            let Some(bucket) = self.bucket_mut(tags::directive_of(&id)) else {
                continue;
            };
            let now_empty = match bucket.get_mut(&id) {
                Some(entry) => {
                    entry.locations.retain(|l| l.file != file);
                    entry.locations.is_empty()
                }
                None => false,
            };
            if now_empty {
                bucket.remove(&id);
            }
        }
        self.chains.retain(|c| c.file != file);
    }

    /// Keep `first_seen` from `previous` for every spec_id it already knew.
    pub fn carry_first_seen(&mut self, previous: &IndexDocument) {
        for category in Category::ALL {
            for bucket in self.categories.get_mut(category).values_mut() {
                for (id, entry) in bucket.iter_mut() {
                    if let Some(old) = previous.query(id) {
                        entry.first_seen.clone_from(&old.entry.first_seen);
                    }
                }
            }
        }
    }

    /// Insert a fresh scan of `file`. Callers remove the file first.
    pub fn insert_matches(&mut self, file: &str, matches: &[TagMatch], now: &str) {
        let mut ids: Vec<String> = Vec::new();
        for m in matches {
            let Some(bucket) = self.bucket_mut(&m.directive) else {
                continue;
            };
            let entry = bucket
                .entry(m.spec_id.clone())
                .or_insert_with(|| IndexEntry {
                    description: None,
                    locations: Vec::new(),
                    first_seen: now.to_string(),
                    last_seen: now.to_string(),
                });
            entry.locations.push(SourceLocation {
                file: file.to_string(),
                line: m.line,
                verb: m.verb,
            });
            entry.locations.sort();
            entry.last_seen = now.to_string();
            if m.description.is_some() {
                entry.description = m.description.clone();
            }
            ids.push(m.spec_id.clone());

            if let (true, Some(target)) = (m.verb.is_relation(), &m.target) {
                self.chains.push(ChainLink {
                    from_tag: m.spec_id.clone(),
                    to_tag: target.clone(),
                    relation: m.verb,
                    file: file.to_string(),
                });
            }
        }
        self.chains.sort();
        self.chains.dedup();
        ids.sort();
        ids.dedup();
        if !ids.is_empty() {
            self.files.insert(file.to_string(), ids);
        }
    }

    pub fn recompute_totals(&mut self) {
        self.metadata.total_tags = self.entry_count();
    }

    /// Equality on tag content, ignoring timestamps.
    pub fn same_tags(&self, other: &IndexDocument) -> bool {
        fn strip(doc: &IndexDocument) -> IndexDocument {
            let mut d = doc.clone();
            d.metadata.created_at.clear();
            d.metadata.updated_at.clear();
            for cat in Category::ALL {
                for bucket in d.categories.get_mut(cat).values_mut() {
                    for entry in bucket.values_mut() {
                        entry.first_seen.clear();
                        entry.last_seen.clear();
                    }
                }
            }
            d
        }
        strip(self) == strip(other)
    }

    /// Schema + invariant check on the serialized form.
    pub fn is_valid(&self) -> bool {
        serde_json::to_value(self)
            .map(|v| validate_schema(&v))
            .unwrap_or(false)
    }
}

/// Checks the presence and shape of every top-level field, plus the
/// `total_tags` and files→bucket invariants.
pub fn validate_schema(doc: &Value) -> bool {
    schema_problem(doc).is_none()
}

/// First schema or invariant problem found, if any.
pub fn schema_problem(doc: &Value) -> Option<String> {
    let Some(obj) = doc.as_object() else {
        return Some("document is not an object".to_string());
    };
    let Some(meta) = obj.get("metadata").and_then(Value::as_object) else {
        return Some("metadata missing".to_string());
    };
    for key in ["created_at", "updated_at"] {
        if !meta.get(key).is_some_and(Value::is_string) {
            return Some(format!("metadata.{key} missing"));
        }
    }
    if meta.get("schema_version").and_then(Value::as_u64) != Some(CURRENT_SCHEMA_VERSION) {
        return Some("metadata.schema_version missing or unsupported".to_string());
    }
    let Some(total) = meta.get("total_tags").and_then(Value::as_u64) else {
        return Some("metadata.total_tags missing".to_string());
    };

    let Some(categories) = obj.get("categories").and_then(Value::as_object) else {
        return Some("categories missing".to_string());
    };
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut entries = 0u64;
    for category in Category::ALL {
        let Some(buckets) = categories.get(category.as_str()).and_then(Value::as_object) else {
            return Some(format!("categories.{} missing", category.as_str()));
        };
        for (directive, bucket) in buckets {
            let Some(bucket) = bucket.as_object() else {
                return Some(format!("bucket {directive} is not an object"));
            };
            for (id, entry) in bucket {
                if !entry.get("locations").is_some_and(Value::is_array) {
                    return Some(format!("entry {id} has no locations"));
                }
                *counts.entry(id.as_str()).or_default() += 1;
                entries += 1;
            }
        }
    }
    if entries != total {
        return Some(format!("total_tags {total} != {entries} entries"));
    }

    let Some(chains) = obj.get("chains").and_then(Value::as_array) else {
        return Some("chains missing".to_string());
    };
    for link in chains {
        for key in ["from_tag", "to_tag", "relation"] {
            if !link.get(key).is_some_and(Value::is_string) {
                return Some(format!("chain link missing {key}"));
            }
        }
    }

    let Some(files) = obj.get("files").and_then(Value::as_object) else {
        return Some("files missing".to_string());
    };
    for (file, ids) in files {
        let Some(ids) = ids.as_array() else {
            return Some(format!("files.{file} is not an array"));
        };
        for id in ids {
            let Some(id) = id.as_str() else {
                return Some(format!("files.{file} holds a non-string id"));
            };
            if counts.get(id).copied() != Some(1) {
                return Some(format!("{id} from {file} is not in exactly one bucket"));
            }
        }
    }
    None
}

/// Kind of a file-change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl std::str::FromStr for ChangeKind {
    type Err = SpectrailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ChangeKind::Created),
            "modified" => Ok(ChangeKind::Modified),
            "deleted" => Ok(ChangeKind::Deleted),
            other => Err(SpectrailError::ValidationError(format!(
                "unknown change kind '{other}' (expected created|modified|deleted)"
            ))),
        }
    }
}

/// A file-change notification from an external watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexState {
    Uninitialized,
    Empty,
    Updating,
    Consistent,
}

/// How the on-disk document looked when it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Missing,
    Current,
    Migrated,
    Corrupt,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeOutcome {
    pub path: String,
    pub kind: ChangeKind,
    pub occurrences_before: usize,
    pub occurrences_after: usize,
    pub total_tags: usize,
    /// False when the re-scan produced identical tags and nothing was written.
    pub written: bool,
}

pub struct IndexManager {
    workspace: Workspace,
    path: PathBuf,
    audit: AuditLog,
    write_lock: Mutex<()>,
    updating: AtomicBool,
}

impl IndexManager {
    pub fn new(workspace: &Workspace, config: &SpectrailConfig) -> Self {
        Self {
            workspace: workspace.clone(),
            path: workspace.state_dir.join(&config.index.path),
            audit: AuditLog::new(workspace),
            write_lock: Mutex::new(()),
            updating: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the empty skeleton unless a document already exists.
    pub fn initialize(&self) -> Result<bool, SpectrailError> {
        let _guard = self.lock_writes()?;
        if self.path.exists() {
            return Ok(false);
        }
        let doc = IndexDocument::skeleton();
        self.persist(&doc)?;
        self.audit
            .record("spectrail", "index.initialize", "ok", serde_json::json!({}));
        Ok(true)
    }

    pub fn state(&self) -> IndexState {
        if self.updating.load(Ordering::SeqCst) {
            return IndexState::Updating;
        }
        if !self.path.exists() {
            return IndexState::Uninitialized;
        }
        let doc = self.load();
        if doc.metadata.total_tags == 0 && doc.files.is_empty() {
            IndexState::Empty
        } else {
            IndexState::Consistent
        }
    }

    /// Current document. A missing or corrupt store yields the empty skeleton.
    pub fn load(&self) -> IndexDocument {
        self.load_with_status().0
    }

    /// Like `load`, but corruption is an error.
    pub fn load_strict(&self) -> Result<IndexDocument, SpectrailError> {
        let bytes = fs::read(&self.path).map_err(SpectrailError::IoError)?;
        decode(&bytes).map(|(doc, _)| doc)
    }

    pub fn load_with_status(&self) -> (IndexDocument, LoadStatus) {
        match fs::read(&self.path) {
            Ok(bytes) => self.decode_lenient(&bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                (IndexDocument::skeleton(), LoadStatus::Missing)
            }
            Err(err) => {
                tracing::warn!(path = %self.path.display(), "tag index unreadable, using empty index: {err}");
                (IndexDocument::skeleton(), LoadStatus::Corrupt)
            }
        }
    }

    fn decode_lenient(&self, bytes: &[u8]) -> (IndexDocument, LoadStatus) {
        match decode(bytes) {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), "tag index corrupt, using empty index until next write: {err}");
                (IndexDocument::skeleton(), LoadStatus::Corrupt)
            }
        }
    }

    pub fn query(&self, spec_id: &str) -> Option<(Category, IndexEntry)> {
        let doc = self.load();
        doc.query(spec_id).map(|r| (r.category, r.entry.clone()))
    }

    /// Re-index one file.
    pub fn process_change(
        &self,
        path: &Path,
        kind: ChangeKind,
    ) -> Result<ChangeOutcome, SpectrailError> {
        let _guard = self.lock_writes()?;
        self.updating.store(true, Ordering::SeqCst);
        let result = self.apply_change(path, kind);
        self.updating.store(false, Ordering::SeqCst);
        result
    }

    fn apply_change(&self, path: &Path, kind: ChangeKind) -> Result<ChangeOutcome, SpectrailError> {
        let rel = self.workspace.contained(path)?;
        let abs = self.workspace.root.join(&rel);
        let matches = match kind {
            ChangeKind::Deleted => Vec::new(),
            ChangeKind::Created | ChangeKind::Modified if !abs.is_file() => Vec::new(),
            ChangeKind::Created | ChangeKind::Modified => tags::extract_from_path(&abs, &rel),
        };

        for attempt in 1..=WRITE_ATTEMPTS {
            let (before_bytes, doc, status) = self.read_snapshot();
            let occurrences_before = doc.occurrences_in(&rel);

            let now = time::now_epoch_z();
            let mut next = doc.clone();
            next.remove_file(&rel);
            next.insert_matches(&rel, &matches, &now);
            next.carry_first_seen(&doc);
            next.recompute_totals();

            let mut outcome = ChangeOutcome {
                path: rel.clone(),
                kind,
                occurrences_before,
                occurrences_after: matches.len(),
                total_tags: next.metadata.total_tags,
                written: false,
            };
            let needs_repair = matches!(status, LoadStatus::Corrupt | LoadStatus::Migrated);
            if status != LoadStatus::Missing && !needs_repair && next.same_tags(&doc) {
                return Ok(outcome);
            }
            next.metadata.updated_at = now;
            next.metadata.schema_version = CURRENT_SCHEMA_VERSION;

            if fingerprint(&fs::read(&self.path).ok()) != fingerprint(&before_bytes) {
                tracing::debug!(file = %rel, attempt, "tag index changed underneath, retrying");
                continue;
            }
            self.persist(&next)?;
            outcome.written = true;
            self.audit.record(
                "spectrail",
                "index.process_change",
                "ok",
                serde_json::json!({
                    "path": rel,
                    "kind": kind,
                    "before": occurrences_before,
                    "after": outcome.occurrences_after,
                    "total_tags": outcome.total_tags,
                    "repaired": needs_repair,
                }),
            );
            return Ok(outcome);
        }
        Err(SpectrailError::ValidationError(format!(
            "tag index kept changing while indexing {rel}; gave up after {WRITE_ATTEMPTS} attempts"
        )))
    }

    /// Replace the whole index with a fresh scan of `paths` (relative or absolute).
    ///
    /// `created_at` and per-entry `first_seen` survive for ids still present.
    pub fn rebuild(&self, paths: &[PathBuf]) -> Result<IndexDocument, SpectrailError> {
        let _guard = self.lock_writes()?;
        self.updating.store(true, Ordering::SeqCst);
        let result = self.rebuild_locked(paths);
        self.updating.store(false, Ordering::SeqCst);
        result
    }

    fn rebuild_locked(&self, paths: &[PathBuf]) -> Result<IndexDocument, SpectrailError> {
        let scanned: Vec<(String, Vec<TagMatch>)> = paths
            .par_iter()
            .map(|p| {
                let abs = self.workspace.absolute(&p.to_string_lossy());
                let rel = self.workspace.relative(&abs);
                let matches = tags::extract_from_path(&abs, &rel);
                (rel, matches)
            })
            .collect();

        let previous = self.load();
        let now = time::now_epoch_z();
        let mut doc = IndexDocument::skeleton();
        doc.metadata.created_at = previous.metadata.created_at.clone();
        doc.metadata.updated_at = now.clone();
        for (rel, matches) in &scanned {
            doc.remove_file(rel);
            doc.insert_matches(rel, matches, &now);
        }
        doc.carry_first_seen(&previous);
        doc.recompute_totals();
        self.persist(&doc)?;
        self.audit.record(
            "spectrail",
            "index.rebuild",
            "ok",
            serde_json::json!({"files": scanned.len(), "total_tags": doc.metadata.total_tags}),
        );
        Ok(doc)
    }

    /// Walk the repository and rebuild from every regular file found.
    pub fn rebuild_workspace(&self) -> Result<IndexDocument, SpectrailError> {
        let paths: Vec<PathBuf> = WalkDir::new(&self.workspace.root)
            .into_iter()
            .filter_entry(|e| {
                !(e.depth() > 0
                    && e.file_type().is_dir()
                    && e.file_name()
                        .to_str()
                        .is_some_and(|name| SKIP_DIRS.contains(&name)))
            })
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.metadata().map(|m| m.len() <= MAX_SCAN_BYTES).unwrap_or(false))
            .map(|e| e.into_path())
            .collect();
        self.rebuild(&paths)
    }

    fn lock_writes(&self) -> Result<std::sync::MutexGuard<'_, ()>, SpectrailError> {
        self.write_lock
            .lock()
            .map_err(|_| SpectrailError::ValidationError("index write lock poisoned".to_string()))
    }

    fn read_snapshot(&self) -> (Option<Vec<u8>>, IndexDocument, LoadStatus) {
        match fs::read(&self.path) {
            Ok(bytes) => {
                let (doc, status) = self.decode_lenient(&bytes);
                (Some(bytes), doc, status)
            }
            Err(_) => {
                let (doc, status) = self.load_with_status();
                (None, doc, status)
            }
        }
    }

    /// Contract-checked atomic write.
    fn persist(&self, doc: &IndexDocument) -> Result<(), SpectrailError> {
        let value = serde_json::to_value(doc)?;
        if let Some(problem) = schema_problem(&value) {
            return Err(SpectrailError::SchemaCorruption(format!(
                "refusing to write invalid index: {problem}"
            )));
        }
        let bytes = serde_json::to_vec_pretty(&value)?;
        write_atomic(&self.path, &bytes)
    }
}

fn decode(bytes: &[u8]) -> Result<(IndexDocument, LoadStatus), SpectrailError> {
    let mut value: Value = serde_json::from_slice(bytes)
        .map_err(|e| SpectrailError::SchemaCorruption(format!("not JSON: {e}")))?;
    let migrated = migration::migrate(&mut value).map_err(SpectrailError::SchemaCorruption)?;
    if migrated {
        recount_total(&mut value);
    }
    if let Some(problem) = schema_problem(&value) {
        return Err(SpectrailError::SchemaCorruption(problem));
    }
    let doc: IndexDocument = serde_json::from_value(value)
        .map_err(|e| SpectrailError::SchemaCorruption(format!("shape mismatch: {e}")))?;
    let status = if migrated {
        LoadStatus::Migrated
    } else {
        LoadStatus::Current
    };
    Ok((doc, status))
}

/// Migrated documents get `total_tags` recomputed from their buckets.
fn recount_total(value: &mut Value) {
    let count: usize = value
        .get("categories")
        .and_then(Value::as_object)
        .map(|cats| {
            cats.values()
                .filter_map(Value::as_object)
                .flat_map(|buckets| buckets.values())
                .filter_map(Value::as_object)
                .map(|bucket| bucket.len())
                .sum()
        })
        .unwrap_or(0);
    if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.insert("total_tags".to_string(), Value::from(count));
    }
}

fn fingerprint(bytes: &Option<Vec<u8>>) -> Option<String> {
    bytes.as_ref().map(|b| format!("{:x}", Sha256::digest(b)))
}

/// Write-to-temp, fsync, rename. The temp file sits next to the target so the
/// rename stays on one filesystem.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SpectrailError> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent).map_err(SpectrailError::IoError)?;
    let tmp = parent.join(format!(
        ".{}.tmp-{}-{}",
        path.file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("index"),
        std::process::id(),
        time::new_event_id()
    ));

    let written = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp);
        return Err(SpectrailError::IoError(err));
    }
    Ok(())
}
