//! Inspect command implementation.

use cloudstore_cache::{BackingCache, LocalRecord};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Journal path.
    pub path: String,
    /// Journal size in bytes.
    pub journal_size: u64,
    /// Last commit sequence.
    pub sequence: u64,
    /// Store identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_uuid: Option<String>,
    /// Mirrored zone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Whether a change token is stored.
    pub has_change_token: bool,
    /// Number of local records.
    pub record_count: usize,
    /// Number of dirty records.
    pub dirty_count: usize,
    /// Number of unpushed deletions.
    pub tombstone_count: usize,
    /// Rows per entity.
    pub entities: BTreeMap<String, usize>,
    /// Per-record details (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<RecordInfo>>,
}

/// Sync state of a single record.
#[derive(Debug, Serialize)]
pub struct RecordInfo {
    /// Record name.
    pub name: String,
    /// Entity name.
    pub entity: String,
    /// Local version.
    pub version: u64,
    /// Last confirmed version.
    pub cached_version: u64,
    /// Remote change tag of the baseline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_tag: Option<String>,
    /// Whether the record needs a push.
    pub dirty: bool,
    /// Whether a conflict ancestor is pending.
    pub conflicted: bool,
    /// Whether the row stands in for a record not received yet.
    pub placeholder: bool,
}

impl From<&LocalRecord> for RecordInfo {
    fn from(record: &LocalRecord) -> Self {
        Self {
            name: record.record_name().to_string(),
            entity: record.record_type.clone(),
            version: record.version,
            cached_version: record.cached_record_version,
            change_tag: record.cached_remote.change_tag.clone(),
            dirty: record.is_dirty(),
            conflicted: record.merge_ancestor.is_some(),
            placeholder: record.placeholder,
        }
    }
}

/// Runs the inspect command.
pub fn run(path: &Path, show_records: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !path.is_file() {
        return Err(format!("No store journal found at {}", path.display()).into());
    }
    let cache = BackingCache::open(path)?;
    let result = inspect(path, &cache, show_records)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn inspect(
    path: &Path,
    cache: &BackingCache,
    show_records: bool,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let records = cache.records();
    let metadata = cache.metadata();

    let mut entities = BTreeMap::new();
    for row in cache.rows() {
        *entities.entry(row.entity).or_insert(0) += 1;
    }

    Ok(InspectResult {
        path: path.display().to_string(),
        journal_size: cache.journal_size()?,
        sequence: cache.sequence(),
        store_uuid: metadata.as_ref().map(|m| m.uuid.to_string()),
        zone: metadata.as_ref().map(|m| m.zone_id.to_string()),
        has_change_token: metadata.is_some_and(|m| m.change_token.is_some()),
        record_count: records.len(),
        dirty_count: records.iter().filter(|r| r.is_dirty()).count(),
        tombstone_count: records.iter().filter(|r| r.is_tombstone()).count(),
        entities,
        records: show_records.then(|| records.iter().map(RecordInfo::from).collect()),
    })
}

fn print_text_output(result: &InspectResult) {
    println!("CloudStore Store Inspection");
    println!("===========================");
    println!();
    println!("Path: {}", result.path);
    println!("Store: {}", result.store_uuid.as_deref().unwrap_or("-"));
    println!("Zone:  {}", result.zone.as_deref().unwrap_or("-"));
    println!();
    println!("Journal:");
    println!("  Size:         {}", format_size(result.journal_size));
    println!("  Sequence:     {}", result.sequence);
    println!(
        "  Change token: {}",
        if result.has_change_token { "yes" } else { "no (initial import pending)" }
    );
    println!();
    println!("Records:");
    println!("  Total:      {}", result.record_count);
    println!("  Dirty:      {}", result.dirty_count);
    println!("  Tombstones: {}", result.tombstone_count);

    if !result.entities.is_empty() {
        println!();
        println!("Entities:");
        for (entity, count) in &result.entities {
            println!("  {entity}: {count} rows");
        }
    }

    if let Some(records) = &result.records {
        println!();
        println!("Record details:");
        for record in records {
            println!(
                "  {} [{}] v{}/{}{}{}{}",
                record.name,
                record.entity,
                record.version,
                record.cached_version,
                if record.dirty { " dirty" } else { "" },
                if record.conflicted { " conflicted" } else { "" },
                if record.placeholder { " placeholder" } else { "" },
            );
        }
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} bytes", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
