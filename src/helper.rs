use std::{
    fs,
    io::{self, Write},
    path::Path,
};

use chrono::{DateTime, Duration, NaiveDate, SubsecRound, TimeZone, Utc};
use log::{debug, error, trace};
use serde::{de::DeserializeOwned, Serialize};
use tempfile::NamedTempFile;

use crate::{errors::io_at, StoreError, Result, TxStep};

/// Current time at the millisecond precision records are persisted with.
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Timestamp for an update committed after `previous`: the current time, or
/// one millisecond past `previous` when the clock has not moved on. Fails
/// when `previous` is already the latest representable instant.
pub fn next_update_time(previous: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let now = now_millis();
    if now > previous {
        return Ok(now);
    }
    previous
        .checked_add_signed(Duration::milliseconds(1))
        .ok_or_else(|| {
            StoreError::storage(
                TxStep::Write,
                format!("cannot advance updatedAt past {}", previous.to_rfc3339()),
            )
        })
}

pub fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Parses a user or import supplied timestamp: epoch milliseconds, RFC 3339,
/// or a bare `YYYY-MM-DD` date (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ms) = raw.parse::<i64>() {
        return from_millis(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc).trunc_subsecs(3));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

// Helper method for parsing tags
pub fn parse_tags(tags: Option<String>) -> Vec<String> {
    tags.map(|t| {
        t.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

/// Trims tags, drops blank ones and removes duplicates keeping the first one seen.
pub fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim();
        if !tag.is_empty() && !out.iter().any(|t| t == tag) {
            out.push(tag.to_string());
        }
    }
    out
}

/// Case-insensitive substring test. `needle` must already be lowercase.
pub fn contains_folded(haystack: &str, needle: &str) -> bool {
    needle.is_empty() || haystack.to_lowercase().contains(needle)
}

/// Reads and deserializes a JSON file, returning `None` when it does not exist.
pub fn read_json_file<T: DeserializeOwned>(path: &Path, step: TxStep) -> Result<Option<T>> {
    debug!("Reading JSON file: {}", path.display());
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            trace!("{} does not exist yet", path.display());
            return Ok(None);
        }
        Err(e) => {
            error!("Failed to open {}: {}", path.display(), e);
            return Err(StoreError::storage(step, e));
        }
    };

    let value = serde_json::from_str(&content).map_err(|e| {
        error!("Failed to parse {}: {}", path.display(), e);
        StoreError::storage(step, format!("{}: {}", path.display(), e))
    })?;
    Ok(Some(value))
}

/// Writes a value as JSON through a temporary file in the same directory and an
/// atomic rename, so readers see either the old or the new content.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T, pretty: bool) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    trace!("Creating temporary file in directory: {}", dir.display());
    let mut temp_file = NamedTempFile::new_in(dir).map_err(|e| {
        error!("Failed to create temporary file: {}", e);
        StoreError::storage(TxStep::Write, e)
    })?;

    let json = if pretty {
        serde_json::to_vec_pretty(value)
    } else {
        serde_json::to_vec(value)
    }
    .map_err(|e| {
        error!("Failed to serialize {}: {}", path.display(), e);
        StoreError::storage(TxStep::Write, e)
    })?;

    temp_file.write_all(&json).map_err(io_at(TxStep::Write))?;
    temp_file.flush().map_err(io_at(TxStep::Write))?;
    temp_file
        .as_file()
        .sync_all()
        .map_err(io_at(TxStep::Commit))?;

    temp_file.persist(path).map_err(|e| {
        error!("Failed to persist file {}: {}", path.display(), e.error);
        StoreError::storage(TxStep::Commit, e.error)
    })?;

    trace!("Persisted {}", path.display());
    Ok(())
}
