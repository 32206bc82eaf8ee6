//! Companion node index/label file parsing for embedding alignment.
//!
//! Every embedding payload should have a `nodes/*.json` companion describing
//! which graph node each row belongs to. The upstream writers produced three
//! shapes over time:
//!
//! 1. a mapping `{"0": {"label": ..., "index": 3}, ...}`;
//! 2. a list of records `[{"label": ..., "index": 3}, ...]`;
//! 3. a degenerate list where every `label` is null and the `index` field
//!    holds a combined `"('<label>', <index>)"` string that has to be
//!    re-parsed.
//!
//! Alignment succeeds only when a candidate yields exactly one index per
//! payload row; candidates whose file name encodes the row count are tried
//! first.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::types::{Modality, ScanId};

/// Recover row-aligned node indices for one embedding payload.
///
/// Returns `None` when no candidate file yields an index count equal to
/// `emb_rows`; the caller records the entry as unusable.
pub fn index_labels(
    base_dir: &Path,
    scan: &ScanId,
    modality: Modality,
    atlas: &str,
    res: &str,
    emb_rows: usize,
) -> Option<Vec<i64>> {
    let dir = base_dir
        .join(format!("embeddings_all_{modality}"))
        .join(format!("sub-{}", scan.subject))
        .join(format!("ses-{}", scan.session))
        .join(format!("rsn-{atlas}_res-{res}"))
        .join("nodes");

    let files = list_json_files(&dir);
    if files.is_empty() {
        eprintln!("Node files empty for {scan}, rsn-{atlas}_res-{res}!");
        return None;
    }

    // Candidates naming the row count are the likeliest match.
    let row_tag = emb_rows.to_string();
    let (named, rest): (Vec<&PathBuf>, Vec<&PathBuf>) = files.iter().partition(|p| {
        p.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.contains(&row_tag))
    });

    for path in named.into_iter().chain(rest) {
        if let Some(ixs) = parse_node_file(path) {
            if ixs.len() == emb_rows {
                return Some(ixs);
            }
        }
    }
    None
}

fn list_json_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files
}

/// Parse one node file into its index sequence.
///
/// Unparseable files yield `None` and the caller moves to the next
/// candidate.
pub fn parse_node_file(path: &Path) -> Option<Vec<i64>> {
    let text = std::fs::read_to_string(path).ok()?;
    let value: Value = serde_json::from_str(&text).ok()?;

    match value {
        Value::Object(map) => {
            let mut ixs = Vec::with_capacity(map.len());
            for record in map.values() {
                ixs.push(value_as_index(record.get("index")?)?);
            }
            Some(ixs)
        }
        Value::Array(records) => {
            let labels_all_null = records
                .iter()
                .all(|r| r.get("label").map_or(true, Value::is_null));
            let mut ixs = Vec::with_capacity(records.len());
            for record in &records {
                let index_field = record.get("index")?;
                if labels_all_null {
                    // Combined "('label', index)" representation.
                    let raw = index_field.as_str()?;
                    let (_, ix) = parse_combined(raw)?;
                    ixs.push(ix);
                } else {
                    ixs.push(value_as_index(index_field)?);
                }
            }
            Some(ixs)
        }
        _ => None,
    }
}

/// An index value may be an integer, a float, or a numeric string.
fn value_as_index(value: &Value) -> Option<i64> {
    if let Some(i) = value.as_i64() {
        return Some(i);
    }
    if let Some(f) = value.as_f64() {
        return Some(f as i64);
    }
    value.as_str()?.trim().parse::<i64>().ok()
}

/// Re-parse a combined `"('<label>', <index>)"` string into its parts.
///
/// Embedded newlines are treated as separators; the label may itself contain
/// commas, so the split is on the last one.
pub fn parse_combined(raw: &str) -> Option<(String, i64)> {
    let joined = raw.replace('\n', ",");
    let trimmed = joined
        .trim()
        .trim_start_matches(['(', '['])
        .trim_end_matches([')', ']']);
    let (label_part, index_part) = trimmed.rsplit_once(',')?;
    let index = index_part.trim().parse::<i64>().ok().or_else(|| {
        index_part
            .trim()
            .parse::<f64>()
            .ok()
            .map(|f| f as i64)
    })?;
    let label = label_part.trim().trim_matches(['\'', '"']).to_string();
    Some((label, index))
}
