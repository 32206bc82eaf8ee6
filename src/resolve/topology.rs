//! Topology-table loading and per-recipe metric resolution.
//!
//! The per-modality table has one row per `sub-<ID>_ses-<SES>` composite and
//! one column per (metric, recipe) pairing, the recipe encoded as
//! pipe-delimited tokens inside the column name. Column naming drifted over
//! time upstream (`_corr` vs `_model-corr`, `thrtype-PROP` vs
//! `thrtype-MST`), so headers are normalized at load before anything reads
//! them.
//!
//! Resolution filters columns by substring targets built from the recipe,
//! then picks one column per metric with a deterministic tie-break.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use ndarray::Array2;
use once_cell::sync::Lazy;
use owo_colors::OwoColorize;
use regex::Regex;

use super::ResolveCx;
use crate::preprocess::{self, Imputer, Scaler};
use crate::store::{Ledger, MissRecord};
use crate::types::{Entry, Recipe, ScanId};

/// Magnitudes below this encode "effectively zero/invalid" upstream, not a
/// real metric value.
pub const NEAR_ZERO: f64 = 1e-7;

/// Column-header drift renames, applied in order at load.
///
/// `_partcorr` must precede `_corr` so the longer token is rewritten first.
static HEADER_DRIFT: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        ("_partcorr", "_model-partcorr"),
        ("_corr", "_model-corr"),
        ("_cov", "_model-cov"),
        ("_sfm", "_model-sfm"),
        ("_csa", "_model-csa"),
        ("_tensor", "_model-tensor"),
        ("_csd", "_model-csd"),
        ("thrtype-PROP", "thrtype-MST"),
    ]
    .iter()
    .map(|(pat, rep)| (Regex::new(pat).expect("static header pattern"), *rep))
    .collect()
});

fn normalize_header(name: &str) -> String {
    let mut out = name.to_string();
    for (pat, rep) in HEADER_DRIFT.iter() {
        out = pat.replace_all(&out, *rep).into_owned();
    }
    out
}

/// The loaded, normalized, preprocessed per-modality metrics table.
#[derive(Debug, Clone)]
pub struct TopologyTable {
    /// Metric-recipe column names (the `id` column excluded).
    pub columns: Vec<String>,
    row_index: BTreeMap<String, usize>,
    values: Array2<f64>,
}

impl TopologyTable {
    /// Load a table from CSV, normalize headers, drop sparse columns, then
    /// scale and impute through the injected collaborators.
    ///
    /// Rows without an id and unnamed index columns are dropped. Cells that
    /// fail to parse (or are infinite) enter as NaN.
    pub fn load(
        path: &Path,
        scaler: &dyn Scaler,
        imputer: &dyn Imputer,
        drop_thr: f64,
    ) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("failed to open topology table {}", path.display()))?;

        let headers = reader.headers()?.clone();
        let mut id_col = None;
        let mut keep: Vec<(usize, String)> = Vec::new();
        for (j, name) in headers.iter().enumerate() {
            if name == "id" {
                id_col = Some(j);
            } else if !name.is_empty() && !name.starts_with("Unnamed") {
                keep.push((j, normalize_header(name)));
            }
        }
        let id_col =
            id_col.with_context(|| format!("topology table {} has no id column", path.display()))?;

        let mut ids: Vec<String> = Vec::new();
        let mut rows: Vec<Vec<f64>> = Vec::new();
        for record in reader.records() {
            let record = record?;
            let id = record.get(id_col).unwrap_or("").trim().to_string();
            if id.is_empty() {
                continue;
            }
            let row: Vec<f64> = keep
                .iter()
                .map(|(j, _)| {
                    let cell = record.get(*j).unwrap_or("").trim();
                    match cell.parse::<f64>() {
                        Ok(v) if v.is_finite() => v,
                        _ => f64::NAN,
                    }
                })
                .collect();
            ids.push(id);
            rows.push(row);
        }

        let mut columns: Vec<String> = keep.into_iter().map(|(_, name)| name).collect();
        let n_rows = rows.len();
        let n_cols = columns.len();
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        let matrix = Array2::from_shape_vec((n_rows, n_cols), flat)
            .context("topology table rows have uneven width")?;

        let mut values = preprocess::drop_sparse_columns(&matrix, &mut columns, drop_thr);
        scaler.scale(&mut values);
        imputer.impute(&mut values);

        let row_index = ids.into_iter().enumerate().map(|(i, id)| (id, i)).collect();
        Ok(Self {
            columns,
            row_index,
            values,
        })
    }

    /// Ensemble identifiers observed in the column names: everything before
    /// the `_thrtype-<T>_` marker, de-duplicated.
    pub fn ensembles(&self, thr_type: &str) -> Vec<String> {
        let marker = format!("_thrtype-{thr_type}_");
        let mut out: Vec<String> = self
            .columns
            .iter()
            .map(|col| match col.split_once(&marker) {
                Some((head, _)) => head.to_string(),
                None => col.clone(),
            })
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Indices of columns whose name contains every target substring.
    pub fn filter_cols(&self, targets: &[String]) -> Vec<usize> {
        (0..self.columns.len())
            .filter(|&j| targets.iter().all(|t| self.columns[j].contains(t.as_str())))
            .collect()
    }

    /// Subject-session composites present as rows.
    pub fn composites(&self) -> impl Iterator<Item = &str> {
        self.row_index.keys().map(String::as_str)
    }

    pub fn value(&self, composite: &str, col: usize) -> Option<f64> {
        let &row = self.row_index.get(composite)?;
        Some(self.values[[row, col]])
    }
}

/// Substring targets a matching column must contain, built from the recipe.
fn targets_for(recipe: &Recipe, thr_type: &str) -> Vec<String> {
    match recipe {
        Recipe::Dwi(r) => vec![
            format!("minlength-{}", r.minlength),
            format!("directget-{}", r.directget),
            format!("model-{}", r.model),
            format!("res-{}", r.res),
            format!("rsn-{}", r.atlas),
            format!("tol-{}", r.tol),
            format!("thrtype-{thr_type}"),
        ],
        Recipe::Func(r) => {
            let mut targets = vec![
                format!("extract-{}", r.extract),
                format!("hpass-{}Hz", r.hpass),
                format!("model-{}", r.model),
                format!("res-{}", r.res),
                format!("rsn-{}", r.atlas),
                format!("thrtype-{thr_type}"),
            ];
            if !r.smoothing_is_zero() {
                targets.push(format!("smooth-{}fwhm", r.smooth));
            }
            targets
        }
    }
}

/// Resolve one recipe against the topology table for one scan.
///
/// Always yields a metric vector (possibly all-NaN); each unmatched metric
/// appends one ledger row. When every collected value is effectively zero
/// the whole vector is voided; otherwise only the sub-threshold entries are.
/// The all-below check runs once, on the originally collected values.
pub fn resolve(
    recipe: &Recipe,
    scan: &ScanId,
    cx: &ResolveCx,
    ledger: &mut Ledger,
) -> Option<Entry> {
    let table = cx.topology?;
    let targets = targets_for(recipe, cx.thr_type);
    let cols = table.filter_cols(&targets);

    let mut data = vec![f64::NAN; cx.metrics.len()];
    for (i, met) in cx.metrics.iter().enumerate() {
        let col_met: Vec<usize> = cols
            .iter()
            .copied()
            .filter(|&j| table.columns[j].contains(met.as_str()))
            .collect();

        let col = match col_met.len() {
            0 => {
                ledger.push(MissRecord::new(scan, cx.modality, cx.alg, recipe));
                eprintln!(
                    "{}",
                    format!(
                        "Missing metric {met} for {} and recipe {recipe}...",
                        scan.composite()
                    )
                    .yellow()
                );
                continue;
            }
            1 => col_met[0],
            _ => match recipe {
                // An unsmoothed recipe also matches the smoothed columns;
                // the fwhm-free candidate is the real one.
                Recipe::Func(r) if r.smoothing_is_zero() => col_met
                    .iter()
                    .copied()
                    .find(|&j| !table.columns[j].contains("fwhm"))
                    .unwrap_or(col_met[0]),
                _ => {
                    let names: Vec<&str> =
                        col_met.iter().map(|&j| table.columns[j].as_str()).collect();
                    eprintln!("Multiple columns detected: {names:?}");
                    col_met[0]
                }
            },
        };

        match table.value(&scan.composite(), col) {
            Some(v) => data[i] = v,
            None => eprintln!(
                "Topology not found for {}, {met}, and recipe {recipe}...",
                scan.composite()
            ),
        }
    }

    // Upstream numeric underflow encodes invalid vectors as near-zeros
    // rather than a missing sentinel.
    if data.iter().all(|v| v.abs() < NEAR_ZERO) {
        for v in data.iter_mut() {
            *v = f64::NAN;
        }
        eprintln!(
            "{} {}",
            format!("ID: {}, SESSION: {}, COMPLETENESS:", scan.subject, scan.session),
            "X".red()
        );
    } else if data.iter().any(|v| v.abs() < NEAR_ZERO) {
        for v in data.iter_mut() {
            if v.abs() < NEAR_ZERO {
                *v = f64::NAN;
            }
        }
        eprintln!(
            "{} {}",
            format!("ID: {}, SESSION: {}, COMPLETENESS:", scan.subject, scan.session),
            "X".yellow()
        );
    }

    Some(Entry::Topology(data))
}
