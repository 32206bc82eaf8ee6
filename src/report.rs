//! Per-recipe scoring and the benchmark summary report.
//!
//! Every (modality, algorithm) grid becomes one summary table with a row per
//! recipe, sorted descending by discriminability, written as
//! `grid_clean_<modality>_<alg>.csv` under the base directory. Rows that
//! carry neither a statistic nor a reliability coefficient are dropped.
//!
//! Recipes score independently, so the scoring loop fans out on the rayon
//! pool; each task reduces to a row keyed by its recipe, no cross-talk.
//!
//! Reliability coefficients (Cronbach's alpha, ICC) are an external concern:
//! [`ReliabilityEstimator`] is the seam and no production implementation
//! ships here.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use ndarray::Array2;
use rayon::prelude::*;

use crate::config::RunConfig;
use crate::discr;
use crate::features;
use crate::preprocess::{self, Imputer, Scaler};
use crate::store::{BuildOutput, SubjectStore};
use crate::types::{Algorithm, Modality, Recipe};

/// A reliability coefficient with its confidence bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reliability {
    pub coefficient: f64,
    pub lower: f64,
    pub upper: f64,
}

/// External reliability-coefficient routine.
///
/// Input: one wide matrix per metric, one row per subject and one column per
/// session, already centered and scaled. `None` means the estimate is not
/// computable for this input (too few rows, degenerate variance).
pub trait ReliabilityEstimator: Send + Sync {
    fn reliability(&self, wide: &Array2<f64>) -> Option<Reliability>;
}

/// One summary table row.
#[derive(Debug)]
pub struct SummaryRow {
    pub recipe: Recipe,
    pub modality: Modality,
    pub alg: Algorithm,
    pub discriminability: Option<f64>,
    /// Reliability coefficient per metric, when an estimator was supplied.
    pub reliability: BTreeMap<String, Reliability>,
}

/// Score every recipe of one (modality, algorithm) grid.
pub fn score_grid(
    cfg: &RunConfig,
    store: &SubjectStore,
    modality: Modality,
    alg: Algorithm,
    recipes: &[Recipe],
    estimator: Option<&dyn ReliabilityEstimator>,
) -> Result<Vec<SummaryRow>> {
    let imputer = preprocess::MeanImputer;
    let scaler = preprocess::ZScoreScaler;

    let mut rows: Vec<SummaryRow> = recipes
        .par_iter()
        .map(|recipe| -> Result<SummaryRow> {
            let mut row = SummaryRow {
                recipe: recipe.clone(),
                modality,
                alg,
                discriminability: None,
                reliability: BTreeMap::new(),
            };

            if cfg.discriminability {
                if let Some((x, labels, mut cols)) = features::stacked_matrix(
                    store,
                    modality,
                    alg,
                    recipe,
                    &cfg.metrics,
                    &cfg.base_dir,
                ) {
                    let mut x =
                        preprocess::drop_sparse_columns(&x, &mut cols, cfg.min_column_coverage);
                    if x.ncols() > 0 {
                        imputer.impute(&mut x);
                        scaler.scale(&mut x);
                        let out = discr::discr_stat(
                            &x,
                            &labels,
                            cfg.dissimilarity,
                            cfg.remove_isolates,
                        )
                        .with_context(|| format!("discriminability failed for {recipe}"))?;
                        if !out.stat.is_nan() {
                            row.discriminability = Some(out.stat);
                        }
                    }
                }
            }

            if cfg.reliability && alg == Algorithm::Topology {
                if let Some(est) = estimator {
                    for (k, met) in cfg.metrics.iter().enumerate() {
                        if let Some(wide) = metric_wide(store, modality, alg, recipe, k) {
                            if let Some(rel) = est.reliability(&wide) {
                                row.reliability.insert(met.clone(), rel);
                            }
                        }
                    }
                }
            }

            Ok(row)
        })
        .collect::<Result<Vec<_>>>()?;

    // Rows with nothing to report carry no information.
    rows.retain(|r| r.discriminability.is_some() || !r.reliability.is_empty());
    rows.sort_by(|a, b| match (a.discriminability, b.discriminability) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    Ok(rows)
}

/// One metric's test-retest matrix: subjects as rows, sessions as columns,
/// zero-masked and z-scaled per column.
fn metric_wide(
    store: &SubjectStore,
    modality: Modality,
    alg: Algorithm,
    recipe: &Recipe,
    met_idx: usize,
) -> Option<Array2<f64>> {
    let subjects: Vec<String> = store.subjects().map(str::to_string).collect();
    let mut sessions: Vec<String> = Vec::new();
    for id in &subjects {
        for ses in store.sessions(id) {
            if !sessions.iter().any(|s| s == ses) {
                sessions.push(ses.to_string());
            }
        }
    }
    sessions.sort();
    if subjects.is_empty() || sessions.len() < 2 {
        return None;
    }

    let mut wide = Array2::from_elem((subjects.len(), sessions.len()), f64::NAN);
    for (i, id) in subjects.iter().enumerate() {
        for (j, ses) in sessions.iter().enumerate() {
            if let Some(crate::types::Entry::Topology(data)) =
                store.entry(id, ses, modality, alg, recipe)
            {
                if let Some(&v) = data.get(met_idx) {
                    // Zero encodes missing in this domain.
                    wide[[i, j]] = if v == 0.0 { f64::NAN } else { v };
                }
            }
        }
    }

    if wide.iter().all(|v| v.is_nan()) {
        return None;
    }
    preprocess::ZScoreScaler.scale(&mut wide);
    Some(wide)
}

/// Score every grid in the build output and write one summary CSV each.
pub fn run(
    cfg: &RunConfig,
    out: &BuildOutput,
    estimator: Option<&dyn ReliabilityEstimator>,
) -> Result<Vec<SummaryRow>> {
    let mut all = Vec::new();
    for ((modality, alg), recipes) in &out.grids {
        let rows = score_grid(cfg, &out.store, *modality, *alg, recipes, estimator)?;
        let path = cfg
            .base_dir
            .join(format!("grid_clean_{modality}_{alg}.csv"));
        write_summary_csv(&rows, &path)?;
        all.extend(rows);
    }
    Ok(all)
}

/// Write one grid's summary rows as CSV.
pub fn write_summary_csv(rows: &[SummaryRow], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;

    // Reliability columns are the union of metrics any row reports.
    let mut rel_metrics: Vec<String> = Vec::new();
    for row in rows {
        for met in row.reliability.keys() {
            if !rel_metrics.contains(met) {
                rel_metrics.push(met.clone());
            }
        }
    }
    rel_metrics.sort();

    let mut header = vec![
        "grid".to_string(),
        "modality".to_string(),
        "embedding".to_string(),
        "discriminability".to_string(),
    ];
    for met in &rel_metrics {
        header.push(format!("reliability_{met}"));
        header.push(format!("reliability_{met}_lower"));
        header.push(format!("reliability_{met}_upper"));
    }
    writer.write_record(&header)?;

    for row in rows {
        let mut record = vec![
            row.recipe.to_string(),
            row.modality.to_string(),
            row.alg.to_string(),
            row.discriminability
                .map(|v| v.to_string())
                .unwrap_or_default(),
        ];
        for met in &rel_metrics {
            match row.reliability.get(met) {
                Some(rel) => {
                    record.push(rel.coefficient.to_string());
                    record.push(rel.lower.to_string());
                    record.push(rel.upper.to_string());
                }
                None => {
                    record.push(String::new());
                    record.push(String::new());
                    record.push(String::new());
                }
            }
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}
