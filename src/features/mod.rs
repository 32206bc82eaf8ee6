//! Feature assembly: flattening store entries into row-aligned tables.
//!
//! Two consumers share the flattening logic:
//! - [`assemble`] builds one phenotype-joined feature table per recipe for a
//!   single session (the ML feature-space path);
//! - [`stacked_matrix`] stacks one numeric row per (subject, session) with
//!   the subject id as label (the discriminability path).
//!
//! Subjects that contribute no usable row are excluded, never zero-filled.
//! Tables from different subjects may disagree on embedding columns (node
//! sets drift across parcellations), so rows are aligned by column-name
//! union with NaN fill.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use ndarray::Array2;
use rayon::prelude::*;

use crate::resolve::nodes;
use crate::store::SubjectStore;
use crate::types::{Algorithm, EmbeddingEntry, Entry, Modality, Recipe, ScanId};

/// The phenotype/demographic table, keyed by subject id.
///
/// Non-numeric cells enter as NaN; only numeric-parseable phenotype data
/// joins the feature space.
#[derive(Debug, Clone)]
pub struct PhenotypeTable {
    columns: Vec<String>,
    rows: Vec<(String, Vec<f64>)>,
}

impl PhenotypeTable {
    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("failed to open phenotype table {}", path.display()))?;
        let headers = reader.headers()?.clone();
        let id_col = headers
            .iter()
            .position(|h| h == "participant_id")
            .with_context(|| {
                format!("phenotype table {} has no participant_id column", path.display())
            })?;

        let columns: Vec<String> = headers
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != id_col)
            .map(|(_, h)| h.to_string())
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let id = record.get(id_col).unwrap_or("").trim().to_string();
            if id.is_empty() {
                continue;
            }
            let values: Vec<f64> = record
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != id_col)
                .map(|(_, cell)| cell.trim().parse::<f64>().unwrap_or(f64::NAN))
                .collect();
            rows.push((id, values));
        }

        Ok(Self { columns, rows })
    }

    /// An in-memory table for tests and embedding callers.
    pub fn from_rows(columns: Vec<String>, rows: Vec<(String, Vec<f64>)>) -> Self {
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn participants(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().map(|(id, _)| id.as_str())
    }

    pub fn row(&self, id: &str) -> Option<&[f64]> {
        self.rows
            .iter()
            .find(|(row_id, _)| row_id == id)
            .map(|(_, values)| values.as_slice())
    }
}

/// A row-aligned numeric table; columns are unique mapping keys.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub index: Vec<String>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl FeatureTable {
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn to_matrix(&self) -> Array2<f64> {
        let n_rows = self.rows.len();
        let n_cols = self.columns.len();
        let flat: Vec<f64> = self.rows.iter().flatten().copied().collect();
        Array2::from_shape_vec((n_rows, n_cols), flat).expect("rows aligned to columns")
    }
}

/// One assembled feature space, paired with the recipe it was built for so
/// parallel assembly across recipes reduces by key without cross-talk.
#[derive(Debug)]
pub struct AssembledFeatures {
    pub recipe: Recipe,
    /// `None` when no subject contributed a usable row.
    pub table: Option<FeatureTable>,
}

/// Build the phenotype-joined feature table for one recipe and session.
pub fn assemble(
    store: &SubjectStore,
    recipe: &Recipe,
    modality: Modality,
    alg: Algorithm,
    ses: &str,
    pheno: &PhenotypeTable,
    metrics: &[String],
    base_dir: &Path,
) -> AssembledFeatures {
    let mut blocks: Vec<(String, Vec<String>, Vec<f64>)> = Vec::new();

    for id in pheno.participants() {
        if !store.contains_subject(id) {
            println!("ID: {id} not found...");
            continue;
        }
        if !store.contains_session(id, ses) {
            println!("Session: {ses} not found for ID {id}...");
            continue;
        }
        let Some(recipes) = store.recipes(id, ses, modality, alg) else {
            println!("Modality: {modality} not found for ID {id}, ses-{ses}, {alg}...");
            continue;
        };
        let Some(entry) = recipes.get(recipe) else {
            println!("Missing {recipe} universe for ID {id}, ses-{ses}...");
            continue;
        };

        let scan = ScanId::new(id, ses);
        let Some((feat_cols, mut feat_vals)) = entry_features(entry, recipe, metrics, base_dir, &scan)
        else {
            println!(
                "Feature-space null for ID {id} & ses-{ses}, modality: {modality}, \
                 embedding: {alg}..."
            );
            continue;
        };

        // Zero is not a semantically valid metric value in this domain.
        for v in feat_vals.iter_mut() {
            if *v == 0.0 {
                *v = f64::NAN;
            }
        }

        let pheno_vals = pheno.row(id).unwrap_or(&[]).to_vec();
        let mut cols: Vec<String> = pheno.columns().to_vec();
        cols.extend(feat_cols);
        let mut vals = pheno_vals;
        vals.extend(feat_vals);
        blocks.push((id.to_string(), cols, vals));
    }

    let table = if blocks.is_empty() {
        None
    } else {
        Some(outer_align(blocks))
    };
    AssembledFeatures {
        recipe: recipe.clone(),
        table,
    }
}

/// Assemble the feature space of every recipe in parallel, reduced by key.
///
/// Each recipe's assembly is independent; results collect into a map keyed
/// by recipe with no cross-talk between workers.
#[allow(clippy::too_many_arguments)]
pub fn assemble_all(
    store: &SubjectStore,
    recipes: &[Recipe],
    modality: Modality,
    alg: Algorithm,
    ses: &str,
    pheno: &PhenotypeTable,
    metrics: &[String],
    base_dir: &Path,
) -> BTreeMap<Recipe, AssembledFeatures> {
    recipes
        .par_iter()
        .map(|recipe| {
            let assembled = assemble(store, recipe, modality, alg, ses, pheno, metrics, base_dir);
            (recipe.clone(), assembled)
        })
        .collect()
}

/// Stack one row per (subject, session) for the discriminability path.
///
/// Returns the aligned matrix, the per-row subject labels, and the column
/// names; `None` when nothing is usable.
pub fn stacked_matrix(
    store: &SubjectStore,
    modality: Modality,
    alg: Algorithm,
    recipe: &Recipe,
    metrics: &[String],
    base_dir: &Path,
) -> Option<(Array2<f64>, Vec<String>, Vec<String>)> {
    let mut blocks: Vec<(String, Vec<String>, Vec<f64>)> = Vec::new();

    let subjects: Vec<String> = store.subjects().map(str::to_string).collect();
    for id in &subjects {
        let sessions: Vec<String> = store.sessions(id).map(str::to_string).collect();
        for ses in &sessions {
            let Some(entry) = store.entry(id, ses, modality, alg, recipe) else {
                continue;
            };
            let scan = ScanId::new(id.clone(), ses.clone());
            if let Some((cols, vals)) = entry_features(entry, recipe, metrics, base_dir, &scan) {
                blocks.push((id.clone(), cols, vals));
            }
        }
    }

    if blocks.is_empty() {
        return None;
    }
    let table = outer_align(blocks);
    Some((table.to_matrix(), table.index.clone(), table.columns))
}

/// One entry's contribution as (columns, values).
fn entry_features(
    entry: &Entry,
    recipe: &Recipe,
    metrics: &[String],
    base_dir: &Path,
    scan: &ScanId,
) -> Option<(Vec<String>, Vec<f64>)> {
    match entry {
        Entry::Topology(data) => {
            if data.iter().all(|v| v.is_nan()) {
                return None;
            }
            Some((metrics.to_vec(), data.clone()))
        }
        Entry::Embedding(emb) => flatten(emb, recipe, base_dir, scan),
    }
}

/// Flatten an embedding into one row: one column per (node index, dimension),
/// dimension-major.
fn flatten(
    emb: &EmbeddingEntry,
    recipe: &Recipe,
    base_dir: &Path,
    scan: &ScanId,
) -> Option<(Vec<String>, Vec<f64>)> {
    let Some(index) = emb.index.as_ref() else {
        println!("Missing indices for {recipe} universe...");
        return None;
    };

    let data = match emb.payload() {
        Ok(data) => data,
        Err(e) => {
            println!("Failed to load {}: {e}", emb.path.display());
            return None;
        }
    };

    let mut ixs = index.clone();
    if ixs.len() != data.nrows() {
        // A node index was dropped from the parcellation but not from the
        // final graph; try to re-derive the alignment before giving up.
        println!(
            "Length of indices {} does not equal the number of rows {} in the \
             embedding-space for {scan} {} {recipe}.",
            ixs.len(),
            data.nrows(),
            recipe.modality()
        );
        ixs = nodes::index_labels(
            base_dir,
            scan,
            recipe.modality(),
            recipe.atlas(),
            recipe.res(),
            data.nrows(),
        )?;
    }

    let atlas = recipe.atlas();
    let res = recipe.res();
    let dims = data.ncols();
    let mut cols = Vec::with_capacity(dims * ixs.len());
    let mut vals = Vec::with_capacity(dims * ixs.len());
    for d in 0..dims {
        for (r, ix) in ixs.iter().enumerate() {
            cols.push(format!("{ix}_rsn-{atlas}_res-{res}_dim{}", d + 1));
            vals.push(data[[r, d]]);
        }
    }
    Some((cols, vals))
}

/// Align blocks by column-name union, NaN-filling the gaps.
fn outer_align(blocks: Vec<(String, Vec<String>, Vec<f64>)>) -> FeatureTable {
    let mut columns: Vec<String> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    for (_, cols, _) in &blocks {
        for col in cols {
            if !seen.contains_key(col) {
                seen.insert(col.clone(), columns.len());
                columns.push(col.clone());
            }
        }
    }

    let mut index = Vec::with_capacity(blocks.len());
    let mut rows = Vec::with_capacity(blocks.len());
    for (id, cols, vals) in blocks {
        let mut row = vec![f64::NAN; columns.len()];
        for (col, val) in cols.iter().zip(vals) {
            row[seen[col]] = val;
        }
        index.push(id);
        rows.push(row);
    }

    FeatureTable {
        index,
        columns,
        rows,
    }
}
