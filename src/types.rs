//! Core types for repromap - the connectome-ensemble reproducibility mapper.
//!
//! This module mirrors the Python benchmarking workflow's vocabulary but with
//! the schema made explicit. Key design decisions:
//! - Recipes are typed records, not anonymous tuples: whether a grid cell is
//!   a six-field functional recipe, a five-field legacy functional recipe, or
//!   a diffusion recipe is decided by a capability check on the observed
//!   hyperparameter names, never by unpack-and-catch.
//! - Everything used as a store key derives `Ord` so the nested store and all
//!   downstream matrices iterate deterministically.
//! - Embedding payloads are lazy: an entry carries its `.npy` path and
//!   materializes the matrix at most once, on first use.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use ndarray::{Array1, Array2, Axis};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

/// Imaging modality of a derivative artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    /// Functional connectomes (BOLD-derived).
    Func,
    /// Diffusion connectomes (tractography-derived).
    Dwi,
}

impl Modality {
    pub fn as_str(self) -> &'static str {
        match self {
            Modality::Func => "func",
            Modality::Dwi => "dwi",
        }
    }

    /// The recognized hyperparameter names for this modality.
    ///
    /// Name order here is incidental; grids always sort lexicographically.
    pub fn hyperparam_names(self) -> &'static [&'static str] {
        match self {
            Modality::Func => &["rsn", "res", "model", "hpass", "extract", "smooth"],
            Modality::Dwi => &["rsn", "res", "model", "directget", "minlength", "tol"],
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "func" => Ok(Modality::Func),
            "dwi" => Ok(Modality::Dwi),
            other => Err(anyhow!("unknown modality: {other}")),
        }
    }
}

/// Embedding algorithm (or the scalar topology table) an artifact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// Scalar graph-theory metric vectors from the per-modality table.
    #[serde(rename = "topology")]
    Topology,
    /// Adjacency spectral embedding.
    #[serde(rename = "ASE")]
    Ase,
    /// Omnibus embedding.
    #[serde(rename = "OMNI")]
    Omni,
}

impl Algorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::Topology => "topology",
            Algorithm::Ase => "ASE",
            Algorithm::Omni => "OMNI",
        }
    }

    /// Whether artifacts live as `.npy` files rather than table columns.
    pub fn is_embedding(self) -> bool {
        !matches!(self, Algorithm::Topology)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "topology" => Ok(Algorithm::Topology),
            "ASE" | "ase" => Ok(Algorithm::Ase),
            "OMNI" | "omni" => Ok(Algorithm::Omni),
            other => Err(anyhow!("unknown embedding algorithm: {other}")),
        }
    }
}

/// One subject-session pair, parsed from a `sub-<ID>_ses-<SES>` composite.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScanId {
    pub subject: String,
    pub session: String,
}

impl ScanId {
    pub fn new(subject: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            session: session.into(),
        }
    }

    /// Parse a `sub-<ID>_ses-<SES>` composite identifier.
    pub fn parse(composite: &str) -> Option<Self> {
        let rest = composite.strip_prefix("sub-")?;
        let (subject, ses_part) = rest.split_once("_ses-")?;
        if subject.is_empty() || ses_part.is_empty() {
            return None;
        }
        Some(Self::new(subject, ses_part))
    }

    /// The composite row key used by the topology table.
    pub fn composite(&self) -> String {
        format!("sub-{}_ses-{}", self.subject, self.session)
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ses-{}", self.subject, self.session)
    }
}

/// A concrete functional processing recipe.
///
/// `smooth == "0"` is the sentinel for "no smoothing applied"; artifacts for
/// such recipes carry no smoothing token in their names at all.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FuncRecipe {
    pub atlas: String,
    pub extract: String,
    pub hpass: String,
    pub model: String,
    pub res: String,
    pub smooth: String,
}

impl FuncRecipe {
    pub fn smoothing_is_zero(&self) -> bool {
        self.smooth == "0"
    }
}

/// A concrete diffusion processing recipe.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DwiRecipe {
    pub atlas: String,
    pub directget: String,
    pub minlength: String,
    pub model: String,
    pub res: String,
    pub tol: String,
}

/// One cell of the hyperparameter grid, i.e. a RecipeKey.
///
/// Used directly as a map key: equality, hashing, and ordering are by value.
/// The variant records which token schema the cell satisfied.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Recipe {
    Func(FuncRecipe),
    Dwi(DwiRecipe),
}

impl Recipe {
    pub fn modality(&self) -> Modality {
        match self {
            Recipe::Func(_) => Modality::Func,
            Recipe::Dwi(_) => Modality::Dwi,
        }
    }

    pub fn atlas(&self) -> &str {
        match self {
            Recipe::Func(r) => &r.atlas,
            Recipe::Dwi(r) => &r.atlas,
        }
    }

    pub fn res(&self) -> &str {
        match self {
            Recipe::Func(r) => &r.res,
            Recipe::Dwi(r) => &r.res,
        }
    }

    /// Hyperparameter values ordered lexicographically by name.
    ///
    /// Functional: extract, hpass, model, res, rsn, smooth.
    /// Diffusion: directget, minlength, model, res, rsn, tol.
    pub fn sorted_values(&self) -> Vec<&str> {
        match self {
            Recipe::Func(r) => vec![&r.extract, &r.hpass, &r.model, &r.res, &r.atlas, &r.smooth],
            Recipe::Dwi(r) => vec![
                &r.directget,
                &r.minlength,
                &r.model,
                &r.res,
                &r.atlas,
                &r.tol,
            ],
        }
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.sorted_values().join(", "))
    }
}

/// One resolved artifact in the subject store.
#[derive(Debug)]
pub enum Entry {
    /// Fixed-length metric vector; NaN marks "metric not found for this
    /// recipe".
    Topology(Vec<f64>),
    /// Node embedding with row-aligned index labels and a lazily loaded
    /// payload.
    Embedding(EmbeddingEntry),
}

impl Entry {
    /// A void entry contributes nothing downstream: an all-NaN metric vector,
    /// or an embedding whose index alignment failed.
    pub fn is_void(&self) -> bool {
        match self {
            Entry::Topology(data) => data.iter().all(|v| v.is_nan()),
            Entry::Embedding(emb) => emb.index.is_none(),
        }
    }
}

/// Embedding payloads stay on disk until first use.
#[derive(Debug)]
pub struct EmbeddingEntry {
    /// Node identifiers aligned to payload rows; `None` when no companion
    /// label file matched the row count (the entry is unusable downstream).
    pub index: Option<Vec<i64>>,
    /// Payload row count, recorded at resolve-time validation.
    pub rows: usize,
    /// Path of the resolved `.npy` artifact.
    pub path: PathBuf,
    payload: OnceCell<Array2<f64>>,
}

impl EmbeddingEntry {
    pub fn new(index: Option<Vec<i64>>, rows: usize, path: PathBuf) -> Self {
        Self {
            index,
            rows,
            path,
            payload: OnceCell::new(),
        }
    }

    /// Materialize the payload, loading from disk at most once.
    pub fn payload(&self) -> Result<&Array2<f64>> {
        self.payload.get_or_try_init(|| load_npy_matrix(&self.path))
    }
}

/// Read a `.npy` payload as a 2-D f64 matrix.
///
/// Accepts 1-D files (treated as a single-column matrix) and f32 payloads.
pub fn load_npy_matrix(path: &std::path::Path) -> Result<Array2<f64>> {
    if let Ok(arr) = ndarray_npy::read_npy::<_, Array2<f64>>(path) {
        return Ok(arr);
    }
    if let Ok(arr) = ndarray_npy::read_npy::<_, Array1<f64>>(path) {
        return Ok(arr.insert_axis(Axis(1)));
    }
    if let Ok(arr) = ndarray_npy::read_npy::<_, Array2<f32>>(path) {
        return Ok(arr.mapv(f64::from));
    }
    match ndarray_npy::read_npy::<_, Array1<f32>>(path) {
        Ok(arr) => Ok(arr.mapv(f64::from).insert_axis(Axis(1))),
        Err(e) => Err(anyhow!("failed to read {}: {e}", path.display())),
    }
}
