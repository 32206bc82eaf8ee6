//! Artifact resolution - from a recipe to a concrete artifact, or a recorded
//! miss.
//!
//! A resolver never raises for a missing artifact: absence is a normal,
//! reported outcome (a missingness-ledger row). The only errors that
//! propagate are unanticipated ones, e.g. an unreadable topology table.
//!
//! Two resolution paths exist:
//! - topology: one table column per (metric, recipe), disambiguated by
//!   substring targets built from the recipe;
//! - embedding: one `.npy` file per recipe under a structured directory,
//!   disambiguated by token filtering, a threshold-marker preference, and
//!   most-recent modification time.

pub mod embedding;
pub mod nodes;
pub mod topology;

use std::path::Path;

use crate::types::{Algorithm, Modality};

pub use topology::TopologyTable;

/// Shared-immutable inputs for one (modality, algorithm) resolution batch.
#[derive(Clone, Copy)]
pub struct ResolveCx<'a> {
    pub base_dir: &'a Path,
    pub modality: Modality,
    pub alg: Algorithm,
    pub template: &'a str,
    pub thr_type: &'a str,
    pub metrics: &'a [String],
    /// Present only for the topology algorithm.
    pub topology: Option<&'a TopologyTable>,
}
