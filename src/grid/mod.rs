//! Hyperparameter-grid resolution: from observed ensemble identifiers to the
//! Cartesian-product search space of processing recipes.
//!
//! The pipeline is: scan every identifier with the token parser, de-duplicate
//! the accumulated values, purge mis-captured atlas tokens, then form the
//! Cartesian product over the name-sorted value lists. Raw grid cells are
//! finally resolved into typed [`Recipe`]s by a capability check on the
//! observed name set.
//!
//! Determinism: value lists are sorted after de-duplication and keys live in
//! a `BTreeMap`, so the same identifiers always produce the same grid in the
//! same order.

pub mod tokens;

use std::collections::BTreeMap;

use crate::types::{DwiRecipe, FuncRecipe, Modality, Recipe};

pub use tokens::SmoothingCapture;

/// Observed hyperparameter values, keyed by name.
///
/// Values accumulate with duplicates during the scan; [`dedup`](Self::dedup)
/// reduces each list to a sorted set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HyperparamDict {
    values: BTreeMap<String, Vec<String>>,
}

impl HyperparamDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &str, value: &str) {
        self.values
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Values for a name; empty when the name was never observed.
    pub fn get(&self, name: &str) -> &[String] {
        self.values.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Hyperparameter names in lexicographic order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Reduce every value list to a sorted, de-duplicated set.
    pub fn dedup(&mut self) {
        for list in self.values.values_mut() {
            list.sort();
            list.dedup();
        }
    }

    /// Drop atlas-variant values that captured a resolution token.
    ///
    /// Identifiers interleave `rsn-` and `res-` tokens; a malformed name can
    /// leak a `res…` fragment into the atlas axis, which would silently
    /// multiply the grid with cells that never resolve.
    pub fn purge_rsn_res(&mut self) {
        if let Some(list) = self.values.get_mut("rsn") {
            list.retain(|v| !v.contains("res"));
        }
    }
}

/// The Cartesian-product search space over one modality's hyperparameters.
///
/// `names` are the grid axes in lexicographic order; every cell holds one
/// value per axis, in the same order. Zero-length cells never appear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    pub names: Vec<String>,
    pub cells: Vec<Vec<String>>,
}

impl Grid {
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Scan `idents` and build the hyperparameter dictionary plus its grid.
///
/// Identifiers that contribute no recognized token are logged and skipped;
/// they never abort the scan.
pub fn build_grid(
    modality: Modality,
    idents: &[String],
    capture: SmoothingCapture,
) -> (HyperparamDict, Grid) {
    let mut dict = HyperparamDict::new();
    for ident in idents {
        if tokens::collect(ident, modality, &mut dict, capture) == 0 {
            eprintln!("Failed to parse ensemble {ident}...");
        }
    }
    dict.dedup();
    dict.purge_rsn_res();

    let grid = cartesian(&dict);
    (dict, grid)
}

/// Cartesian product over the name-sorted value lists.
///
/// A key with an empty value list yields an empty grid (there is no cell
/// that could satisfy it), matching product semantics.
fn cartesian(dict: &HyperparamDict) -> Grid {
    let names: Vec<String> = dict.names().map(str::to_string).collect();
    let lists: Vec<&[String]> = names.iter().map(|n| dict.get(n)).collect();

    let total: usize = lists.iter().map(|l| l.len()).product();

    // Decompose a linear index into one pick per axis, last axis fastest.
    let mut cells = Vec::with_capacity(total);
    for idx in 0..total {
        let mut cell = Vec::with_capacity(lists.len());
        let mut remaining = idx;
        for list in lists.iter().rev() {
            let pick = remaining % list.len();
            remaining /= list.len();
            cell.push(list[pick].clone());
        }
        cell.reverse();
        if !cell.is_empty() {
            cells.push(cell);
        }
    }

    Grid { names, cells }
}

/// Resolve every grid cell into a typed [`Recipe`].
///
/// Cells whose name set matches neither the modality's full schema nor (for
/// the functional modality) the legacy five-name schema are logged and
/// skipped.
pub fn resolve_recipes(modality: Modality, grid: &Grid) -> Vec<Recipe> {
    let mut recipes = Vec::with_capacity(grid.len());
    for cell in &grid.cells {
        match resolve_cell(modality, &grid.names, cell) {
            Some(recipe) => recipes.push(recipe),
            None => eprintln!("Failed to parse recipe: {cell:?}"),
        }
    }
    recipes
}

/// Capability check: map a raw cell onto a typed recipe by name lookup.
pub fn resolve_cell(modality: Modality, names: &[String], values: &[String]) -> Option<Recipe> {
    if names.len() != values.len() {
        return None;
    }
    let lookup = |want: &str| -> Option<String> {
        names
            .iter()
            .position(|n| n == want)
            .map(|i| values[i].clone())
    };

    match modality {
        Modality::Func => {
            let full = ["extract", "hpass", "model", "res", "rsn", "smooth"];
            let legacy = ["extract", "hpass", "model", "res", "rsn"];
            let smooth = if name_set_matches(names, &full) {
                lookup("smooth")?
            } else if name_set_matches(names, &legacy) {
                "0".to_string()
            } else {
                return None;
            };
            Some(Recipe::Func(FuncRecipe {
                atlas: lookup("rsn")?,
                extract: lookup("extract")?,
                hpass: lookup("hpass")?,
                model: lookup("model")?,
                res: lookup("res")?,
                smooth,
            }))
        }
        Modality::Dwi => {
            let full = ["directget", "minlength", "model", "res", "rsn", "tol"];
            if !name_set_matches(names, &full) {
                return None;
            }
            Some(Recipe::Dwi(DwiRecipe {
                atlas: lookup("rsn")?,
                directget: lookup("directget")?,
                minlength: lookup("minlength")?,
                model: lookup("model")?,
                res: lookup("res")?,
                tol: lookup("tol")?,
            }))
        }
    }
}

fn name_set_matches(names: &[String], expected: &[&str]) -> bool {
    names.len() == expected.len() && expected.iter().all(|e| names.iter().any(|n| n == e))
}
