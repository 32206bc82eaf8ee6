//! The nested subject store and its parallel population.
//!
//! Structure: id -> session -> modality -> algorithm -> recipe -> entry.
//! Population fans out one task per scan on the rayon pool; every task reads
//! only shared-immutable inputs (the grid, the resolver context) and returns
//! an immutable partial store plus a partial missingness ledger. The fold
//! into the global store is a serialized associative deep-union: scans are
//! disjoint, so no task's keys ever collide with another's.
//!
//! The missingness ledger is append-only and purely for audit; nothing reads
//! it for control flow.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use rayon::prelude::*;

use crate::config::RunConfig;
use crate::resolve::{self, ResolveCx, TopologyTable};
use crate::types::{Algorithm, Entry, Modality, Recipe, ScanId};
use crate::{grid, preprocess};

/// One failed artifact lookup, with full context for later audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissRecord {
    pub id: String,
    pub ses: String,
    pub modality: Modality,
    pub alg: Algorithm,
    pub recipe: Recipe,
}

impl MissRecord {
    pub fn new(scan: &ScanId, modality: Modality, alg: Algorithm, recipe: &Recipe) -> Self {
        Self {
            id: scan.subject.clone(),
            ses: scan.session.clone(),
            modality,
            alg,
            recipe: recipe.clone(),
        }
    }
}

/// Append-only audit log of unresolved lookups.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    rows: Vec<MissRecord>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: MissRecord) {
        self.rows.push(row);
    }

    pub fn extend(&mut self, other: Ledger) {
        self.rows.extend(other.rows);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[MissRecord] {
        &self.rows
    }

    /// Write the ledger as CSV for offline audit.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        writer.write_record(["id", "ses", "modality", "alg", "grid"])?;
        for row in &self.rows {
            let grid = row.recipe.to_string();
            writer.write_record([
                row.id.as_str(),
                row.ses.as_str(),
                row.modality.as_str(),
                row.alg.as_str(),
                grid.as_str(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}

type RecipeMap = BTreeMap<Recipe, Entry>;
type AlgMap = BTreeMap<Algorithm, RecipeMap>;
type ModalityMap = BTreeMap<Modality, AlgMap>;
type SessionMap = BTreeMap<String, ModalityMap>;

/// The nested feature store, read-mostly after population.
#[derive(Debug, Default)]
pub struct SubjectStore {
    map: BTreeMap<String, SessionMap>,
}

impl SubjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        scan: &ScanId,
        modality: Modality,
        alg: Algorithm,
        recipe: Recipe,
        entry: Entry,
    ) {
        self.map
            .entry(scan.subject.clone())
            .or_default()
            .entry(scan.session.clone())
            .or_default()
            .entry(modality)
            .or_default()
            .entry(alg)
            .or_default()
            .insert(recipe, entry);
    }

    pub fn subjects(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }

    pub fn sessions(&self, id: &str) -> impl Iterator<Item = &str> {
        self.map
            .get(id)
            .into_iter()
            .flat_map(|m| m.keys().map(String::as_str))
    }

    /// Recipe map for one (id, session, modality, algorithm) context.
    pub fn recipes(
        &self,
        id: &str,
        ses: &str,
        modality: Modality,
        alg: Algorithm,
    ) -> Option<&RecipeMap> {
        self.map.get(id)?.get(ses)?.get(&modality)?.get(&alg)
    }

    pub fn entry(
        &self,
        id: &str,
        ses: &str,
        modality: Modality,
        alg: Algorithm,
        recipe: &Recipe,
    ) -> Option<&Entry> {
        self.recipes(id, ses, modality, alg)?.get(recipe)
    }

    pub fn contains_subject(&self, id: &str) -> bool {
        self.map.contains_key(id)
    }

    pub fn contains_session(&self, id: &str, ses: &str) -> bool {
        self.map.get(id).is_some_and(|m| m.contains_key(ses))
    }

    pub fn len_entries(&self) -> usize {
        self.map
            .values()
            .flat_map(|s| s.values())
            .flat_map(|m| m.values())
            .flat_map(|a| a.values())
            .map(|r| r.len())
            .sum()
    }

    /// Deep-union another store into this one.
    ///
    /// Scans are partitioned across workers, so the same (id, session,
    /// modality, algorithm, recipe) path never arrives from two partials;
    /// merge order is irrelevant.
    pub fn merge(&mut self, other: SubjectStore) {
        for (id, sessions) in other.map {
            let id_slot = self.map.entry(id).or_default();
            for (ses, modalities) in sessions {
                let ses_slot = id_slot.entry(ses).or_default();
                for (modality, algs) in modalities {
                    let mod_slot = ses_slot.entry(modality).or_default();
                    for (alg, recipes) in algs {
                        let alg_slot = mod_slot.entry(alg).or_default();
                        for (recipe, entry) in recipes {
                            alg_slot.insert(recipe, entry);
                        }
                    }
                }
            }
        }
    }

    /// Prune void entries and the empty branches they leave behind.
    pub fn clean(&mut self) {
        for sessions in self.map.values_mut() {
            for modalities in sessions.values_mut() {
                for algs in modalities.values_mut() {
                    for recipes in algs.values_mut() {
                        recipes.retain(|_, entry| !entry.is_void());
                    }
                    algs.retain(|_, recipes| !recipes.is_empty());
                }
                modalities.retain(|_, algs| !algs.is_empty());
            }
            sessions.retain(|_, modalities| !modalities.is_empty());
        }
        self.map.retain(|_, sessions| !sessions.is_empty());
    }
}

/// Populate a store for every (scan x recipe) pair, in parallel over scans.
pub fn populate(scans: &[ScanId], recipes: &[Recipe], cx: &ResolveCx) -> (SubjectStore, Ledger) {
    let partials: Vec<(SubjectStore, Ledger)> = scans
        .par_iter()
        .map(|scan| populate_scan(scan, recipes, cx))
        .collect();

    let mut store = SubjectStore::new();
    let mut ledger = Ledger::new();
    for (partial_store, partial_ledger) in partials {
        store.merge(partial_store);
        ledger.extend(partial_ledger);
    }
    (store, ledger)
}

/// Resolve every recipe for one scan into a partial store.
fn populate_scan(scan: &ScanId, recipes: &[Recipe], cx: &ResolveCx) -> (SubjectStore, Ledger) {
    let mut store = SubjectStore::new();
    let mut ledger = Ledger::new();

    let mut resolved = 0usize;
    for recipe in recipes {
        let entry = if cx.alg.is_embedding() {
            resolve::embedding::resolve(recipe, scan, cx, &mut ledger)
        } else {
            resolve::topology::resolve(recipe, scan, cx, &mut ledger)
        };
        if let Some(entry) = entry {
            if !entry.is_void() {
                resolved += 1;
            }
            store.insert(scan, cx.modality, cx.alg, recipe.clone(), entry);
        }
    }

    let status = if resolved > 0 {
        format!("{}", "\u{2713}".green())
    } else {
        format!("{}", "\u{2717}".red())
    };
    println!(
        "ID: {}, SESSION: {}, COMPLETENESS: {status}",
        scan.subject, scan.session
    );

    (store, ledger)
}

/// Everything one full population run produces.
pub struct BuildOutput {
    pub store: SubjectStore,
    /// Recipes enumerated per (modality, algorithm) batch.
    pub grids: BTreeMap<(Modality, Algorithm), Vec<Recipe>>,
    pub ledger: Ledger,
}

/// Build the global store across every configured modality, algorithm, and
/// session. Batches run sequentially; scans within a batch run in parallel.
pub fn build_store(cfg: &RunConfig) -> Result<BuildOutput> {
    let scaler = preprocess::MinMaxScaler::default();
    let imputer = preprocess::MeanImputer;

    let mut store = SubjectStore::new();
    let mut grids = BTreeMap::new();
    let mut ledger = Ledger::new();

    for &modality in &cfg.modalities {
        println!("MODALITY: {modality}");

        // The metrics table serves every topology batch of this modality.
        let table = if cfg.embeddings.contains(&Algorithm::Topology) {
            let path = cfg
                .base_dir
                .join(format!("all_subs_neat_{modality}.csv"));
            if path.is_file() {
                Some(TopologyTable::load(
                    &path,
                    &scaler,
                    &imputer,
                    cfg.min_column_coverage,
                )?)
            } else {
                None
            }
        } else {
            None
        };

        for &alg in &cfg.embeddings {
            println!("EMBEDDING TYPE: {alg}");
            for ses in &cfg.sessions {
                let (idents, scans, table_ref) = if alg.is_embedding() {
                    let idents =
                        resolve::embedding::discover_ensembles(&cfg.base_dir, modality, alg);
                    if idents.is_empty() {
                        println!("No ensembles found.");
                        continue;
                    }
                    let scans: Vec<ScanId> =
                        resolve::embedding::discover_subjects(&cfg.base_dir, modality)
                            .into_iter()
                            .map(|subject| ScanId::new(subject, ses.clone()))
                            .collect();
                    (idents, scans, None)
                } else {
                    let Some(table) = table.as_ref() else {
                        println!("Missing topology outputs.");
                        continue;
                    };
                    let idents = table.ensembles(&cfg.thr_type);
                    let scans: Vec<ScanId> = table
                        .composites()
                        .filter_map(ScanId::parse)
                        .filter(|scan| &scan.session == ses)
                        .collect();
                    (idents, scans, Some(table))
                };

                let (_, raw_grid) = grid::build_grid(modality, &idents, cfg.smoothing_capture);
                let recipes = grid::resolve_recipes(modality, &raw_grid);
                if recipes.is_empty() {
                    println!("Empty grid for {modality} {alg} ses-{ses}.");
                    continue;
                }

                let cx = ResolveCx {
                    base_dir: &cfg.base_dir,
                    modality,
                    alg,
                    template: &cfg.template,
                    thr_type: &cfg.thr_type,
                    metrics: &cfg.metrics,
                    topology: table_ref,
                };
                let (partial, misses) = populate(&scans, &recipes, &cx);
                store.merge(partial);
                ledger.extend(misses);
                grids.insert((modality, alg), recipes);
            }
        }
    }

    store.clean();
    Ok(BuildOutput {
        store,
        grids,
        ledger,
    })
}
