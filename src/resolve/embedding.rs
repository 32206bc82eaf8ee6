//! Embedding artifact resolution: candidate enumeration, token filtering,
//! deterministic disambiguation, and load validation.
//!
//! Candidates for a recipe are the `gradient-*` files under
//! `embeddings_all_<modality>/sub-<ID>/ses-<SES>/rsn-<atlas>_res-<res>/`.
//! A candidate survives filtering when its name contains the algorithm name
//! and every recipe token. Ambiguity is resolved the same way everywhere:
//! prefer the subset without a `thrtype` marker, then take the most recently
//! modified file.
//!
//! Directory listings are sorted before use so resolution is reproducible
//! run to run.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use owo_colors::OwoColorize;

use super::{nodes, ResolveCx};
use crate::store::{Ledger, MissRecord};
use crate::types::{load_npy_matrix, Algorithm, EmbeddingEntry, Entry, Modality, Recipe, ScanId};

/// Resolve one recipe to an embedding entry for one scan.
///
/// Zero surviving candidates, or a candidate that fails to load, append a
/// ledger row and yield nothing.
pub fn resolve(
    recipe: &Recipe,
    scan: &ScanId,
    cx: &ResolveCx,
    ledger: &mut Ledger,
) -> Option<Entry> {
    let dir = cx
        .base_dir
        .join(format!("embeddings_all_{}", cx.modality))
        .join(format!("sub-{}", scan.subject))
        .join(format!("ses-{}", scan.session))
        .join(format!("rsn-{}_res-{}", recipe.atlas(), recipe.res()));

    let mut candidates: Vec<PathBuf> = list_files(&dir)
        .into_iter()
        .filter(|p| file_name(p).starts_with("gradient-"))
        .collect();

    // Tokens may live in the directory components (rsn, res) or the file
    // name, so filtering matches against the whole path.
    let tokens = filter_tokens(recipe, cx.alg, cx.template);
    candidates.retain(|p| {
        let hay = p.to_string_lossy();
        tokens.iter().all(|t| hay.contains(t.as_str()))
    });
    if let Recipe::Func(r) = recipe {
        if r.smoothing_is_zero() {
            // "0" means the artifact never went through smoothing at all.
            candidates.retain(|p| !p.to_string_lossy().contains("smooth"));
        } else {
            let smooth_tag = format!("smooth-{}fwhm", r.smooth);
            candidates.retain(|p| p.to_string_lossy().contains(&smooth_tag));
        }
    }

    if candidates.is_empty() {
        eprintln!(
            "{}",
            format!(
                "No {} embeddings found for {} and recipe {recipe} & {}...",
                cx.modality, scan.subject, cx.alg
            )
            .yellow()
        );
        ledger.push(MissRecord::new(scan, cx.modality, cx.alg, recipe));
        return None;
    }

    let chosen = disambiguate(candidates, scan, recipe);

    let payload = match load_npy_matrix(&chosen) {
        Ok(arr) => arr,
        Err(e) => {
            eprintln!(
                "{}",
                format!("Failed to load {} for {scan}: {e}", chosen.display()).yellow()
            );
            ledger.push(MissRecord::new(scan, cx.modality, cx.alg, recipe));
            return None;
        }
    };

    let rows = payload.nrows();
    let index = nodes::index_labels(
        cx.base_dir,
        scan,
        cx.modality,
        recipe.atlas(),
        recipe.res(),
        rows,
    );
    Some(Entry::Embedding(EmbeddingEntry::new(index, rows, chosen)))
}

/// The canonical multi-match rule: prefer thrtype-free names, then the most
/// recently modified file.
fn disambiguate(candidates: Vec<PathBuf>, scan: &ScanId, recipe: &Recipe) -> PathBuf {
    if candidates.len() == 1 {
        return candidates.into_iter().next().expect("one candidate");
    }

    let raw: Vec<PathBuf> = candidates
        .iter()
        .filter(|p| !p.to_string_lossy().contains("thrtype"))
        .cloned()
        .collect();
    let pool = if raw.is_empty() { candidates } else { raw };
    if pool.len() == 1 {
        return pool.into_iter().next().expect("one candidate");
    }

    eprintln!(
        "Multiple embeddings found for {} and recipe {recipe}:\n{pool:?}\nTaking the most recent...",
        scan.subject
    );
    pool.into_iter()
        .max_by_key(|p| mtime(p))
        .expect("non-empty candidate pool")
}

/// Name tokens every surviving candidate must contain.
fn filter_tokens(recipe: &Recipe, alg: Algorithm, template: &str) -> Vec<String> {
    let mut tokens = vec![
        alg.as_str().to_string(),
        format!("res-{}", recipe.res()),
        format!("rsn-{}", recipe.atlas()),
        format!("template-{template}"),
    ];
    match recipe {
        Recipe::Func(r) => {
            tokens.push(format!("model-{}", r.model));
            tokens.push(format!("hpass-{}", r.hpass));
            tokens.push(format!("extract-{}", r.extract));
        }
        Recipe::Dwi(r) => {
            tokens.push(format!("model-{}", r.model));
            tokens.push(format!("directget-{}", r.directget));
            tokens.push(format!("minlength-{}", r.minlength));
            tokens.push(format!("tol-{}", r.tol));
        }
    }
    tokens
}

/// Ensemble identifiers observed on disk for one (modality, algorithm).
///
/// Rebuilds `rsn-<A>_res-<R>_<file suffix>` from the directory structure and
/// strips any `_thrtype…` tail, mirroring how the identifiers were first
/// written.
pub fn discover_ensembles(base_dir: &Path, modality: Modality, alg: Algorithm) -> Vec<String> {
    let marker = format!("{modality}_");
    let mut out: Vec<String> = Vec::new();

    for sub_dir in list_dirs(&base_dir.join(format!("embeddings_all_{modality}"))) {
        for ses_dir in list_dirs(&sub_dir) {
            for rsn_dir in list_dirs(&ses_dir) {
                let dir_name = file_name(&rsn_dir).to_string();
                let (Some(atlas), Some(res)) = (
                    crate::grid::tokens::token_after(&dir_name, "rsn"),
                    crate::grid::tokens::token_after(&dir_name, "res"),
                ) else {
                    continue;
                };
                for file in list_files(&rsn_dir) {
                    let name = file_name(&file);
                    if !name.ends_with(".npy") || !name.contains(alg.as_str()) {
                        continue;
                    }
                    let Some(pos) = name.find(&marker) else {
                        continue;
                    };
                    let suffix = name[pos + marker.len()..].trim_end_matches(".npy");
                    let mut ensemble = format!("rsn-{atlas}_res-{res}_{suffix}");
                    if let Some(i) = ensemble.find("_thrtype") {
                        ensemble.truncate(i);
                    }
                    out.push(ensemble);
                }
            }
        }
    }

    out.sort();
    out.dedup();
    out
}

/// Subject ids (without the `sub-` prefix) present in the embeddings tree.
pub fn discover_subjects(base_dir: &Path, modality: Modality) -> Vec<String> {
    let mut subjects: Vec<String> = list_dirs(&base_dir.join(format!("embeddings_all_{modality}")))
        .iter()
        .filter_map(|p| file_name(p).strip_prefix("sub-").map(str::to_string))
        .collect();
    subjects.sort();
    subjects
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

fn list_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = list_entries(dir, false);
    files.sort();
    files
}

fn list_dirs(dir: &Path) -> Vec<PathBuf> {
    let mut dirs = list_entries(dir, true);
    dirs.sort();
    dirs
}

fn list_entries(dir: &Path, dirs: bool) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| if dirs { p.is_dir() } else { p.is_file() })
        .collect()
}

fn mtime(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DwiRecipe, FuncRecipe};
    use ndarray::Array2;
    use ndarray_npy::write_npy;
    use std::fs;

    fn dwi_recipe() -> Recipe {
        Recipe::Dwi(DwiRecipe {
            atlas: "a".into(),
            directget: "prob".into(),
            minlength: "20".into(),
            model: "csd".into(),
            res: "2".into(),
            tol: "8".into(),
        })
    }

    fn func_recipe(smooth: &str) -> Recipe {
        Recipe::Func(FuncRecipe {
            atlas: "a".into(),
            extract: "mean".into(),
            hpass: "0".into(),
            model: "corr".into(),
            res: "2".into(),
            smooth: smooth.into(),
        })
    }

    fn scan_dir(base: &Path, modality: Modality) -> PathBuf {
        base.join(format!("embeddings_all_{modality}"))
            .join("sub-A")
            .join("ses-1")
            .join("rsn-a_res-2")
    }

    fn write_embedding(dir: &Path, name: &str, rows: usize) -> PathBuf {
        fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        let arr = Array2::<f64>::ones((rows, 1));
        write_npy(&path, &arr).unwrap();
        path
    }

    fn write_nodes(dir: &Path, n: usize) {
        let nodes = dir.join("nodes");
        fs::create_dir_all(&nodes).unwrap();
        let records: Vec<String> = (0..n)
            .map(|i| format!(r#"{{"label": "n{i}", "index": {i}}}"#))
            .collect();
        fs::write(nodes.join("labels.json"), format!("[{}]", records.join(","))).unwrap();
    }

    fn cx<'a>(base: &'a Path, modality: Modality, metrics: &'a [String]) -> ResolveCx<'a> {
        ResolveCx {
            base_dir: base,
            modality,
            alg: Algorithm::Ase,
            template: "MNI152_T1",
            thr_type: "MST",
            metrics,
            topology: None,
        }
    }

    const DWI_NAME: &str = "gradient-ASE_dwi_rsn-a_res-2_template-MNI152_T1_model-csd_directget-prob_minlength-20_tol-8.npy";

    #[test]
    fn test_resolve_single_candidate() {
        let base = tempfile::tempdir().unwrap();
        let dir = scan_dir(base.path(), Modality::Dwi);
        write_embedding(&dir, DWI_NAME, 3);
        write_nodes(&dir, 3);

        let metrics: Vec<String> = Vec::new();
        let cx = cx(base.path(), Modality::Dwi, &metrics);
        let mut ledger = Ledger::new();
        let entry = resolve(&dwi_recipe(), &ScanId::new("A", "1"), &cx, &mut ledger).unwrap();

        match entry {
            Entry::Embedding(emb) => {
                assert_eq!(emb.rows, 3);
                assert_eq!(emb.index, Some(vec![0, 1, 2]));
            }
            other => panic!("expected embedding entry, got {other:?}"),
        }
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_resolve_no_match_records_miss() {
        let base = tempfile::tempdir().unwrap();
        let dir = scan_dir(base.path(), Modality::Dwi);
        // Wrong model token
        write_embedding(
            &dir,
            "gradient-ASE_dwi_rsn-a_res-2_template-MNI152_T1_model-csa_directget-prob_minlength-20_tol-8.npy",
            3,
        );

        let metrics: Vec<String> = Vec::new();
        let cx = cx(base.path(), Modality::Dwi, &metrics);
        let mut ledger = Ledger::new();
        assert!(resolve(&dwi_recipe(), &ScanId::new("A", "1"), &cx, &mut ledger).is_none());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_resolve_prefers_thrtype_free_candidate() {
        let base = tempfile::tempdir().unwrap();
        let dir = scan_dir(base.path(), Modality::Dwi);
        write_embedding(
            &dir,
            "gradient-ASE_dwi_rsn-a_res-2_template-MNI152_T1_model-csd_directget-prob_minlength-20_tol-8_thrtype-MST.npy",
            5,
        );
        let raw = write_embedding(&dir, DWI_NAME, 3);
        write_nodes(&dir, 3);

        let metrics: Vec<String> = Vec::new();
        let cx = cx(base.path(), Modality::Dwi, &metrics);
        let mut ledger = Ledger::new();
        let entry = resolve(&dwi_recipe(), &ScanId::new("A", "1"), &cx, &mut ledger).unwrap();
        match entry {
            Entry::Embedding(emb) => assert_eq!(emb.path, raw),
            other => panic!("expected embedding entry, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_takes_most_recent_among_ambiguous() {
        let base = tempfile::tempdir().unwrap();
        let dir = scan_dir(base.path(), Modality::Dwi);
        let older = write_embedding(&dir, &format!("older_{DWI_NAME}"), 3);
        let newer = write_embedding(&dir, &format!("newer_{DWI_NAME}"), 3);
        // Renames keep both candidates matching the gradient- prefix.
        let older_path = dir.join(format!("gradient-old_{}", file_name(&older)));
        let newer_path = dir.join(format!("gradient-new_{}", file_name(&newer)));
        fs::rename(&older, &older_path).unwrap();
        fs::rename(&newer, &newer_path).unwrap();

        let past = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        let f = fs::File::open(&older_path).unwrap();
        f.set_modified(past).unwrap();
        write_nodes(&dir, 3);

        let metrics: Vec<String> = Vec::new();
        let cx = cx(base.path(), Modality::Dwi, &metrics);
        let mut ledger = Ledger::new();
        let entry = resolve(&dwi_recipe(), &ScanId::new("A", "1"), &cx, &mut ledger).unwrap();
        match entry {
            Entry::Embedding(emb) => assert_eq!(emb.path, newer_path),
            other => panic!("expected embedding entry, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_smoothing_excludes_smoothed_artifacts() {
        let base = tempfile::tempdir().unwrap();
        let dir = scan_dir(base.path(), Modality::Func);
        let plain = write_embedding(
            &dir,
            "gradient-ASE_func_rsn-a_res-2_template-MNI152_T1_model-corr_hpass-0Hz_extract-mean.npy",
            3,
        );
        write_embedding(
            &dir,
            "gradient-ASE_func_rsn-a_res-2_template-MNI152_T1_model-corr_hpass-0Hz_extract-mean_smooth-2fwhm.npy",
            3,
        );
        write_nodes(&dir, 3);

        let metrics: Vec<String> = Vec::new();
        let cx = cx(base.path(), Modality::Func, &metrics);
        let mut ledger = Ledger::new();

        let entry = resolve(&func_recipe("0"), &ScanId::new("A", "1"), &cx, &mut ledger).unwrap();
        match entry {
            Entry::Embedding(emb) => assert_eq!(emb.path, plain),
            other => panic!("expected embedding entry, got {other:?}"),
        }

        let entry = resolve(&func_recipe("2"), &ScanId::new("A", "1"), &cx, &mut ledger).unwrap();
        match entry {
            Entry::Embedding(emb) => {
                assert!(file_name(&emb.path).contains("smooth-2fwhm"));
            }
            other => panic!("expected embedding entry, got {other:?}"),
        }
    }

    #[test]
    fn test_resolver_determinism() {
        let base = tempfile::tempdir().unwrap();
        let dir = scan_dir(base.path(), Modality::Dwi);
        write_embedding(&dir, DWI_NAME, 3);
        write_nodes(&dir, 3);

        let metrics: Vec<String> = Vec::new();
        let cx = cx(base.path(), Modality::Dwi, &metrics);

        let mut paths = Vec::new();
        for _ in 0..3 {
            let mut ledger = Ledger::new();
            let entry = resolve(&dwi_recipe(), &ScanId::new("A", "1"), &cx, &mut ledger).unwrap();
            match entry {
                Entry::Embedding(emb) => paths.push(emb.path),
                other => panic!("expected embedding entry, got {other:?}"),
            }
        }
        assert!(paths.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_unaligned_index_marks_entry_void() {
        let base = tempfile::tempdir().unwrap();
        let dir = scan_dir(base.path(), Modality::Dwi);
        write_embedding(&dir, DWI_NAME, 3);
        write_nodes(&dir, 5); // wrong node count

        let metrics: Vec<String> = Vec::new();
        let cx = cx(base.path(), Modality::Dwi, &metrics);
        let mut ledger = Ledger::new();
        let entry = resolve(&dwi_recipe(), &ScanId::new("A", "1"), &cx, &mut ledger).unwrap();
        assert!(entry.is_void());
    }

    #[test]
    fn test_discover_ensembles_strips_thrtype() {
        let base = tempfile::tempdir().unwrap();
        let dir = scan_dir(base.path(), Modality::Dwi);
        write_embedding(
            &dir,
            "gradient-ASE_dwi_model-csd_directget-prob_minlength-20_tol-8_thrtype-MST.npy",
            2,
        );
        write_embedding(
            &dir,
            "gradient-ASE_dwi_model-csa_directget-det_minlength-40_tol-8.npy",
            2,
        );

        let ens = discover_ensembles(base.path(), Modality::Dwi, Algorithm::Ase);
        assert_eq!(
            ens,
            vec![
                "rsn-a_res-2_model-csa_directget-det_minlength-40_tol-8".to_string(),
                "rsn-a_res-2_model-csd_directget-prob_minlength-20_tol-8".to_string(),
            ]
        );
    }

    #[test]
    fn test_discover_subjects() {
        let base = tempfile::tempdir().unwrap();
        for sub in ["sub-B", "sub-A", "not-a-subject"] {
            fs::create_dir_all(base.path().join("embeddings_all_func").join(sub)).unwrap();
        }
        let subs = discover_subjects(base.path(), Modality::Func);
        assert_eq!(subs, vec!["A".to_string(), "B".to_string()]);
    }
}
