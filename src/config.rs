//! Run configuration loading from repromap.toml.
//!
//! ## Example
//!
//! ```toml
//! [benchmark]
//! base-dir = "/data/outs/triple"
//! modalities = ["func", "dwi"]
//! embeddings = ["topology"]
//! sessions = ["1", "2"]
//! thr-type = "MST"
//! dissimilarity = "euclidean"
//! discriminability = true
//! ```
//!
//! Every field has a default except `base-dir`; validation runs before any
//! work starts and rejects configurations that request no report at all.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::discr::Dissimilarity;
use crate::grid::SmoothingCapture;
use crate::types::{Algorithm, Modality};

/// Default graph-theory metric vocabulary for topology entries.
pub const DEFAULT_METRICS: &[&str] = &[
    "global_efficiency",
    "average_clustering",
    "average_shortest_path_length",
    "average_local_efficiency_nodewise",
    "average_betweenness_centrality",
    "average_eigenvector_centrality",
    "modularity",
];

/// A fully resolved benchmark run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Root of the derivatives tree (topology tables, embeddings).
    pub base_dir: PathBuf,
    pub modalities: Vec<Modality>,
    /// Embedding algorithms (or topology) to benchmark.
    pub embeddings: Vec<Algorithm>,
    pub sessions: Vec<String>,
    /// Registration template tag expected in embedding names.
    pub template: String,
    /// Thresholding-type tag expected in topology column names.
    pub thr_type: String,
    pub metrics: Vec<String>,
    pub dissimilarity: Dissimilarity,
    pub remove_isolates: bool,
    /// Report the discriminability statistic per recipe.
    pub discriminability: bool,
    /// Report reliability coefficients per recipe (needs an estimator).
    pub reliability: bool,
    pub smoothing_capture: SmoothingCapture,
    /// Minimum finite-value fraction a feature column must keep.
    pub min_column_coverage: f64,
}

/// Raw config as deserialized from TOML.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct RawConfig {
    base_dir: Option<PathBuf>,
    modalities: Option<Vec<Modality>>,
    embeddings: Option<Vec<Algorithm>>,
    sessions: Option<Vec<String>>,
    template: Option<String>,
    thr_type: Option<String>,
    metrics: Option<Vec<String>>,
    dissimilarity: Option<Dissimilarity>,
    remove_isolates: Option<bool>,
    discriminability: Option<bool>,
    reliability: Option<bool>,
    smoothing_capture: Option<SmoothingCapture>,
    min_column_coverage: Option<f64>,
}

/// Wrapper for the `[benchmark]` table.
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    benchmark: Option<RawConfig>,
}

impl RunConfig {
    /// Load configuration from an explicit file, or `repromap.toml` in the
    /// working directory, falling back to defaults.
    pub fn load(config_path: Option<&Path>, base_dir: Option<&Path>) -> Result<Self> {
        let raw = match config_path {
            Some(path) => Self::read_raw(path)?,
            None => {
                let candidate = Path::new("repromap.toml");
                if candidate.is_file() {
                    Self::read_raw(candidate)?
                } else {
                    RawConfig::default()
                }
            }
        };

        let base_dir = match base_dir.map(Path::to_path_buf).or(raw.base_dir) {
            Some(dir) => dir,
            None => bail!("no base directory: pass --base-dir or set base-dir in repromap.toml"),
        };

        let cfg = Self {
            base_dir,
            modalities: raw
                .modalities
                .unwrap_or_else(|| vec![Modality::Func, Modality::Dwi]),
            embeddings: raw.embeddings.unwrap_or_else(|| vec![Algorithm::Topology]),
            sessions: raw.sessions.unwrap_or_else(|| vec!["1".to_string()]),
            template: raw.template.unwrap_or_else(|| "MNI152_T1".to_string()),
            thr_type: raw.thr_type.unwrap_or_else(|| "MST".to_string()),
            metrics: raw
                .metrics
                .unwrap_or_else(|| DEFAULT_METRICS.iter().map(|m| m.to_string()).collect()),
            dissimilarity: raw.dissimilarity.unwrap_or(Dissimilarity::Euclidean),
            remove_isolates: raw.remove_isolates.unwrap_or(true),
            discriminability: raw.discriminability.unwrap_or(true),
            reliability: raw.reliability.unwrap_or(false),
            smoothing_capture: raw.smoothing_capture.unwrap_or_default(),
            min_column_coverage: raw.min_column_coverage.unwrap_or(0.5),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn read_raw(path: &Path) -> Result<RawConfig> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let file: ConfigFile = toml::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(file.benchmark.unwrap_or_default())
    }

    /// Reject impossible configurations before any work starts.
    pub fn validate(&self) -> Result<()> {
        if !self.discriminability && !self.reliability {
            bail!("must request at least one of discriminability or reliability");
        }
        if self.modalities.is_empty() {
            bail!("no modalities configured");
        }
        if self.embeddings.is_empty() {
            bail!("no embedding types configured");
        }
        if self.sessions.is_empty() {
            bail!("no sessions configured");
        }
        if !(0.0..=1.0).contains(&self.min_column_coverage) {
            bail!(
                "min-column-coverage must lie in [0, 1], got {}",
                self.min_column_coverage
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_defaults_from_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RunConfig::load(None, Some(dir.path())).unwrap();
        assert_eq!(cfg.modalities, vec![Modality::Func, Modality::Dwi]);
        assert_eq!(cfg.embeddings, vec![Algorithm::Topology]);
        assert_eq!(cfg.thr_type, "MST");
        assert_eq!(cfg.metrics.len(), DEFAULT_METRICS.len());
        assert!(cfg.discriminability);
        assert!(!cfg.reliability);
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repromap.toml");
        fs::write(
            &path,
            r#"
[benchmark]
base-dir = "/data/outs"
modalities = ["dwi"]
embeddings = ["ASE", "topology"]
sessions = ["1", "2"]
thr-type = "PROP"
dissimilarity = "cosine"
smoothing-capture = "zero-after-first"
"#,
        )
        .unwrap();

        let cfg = RunConfig::load(Some(&path), None).unwrap();
        assert_eq!(cfg.base_dir, PathBuf::from("/data/outs"));
        assert_eq!(cfg.modalities, vec![Modality::Dwi]);
        assert_eq!(cfg.embeddings, vec![Algorithm::Ase, Algorithm::Topology]);
        assert_eq!(cfg.thr_type, "PROP");
        assert_eq!(cfg.dissimilarity, Dissimilarity::Cosine);
        assert_eq!(cfg.smoothing_capture, SmoothingCapture::ZeroAfterFirst);
    }

    #[test]
    fn test_base_dir_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repromap.toml");
        fs::write(&path, "[benchmark]\nbase-dir = \"/from/file\"\n").unwrap();
        let cfg = RunConfig::load(Some(&path), Some(Path::new("/from/cli"))).unwrap();
        assert_eq!(cfg.base_dir, PathBuf::from("/from/cli"));
    }

    #[test]
    fn test_requesting_no_report_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repromap.toml");
        fs::write(
            &path,
            "[benchmark]\nbase-dir = \"/x\"\ndiscriminability = false\nreliability = false\n",
        )
        .unwrap();
        assert!(RunConfig::load(Some(&path), None).is_err());
    }

    #[test]
    fn test_missing_base_dir_is_fatal() {
        // No config file in the working directory and no --base-dir.
        let prev = std::env::current_dir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let result = RunConfig::load(None, None);
        std::env::set_current_dir(prev).unwrap();
        assert!(result.is_err());
    }
}
