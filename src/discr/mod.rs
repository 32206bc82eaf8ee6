//! The discriminability statistic and its reliability density function.
//!
//! Discriminability is the probability that a random within-subject pair of
//! samples sits closer in feature space than a random between-subject pair.
//! For each sample and each of its same-label distances `d`, the reliability
//! value is the fraction of different-label distances exceeding `d`, with
//! exact ties earning half credit:
//!
//! ```text
//! rdf = 1 - (count(Dij < d) + 0.5 * count(Dij == d)) / |Dij|
//! ```
//!
//! Values below 0.5 mark non-discriminating comparisons and are masked
//! before averaging, so the observed statistic lives in [0.5, 1] whenever
//! any comparison survives; 1.0 means every within-subject pair beats every
//! between-subject pair, 0.5 is chance.
//!
//! Both the tie half-credit and the sub-0.5 masking measurably move the
//! result on small samples; tests below pin them.

use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use ndarray::Array2;
use serde::Deserialize;

/// Pairwise dissimilarity measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dissimilarity {
    Euclidean,
    Cosine,
    Haversine,
    Manhattan,
    /// `X` is already a dissimilarity matrix.
    Precomputed,
}

impl FromStr for Dissimilarity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "euclidean" => Ok(Self::Euclidean),
            "cosine" => Ok(Self::Cosine),
            "haversine" => Ok(Self::Haversine),
            "manhattan" => Ok(Self::Manhattan),
            "precomputed" => Ok(Self::Precomputed),
            other => Err(anyhow!("unknown dissimilarity: {other}")),
        }
    }
}

/// Output of [`discr_stat`].
#[derive(Debug)]
pub struct Discr {
    /// Mean of the surviving reliability values; NaN when none survive.
    pub stat: f64,
    /// Per-sample reliability matrix, NaN-padded and sub-0.5 masked.
    pub rdf: Array2<f64>,
}

/// Compute the discriminability statistic for feature matrix `x` and label
/// vector `y`.
///
/// With `remove_isolates`, rows whose label occurs only once are dropped
/// first (they admit no within-label comparison). The statistic is undefined
/// (NaN) when every surviving comparison is masked or no comparison exists.
pub fn discr_stat(
    x: &Array2<f64>,
    y: &[String],
    dissimilarity: Dissimilarity,
    remove_isolates: bool,
) -> Result<Discr> {
    if x.nrows() != y.len() {
        bail!(
            "feature matrix has {} rows but label vector has {} entries",
            x.nrows(),
            y.len()
        );
    }
    if dissimilarity == Dissimilarity::Precomputed && x.nrows() != x.ncols() {
        bail!("precomputed dissimilarity matrix must be square");
    }
    if dissimilarity == Dissimilarity::Haversine && x.ncols() != 2 {
        bail!("haversine dissimilarity requires exactly two feature columns");
    }

    let (x, labels) = if remove_isolates {
        retain_repeated_labels(x, y, dissimilarity)
    } else {
        (x.clone(), y.to_vec())
    };

    let dissimilarities = match dissimilarity {
        Dissimilarity::Precomputed => x,
        kind => pairwise(&x, kind),
    };

    let mut rdf = reliability_density(&dissimilarities, &labels);
    for v in rdf.iter_mut() {
        if *v < 0.5 {
            *v = f64::NAN;
        }
    }

    Ok(Discr {
        stat: nan_mean(&rdf),
        rdf,
    })
}

/// Drop rows (and, for precomputed input, columns) whose label is a
/// singleton.
fn retain_repeated_labels(
    x: &Array2<f64>,
    y: &[String],
    dissimilarity: Dissimilarity,
) -> (Array2<f64>, Vec<String>) {
    let keep: Vec<usize> = (0..y.len())
        .filter(|&i| y.iter().filter(|l| **l == y[i]).count() > 1)
        .collect();

    let labels: Vec<String> = keep.iter().map(|&i| y[i].clone()).collect();
    let out = match dissimilarity {
        Dissimilarity::Precomputed => {
            let mut out = Array2::zeros((keep.len(), keep.len()));
            for (ri, &i) in keep.iter().enumerate() {
                for (rj, &j) in keep.iter().enumerate() {
                    out[[ri, rj]] = x[[i, j]];
                }
            }
            out
        }
        _ => {
            let mut out = Array2::zeros((keep.len(), x.ncols()));
            for (ri, &i) in keep.iter().enumerate() {
                out.row_mut(ri).assign(&x.row(i));
            }
            out
        }
    };
    (out, labels)
}

/// Pairwise dissimilarity matrix over sample rows.
pub fn pairwise(x: &Array2<f64>, kind: Dissimilarity) -> Array2<f64> {
    let n = x.nrows();
    let mut out = Array2::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let d = row_distance(&x.row(i), &x.row(j), kind);
            out[[i, j]] = d;
            out[[j, i]] = d;
        }
    }
    out
}

fn row_distance(
    a: &ndarray::ArrayView1<'_, f64>,
    b: &ndarray::ArrayView1<'_, f64>,
    kind: Dissimilarity,
) -> f64 {
    match kind {
        Dissimilarity::Euclidean => a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y).powi(2))
            .sum::<f64>()
            .sqrt(),
        Dissimilarity::Manhattan => a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum(),
        Dissimilarity::Cosine => {
            let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
            let na: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
            let nb: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
            if na == 0.0 || nb == 0.0 {
                1.0
            } else {
                1.0 - dot / (na * nb)
            }
        }
        Dissimilarity::Haversine => {
            // Rows are (latitude, longitude) in radians.
            let (lat1, lon1) = (a[0], a[1]);
            let (lat2, lon2) = (b[0], b[1]);
            let s_lat = ((lat2 - lat1) / 2.0).sin();
            let s_lon = ((lon2 - lon1) / 2.0).sin();
            let h = s_lat * s_lat + lat1.cos() * lat2.cos() * s_lon * s_lon;
            2.0 * h.sqrt().min(1.0).asin()
        }
        Dissimilarity::Precomputed => unreachable!("precomputed input bypasses row distances"),
    }
}

/// The reliability density function: one row per sample, one column per
/// same-label comparison, NaN-padded to the widest sample.
pub fn reliability_density(dissimilarities: &Array2<f64>, labels: &[String]) -> Array2<f64> {
    let n = labels.len();
    let mut rdfs: Vec<Vec<f64>> = Vec::with_capacity(n);

    for i in 0..n {
        let di = dissimilarities.row(i);
        let dij: Vec<f64> = (0..n)
            .filter(|&j| labels[j] != labels[i])
            .map(|j| di[j])
            .collect();
        let dii: Vec<f64> = (0..n)
            .filter(|&j| j != i && labels[j] == labels[i])
            .map(|j| di[j])
            .collect();

        let row: Vec<f64> = dii
            .iter()
            .map(|&d| {
                if dij.is_empty() {
                    f64::NAN
                } else {
                    let below = dij.iter().filter(|&&v| v < d).count() as f64;
                    let ties = dij.iter().filter(|&&v| v == d).count() as f64;
                    1.0 - (below + 0.5 * ties) / dij.len() as f64
                }
            })
            .collect();
        rdfs.push(row);
    }

    let width = rdfs.iter().map(Vec::len).max().unwrap_or(0);
    let mut out = Array2::from_elem((n, width), f64::NAN);
    for (i, row) in rdfs.into_iter().enumerate() {
        for (j, v) in row.into_iter().enumerate() {
            out[[i, j]] = v;
        }
    }
    out
}

fn nan_mean(x: &Array2<f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for &v in x.iter() {
        if !v.is_nan() {
            sum += v;
            count += 1;
        }
    }
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_perfect_separation_scenario() {
        // 2 subjects, 2 sessions each, constant within-subject features.
        let x = array![[1.0, 1.0, 1.0, 1.0], [1.0, 1.0, 1.0, 1.0], [5.0, 5.0, 5.0, 5.0], [
            5.0, 5.0, 5.0, 5.0
        ]];
        let y = labels(&["A", "A", "B", "B"]);
        let out = discr_stat(&x, &y, Dissimilarity::Euclidean, true).unwrap();
        assert_eq!(out.stat, 1.0);
    }

    #[test]
    fn test_tie_half_credit() {
        // Sample 0's one same-label distance exactly equals its one
        // different-label distance: rdf = 1 - (0 + 0.5)/1 = 0.5.
        let d = array![[0.0, 2.0, 2.0], [2.0, 0.0, 3.0], [2.0, 3.0, 0.0]];
        let y = labels(&["A", "A", "B"]);
        let rdf = reliability_density(&d, &y);
        assert_eq!(rdf[[0, 0]], 0.5);
    }

    #[test]
    fn test_statistic_bounds() {
        let x = array![
            [0.0, 0.1],
            [0.2, 0.0],
            [1.0, 0.9],
            [0.9, 1.1],
            [0.5, 0.6],
            [0.55, 0.5]
        ];
        let y = labels(&["A", "A", "B", "B", "C", "C"]);
        for kind in [
            Dissimilarity::Euclidean,
            Dissimilarity::Manhattan,
            Dissimilarity::Cosine,
        ] {
            let out = discr_stat(&x, &y, kind, true).unwrap();
            assert!(
                out.stat.is_nan() || (0.5..=1.0).contains(&out.stat),
                "{kind:?} stat out of range: {}",
                out.stat
            );
        }
    }

    #[test]
    fn test_all_singletons_is_undefined() {
        let x = array![[1.0], [2.0], [3.0]];
        let y = labels(&["A", "B", "C"]);
        let out = discr_stat(&x, &y, Dissimilarity::Euclidean, true).unwrap();
        assert!(out.stat.is_nan());
        assert_eq!(out.rdf.nrows(), 0);
    }

    #[test]
    fn test_remove_isolates_drops_singleton_rows() {
        let x = array![[1.0], [1.1], [9.0], [5.0], [5.1]];
        let y = labels(&["A", "A", "lone", "B", "B"]);
        let out = discr_stat(&x, &y, Dissimilarity::Euclidean, true).unwrap();
        // Four retained samples, one within-label comparison each.
        assert_eq!(out.rdf.nrows(), 4);
        assert_eq!(out.stat, 1.0);
    }

    #[test]
    fn test_sub_half_values_are_masked() {
        // Anti-discriminating layout: within-label distances exceed the
        // between-label ones, so every rdf value falls below 0.5.
        let d = array![
            [0.0, 10.0, 1.0, 1.0],
            [10.0, 0.0, 1.0, 1.0],
            [1.0, 1.0, 0.0, 10.0],
            [1.0, 1.0, 10.0, 0.0]
        ];
        let y = labels(&["A", "A", "B", "B"]);
        let out = discr_stat(&d, &y, Dissimilarity::Precomputed, true).unwrap();
        assert!(out.stat.is_nan());
        assert!(out.rdf.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_precomputed_requires_square() {
        let x = array![[0.0, 1.0, 2.0], [1.0, 0.0, 3.0]];
        let y = labels(&["A", "A"]);
        assert!(discr_stat(&x, &y, Dissimilarity::Precomputed, false).is_err());
    }

    #[test]
    fn test_haversine_requires_two_columns() {
        let x = array![[0.0], [1.0]];
        let y = labels(&["A", "A"]);
        assert!(discr_stat(&x, &y, Dissimilarity::Haversine, false).is_err());
    }

    #[test]
    fn test_haversine_antipodal() {
        use std::f64::consts::PI;
        let x = array![[0.0, 0.0], [0.0, PI], [0.0, 0.0], [0.0, PI]];
        let y = labels(&["A", "B", "A", "B"]);
        let d = pairwise(&x, Dissimilarity::Haversine);
        assert!((d[[0, 1]] - PI).abs() < 1e-12);
        assert_eq!(d[[0, 2]], 0.0);
    }

    #[test]
    fn test_manhattan_distance() {
        let x = array![[0.0, 0.0], [1.0, 2.0]];
        let d = pairwise(&x, Dissimilarity::Manhattan);
        assert_eq!(d[[0, 1]], 3.0);
    }

    #[test]
    fn test_label_length_mismatch_is_an_error() {
        let x = array![[1.0], [2.0]];
        let y = labels(&["A"]);
        assert!(discr_stat(&x, &y, Dissimilarity::Euclidean, false).is_err());
    }

    #[test]
    fn test_rdf_padding_is_nan() {
        // Label A has three samples (two comparisons each); B has two (one
        // comparison each); B rows are padded with NaN.
        let x = array![[1.0], [1.1], [0.9], [5.0], [5.1]];
        let y = labels(&["A", "A", "A", "B", "B"]);
        let out = discr_stat(&x, &y, Dissimilarity::Euclidean, true).unwrap();
        assert_eq!(out.rdf.shape(), &[5, 2]);
        assert!(out.rdf[[3, 1]].is_nan());
        assert!(out.rdf[[4, 1]].is_nan());
    }
}
