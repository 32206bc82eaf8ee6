//! Token extraction from ensemble identifier strings.
//!
//! Ensemble identifiers are free text in which hyperparameters are embedded
//! as `<name>-<value>` substrings delimited by underscores, e.g.
//! `rsn-triple_res-2_model-corr_hpass-0Hz_extract-mean_smooth-2fwhm`.
//! This module is the small explicit parser over that convention: one
//! function per extraction shape, absence of a token is a silent per-pair
//! skip, never an error.
//!
//! ## Extraction shapes
//!
//! | Shape            | Rule                                               |
//! |------------------|----------------------------------------------------|
//! | generic          | text between `<name>-` and the next `_`            |
//! | unit-suffixed    | generic, then strip a trailing unit marker         |
//! | smoothing        | unit-suffixed with a `"0"` sentinel (two policies) |
//!
//! The smoothing token historically had two divergent capture paths; both
//! are preserved behind [`SmoothingCapture`] and pinned by tests below.

use serde::Deserialize;

use super::HyperparamDict;
use crate::types::Modality;

/// Hyperparameter names that the generic `<name>-` rule must NOT touch.
///
/// These are either extracted by a dedicated modality-specific rule below
/// (smooth, hpass, extract, directget, minlength, tol) or are fixed per run
/// and never enumerated as grid axes (template, nodetype, samples,
/// track_type).
pub const GENERIC_EXCLUDED: &[&str] = &[
    "smooth",
    "hpass",
    "track_type",
    "directget",
    "tol",
    "minlength",
    "samples",
    "nodetype",
    "template",
    "extract",
];

/// Which of the two historical smoothing-capture behaviors to apply.
///
/// The upstream workflow shipped two divergent code paths for the functional
/// smoothing token and it is not documented which was intended, so both are
/// preserved behind this flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SmoothingCapture {
    /// A present token contributes its value; an absent token contributes
    /// the `"0"` sentinel.
    ZeroWhenAbsent,
    /// The first present token contributes its value; every later present
    /// token contributes a literal `"0"`; an absent token contributes
    /// nothing.
    ZeroAfterFirst,
}

impl Default for SmoothingCapture {
    fn default() -> Self {
        SmoothingCapture::ZeroWhenAbsent
    }
}

/// The substring between the first `<name>-` and the next `_` delimiter.
///
/// Returns `None` when the identifier carries no such token.
pub fn token_after<'a>(ident: &'a str, name: &str) -> Option<&'a str> {
    let marker = format!("{name}-");
    let start = ident.find(&marker)? + marker.len();
    let rest = &ident[start..];
    let end = rest.find('_').unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Strip a trailing unit marker (`fwhm`, `Hz`) from an extracted token.
fn strip_unit<'a>(token: &'a str, unit: &str) -> &'a str {
    match token.find(unit) {
        Some(i) => &token[..i],
        None => token,
    }
}

/// Scan one identifier and append every recognized token to `dict`.
///
/// Returns the number of values contributed; zero means the identifier
/// matched no recognized token at all (the caller logs it and moves on).
pub fn collect(
    ident: &str,
    modality: Modality,
    dict: &mut HyperparamDict,
    capture: SmoothingCapture,
) -> usize {
    let mut contributed = 0;

    for &name in modality.hyperparam_names() {
        if GENERIC_EXCLUDED.contains(&name) {
            continue;
        }
        if let Some(value) = token_after(ident, name) {
            dict.push(name, value);
            contributed += 1;
        }
    }

    match modality {
        Modality::Func => {
            match capture {
                SmoothingCapture::ZeroWhenAbsent => {
                    if let Some(tok) = token_after(ident, "smooth") {
                        dict.push("smooth", strip_unit(tok, "fwhm"));
                        contributed += 1;
                    } else {
                        // Sentinel only; does not count as a parsed token.
                        dict.push("smooth", "0");
                    }
                }
                SmoothingCapture::ZeroAfterFirst => {
                    if let Some(tok) = token_after(ident, "smooth") {
                        if dict.contains("smooth") {
                            dict.push("smooth", "0");
                        } else {
                            dict.push("smooth", strip_unit(tok, "fwhm"));
                        }
                        contributed += 1;
                    }
                }
            }
            if let Some(tok) = token_after(ident, "hpass") {
                dict.push("hpass", strip_unit(tok, "Hz"));
                contributed += 1;
            }
            if let Some(tok) = token_after(ident, "extract") {
                dict.push("extract", tok);
                contributed += 1;
            }
        }
        Modality::Dwi => {
            for name in ["directget", "minlength", "tol"] {
                if let Some(tok) = token_after(ident, name) {
                    dict.push(name, tok);
                    contributed += 1;
                }
            }
        }
    }

    contributed
}

#[cfg(test)]
mod tests {
    use super::*;

    const FUNC_IDENT: &str =
        "rsn-triple_res-2_model-corr_hpass-0.1Hz_extract-mean_smooth-2fwhm";
    const DWI_IDENT: &str =
        "rsn-triple_res-2_model-csd_directget-prob_minlength-20_tol-8";

    #[test]
    fn test_token_after_basic() {
        assert_eq!(token_after(FUNC_IDENT, "rsn"), Some("triple"));
        assert_eq!(token_after(FUNC_IDENT, "res"), Some("2"));
        assert_eq!(token_after(FUNC_IDENT, "model"), Some("corr"));
        // Trailing token has no `_` terminator
        assert_eq!(token_after(DWI_IDENT, "tol"), Some("8"));
    }

    #[test]
    fn test_token_after_absent_is_none() {
        assert_eq!(token_after(FUNC_IDENT, "directget"), None);
        assert_eq!(token_after("garbage", "rsn"), None);
    }

    #[test]
    fn test_func_tokens_all_present() {
        let mut dict = HyperparamDict::new();
        let n = collect(
            FUNC_IDENT,
            Modality::Func,
            &mut dict,
            SmoothingCapture::ZeroWhenAbsent,
        );
        assert_eq!(n, 6);
        assert_eq!(dict.get("rsn"), &["triple"]);
        assert_eq!(dict.get("res"), &["2"]);
        assert_eq!(dict.get("model"), &["corr"]);
        assert_eq!(dict.get("hpass"), &["0.1"]);
        assert_eq!(dict.get("extract"), &["mean"]);
        assert_eq!(dict.get("smooth"), &["2"]);
    }

    #[test]
    fn test_func_tokens_each_absent() {
        // Dropping any one token only loses that token's contribution.
        for missing in ["rsn", "res", "model", "hpass", "extract"] {
            let ident: String = FUNC_IDENT
                .split('_')
                .filter(|part| !part.starts_with(&format!("{missing}-")))
                .collect::<Vec<_>>()
                .join("_");
            let mut dict = HyperparamDict::new();
            collect(
                &ident,
                Modality::Func,
                &mut dict,
                SmoothingCapture::ZeroWhenAbsent,
            );
            assert!(!dict.contains(missing), "{missing} should be skipped");
        }
    }

    #[test]
    fn test_dwi_tokens_all_present() {
        let mut dict = HyperparamDict::new();
        let n = collect(
            DWI_IDENT,
            Modality::Dwi,
            &mut dict,
            SmoothingCapture::ZeroWhenAbsent,
        );
        assert_eq!(n, 6);
        assert_eq!(dict.get("directget"), &["prob"]);
        assert_eq!(dict.get("minlength"), &["20"]);
        assert_eq!(dict.get("tol"), &["8"]);
    }

    #[test]
    fn test_dwi_tokens_each_absent() {
        for missing in ["directget", "minlength", "tol"] {
            let ident: String = DWI_IDENT
                .split('_')
                .filter(|part| !part.starts_with(&format!("{missing}-")))
                .collect::<Vec<_>>()
                .join("_");
            let mut dict = HyperparamDict::new();
            collect(
                &ident,
                Modality::Dwi,
                &mut dict,
                SmoothingCapture::ZeroWhenAbsent,
            );
            assert!(!dict.contains(missing), "{missing} should be skipped");
        }
    }

    #[test]
    fn test_unit_markers_are_stripped() {
        let mut dict = HyperparamDict::new();
        collect(
            "rsn-a_res-1_model-corr_hpass-0.08Hz_extract-median_smooth-6fwhm",
            Modality::Func,
            &mut dict,
            SmoothingCapture::ZeroWhenAbsent,
        );
        assert_eq!(dict.get("hpass"), &["0.08"]);
        assert_eq!(dict.get("smooth"), &["6"]);
    }

    #[test]
    fn test_smoothing_policies_diverge() {
        // Two identifiers with distinct smoothing kernels expose the
        // divergence between the historical capture paths.
        let idents = [
            "rsn-a_res-1_model-corr_hpass-0Hz_extract-mean_smooth-2fwhm",
            "rsn-a_res-1_model-corr_hpass-0Hz_extract-mean_smooth-4fwhm",
        ];

        let mut when_absent = HyperparamDict::new();
        let mut after_first = HyperparamDict::new();
        for ident in idents {
            collect(
                ident,
                Modality::Func,
                &mut when_absent,
                SmoothingCapture::ZeroWhenAbsent,
            );
            collect(
                ident,
                Modality::Func,
                &mut after_first,
                SmoothingCapture::ZeroAfterFirst,
            );
        }
        when_absent.dedup();
        after_first.dedup();

        // ZeroWhenAbsent keeps every observed kernel.
        assert_eq!(when_absent.get("smooth"), &["2", "4"]);
        // ZeroAfterFirst keeps the first and collapses the rest to "0".
        assert_eq!(after_first.get("smooth"), &["0", "2"]);
    }

    #[test]
    fn test_smoothing_absent_token() {
        let ident = "rsn-a_res-1_model-corr_hpass-0Hz_extract-mean";

        let mut when_absent = HyperparamDict::new();
        collect(
            ident,
            Modality::Func,
            &mut when_absent,
            SmoothingCapture::ZeroWhenAbsent,
        );
        assert_eq!(when_absent.get("smooth"), &["0"]);

        let mut after_first = HyperparamDict::new();
        collect(
            ident,
            Modality::Func,
            &mut after_first,
            SmoothingCapture::ZeroAfterFirst,
        );
        assert!(!after_first.contains("smooth"));
    }

    #[test]
    fn test_garbage_contributes_nothing() {
        let mut dict = HyperparamDict::new();
        let n = collect(
            "not_an_ensemble_name",
            Modality::Dwi,
            &mut dict,
            SmoothingCapture::ZeroWhenAbsent,
        );
        assert_eq!(n, 0);
        assert!(dict.is_empty());
    }
}
