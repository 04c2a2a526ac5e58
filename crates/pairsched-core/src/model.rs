//! The interference prediction model: a non-negative linear regressor
//! trained offline, loaded from a timestamp-versioned JSON file.
//!
//! Feature vector for an ordered pair `(base, col)`:
//! - `x₀`: the base job's smallest per-feature base slowdown;
//! - `x_{1+idx(f)}`: `sensitivity(base,f) · intensity(col,f) ·
//!   activation(usage(base,f), usage(col,f), f)`.
//!
//! Predicted slowdown is rescaled by the base job's IPC ceiling into a
//! compatibility score in `[0, 1]`; the symbiotic score of a pair is the sum
//! of both directions.

use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde::Deserialize;

use crate::characterize::JobCharacteristics;
use crate::error::{ControlError, Result};
use crate::feature::{FeatureKind, TargetSet};

/// Model files are named `prediction_model_<unix timestamp>.json`.
const MODEL_PREFIX: &str = "prediction_model_";
const MODEL_SUFFIX: &str = ".json";

#[derive(Debug, Deserialize)]
struct ModelFile {
    feature_list: Vec<String>,
    coefficients: Vec<f64>,
    intercept: Intercept,
}

/// Trainers emit the intercept either as a scalar or a one-element array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Intercept {
    Scalar(f64),
    Array(Vec<f64>),
}

/// A loaded, validated regressor.
#[derive(Debug, Clone)]
pub struct PredictionModel {
    weights: Vec<f64>,
    intercept: f64,
}

impl PredictionModel {
    /// Build a model directly from weights (tests, synthetic scoring).
    pub fn from_parts(weights: Vec<f64>, intercept: f64) -> Self {
        PredictionModel { weights, intercept }
    }

    /// Parse a model file body and check it against the target set: the
    /// feature list must be `["base", <target features in order>]` with one
    /// coefficient each.
    pub fn from_json(raw: &str, target: &TargetSet) -> Result<Self> {
        let file: ModelFile = serde_json::from_str(raw)?;

        let mut expected = vec!["base".to_string()];
        expected.extend(target.names().iter().map(|n| n.to_string()));
        if file.feature_list != expected {
            return Err(ControlError::ModelInvalid(format!(
                "feature list {:?} does not match target set {:?}",
                file.feature_list, expected
            )));
        }
        if file.coefficients.len() != file.feature_list.len() {
            return Err(ControlError::ModelInvalid(format!(
                "{} coefficients for {} features",
                file.coefficients.len(),
                file.feature_list.len()
            )));
        }
        let intercept = match file.intercept {
            Intercept::Scalar(v) => v,
            Intercept::Array(v) if v.len() == 1 => v[0],
            Intercept::Array(v) => {
                return Err(ControlError::ModelInvalid(format!(
                    "intercept array of length {}",
                    v.len()
                )));
            }
        };
        if file.coefficients.iter().any(|w| *w < 0.0) {
            // The trainer constrains weights to be non-negative; a negative
            // weight breaks score monotonicity but is not worth a refusal.
            warn!("model has negative coefficients; scores may not be monotone");
        }
        Ok(PredictionModel { weights: file.coefficients, intercept })
    }

    /// Load the newest model under `dir` (highest filename timestamp).
    pub fn load_latest(dir: &Path, target: &TargetSet) -> Result<(Self, PathBuf)> {
        let path = latest_model_path(dir)?;
        let raw = fs::read_to_string(&path)?;
        Ok((Self::from_json(&raw, target)?, path))
    }

    /// `w·x + w₀`.
    pub fn predict_slowdown(&self, x: &[f64]) -> f64 {
        let dot: f64 = self.weights.iter().zip(x).map(|(w, v)| w * v).sum();
        dot + self.intercept
    }
}

/// Newest `prediction_model_<ts>.json` under `dir`.
pub fn latest_model_path(dir: &Path) -> Result<PathBuf> {
    let mut best: Option<(i64, PathBuf)> = None;
    let entries = fs::read_dir(dir)
        .map_err(|_| ControlError::ModelNotFound(dir.display().to_string()))?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(ts) = name
            .strip_prefix(MODEL_PREFIX)
            .and_then(|rest| rest.strip_suffix(MODEL_SUFFIX))
            .and_then(|stamp| stamp.parse::<i64>().ok())
        else {
            continue;
        };
        if best.as_ref().is_none_or(|(seen, _)| ts > *seen) {
            best = Some((ts, entry.path()));
        }
    }
    best.map(|(_, path)| path)
        .ok_or_else(|| ControlError::ModelNotFound(dir.display().to_string()))
}

/// Deploy `source` into `dir` as the newest timestamped model, unless the
/// newest existing model already has identical content. Returns the new path
/// when a copy was made.
pub fn deploy_model(source: &Path, dir: &Path, timestamp: i64) -> Result<Option<PathBuf>> {
    let body = fs::read_to_string(source)?;
    fs::create_dir_all(dir)?;
    if let Ok(latest) = latest_model_path(dir) {
        if fs::read_to_string(&latest)? == body {
            return Ok(None);
        }
    }
    let dest = dir.join(format!("{MODEL_PREFIX}{timestamp}{MODEL_SUFFIX}"));
    fs::write(&dest, body)?;
    Ok(Some(dest))
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Contention activation of two usage fractions on one feature.
///
/// Sequential resources only contend once their combined claim exceeds the
/// whole structure; shared-capacity resources contend smoothly.
pub fn activation(kind: FeatureKind, usage_a: f64, usage_b: f64) -> f64 {
    match kind {
        FeatureKind::Sequential => (usage_a + usage_b - 1.0).max(0.0),
        _ => usage_a * usage_b * (usage_a + usage_b) / 2.0,
    }
}

/// Assemble the model input for the ordered pair `(base, col)`.
pub fn feature_vector(
    target: &TargetSet,
    base: &JobCharacteristics,
    col: &JobCharacteristics,
) -> Vec<f64> {
    let mut x = Vec::with_capacity(target.len() + 1);
    let min_base_slowdown = base
        .profiles
        .iter()
        .map(|p| p.base_slowdown)
        .fold(f64::INFINITY, f64::min);
    x.push(if min_base_slowdown.is_finite() { min_base_slowdown } else { 0.0 });

    for (idx, spec) in target.iter().enumerate() {
        let b = &base.profiles[idx];
        let c = &col.profiles[idx];
        x.push(b.sensitivity * c.intensity * activation(spec.kind, b.usage, c.usage));
    }
    x
}

/// Directional compatibility score: scale-factored predicted retained
/// throughput of `base` while co-running with `col`, clamped to `[0, 1]`.
pub fn compatibility(
    model: &PredictionModel,
    target: &TargetSet,
    base: &JobCharacteristics,
    col: &JobCharacteristics,
) -> f64 {
    let predicted = model.predict_slowdown(&feature_vector(target, base, col));
    (base.scale_factor * (1.0 - predicted)).clamp(0.0, 1.0)
}

/// Symbiotic score of an unordered pair: both directional compatibilities
/// summed. Symmetric by construction, in `[0, 2]`.
pub fn symbiotic(
    model: &PredictionModel,
    target: &TargetSet,
    a: &JobCharacteristics,
    b: &JobCharacteristics,
) -> f64 {
    compatibility(model, target, a, b) + compatibility(model, target, b, a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characterize::FeatureProfile;

    fn chars(job: i32, target: &TargetSet, usage: f64, sf: f64) -> JobCharacteristics {
        JobCharacteristics {
            job,
            profiles: (0..target.len())
                .map(|i| FeatureProfile {
                    sensitivity: 0.5,
                    usage,
                    intensity: 0.4,
                    base_slowdown: 0.1 + i as f64 * 0.05,
                })
                .collect(),
            single_ipc: 1.0,
            scale_factor: sf,
        }
    }

    #[test]
    fn activation_matches_worked_examples() {
        assert_eq!(activation(FeatureKind::Sequential, 0.3, 0.4), 0.0);
        assert!((activation(FeatureKind::Sequential, 0.7, 0.5) - 0.2).abs() < 1e-12);
        assert!((activation(FeatureKind::Parallel, 0.5, 0.5) - 0.125).abs() < 1e-12);
        assert!((activation(FeatureKind::Parallel, 0.8, 0.8) - 0.512).abs() < 1e-12);
    }

    #[test]
    fn activation_is_symmetric_and_bounded() {
        for kind in [FeatureKind::Sequential, FeatureKind::Parallel, FeatureKind::Port] {
            for ua in [0.0, 0.25, 0.5, 0.75, 1.0] {
                for ub in [0.0, 0.3, 0.6, 1.0] {
                    let fwd = activation(kind, ua, ub);
                    let rev = activation(kind, ub, ua);
                    assert_eq!(fwd, rev);
                    assert!((0.0..=1.0).contains(&fwd));
                }
            }
        }
    }

    #[test]
    fn model_json_accepts_scalar_and_array_intercept() {
        let target = TargetSet::from_names(&["int_port", "l1_dcache"]).unwrap();
        let scalar = r#"{
            "feature_list": ["base", "int_port", "l1_dcache"],
            "coefficients": [0.1, 0.2, 0.3],
            "intercept": 0.05
        }"#;
        let array = r#"{
            "feature_list": ["base", "int_port", "l1_dcache"],
            "coefficients": [0.1, 0.2, 0.3],
            "intercept": [0.05]
        }"#;
        let a = PredictionModel::from_json(scalar, &target).unwrap();
        let b = PredictionModel::from_json(array, &target).unwrap();
        assert_eq!(a.intercept, b.intercept);
        assert_eq!(a.weights, b.weights);
    }

    #[test]
    fn model_json_rejects_mismatches() {
        let target = TargetSet::from_names(&["int_port", "l1_dcache"]).unwrap();
        let wrong_features = r#"{
            "feature_list": ["base", "l1_dcache", "int_port"],
            "coefficients": [0.1, 0.2, 0.3],
            "intercept": 0.0
        }"#;
        assert!(PredictionModel::from_json(wrong_features, &target).is_err());
        let wrong_len = r#"{
            "feature_list": ["base", "int_port", "l1_dcache"],
            "coefficients": [0.1, 0.2],
            "intercept": 0.0
        }"#;
        assert!(PredictionModel::from_json(wrong_len, &target).is_err());
        let fat_intercept = r#"{
            "feature_list": ["base", "int_port", "l1_dcache"],
            "coefficients": [0.1, 0.2, 0.3],
            "intercept": [0.0, 1.0]
        }"#;
        assert!(PredictionModel::from_json(fat_intercept, &target).is_err());
    }

    #[test]
    fn newest_model_wins_and_dedup_deploy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("prediction_model_100.json"), "old").unwrap();
        std::fs::write(dir.path().join("prediction_model_250.json"), "new").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();
        let latest = latest_model_path(dir.path()).unwrap();
        assert!(latest.ends_with("prediction_model_250.json"));

        // Identical content is not re-deployed; new content is.
        let src = dir.path().join("candidate.json");
        std::fs::write(&src, "new").unwrap();
        assert!(deploy_model(&src, dir.path(), 300).unwrap().is_none());
        std::fs::write(&src, "newer").unwrap();
        let dest = deploy_model(&src, dir.path(), 300).unwrap().unwrap();
        assert!(dest.ends_with("prediction_model_300.json"));
        assert!(latest_model_path(dir.path()).unwrap().ends_with("prediction_model_300.json"));
    }

    #[test]
    fn missing_model_dir_is_model_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nowhere");
        assert!(matches!(
            latest_model_path(&missing),
            Err(ControlError::ModelNotFound(_))
        ));
        assert!(matches!(
            latest_model_path(dir.path()),
            Err(ControlError::ModelNotFound(_))
        ));
    }

    #[test]
    fn symbiotic_score_symmetry() {
        // sf(7)=0.9 with ŝ(7|8)=0.1 → cs=0.81; sf(8)=0.8 with ŝ(8|7)=0.2 →
        // cs=0.64; sym = 1.45 either way round.
        let target = TargetSet::from_names(&["int_port"]).unwrap();
        let mut a = chars(7, &target, 0.0, 0.9);
        let mut b = chars(8, &target, 0.0, 0.8);
        // Zero usage kills the feature terms; steer ŝ through x₀ alone.
        a.profiles[0].base_slowdown = 0.1;
        b.profiles[0].base_slowdown = 0.2;
        let model = PredictionModel::from_parts(vec![1.0, 1.0], 0.0);

        let cs_ab = compatibility(&model, &target, &a, &b);
        let cs_ba = compatibility(&model, &target, &b, &a);
        assert!((cs_ab - 0.81).abs() < 1e-12);
        assert!((cs_ba - 0.64).abs() < 1e-12);
        let sym = symbiotic(&model, &target, &a, &b);
        assert!((sym - 1.45).abs() < 1e-12);
        assert_eq!(sym, symbiotic(&model, &target, &b, &a));
        assert!((0.0..=2.0).contains(&sym));
    }

    #[test]
    fn compatibility_is_monotone_in_feature_terms() {
        let target = TargetSet::from_names(&["int_port", "l1_dcache"]).unwrap();
        let model = PredictionModel::from_parts(vec![0.5, 0.8, 0.8], 0.0);
        let base = chars(1, &target, 0.5, 1.0);
        let mut low = chars(2, &target, 0.2, 1.0);
        let mut high = chars(2, &target, 0.2, 1.0);
        low.profiles[0].intensity = 0.1;
        high.profiles[0].intensity = 0.9;
        // More intense co-runner ⇒ larger predicted slowdown ⇒ no larger score.
        assert!(
            compatibility(&model, &target, &base, &high)
                <= compatibility(&model, &target, &base, &low)
        );
    }
}
