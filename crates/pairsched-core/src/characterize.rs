//! Workload characterization: raw per-resource IPC measurements in, one
//! `(sensitivity, usage, intensity, base_slowdown)` tuple per target feature
//! out.
//!
//! The math differs by feature kind (§ the feature catalogue): issue-queue
//! style resources are probed at three pressure points and their usage comes
//! from a straight-line fit; caches compare the high injector's throughput
//! against its low/high baselines; ports collapse to a single high-pressure
//! comparison. Every output lands in `[0, 1]`; sensitivity is floored at a
//! tiny positive value because downstream scoring divides by it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};
use crate::feature::{self, FeatureKind, FeatureSpec, Level, TargetSet};
use crate::store::{
    JOB_INJECTOR_HIGH, JOB_INJECTOR_LOW, JOB_INJECTOR_SINGLE, Measurement, ProfileStore,
    RUN_INJECTOR, RUN_WORKLOAD,
};

/// Smallest admissible sensitivity; avoids division hazards downstream.
pub const SENSITIVITY_FLOOR: f64 = 1e-7;

/// Below this sensitivity a workload is treated as not using the resource.
pub const USAGE_SENSITIVITY_GATE: f64 = 0.05;

/// Smallest admissible magnitude for the usage-fit slope.
const SLOPE_FLOOR: f64 = 0.001;

/// Shift applied when the medium and high pressure points coincide.
const PRESSURE_SHIFT: f64 = 0.001;

// ---------------------------------------------------------------------------
// Measurement lookup
// ---------------------------------------------------------------------------

/// Fast lookup over one job's measurement corpus, keyed by
/// `(feature, pressure, run_type)`.
#[derive(Debug, Clone)]
pub struct MeasurementIndex {
    job: i32,
    map: HashMap<(String, i32, String), f64>,
}

impl MeasurementIndex {
    pub fn build(job: i32, docs: &[Measurement]) -> Self {
        let mut map = HashMap::with_capacity(docs.len());
        for doc in docs {
            map.insert(
                (doc.feature.clone(), doc.pressure, doc.run_type.clone()),
                doc.ipc,
            );
        }
        MeasurementIndex { job, map }
    }

    fn get(&self, feature_name: &str, pressure: i32, run_type: &str) -> Result<f64> {
        self.map
            .get(&(feature_name.to_string(), pressure, run_type.to_string()))
            .copied()
            .ok_or_else(|| ControlError::MissingMeasurement {
                job: self.job,
                what: format!("{feature_name}/p{pressure}/{run_type}"),
            })
    }
}

/// The three injector-only baseline corpora, keyed by the sibling injector
/// the primary ran against (none / low / high).
#[derive(Debug, Clone)]
pub struct Baselines {
    solo: MeasurementIndex,
    vs_low: MeasurementIndex,
    vs_high: MeasurementIndex,
}

impl Baselines {
    /// Fetch all three baseline corpora from the store.
    pub fn load(store: &dyn ProfileStore) -> Result<Self> {
        Ok(Baselines {
            solo: MeasurementIndex::build(
                JOB_INJECTOR_SINGLE,
                &store.fetch_profile_data(JOB_INJECTOR_SINGLE)?,
            ),
            vs_low: MeasurementIndex::build(
                JOB_INJECTOR_LOW,
                &store.fetch_profile_data(JOB_INJECTOR_LOW)?,
            ),
            vs_high: MeasurementIndex::build(
                JOB_INJECTOR_HIGH,
                &store.fetch_profile_data(JOB_INJECTOR_HIGH)?,
            ),
        })
    }

    pub fn from_docs(solo: &[Measurement], vs_low: &[Measurement], vs_high: &[Measurement]) -> Self {
        Baselines {
            solo: MeasurementIndex::build(JOB_INJECTOR_SINGLE, solo),
            vs_low: MeasurementIndex::build(JOB_INJECTOR_LOW, vs_low),
            vs_high: MeasurementIndex::build(JOB_INJECTOR_HIGH, vs_high),
        }
    }
}

// ---------------------------------------------------------------------------
// Characteristics
// ---------------------------------------------------------------------------

/// The per-feature 4-tuple. All fields in `[0, 1]`; `sensitivity` strictly
/// positive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureProfile {
    pub sensitivity: f64,
    pub usage: f64,
    pub intensity: f64,
    pub base_slowdown: f64,
}

/// Everything scoring needs to know about one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCharacteristics {
    pub job: i32,
    /// One profile per target feature, in dense-index order.
    pub profiles: Vec<FeatureProfile>,
    /// Solo-run IPC.
    pub single_ipc: f64,
    /// IPC ceiling ratio under the LLC high injector; rescales predicted
    /// slowdown into the compatibility score.
    pub scale_factor: f64,
}

/// Derive a job's characteristics from its profiling corpus. Partial corpora
/// are rejected: any missing document fails the whole job.
pub fn characterize_job(
    target: &TargetSet,
    docs: &MeasurementIndex,
    baselines: &Baselines,
) -> Result<JobCharacteristics> {
    let solo_ipc = docs.get(feature::SINGLE_FEATURE, 0, RUN_WORKLOAD)?;

    let mut profiles = Vec::with_capacity(target.len());
    for spec in target.iter() {
        let raw = match spec.kind {
            FeatureKind::Sequential => characterize_sequential(spec, solo_ipc, docs, baselines)?,
            FeatureKind::Parallel => characterize_parallel(spec, solo_ipc, docs, baselines)?,
            FeatureKind::Port => characterize_port(spec, solo_ipc, docs, baselines)?,
        };
        profiles.push(clamp_profile(raw));
    }

    let sf_pressure = FeatureKind::Parallel.encode(Level::High);
    let ceiling_ipc = docs.get(feature::SCALE_FACTOR_FEATURE, sf_pressure, RUN_WORKLOAD)?;
    let scale_factor = ratio(ceiling_ipc, solo_ipc).max(0.0);

    Ok(JobCharacteristics { job: docs.job, profiles, single_ipc: solo_ipc, scale_factor })
}

fn characterize_sequential(
    spec: &FeatureSpec,
    solo_ipc: f64,
    docs: &MeasurementIndex,
    baselines: &Baselines,
) -> Result<FeatureProfile> {
    let p_low = spec.kind.encode(Level::Low);
    let p_med = spec.kind.encode(Level::Medium);
    let p_high = spec.kind.encode(Level::High);

    let wl_low = docs.get(spec.name, p_low, RUN_WORKLOAD)?;
    let wl_med = docs.get(spec.name, p_med, RUN_WORKLOAD)?;
    let wl_high = docs.get(spec.name, p_high, RUN_WORKLOAD)?;
    let inj_corun = docs.get(spec.name, p_low, RUN_INJECTOR)?;
    let inj_solo = baselines.solo.get(spec.name, p_low, RUN_INJECTOR)?;

    let intensity = 1.0 - ratio(inj_corun, inj_solo);
    let base_slowdown = 1.0 - ratio(wl_low, solo_ipc);
    let sensitivity = 1.0 - ratio(wl_high, wl_low);
    let usage = fit_sequential_usage(spec, wl_low, wl_med, wl_high, sensitivity);

    Ok(FeatureProfile { sensitivity, usage, intensity, base_slowdown })
}

/// Fit a line through the medium/high pressure points and solve for the
/// pressure at which the workload would run at its low-pressure IPC. The
/// solution, clamped into `[watermark, usable]`, is how many resource units
/// the co-runner could take before this workload noticed.
fn fit_sequential_usage(
    spec: &FeatureSpec,
    wl_low: f64,
    wl_med: f64,
    wl_high: f64,
    sensitivity: f64,
) -> f64 {
    let values = spec.pressure_values();
    let (mut v_med, v_high) = (values[1], values[2]);
    if (v_high - v_med).abs() < f64::EPSILON {
        v_med -= PRESSURE_SHIFT;
    }

    let mut slope = (wl_high - wl_med) / (v_high - v_med);
    if slope.abs() < SLOPE_FLOOR {
        slope = if slope > 0.0 { SLOPE_FLOOR } else { -SLOPE_FLOOR };
    }

    let watermark = spec.watermark as f64;
    let usable = spec.usable() as f64;
    let x = if slope > 0.0 {
        // IPC rising with pressure is anomalous; file it as minimal usage.
        usable
    } else {
        (v_med + (wl_low - wl_med) / slope).clamp(watermark, usable)
    };

    if sensitivity > USAGE_SENSITIVITY_GATE {
        let size = spec.size as f64;
        ((size - x) / size).max(0.0)
    } else {
        0.0
    }
}

fn characterize_parallel(
    spec: &FeatureSpec,
    solo_ipc: f64,
    docs: &MeasurementIndex,
    baselines: &Baselines,
) -> Result<FeatureProfile> {
    let p_low = spec.kind.encode(Level::Low);
    let p_high = spec.kind.encode(Level::High);

    let wl_low = docs.get(spec.name, p_low, RUN_WORKLOAD)?;
    let wl_high = docs.get(spec.name, p_high, RUN_WORKLOAD)?;
    let inj_corun_low = docs.get(spec.name, p_low, RUN_INJECTOR)?;
    let inj_solo_low = baselines.solo.get(spec.name, p_low, RUN_INJECTOR)?;

    let intensity = 1.0 - ratio(inj_corun_low, inj_solo_low);
    let base_slowdown = 1.0 - ratio(wl_low, solo_ipc);
    let sensitivity = 1.0 - ratio(wl_high, wl_low);

    // How far the workload pushes the high injector from its "sharing with
    // nothing" throughput toward its "sharing with everything" throughput.
    let high_vs_low = baselines.vs_low.get(spec.name, p_high, RUN_INJECTOR)?;
    let high_vs_high = baselines.vs_high.get(spec.name, p_high, RUN_INJECTOR)?;
    let high_vs_workload = docs.get(spec.name, p_high, RUN_INJECTOR)?;
    let span = high_vs_low - high_vs_high;
    let usage = if span.abs() > f64::EPSILON {
        (high_vs_low - high_vs_workload) / span
    } else {
        0.0
    };

    Ok(FeatureProfile { sensitivity, usage, intensity, base_slowdown })
}

fn characterize_port(
    spec: &FeatureSpec,
    solo_ipc: f64,
    docs: &MeasurementIndex,
    baselines: &Baselines,
) -> Result<FeatureProfile> {
    let p_high = spec.kind.encode(Level::High);

    let wl_high = docs.get(spec.name, p_high, RUN_WORKLOAD)?;
    let inj_corun = docs.get(spec.name, p_high, RUN_INJECTOR)?;
    let inj_solo = baselines.solo.get(spec.name, p_high, RUN_INJECTOR)?;

    let intensity = 1.0 - ratio(inj_corun, inj_solo);
    let base_slowdown = 1.0 - ratio(wl_high, solo_ipc);

    Ok(FeatureProfile {
        sensitivity: base_slowdown,
        usage: intensity,
        intensity,
        base_slowdown,
    })
}

fn clamp_profile(raw: FeatureProfile) -> FeatureProfile {
    let clamped = |v: f64| v.clamp(0.0, 1.0);
    let mut sensitivity = clamped(raw.sensitivity);
    if sensitivity <= 0.0 {
        sensitivity = SENSITIVITY_FLOOR;
    }
    FeatureProfile {
        sensitivity,
        usage: clamped(raw.usage),
        intensity: clamped(raw.intensity),
        base_slowdown: clamped(raw.base_slowdown),
    }
}

fn ratio(num: f64, den: f64) -> f64 {
    if den.abs() < f64::EPSILON { 0.0 } else { num / den }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{JOB_INJECTOR_HIGH, JOB_INJECTOR_LOW, JOB_INJECTOR_SINGLE};

    const JOB: i32 = 7;

    fn doc(feature: &str, job: i32, pressure: i32, run: &str, ipc: f64) -> Measurement {
        Measurement::new("test-node", feature, job, pressure, run, ipc)
    }

    /// A complete, plausible corpus for one job over the given target set.
    fn full_corpus(target: &TargetSet) -> (MeasurementIndex, Baselines) {
        let mut job_docs = vec![doc("single", JOB, 0, RUN_WORKLOAD, 1.5)];
        let mut solo = Vec::new();
        let mut vs_low = Vec::new();
        let mut vs_high = Vec::new();

        for spec in target.iter() {
            for (p, _) in spec.kind.levels().iter().enumerate() {
                let p = p as i32;
                job_docs.push(doc(spec.name, JOB, p, RUN_WORKLOAD, 1.4 - 0.2 * p as f64));
                job_docs.push(doc(spec.name, JOB, p, RUN_INJECTOR, 1.1 - 0.1 * p as f64));
                solo.push(doc(spec.name, JOB_INJECTOR_SINGLE, p, RUN_INJECTOR, 1.6));
                vs_low.push(doc(spec.name, JOB_INJECTOR_LOW, p, RUN_INJECTOR, 1.3));
                vs_high.push(doc(spec.name, JOB_INJECTOR_HIGH, p, RUN_INJECTOR, 0.7));
            }
        }
        // Scale-factor ceiling measurement.
        job_docs.push(doc("l3_cache", JOB, 1, RUN_WORKLOAD, 1.2));

        (
            MeasurementIndex::build(JOB, &job_docs),
            Baselines::from_docs(&solo, &vs_low, &vs_high),
        )
    }

    #[test]
    fn sequential_usage_line_fit() {
        // Worked example: pressures (1, 55, 69), workload IPCs 1.20/1.00/0.80
        // on int_isq (size 75, watermark 6) → x ≈ 41, usage ≈ 0.453.
        let spec = feature::lookup("int_isq").unwrap();
        let sensitivity = 1.0 - 0.80 / 1.20;
        let usage = fit_sequential_usage(spec, 1.20, 1.00, 0.80, sensitivity);
        assert!((usage - 34.0 / 75.0).abs() < 1e-2, "usage was {usage}");
    }

    #[test]
    fn sequential_usage_gate_and_clamps() {
        let spec = feature::lookup("int_isq").unwrap();
        // Insensitive workloads report zero usage regardless of the fit.
        assert_eq!(fit_sequential_usage(spec, 1.20, 1.00, 0.80, 0.04), 0.0);
        // A rising line (anomalous) lands in the minimal-usage bucket.
        let usage = fit_sequential_usage(spec, 1.0, 1.0, 1.2, 0.5);
        assert!((usage - (75.0 - 69.0) / 75.0).abs() < 1e-12);
        // A fit escaping below the watermark saturates.
        let usage = fit_sequential_usage(spec, 5.0, 1.00, 0.80, 0.5);
        assert!((usage - (75.0 - 6.0) / 75.0).abs() < 1e-12);
    }

    #[test]
    fn parallel_usage_interpolates_between_baselines() {
        let target = TargetSet::from_names(&["l1_dcache"]).unwrap();
        let (mut docs, baselines) = full_corpus(&target);
        // High injector: 2.0 against low baseline, 1.0 against high baseline,
        // 1.5 against this workload → usage 0.5.
        docs.map.insert(("l1_dcache".into(), 1, RUN_INJECTOR.into()), 1.5);
        let mut vs_low = docs.clone();
        let base = Baselines {
            solo: baselines.solo.clone(),
            vs_low: {
                vs_low.map.insert(("l1_dcache".into(), 1, RUN_INJECTOR.into()), 2.0);
                vs_low
            },
            vs_high: {
                let mut b = baselines.vs_high.clone();
                b.map.insert(("l1_dcache".into(), 1, RUN_INJECTOR.into()), 1.0);
                b
            },
        };
        let out = characterize_job(&target, &docs, &base).unwrap();
        assert!((out.profiles[0].usage - 0.5).abs() < 1e-12);
    }

    #[test]
    fn port_usage_equals_intensity() {
        let target = TargetSet::from_names(&["int_port"]).unwrap();
        let (docs, baselines) = full_corpus(&target);
        let out = characterize_job(&target, &docs, &baselines).unwrap();
        let p = out.profiles[0];
        assert_eq!(p.usage, p.intensity);
        // intensity = 1 − 1.1/1.6
        assert!((p.intensity - (1.0 - 1.1 / 1.6)).abs() < 1e-12);
        // base_slowdown = 1 − 1.4/1.5, shared with (unfloored) sensitivity
        assert!((p.base_slowdown - (1.0 - 1.4 / 1.5)).abs() < 1e-12);
    }

    #[test]
    fn all_outputs_clamped_and_sensitivity_floored() {
        let target = TargetSet::default_set();
        let (mut docs, baselines) = full_corpus(&target);
        // Make int_isq *faster* under high pressure: sensitivity would go
        // negative and must be floored.
        docs.map.insert(("int_isq".into(), 2, RUN_WORKLOAD.into()), 99.0);
        let out = characterize_job(&target, &docs, &baselines).unwrap();
        for p in &out.profiles {
            assert!(p.sensitivity > 0.0 && p.sensitivity <= 1.0);
            assert!((0.0..=1.0).contains(&p.usage));
            assert!((0.0..=1.0).contains(&p.intensity));
            assert!((0.0..=1.0).contains(&p.base_slowdown));
        }
        let isq = target.idx("int_isq").unwrap();
        assert_eq!(out.profiles[isq].sensitivity, SENSITIVITY_FLOOR);
    }

    #[test]
    fn scale_factor_is_ceiling_over_solo() {
        let target = TargetSet::from_names(&["int_port"]).unwrap();
        let (docs, baselines) = full_corpus(&target);
        let out = characterize_job(&target, &docs, &baselines).unwrap();
        assert!((out.single_ipc - 1.5).abs() < 1e-12);
        assert!((out.scale_factor - 1.2 / 1.5).abs() < 1e-12);
    }

    #[test]
    fn missing_document_fails_the_job() {
        let target = TargetSet::default_set();
        let (mut docs, baselines) = full_corpus(&target);
        docs.map.remove(&("l1_dtlb".to_string(), 1, RUN_WORKLOAD.to_string()));
        let err = characterize_job(&target, &docs, &baselines).unwrap_err();
        assert!(matches!(err, ControlError::MissingMeasurement { job: JOB, .. }));
    }
}
