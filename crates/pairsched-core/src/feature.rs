//! Microarchitectural feature catalogue and pressure-level encoding.
//!
//! Every table in the controller (measurement documents, characteristics,
//! the prediction-model feature vector) indexes resources through the fixed
//! catalogue below. A machine profiles only a subset of the catalogue (the
//! [`TargetSet`]), but catalogue order and catalogue ids are stable across
//! machines so that documents from different nodes stay comparable.

use crate::error::{ControlError, Result};

/// Ratio applied to the usable capacity to place the medium pressure point.
pub const MEDIUM_RATIO: f64 = 0.8;

// ---------------------------------------------------------------------------
// Feature kinds and pressure levels
// ---------------------------------------------------------------------------

/// How a resource degrades under contention, which decides how many pressure
/// levels it is probed at and which characterization math applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureKind {
    /// Issue queues and the µop cache: entries are consumed one by one, so
    /// three pressure points (low/medium/high) are needed to fit usage.
    Sequential,
    /// Caches and the DTLB: capacity is shared all-or-nothing enough that
    /// two pressure points (low/high) suffice.
    Parallel,
    /// Execution ports: bandwidth-bound, probed at a single high point.
    Port,
}

/// A discrete probe point for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Low,
    Medium,
    High,
}

impl FeatureKind {
    /// The probe points for this kind, in encoding order.
    pub fn levels(self) -> &'static [Level] {
        match self {
            FeatureKind::Sequential => &[Level::Low, Level::Medium, Level::High],
            FeatureKind::Parallel => &[Level::Low, Level::High],
            FeatureKind::Port => &[Level::High],
        }
    }

    /// Integer pressure encoding of `level` for this kind, as stored in
    /// measurement documents (sequential LOW=0/MED=1/HIGH=2, parallel
    /// LOW=0/HIGH=1, port HIGH=0).
    pub fn encode(self, level: Level) -> i32 {
        self.levels()
            .iter()
            .position(|l| *l == level)
            .map(|p| p as i32)
            .unwrap_or(-1)
    }

    /// Stable numeric code stored in the `feature_type` document field.
    pub fn type_code(self) -> i32 {
        match self {
            FeatureKind::Sequential => 0,
            FeatureKind::Parallel => 1,
            FeatureKind::Port => 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Catalogue
// ---------------------------------------------------------------------------

/// Static description of one catalogue resource.
#[derive(Debug)]
pub struct FeatureSpec {
    pub name: &'static str,
    pub kind: FeatureKind,
    /// Nominal capacity in resource units (entries, ways, ports).
    pub size: u32,
    /// Reserved headroom below `size` that injectors never claim.
    pub watermark: u32,
}

impl FeatureSpec {
    /// Capacity actually available to a co-runner.
    pub fn usable(&self) -> u32 {
        self.size - self.watermark
    }

    /// Pressure values in resource units, one per probe level.
    ///
    /// Sequential: `(1, ⌊usable·MEDIUM_RATIO⌋, usable)`. Parallel: `(1, 4)`.
    /// Ports have no unit-denominated pressure; a single placeholder is
    /// returned so the slice lines up with `kind.levels()`.
    pub fn pressure_values(&self) -> Vec<f64> {
        match self.kind {
            FeatureKind::Sequential => {
                let usable = self.usable() as f64;
                vec![1.0, (usable * MEDIUM_RATIO).floor(), usable]
            }
            FeatureKind::Parallel => vec![1.0, 4.0],
            FeatureKind::Port => vec![1.0],
        }
    }
}

/// The fixed, ordered feature catalogue. Index in this table is the stable
/// catalogue id carried in the `feature_id` document field.
pub const CATALOGUE: &[FeatureSpec] = &[
    FeatureSpec { name: "uop_cache", kind: FeatureKind::Sequential, size: 8, watermark: 4 },
    FeatureSpec { name: "int_port", kind: FeatureKind::Port, size: 0, watermark: 0 },
    FeatureSpec { name: "int_isq", kind: FeatureKind::Sequential, size: 75, watermark: 6 },
    FeatureSpec { name: "fp_port", kind: FeatureKind::Port, size: 0, watermark: 0 },
    FeatureSpec { name: "fp_isq", kind: FeatureKind::Sequential, size: 75, watermark: 6 },
    FeatureSpec { name: "load_isq", kind: FeatureKind::Sequential, size: 46, watermark: 8 },
    FeatureSpec { name: "l1_dcache", kind: FeatureKind::Parallel, size: 64 * 12, watermark: 0 },
    FeatureSpec { name: "l2_cache", kind: FeatureKind::Parallel, size: 1024 * 8, watermark: 0 },
    FeatureSpec { name: "l1_dtlb", kind: FeatureKind::Parallel, size: 16 * 4, watermark: 0 },
];

/// Resources measured by the profiling pipeline but never part of the
/// pairwise model: the LLC used for the scale-factor ceiling, plus queue
/// structures kept for diagnostics.
pub const AUXILIARY: &[FeatureSpec] = &[
    FeatureSpec { name: "l3_cache", kind: FeatureKind::Parallel, size: 16384 * 16, watermark: 0 },
    FeatureSpec { name: "load_lsq", kind: FeatureKind::Sequential, size: 128, watermark: 64 },
    FeatureSpec { name: "rob", kind: FeatureKind::Sequential, size: 352, watermark: 176 },
];

/// The feature name under which the solo-run IPC document is filed.
pub const SINGLE_FEATURE: &str = "single";

/// The feature whose high injector establishes the per-job IPC ceiling.
pub const SCALE_FACTOR_FEATURE: &str = "l3_cache";

/// Look a feature up by name in the catalogue, then the auxiliary table.
pub fn lookup(name: &str) -> Option<&'static FeatureSpec> {
    CATALOGUE
        .iter()
        .find(|f| f.name == name)
        .or_else(|| AUXILIARY.iter().find(|f| f.name == name))
}

/// Catalogue id of `name`, or -1 for auxiliary/synthetic features.
pub fn catalogue_id(name: &str) -> i32 {
    CATALOGUE
        .iter()
        .position(|f| f.name == name)
        .map(|p| p as i32)
        .unwrap_or(-1)
}

/// `feature_type` document code for `name`, -1 when unknown/synthetic.
pub fn type_code(name: &str) -> i32 {
    if CATALOGUE.iter().any(|f| f.name == name) {
        lookup(name).map(|f| f.kind.type_code()).unwrap_or(-1)
    } else {
        -1
    }
}

// ---------------------------------------------------------------------------
// Target set
// ---------------------------------------------------------------------------

/// The machine-configured subset of the catalogue that is actually profiled
/// and fed to the prediction model. Order follows the catalogue; each member
/// gets a dense index used for characteristic vectors and model features.
#[derive(Debug, Clone)]
pub struct TargetSet {
    features: Vec<&'static FeatureSpec>,
}

impl TargetSet {
    /// Build a target set from feature names. Unknown names and auxiliary
    /// features are rejected; order is normalized to catalogue order and
    /// duplicates collapse.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        for n in names {
            if !CATALOGUE.iter().any(|f| f.name == n.as_ref()) {
                return Err(ControlError::Config(format!(
                    "unknown target feature '{}'",
                    n.as_ref()
                )));
            }
        }
        let features: Vec<&'static FeatureSpec> = CATALOGUE
            .iter()
            .filter(|f| names.iter().any(|n| n.as_ref() == f.name))
            .collect();
        if features.is_empty() {
            return Err(ControlError::Config("empty target feature set".into()));
        }
        Ok(TargetSet { features })
    }

    /// The default deployment subset.
    pub fn default_set() -> Self {
        TargetSet::from_names(&[
            "int_port",
            "int_isq",
            "fp_port",
            "load_isq",
            "l1_dcache",
            "l2_cache",
            "l1_dtlb",
        ])
        .expect("default target names are catalogue members")
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Dense index of `name` within this set.
    pub fn idx(&self, name: &str) -> Option<usize> {
        self.features.iter().position(|f| f.name == name)
    }

    pub fn get(&self, idx: usize) -> &'static FeatureSpec {
        self.features[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static FeatureSpec> + '_ {
        self.features.iter().copied()
    }

    /// Member names in dense-index order.
    pub fn names(&self) -> Vec<&'static str> {
        self.features.iter().map(|f| f.name).collect()
    }
}
