//! Named analysis options and their validation.
//!
//! Every option carries the documented default, so an empty JSON object is a
//! complete configuration apart from the particle radius. `validate` runs
//! before any fitting starts; nothing here is silently corrected.

use crate::domain::{AmidrError, ConfigResult, ExecutionMode, Protocol};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;

pub const DEFAULT_EXPANSION_TERMS: usize = 4000;
pub const DEFAULT_ACTIVE_MATERIAL_DENSITY: f64 = 4.9;
pub const DEFAULT_TAU_MIN: f64 = 0.5;
pub const DEFAULT_MAX_DQDV_CHANGE: f64 = 2.0;
pub const DEFAULT_BIN_WIDTH: f64 = 0.025;
pub const DEFAULT_FTOL: f64 = 5.0e-14;
pub const DEFAULT_MAX_EVALUATIONS: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Bounds {
    pub lower: f64,
    pub upper: f64,
}

impl Bounds {
    pub const fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }

    fn validate(&self, placeholder: &'static str, name: &str) -> ConfigResult<()> {
        if !(self.lower.is_finite() && self.upper.is_finite()) || self.lower >= self.upper {
            return Err(AmidrError::configuration(
                placeholder,
                format!(
                    "{} bounds must satisfy lower < upper, got [{}, {}]",
                    name, self.lower, self.upper
                ),
            ));
        }
        Ok(())
    }

    fn validate_positive(&self, placeholder: &'static str, name: &str) -> ConfigResult<()> {
        self.validate(placeholder, name)?;
        if self.lower <= 0.0 {
            return Err(AmidrError::configuration(
                placeholder,
                format!("{} bounds must be positive, got [{}, {}]", name, self.lower, self.upper),
            ));
        }
        Ok(())
    }
}

impl From<[f64; 2]> for Bounds {
    fn from(value: [f64; 2]) -> Self {
        Self::new(value[0], value[1])
    }
}

impl From<Bounds> for [f64; 2] {
    fn from(value: Bounds) -> Self {
        [value.lower, value.upper]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Geometry {
    Sphere,
}

impl FromStr for Geometry {
    type Err = AmidrError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sphere" => Ok(Self::Sphere),
            other => Err(AmidrError::configuration(
                "CONFIG.GEOMETRY",
                format!("unsupported particle geometry '{}'; supported: sphere", other),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationOptions {
    pub protocol: Protocol,
    /// Re-derive step indices because the file was stitched together by hand.
    pub spliced: bool,
    /// Replace the full-cell label potential with the working-electrode potential.
    pub force_two_electrode: bool,
    /// Current magnitude (A) at or below which a sample counts as open circuit.
    pub zero_current_threshold: f64,
    /// Use the nominal capacity from the file header instead of the measured span.
    pub use_input_capacity: bool,
}

impl Default for SegmentationOptions {
    fn default() -> Self {
        Self {
            protocol: Protocol::SingleRate,
            spliced: false,
            force_two_electrode: false,
            zero_current_threshold: 1.0e-9,
            use_input_capacity: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationOptions {
    pub capacitance_correction: bool,
    /// Multi-rate points with a cumulative capacity fraction below this are dropped.
    pub fcap_min: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    /// Particle radius in cm.
    pub particle_radius: f64,
    pub resistance_corrected: bool,
    pub geometry: String,
    pub expansion_terms: usize,
    pub d_bounds: Bounds,
    pub d_guess: f64,
    pub p_bounds: Bounds,
    pub p_guess: f64,
    pub capacity_adjustment_bounds: Bounds,
    pub capacity_adjustment_guess: f64,
    pub remove_out_of_bounds: bool,
    pub ftol: f64,
    pub max_evaluations: usize,
    /// Active material density in g/cm^3, used for the contact resistivity.
    pub active_material_density: f64,
    pub execution_mode: ExecutionMode,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            particle_radius: 0.0,
            resistance_corrected: true,
            geometry: "sphere".to_string(),
            expansion_terms: DEFAULT_EXPANSION_TERMS,
            d_bounds: Bounds::new(1.0e-17, 1.0e-8),
            d_guess: 1.0e-11,
            p_bounds: Bounds::new(1.0e-6, 10.0),
            p_guess: 1.0e-2,
            capacity_adjustment_bounds: Bounds::new(1.0, 1.5),
            capacity_adjustment_guess: 1.0,
            remove_out_of_bounds: true,
            ftol: DEFAULT_FTOL,
            max_evaluations: DEFAULT_MAX_EVALUATIONS,
            active_material_density: DEFAULT_ACTIVE_MATERIAL_DENSITY,
            execution_mode: ExecutionMode::Serial,
        }
    }
}

impl FitOptions {
    pub fn geometry(&self) -> ConfigResult<Geometry> {
        self.geometry.parse()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.particle_radius.is_finite() && self.particle_radius > 0.0) {
            return Err(AmidrError::configuration(
                "CONFIG.PARTICLE_RADIUS",
                format!(
                    "particle radius must be a positive length in cm, got {}",
                    self.particle_radius
                ),
            ));
        }
        self.geometry()?;
        if self.expansion_terms == 0 {
            return Err(AmidrError::configuration(
                "CONFIG.EXPANSION_TERMS",
                "expansion term count must be positive",
            ));
        }
        self.d_bounds.validate_positive("CONFIG.BOUNDS", "D_c")?;
        self.p_bounds.validate_positive("CONFIG.BOUNDS", "P")?;
        self.capacity_adjustment_bounds
            .validate_positive("CONFIG.BOUNDS", "capacity adjustment")?;

        for (name, guess, bounds) in [
            ("D_c", self.d_guess, self.d_bounds),
            ("P", self.p_guess, self.p_bounds),
            (
                "capacity adjustment",
                self.capacity_adjustment_guess,
                self.capacity_adjustment_bounds,
            ),
        ] {
            if !bounds.contains(guess) {
                return Err(AmidrError::configuration(
                    "CONFIG.GUESS",
                    format!(
                        "{} initial guess {} lies outside [{}, {}]",
                        name, guess, bounds.lower, bounds.upper
                    ),
                ));
            }
        }

        if !(self.ftol > 0.0) || self.max_evaluations == 0 {
            return Err(AmidrError::configuration(
                "CONFIG.OPTIMIZER",
                format!(
                    "optimizer needs ftol > 0 and a positive evaluation budget, got ftol={} max_evaluations={}",
                    self.ftol, self.max_evaluations
                ),
            ));
        }
        if !(self.active_material_density > 0.0) {
            return Err(AmidrError::configuration(
                "CONFIG.DENSITY",
                format!(
                    "active material density must be positive, got {}",
                    self.active_material_density
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferencePoint {
    pub voltage: f64,
    /// Specific capacity in mAh/g from an independent half-cell measurement.
    pub specific_capacity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IonSaturationInputs {
    /// Kelvin.
    pub temperature: f64,
    /// Theoretical maximum specific capacity in mAh/g.
    pub theoretical_capacity: f64,
    pub reference_points: [ReferencePoint; 2],
}

impl IonSaturationInputs {
    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.temperature > 0.0) {
            return Err(AmidrError::configuration(
                "CONFIG.ION_SATURATION",
                format!("temperature must be positive kelvin, got {}", self.temperature),
            ));
        }
        if !(self.theoretical_capacity > 0.0) {
            return Err(AmidrError::configuration(
                "CONFIG.ION_SATURATION",
                format!(
                    "theoretical capacity must be positive, got {}",
                    self.theoretical_capacity
                ),
            ));
        }
        let [first, second] = self.reference_points;
        if !(first.voltage.is_finite()
            && second.voltage.is_finite()
            && first.specific_capacity.is_finite()
            && second.specific_capacity.is_finite())
        {
            return Err(AmidrError::configuration(
                "CONFIG.ION_SATURATION",
                "reference points must be finite (voltage, specific capacity) pairs",
            ));
        }
        if first.voltage == second.voltage || first.specific_capacity == second.specific_capacity
        {
            return Err(AmidrError::configuration(
                "CONFIG.ION_SATURATION",
                "the two reference points must differ in both voltage and capacity",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinningOptions {
    pub tau_min: f64,
    /// `None` disables the dq/dV neighbour check, including the edge rejection.
    pub max_dqdv_change: Option<f64>,
    pub bin_width: f64,
}

impl Default for BinningOptions {
    fn default() -> Self {
        Self {
            tau_min: DEFAULT_TAU_MIN,
            max_dqdv_change: Some(DEFAULT_MAX_DQDV_CHANGE),
            bin_width: DEFAULT_BIN_WIDTH,
        }
    }
}

impl BinningOptions {
    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.bin_width.is_finite() && self.bin_width > 0.0) {
            return Err(AmidrError::configuration(
                "CONFIG.BIN_WIDTH",
                format!("bin width must be positive, got {}", self.bin_width),
            ));
        }
        if let Some(change) = self.max_dqdv_change {
            if !(change > 1.0) {
                return Err(AmidrError::configuration(
                    "CONFIG.MAX_DQDV_CHANGE",
                    format!("maximum dq/dV change must exceed 1, got {}", change),
                ));
            }
        }
        if !self.tau_min.is_finite() {
            return Err(AmidrError::configuration(
                "CONFIG.TAU_MIN",
                "minimum tau must be finite",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub segmentation: SegmentationOptions,
    pub normalization: NormalizationOptions,
    pub fit: FitOptions,
    pub ion_saturation: Option<IonSaturationInputs>,
    pub binning: BinningOptions,
}

impl AnalysisConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.segmentation.spliced && self.segmentation.protocol == Protocol::SingleRate {
            return Err(AmidrError::configuration(
                "CONFIG.SPLICED_SINGLE_RATE",
                "single-rate protocol cannot operate on spliced files; clean up the file and disable splicing",
            ));
        }
        if !(self.segmentation.zero_current_threshold >= 0.0) {
            return Err(AmidrError::configuration(
                "CONFIG.ZERO_CURRENT",
                format!(
                    "zero-current threshold must be non-negative, got {}",
                    self.segmentation.zero_current_threshold
                ),
            ));
        }
        self.fit.validate()?;
        if let Some(inputs) = &self.ion_saturation {
            inputs.validate()?;
        }
        self.binning.validate()
    }
}

pub fn load_analysis_config(path: impl AsRef<Path>) -> ConfigResult<AnalysisConfig> {
    let path = path.as_ref();
    let source = fs::read_to_string(path).map_err(|source| {
        AmidrError::io_system(
            "IO.CONFIG_READ",
            format!("failed to read configuration '{}': {}", path.display(), source),
        )
    })?;
    let config: AnalysisConfig = serde_json::from_str(&source).map_err(|source| {
        AmidrError::configuration(
            "CONFIG.PARSE",
            format!("failed to parse configuration '{}': {}", path.display(), source),
        )
    })?;
    config.validate()?;
    Ok(config)
}
