pub mod errors;

pub use errors::{AmidrError, AmidrErrorCategory, AmidrResult, ConfigResult, SegmentResult};

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Serial,
    Parallel,
}

/// Pulse protocol recorded in a file.
///
/// `SingleRate` (AMIDR) applies one current per pulse and follows it with an
/// open-circuit relaxation. `MultiRate` (AMID) steps through decreasing rates
/// to the same cutoff voltage before relaxing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    SingleRate,
    MultiRate,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SingleRate => "AMIDR",
            Self::MultiRate => "AMID",
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HalfCycle {
    Charge,
    Discharge,
}

impl HalfCycle {
    pub fn from_current(current: f64) -> Self {
        if current >= 0.0 {
            Self::Charge
        } else {
            Self::Discharge
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Charge => "Charge",
            Self::Discharge => "Discharge",
        }
    }
}

impl Display for HalfCycle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

/// One row of the tabular cycler export.
///
/// Units follow the UHPC export: hours, volts, amperes and ampere-hours.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub time: f64,
    pub voltage: f64,
    /// Full-cell potential of a three-electrode cell, used for labels.
    #[serde(default)]
    pub cell_voltage: Option<f64>,
    pub current: f64,
    pub capacity: f64,
    pub step_index: i64,
}

impl Sample {
    pub fn new(time: f64, voltage: f64, current: f64, capacity: f64, step_index: i64) -> Self {
        Self {
            time,
            voltage,
            cell_voltage: None,
            current,
            capacity,
            step_index,
        }
    }

    pub fn label_voltage(&self) -> f64 {
        self.cell_voltage.unwrap_or(self.voltage)
    }
}

/// A parsed cycler file plus the cell metadata normally found in its header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    pub label: String,
    /// Active material mass in grams.
    pub mass: f64,
    /// Nominal cell capacity in Ah, used to convert currents to C-rates.
    pub nominal_capacity: f64,
    pub samples: Vec<Sample>,
}

impl CellRecord {
    pub fn new(
        label: impl Into<String>,
        mass: f64,
        nominal_capacity: f64,
        samples: Vec<Sample>,
    ) -> Self {
        Self {
            label: label.into(),
            mass,
            nominal_capacity,
            samples,
        }
    }
}
