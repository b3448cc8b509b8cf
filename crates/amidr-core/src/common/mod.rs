pub mod config;
pub mod constants;

pub use config::{
    AnalysisConfig, BinningOptions, Bounds, FitOptions, Geometry, IonSaturationInputs,
    NormalizationOptions, ReferencePoint, SegmentationOptions, load_analysis_config,
};
