//! Diffusivity analysis for galvanostatic pulse/relaxation measurements.
//!
//! Cycler records are segmented into pulse and relaxation steps, normalized into
//! capacity-fraction intervals, fitted against the spherical Atlung expression,
//! optionally corrected for ion saturation, and finally screened and averaged
//! into voltage bins per material.

pub mod common;
pub mod domain;
pub mod modules;
pub mod numerics;
