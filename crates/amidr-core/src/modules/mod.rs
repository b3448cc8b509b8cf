pub mod binning;
pub mod compare;
pub mod fit;
pub mod ionsat;
pub mod normalize;
pub mod pipeline;
pub mod segment;
pub mod serialization;

mod traits;

pub use traits::{CapacityModel, ModelCurve, ParameterSpace};
