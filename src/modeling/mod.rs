pub mod features;
pub mod vector;

pub use features::{Clock, FeatureVectorBuilder, PrerequisiteProxy};
pub use vector::{Feature, FeatureVector, FEATURE_DIM, FEATURE_NAMES};
