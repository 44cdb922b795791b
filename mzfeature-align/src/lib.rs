mod align;

pub use align::{
    AlignedFeature, AlignmentGroup, AlignmentParams, FeatureAligner, RunFeature,
};
