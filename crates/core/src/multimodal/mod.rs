//! Position-id synthesis for vision-language inputs.
//!
//! Image and video encoders are external. What the forward pass needs from
//! them is only the grid extents of each vision segment, which this module
//! turns into the three-axis position ids that drive sectioned rotary.

mod position;

pub use position::{PositionIdBuilder, VisionGrid};
