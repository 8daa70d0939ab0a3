//! Scheduling stages: bounded concurrency, executor hand-off and branching.

pub mod branch;
pub mod handoff;
pub mod throttle;

pub use branch::{BranchOnSeparateImagesProducer, BranchProducer, ImageDimensions, SeparateImagesMode};
pub use handoff::ThreadHandoffProducer;
pub use throttle::ThrottlingProducer;
