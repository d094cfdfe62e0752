pub mod jobs;
pub mod lrcp;
pub mod wire;
