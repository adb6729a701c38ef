pub mod consumer;
pub mod jobs;
pub mod queue;

pub mod utils;
