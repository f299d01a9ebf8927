//! Infrastructure layer: job store, work queue, pipeline orchestration and
//! the worker pool.

pub mod config;
pub mod jobs;
pub mod pipeline;
pub mod queue;
pub mod workers;

#[cfg(test)]
mod test_support;
