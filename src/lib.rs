// Loadtest - Library root

pub mod codec;
pub mod config;
pub mod deploy;
pub mod error;
pub mod generator;
pub mod parser;
pub mod pipeline;
pub mod report;
pub mod target;
pub mod worker;

pub use codec::RequestResult;
pub use config::PipelineConfig;
pub use error::LoadtestError;
pub use parser::LogParser;
pub use pipeline::{Pipeline, RunSummary, ShutdownHandle};
