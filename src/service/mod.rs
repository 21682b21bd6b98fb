//! Service layer module

pub mod backends;
pub mod insight_service;
pub mod keywords;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use backends::{Captioner, FaceAnalyzer, OpenVinoFaceAnalyzer, OpenVinoTextReader, TextReader};
pub use insight_service::{Backends, InsightService, ServiceError};
pub use types::*;
