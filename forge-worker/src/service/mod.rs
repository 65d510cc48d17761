//! Service layer
//!
//! Wrappers around the external collaborators the pipelines drive. Each one
//! turns a pipeline request into a [`ProcessRun`](crate::process::ProcessRun)
//! and hands it to a [`ProcessRunner`](crate::process::ProcessRunner).
//!
//! Collaborators with heuristics or heavy setup are trait-based so pipelines
//! can be tested without them.

mod bundles;
mod classifier;
mod converter;
mod svg;
mod toy;

// Re-export traits
pub use classifier::LogClassifier;
pub use toy::ToyImporter;

// Re-export implementations
pub use bundles::AssetBundleService;
pub use classifier::SubstringClassifier;
pub use converter::ConverterService;
pub use svg::SvgService;
pub use toy::{MongoToyImporter, ToyImportError};
