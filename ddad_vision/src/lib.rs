// THEORY:
// This file is the main entry point for the `ddad_vision` library crate.
// It exports the `InspectionPipeline` and its configuration and report types as the
// high-level interface of the engine: fit on normal images, adapt to the target
// domain, then score test images into anomaly maps and decisions.
//
// Key architectural principles:
// 1.  **One front door**: consumers such as `ddad_tester` go through `pipeline` and
//     `config`. The `core_modules` stay public for tests and custom predictors, but
//     nothing requires touching them directly.
// 2.  **Shared read, exclusive write**: fitting and adaptation take `&mut` on the
//     pipeline; scoring takes `&self` and runs in parallel.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use config::InspectConfig;
pub use error::{InspectError, Result};
pub use parallel_pipeline::{DecodeSettings, LoaderPool};
pub use pipeline::{EvaluationReport, FitSummary, InspectionPipeline, SampleOutcome};
