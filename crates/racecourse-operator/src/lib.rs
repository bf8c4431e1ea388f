pub mod children;
pub mod conditions;
pub mod config;
pub mod controller;
pub mod crd;
pub mod desired;
pub mod error;
pub mod labels;
pub mod logging;
pub mod mutator;
pub mod store;
pub mod telemetry;
pub mod test_support;

// Re-export commonly used symbols for binaries and tests.
pub use config::OperatorConfig;
pub use controller::{reconcile_racecourse, Context};
pub use crd::{Racecourse, RacecourseSpec, RacecourseStatus, Spec, Status};
pub use error::{Error, Result};
