//! Failure classification
//!
//! Raw provider failures are mapped onto a closed taxonomy of error kinds,
//! each carrying a recovery strategy, a display message and suggested
//! actions.

pub mod classification;
pub mod detector;

pub use classification::{
    ClassifiedError, ErrorKind, FailureSignal, ProviderFailure, RecoveryStrategy,
};
pub use detector::{classify, create_error_summary, ErrorClassifier, ErrorPattern};
