//! Convenience result type alias for CareHub.

use crate::error::AppError;

/// A specialized `Result` type for CareHub operations.
pub type AppResult<T> = Result<T, AppError>;
