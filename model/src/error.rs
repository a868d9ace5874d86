//! Errors reported by the data model.

use crate::sql::db::{self, ColumnError};
use snafu::Snafu;
use std::fmt::Display;

/// Errors reported by the data model.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// A record referenced by ID does not exist.
    #[snafu(display("{entity} {id} not found"))]
    NotFound { entity: &'static str, id: i64 },

    /// The input failed validation.
    #[snafu(display("invalid input: {}", problems.join("; ")))]
    Invalid { problems: Vec<String> },

    /// The input conflicts with existing records.
    #[snafu(display("{message}"))]
    Conflict { message: String },

    #[snafu(display("database error: {source}"))]
    Database {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A row read from the database does not have the expected shape.
    #[snafu(display("corrupt record: {message}"))]
    Corrupt { message: String },

    #[snafu(display("attachment storage error: {source}"))]
    Storage { source: std::io::Error },

    #[snafu(display("unable to write report: {source}"))]
    Report { source: csv::Error },
}

/// Result type for the data model.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Convert an error from the database.
    ///
    /// Unique constraint violations become [`Error::Conflict`].
    pub fn db<E: db::Error>(err: E) -> Self {
        if err.is_unique_violation() {
            Self::Conflict {
                message: err.to_string(),
            }
        } else {
            Self::Database {
                source: Box::new(err),
            }
        }
    }

    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn invalid(problem: impl Display) -> Self {
        Self::Invalid {
            problems: vec![problem.to_string()],
        }
    }

    pub fn conflict(message: impl Display) -> Self {
        Self::Conflict {
            message: message.to_string(),
        }
    }
}

impl From<ColumnError> for Error {
    fn from(err: ColumnError) -> Self {
        Self::Corrupt {
            message: err.to_string(),
        }
    }
}

/// Accumulates every problem found while validating an input.
#[derive(Clone, Debug, Default)]
pub struct Problems(Vec<String>);

impl Problems {
    /// Record `problem` unless `ok` holds.
    pub fn check(&mut self, ok: bool, problem: impl FnOnce() -> String) {
        if !ok {
            self.0.push(problem());
        }
    }

    /// Require a non-blank text field.
    pub fn required(&mut self, field: &str, value: &str) {
        self.check(!value.trim().is_empty(), || format!("{field} is required"));
    }

    /// Require a finite number.
    pub fn finite(&mut self, field: &str, value: f64) {
        self.check(value.is_finite(), || format!("{field} must be a finite number"));
    }

    /// Require that an optional lower bound does not exceed an optional upper bound.
    pub fn ordered(&mut self, field: &str, lower: Option<f64>, upper: Option<f64>) {
        if let (Some(lower), Some(upper)) = (lower, upper) {
            self.check(lower <= upper, || {
                format!("{field}: lower limit {lower} exceeds upper limit {upper}")
            });
        }
    }

    pub fn push(&mut self, problem: impl Display) {
        self.0.push(problem.to_string());
    }

    /// Add the problems of a nested input, prefixing each with `context`.
    pub fn extend(&mut self, context: impl Display, other: Problems) {
        self.0
            .extend(other.0.into_iter().map(|p| format!("{context}: {p}")));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fail with [`Error::Invalid`] if any problems were recorded.
    pub fn finish(self) -> Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(Error::Invalid { problems: self.0 })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_problems_collects_everything() {
        let mut problems = Problems::default();
        problems.required("supplier", "  ");
        problems.finite("quantity", f64::NAN);
        problems.ordered("thickness", Some(2.0), Some(1.0));
        problems.ordered("width", None, Some(1.0));
        let Err(Error::Invalid { problems }) = problems.finish() else {
            panic!("expected validation failure");
        };
        assert_eq!(problems.len(), 3);
        assert_eq!(problems[0], "supplier is required");
    }

    #[test]
    fn test_empty_problems() {
        assert!(Problems::default().finish().is_ok());
    }
}
