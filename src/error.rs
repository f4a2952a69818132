//! Error type for template parsing.
//!
//! Every failure surfaces as a [`TemplateError`] carrying a message and
//! 1-based line/column coordinates. The type implements
//! [`miette::Diagnostic`] so embedders can report it through
//! `miette::Report` alongside their other diagnostics.

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T, E = TemplateError> = std::result::Result<T, E>;

/// A fatal template parse error.
///
/// Coordinates are 1-based. They are `None` only when the failure happens
/// at end of input with no token left to anchor to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateError {
    message: String,
    lineno: Option<usize>,
    colno: Option<usize>,
}

impl TemplateError {
    /// Build an error with explicit 1-based coordinates.
    pub fn new(
        message: impl Into<String>,
        lineno: Option<usize>,
        colno: Option<usize>,
    ) -> Self {
        Self {
            message: message.into(),
            lineno,
            colno,
        }
    }

    /// Build an error from the parser's internal 0-based coordinates.
    pub(crate) fn at(message: impl Into<String>, pos: Option<(usize, usize)>) -> Self {
        Self {
            message: message.into(),
            lineno: pos.map(|(l, _)| l + 1),
            colno: pos.map(|(_, c)| c + 1),
        }
    }

    /// The error message, without position information.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 1-based line of the offending token, if known.
    pub fn lineno(&self) -> Option<usize> {
        self.lineno
    }

    /// 1-based column of the offending token, if known.
    pub fn colno(&self) -> Option<usize> {
        self.colno
    }
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let (Some(lineno), Some(colno)) = (self.lineno, self.colno) {
            write!(f, " (line {lineno}, column {colno})")?;
        }
        Ok(())
    }
}

impl std::error::Error for TemplateError {}

impl miette::Diagnostic for TemplateError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinates_are_one_based() {
        let err = TemplateError::at("unexpected token", Some((0, 4)));
        assert_eq!(err.lineno(), Some(1));
        assert_eq!(err.colno(), Some(5));
        assert_eq!(err.to_string(), "unexpected token (line 1, column 5)");
    }

    #[test]
    fn test_missing_position() {
        let err = TemplateError::at("unexpected end of file", None);
        assert_eq!(err.lineno(), None);
        assert_eq!(err.to_string(), "unexpected end of file");
    }
}
