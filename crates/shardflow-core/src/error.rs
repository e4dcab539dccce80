//! Error types for the Shardflow compiler.
//!
//! All errors surface at compile time; iteration-time operations only relay
//! failures from the external task runtime. Variants carry enough context to
//! report the offending operator kind and shapes.

use thiserror::Error;

/// Specialized Result type for Shardflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Shardflow compilation.
#[derive(Error, Debug)]
pub enum Error {
    /// Structural violation in the graph: invalid shape combination,
    /// missing owner, unsupported operator kind.
    #[error("structural error: {message}")]
    Structural {
        /// Detailed error message
        message: String,
        /// Kind of the offending operator, if known
        operator: Option<String>,
    },

    /// Shape inference or validity failure.
    #[error("shape error: {message}")]
    Shape {
        /// Detailed error message
        message: String,
        /// Expected dimension sizes, if applicable
        expected: Option<Vec<usize>>,
        /// Actual dimension sizes, if applicable
        actual: Option<Vec<usize>>,
    },

    /// Invalid compiler configuration.
    #[error("configuration error: {message}")]
    Config {
        /// Detailed error message
        message: String,
    },

    /// Region or partition construction failure: a partition that should be
    /// disjoint or complete is not, signalling a malformed parallel-dim
    /// descriptor.
    #[error("partition error: {message}")]
    Partition {
        /// Detailed error message
        message: String,
    },

    /// Fusion rewrite produced an inconsistent operator list. Indicates a
    /// bug in the rewrite, not in user input.
    #[error("fusion integrity error: {message}")]
    FusionIntegrity {
        /// Detailed error message
        message: String,
    },

    /// Strategy search failure.
    #[error("search error: {message}")]
    Search {
        /// Detailed error message
        message: String,
    },

    /// Unsupported operation or feature.
    #[error("unsupported: {feature}")]
    Unsupported {
        /// Feature that is not supported
        feature: String,
    },
}

impl Error {
    /// Create a structural error.
    pub fn structural(message: impl Into<String>) -> Self {
        Self::Structural {
            message: message.into(),
            operator: None,
        }
    }

    /// Create a structural error attributed to an operator kind.
    pub fn structural_in(message: impl Into<String>, operator: impl Into<String>) -> Self {
        Self::Structural {
            message: message.into(),
            operator: Some(operator.into()),
        }
    }

    /// Create a shape error.
    pub fn shape(message: impl Into<String>) -> Self {
        Self::Shape {
            message: message.into(),
            expected: None,
            actual: None,
        }
    }

    /// Create a shape mismatch error with expected/actual sizes.
    pub fn shape_mismatch(
        message: impl Into<String>,
        expected: Vec<usize>,
        actual: Vec<usize>,
    ) -> Self {
        Self::Shape {
            message: message.into(),
            expected: Some(expected),
            actual: Some(actual),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a partition error.
    pub fn partition(message: impl Into<String>) -> Self {
        Self::Partition {
            message: message.into(),
        }
    }

    /// Create a fusion integrity error.
    pub fn fusion_integrity(message: impl Into<String>) -> Self {
        Self::FusionIntegrity {
            message: message.into(),
        }
    }

    /// Create a search error.
    pub fn search(message: impl Into<String>) -> Self {
        Self::Search {
            message: message.into(),
        }
    }

    /// Create an unsupported feature error.
    pub fn unsupported(feature: impl Into<String>) -> Self {
        Self::Unsupported {
            feature: feature.into(),
        }
    }

    /// Whether this error indicates a compiler bug rather than bad input.
    pub fn is_internal(&self) -> bool {
        matches!(self, Error::FusionIntegrity { .. } | Error::Partition { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::structural_in("input slot has no owner", "linear");
        assert!(err.to_string().contains("structural"));
        assert!(!err.is_internal());
    }

    #[test]
    fn test_shape_mismatch_context() {
        let err = Error::shape_mismatch("rank mismatch", vec![64, 128], vec![64]);
        match err {
            Error::Shape {
                expected, actual, ..
            } => {
                assert_eq!(expected, Some(vec![64, 128]));
                assert_eq!(actual, Some(vec![64]));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_internal_errors() {
        assert!(Error::fusion_integrity("slot drift").is_internal());
        assert!(Error::partition("not disjoint").is_internal());
        assert!(!Error::config("bad budget").is_internal());
    }
}
