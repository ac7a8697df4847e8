use std::fmt::{Display, Formatter};

/// Error returned when a bucket builder rejects its configuration.
///
/// # Examples
///
/// ```rust
/// use virta::{AsyncTokenBucket, BuildError};
///
/// let err = AsyncTokenBucket::builder().rate(-1).build().unwrap_err();
/// assert_eq!(err, BuildError::InvalidRate(-1));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BuildError {
    /// No rate (or rate supplier) was configured.
    MissingRate,
    /// The configured rate must be positive.
    InvalidRate(i64),
    /// The configured rate period must be positive.
    InvalidRatePeriod(i64),
    /// The configured capacity must be positive.
    InvalidCapacity(i64),
    /// A dynamic-rate factor is out of range.
    InvalidFactor {
        name: &'static str,
        value: f64,
    },
}

impl Display for BuildError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::MissingRate => write!(f, "rate is required but was not configured"),
            BuildError::InvalidRate(rate) => {
                write!(f, "rate must be positive, got {rate}")
            }
            BuildError::InvalidRatePeriod(nanos) => {
                write!(f, "rate period must be positive, got {nanos}ns")
            }
            BuildError::InvalidCapacity(capacity) => {
                write!(f, "capacity must be positive, got {capacity}")
            }
            BuildError::InvalidFactor { name, value } => {
                write!(f, "{name} is out of range: {value}")
            }
        }
    }
}

impl std::error::Error for BuildError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_missing_rate() {
        assert_eq!(
            "rate is required but was not configured",
            BuildError::MissingRate.to_string()
        );
    }

    #[test]
    fn display_invalid_factor() {
        let err = BuildError::InvalidFactor {
            name: "capacity_factor",
            value: -0.5,
        };
        assert_eq!("capacity_factor is out of range: -0.5", err.to_string());
    }
}
