//! Readiness state for optional external dependencies
//!
//! A dependency such as the payment provider may be unconfigured, still
//! starting up, or ready. Callers ask for the value with [`Readiness::require`]
//! and get a typed [`Unavailable`] error instead of a missing-value panic.

use std::fmt;

/// Why a dependency cannot be used right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Unavailable {
    #[error("dependency is not configured")]
    NotConfigured,

    #[error("dependency is still initializing")]
    Initializing,
}

/// Lifecycle of an optional dependency
#[derive(Debug, Clone)]
pub enum Readiness<T> {
    NotConfigured,
    Initializing,
    Ready(T),
}

impl<T> Default for Readiness<T> {
    fn default() -> Self {
        Readiness::NotConfigured
    }
}

impl<T> Readiness<T> {
    pub fn require(&self) -> Result<&T, Unavailable> {
        match self {
            Readiness::Ready(value) => Ok(value),
            Readiness::Initializing => Err(Unavailable::Initializing),
            Readiness::NotConfigured => Err(Unavailable::NotConfigured),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready(_))
    }

    /// Stable name used in health output and logs
    pub fn state_name(&self) -> &'static str {
        match self {
            Readiness::NotConfigured => "not_configured",
            Readiness::Initializing => "initializing",
            Readiness::Ready(_) => "ready",
        }
    }

    /// Build from an optional value: `Some` is ready, `None` is not configured.
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(value) => Readiness::Ready(value),
            None => Readiness::NotConfigured,
        }
    }
}

impl<T> fmt::Display for Readiness<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_not_configured() {
        let state: Readiness<u8> = Readiness::default();
        assert_eq!(state.require(), Err(Unavailable::NotConfigured));
        assert!(!state.is_ready());
        assert_eq!(state.to_string(), "not_configured");
    }

    #[test]
    fn test_initializing_is_distinct_from_unconfigured() {
        let state: Readiness<u8> = Readiness::Initializing;
        assert_eq!(state.require(), Err(Unavailable::Initializing));
        assert_eq!(state.state_name(), "initializing");
    }

    #[test]
    fn test_ready_yields_value() {
        let state = Readiness::Ready("stripe");
        assert_eq!(state.require(), Ok(&"stripe"));
        assert!(state.is_ready());
    }

    #[test]
    fn test_from_option() {
        assert!(Readiness::from_option(Some(1)).is_ready());
        assert!(matches!(
            Readiness::<u8>::from_option(None),
            Readiness::NotConfigured
        ));
    }
}
