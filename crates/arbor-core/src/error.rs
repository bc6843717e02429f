#![forbid(unsafe_code)]

//! Errors for graph and observation operations.
//!
//! These are synchronous failures at the call site: they indicate a
//! lifecycle bug in the caller (operating on a torn-down node, observing a
//! sealed slot) and must not be ignored. Redundant removal operations —
//! `unlink` and the `unsubscribe` family — never fail.

/// Error returned by graph and observation operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The node has been torn down and accepts no further operations.
    ObjectUnlinked,
    /// The property exists but cannot be intercepted (fixed slot).
    NotObservable,
    /// Attaching would make a node its own (transitive) owner.
    WouldCycle,
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ObjectUnlinked => write!(f, "object has been unlinked"),
            Self::NotObservable => write!(f, "property cannot be intercepted"),
            Self::WouldCycle => write!(f, "attachment would create an ownership cycle"),
        }
    }
}

impl std::error::Error for GraphError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(GraphError::ObjectUnlinked.to_string(), "object has been unlinked");
        assert_eq!(
            GraphError::NotObservable.to_string(),
            "property cannot be intercepted"
        );
        assert_eq!(
            GraphError::WouldCycle.to_string(),
            "attachment would create an ownership cycle"
        );
    }
}
