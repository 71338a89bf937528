use thiserror::Error;

use crate::reference::Ref;

#[derive(Debug, Error)]
pub enum Error {
    #[error("atomic predicate {0} is not live")]
    ApNotFound(Ref),

    #[error("predicate set is not contained in port {port} of {element}")]
    ApSetNotFound { element: String, port: String },

    #[error("non-false residual {residual} left after classifying on {element}")]
    NonFalseResidual { element: String, residual: Ref },

    #[error("merge candidate group {0:?} has fewer than two predicates")]
    MergeSingleton(Vec<Ref>),

    #[error("port {port} does not exist on {element}")]
    PortNotFound { element: String, port: String },

    #[error("element {0} not found")]
    ElementNotFound(String),

    #[error("no port holds atomic predicate {0}")]
    NoHoldingPorts(Ref),

    #[error("malformed {what}: {line:?}")]
    Parse { what: &'static str, line: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn parse(what: &'static str, line: impl Into<String>) -> Self {
        Error::Parse {
            what,
            line: line.into(),
        }
    }

    /// The partition or a rule store diverged from its invariants.
    /// The current update must be abandoned.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Error::ApNotFound(_)
                | Error::ApSetNotFound { .. }
                | Error::NonFalseResidual { .. }
                | Error::MergeSingleton(_)
                | Error::PortNotFound { .. }
        )
    }

    /// The input referenced something unknown. A driver may skip the update.
    pub fn is_reference_error(&self) -> bool {
        matches!(
            self,
            Error::ElementNotFound(_) | Error::NoHoldingPorts(_) | Error::Parse { .. }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_taxonomy() {
        assert!(Error::ApNotFound(Ref::positive(3)).is_invariant_violation());
        assert!(!Error::ApNotFound(Ref::positive(3)).is_reference_error());
        assert!(Error::ElementNotFound("r1".into()).is_reference_error());
        assert!(Error::parse("update", "+ bogus").is_reference_error());
        let io = Error::from(std::io::Error::new(std::io::ErrorKind::NotFound, "x"));
        assert!(!io.is_reference_error() && !io.is_invariant_violation());
    }

    #[test]
    fn test_display() {
        let e = Error::PortNotFound {
            element: "r1".into(),
            port: "eth9".into(),
        };
        assert_eq!(e.to_string(), "port eth9 does not exist on r1");
    }
}
