// SCHEDGOV ERROR TAXONOMY
// EVERY FALLIBLE CONFIGURATION OR LIFECYCLE CALL RETURNS anyhow::Result.
// THE CONCRETE CAUSE IS A GovError SO CALLERS CAN downcast_ref AND BRANCH.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GovError {
    // MALFORMED TEXT WRITTEN TO A TUNABLE OR GROUP ATTRIBUTE
    #[error("invalid value {value:?} for {attr}")]
    InvalidValue { attr: String, value: String },
    // WELL-FORMED BUT OUTSIDE THE ACCEPTED RANGE
    #[error("{attr} = {value} out of range [{min}, {max}]")]
    OutOfRange { attr: String, value: i64, min: i64, max: i64 },
    #[error("unknown attribute {0}")]
    UnknownAttr(String),
    // POLICY ALREADY HAS GOVERNOR DATA ATTACHED
    #[error("policy{0} already has a governor attached")]
    Busy(usize),
    // BOOST-GROUP REGISTRY OR SLOT POOL EXHAUSTED
    #[error("no space left: {0}")]
    NoSpace(&'static str),
    // UNKNOWN POLICY, GROUP OR SLOT
    #[error("not found: {0}")]
    NotFound(String),
    // BOOST GROUPS ONLY NEST ONE LEVEL BELOW ROOT
    #[error("nested boost groups are not allowed")]
    Nested,
    #[error("the root boost group cannot be removed")]
    RootGroup,
    #[error("{0} already exists")]
    AlreadyExists(String),
    // BOOST GROUP STILL HAS RUNNABLE TASKS
    #[error("{0} still has runnable tasks")]
    InUse(String),
    // FREQUENCY TABLE EMPTY, OR NO ENTRY INSIDE THE REQUESTED LIMITS
    #[error("no usable frequency table entry")]
    EmptyTable,
    // ON/OFF SWITCH WRITTEN WITH ITS CURRENT STATE
    #[error("switch transition {} -> {} rejected", u8::from(*from), u8::from(*to))]
    InvalidTransition { from: bool, to: bool },
}

// RANGE CHECK HELPER FOR INTEGER ATTRIBUTES
pub(crate) fn check_range(attr: &str, value: i64, min: i64, max: i64) -> Result<(), GovError> {
    if value < min || value > max {
        return Err(GovError::OutOfRange { attr: attr.to_string(), value, min, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_check_bounds_inclusive() {
        assert!(check_range("boost", 0, 0, 100).is_ok());
        assert!(check_range("boost", 100, 0, 100).is_ok());
        assert_eq!(
            check_range("boost", 101, 0, 100),
            Err(GovError::OutOfRange { attr: "boost".into(), value: 101, min: 0, max: 100 })
        );
    }

    #[test]
    fn errors_survive_anyhow() {
        let err: anyhow::Error = GovError::Nested.into();
        assert_eq!(err.downcast_ref::<GovError>(), Some(&GovError::Nested));
        assert!(err.to_string().contains("nested"));
    }

    #[test]
    fn messages_name_the_offender() {
        let e = GovError::OutOfRange { attr: "boost".into(), value: 101, min: 0, max: 100 };
        assert_eq!(e.to_string(), "boost = 101 out of range [0, 100]");
        let e = GovError::InvalidValue { attr: "shaping".into(), value: "turbo".into() };
        assert_eq!(e.to_string(), "invalid value \"turbo\" for shaping");
        let e = GovError::InvalidTransition { from: true, to: true };
        assert_eq!(e.to_string(), "switch transition 1 -> 1 rejected");
    }
}
