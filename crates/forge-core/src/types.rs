//! Identifiers and small shared records
//!
//! All ids are ULIDs so they sort by creation time in logs and stores.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            /// Generate a new id
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(s).map(Self)
            }
        }
    };
}

ulid_id!(
    /// Build session identifier
    SessionId
);
ulid_id!(
    /// Intent contract identifier
    ContractId
);
ulid_id!(
    /// Component identifier
    ComponentId
);
ulid_id!(
    /// Generation agent identifier
    AgentId
);
ulid_id!(
    /// Generation attempt identifier
    AttemptId
);
ulid_id!(
    /// Verification result identifier
    ResultId
);
ulid_id!(
    /// Escalation record identifier
    EscalationId
);

/// Success criterion identifier (`C1`, `C2`, ... in contract order)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CriterionId(pub String);

impl CriterionId {
    /// Id for the criterion at zero-based `index`
    #[must_use]
    pub fn nth(index: usize) -> Self {
        Self(format!("C{}", index + 1))
    }

    /// As string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CriterionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CriterionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_strings() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-ulid".parse::<SessionId>().is_err());
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = ComponentId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }

    #[test]
    fn criterion_ids_follow_order() {
        assert_eq!(CriterionId::nth(0).as_str(), "C1");
        assert_eq!(CriterionId::nth(4).to_string(), "C5");
    }
}
