use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub fn parse(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map(Self)
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

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

// Public identifiers exposed over the API. Every resource also carries an
// internal i64 row id used for joins; internal ids never cross the wire.
define_id!(ProjectId, "Public identifier of a project.");
define_id!(TaskId, "Public identifier of a scheduled task.");
define_id!(ExecutionId, "Public identifier of a single task execution.");
define_id!(NodeId, "Public identifier of a worker node.");
define_id!(UserId, "Public identifier of a user.");
define_id!(
    InstallKeyId,
    "Public identifier of a one-shot worker install key."
);
