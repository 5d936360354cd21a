use std::fmt;

/// Logical role of a fixture inside a fixture set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Network,
    Cache,
    PrimaryStore,
    Broker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Cache => write!(f, "cache"),
            Self::PrimaryStore => write!(f, "primary store"),
            Self::Broker => write!(f, "broker"),
        }
    }
}
