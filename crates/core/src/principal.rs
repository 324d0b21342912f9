//! The authenticated party a snapshot is synced for.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::id::PrincipalId;

/// Marketplace role a principal acts in.
///
/// The role only selects which dashboard the snapshot is fetched for; the
/// backend decides what each role may see.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Contractor,
    Supplier,
    Logistics,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Contractor => "contractor",
            Role::Supplier => "supplier",
            Role::Logistics => "logistics",
        }
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "contractor" => Ok(Role::Contractor),
            "supplier" => Ok(Role::Supplier),
            "logistics" => Ok(Role::Logistics),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// The authenticated actor on whose behalf data is synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    id: PrincipalId,
    role: Role,
}

impl Principal {
    pub fn new(id: PrincipalId, role: Role) -> Self {
        Self { id, role }
    }

    pub fn id(&self) -> PrincipalId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

impl core::fmt::Display for Principal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.role, self.id)
    }
}
