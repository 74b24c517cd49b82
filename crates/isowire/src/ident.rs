//! # Identifiers
//!
//! A service contract is named once, at compile time, by an `Identifier`.
//! The identifier carries no behavior; it only tells the engine where a call
//! should go and which method names the contract exposes.

use serde::Deserialize;
use serde::Serialize;

/// The structural side of a service: the context hosting it.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Content,
    Background,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Background => "background",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Names a service contract.
///
/// `role` is optional so that contracts declared without a side still route;
/// callers then fall back to their configured default target.
///
/// ```
/// use isowire::{Identifier, Role};
///
/// const MATH: Identifier = Identifier::new("IMath", Role::Background)
///     .with_methods(&["add", "mul"]);
///
/// assert!(MATH.has_method("add"));
/// assert!(!MATH.has_method("div"));
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identifier {
    pub key: &'static str,
    pub role: Option<Role>,
    pub methods: &'static [&'static str],
}

impl Identifier {
    pub const fn new(key: &'static str, role: Role) -> Self {
        Self { key, role: Some(role), methods: &[] }
    }

    /// An identifier without a declared role.
    pub const fn unrouted(key: &'static str) -> Self {
        Self { key, role: None, methods: &[] }
    }

    pub const fn with_methods(mut self, methods: &'static [&'static str]) -> Self {
        self.methods = methods;
        self
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains(&method)
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.role {
            Some(role) => write!(f, "{}@{}", self.key, role),
            None => f.write_str(self.key),
        }
    }
}

/// The composite key of one reactive stream: `"{key}-{instance_key}"`.
pub fn subject_key(identifier: &Identifier, instance_key: &str) -> String {
    format!("{}-{}", identifier.key, instance_key)
}
