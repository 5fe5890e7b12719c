//! Permission registry
//!
//! Static per-service table from operation name to the permissions that
//! authorize it, plus the operations that need no authentication at all.
//! Built once at startup and shared behind an `Arc`; there is no way to
//! change it afterwards.
//!
//! Any single listed permission satisfies an operation. An operation with no
//! entry (or an empty one) is open to every authenticated caller.

pub mod catalog;

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to read permission file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse permission file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid permission table: {0}")]
    Invalid(String),

    #[error("Unknown service: {0}")]
    UnknownService(String),
}

/// What an operation asks of its caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement<'a> {
    /// No token needed
    Public,
    /// Any authenticated caller
    Unrestricted,
    /// Authenticated and holding at least one of these
    AnyOf(&'a BTreeSet<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRegistry {
    service: String,
    requirements: BTreeMap<String, BTreeSet<String>>,
    public: BTreeSet<String>,
}

impl PermissionRegistry {
    pub fn builder(service: impl Into<String>) -> PermissionRegistryBuilder {
        PermissionRegistryBuilder {
            service: service.into(),
            requirements: BTreeMap::new(),
            public: BTreeSet::new(),
        }
    }

    /// Load a table from TOML
    ///
    /// ```toml
    /// service = "AuthService"
    /// public = ["/AuthService/Login"]
    ///
    /// [[operation]]
    /// name = "/AuthService/SwitchOrganization"
    /// permissions = ["switch-organizations"]
    /// ```
    pub fn from_toml(source: &str) -> Result<Self, RegistryError> {
        let file: RegistryFile = toml::from_str(source)?;

        if file.service.trim().is_empty() {
            return Err(RegistryError::Invalid("service name is empty".into()));
        }

        let mut seen = BTreeSet::new();
        let mut builder = Self::builder(file.service);

        for op in file.operation {
            if op.name.trim().is_empty() {
                return Err(RegistryError::Invalid("operation name is empty".into()));
            }
            if !seen.insert(op.name.clone()) {
                return Err(RegistryError::Invalid(format!(
                    "operation {} listed twice",
                    op.name
                )));
            }
            if op.permissions.iter().any(|p| p.trim().is_empty()) {
                return Err(RegistryError::Invalid(format!(
                    "operation {} has an empty permission name",
                    op.name
                )));
            }
            builder = builder.require(op.name, op.permissions);
        }

        for name in file.public {
            if seen.contains(&name) {
                return Err(RegistryError::Invalid(format!(
                    "operation {name} is both public and restricted"
                )));
            }
            builder = builder.public(name);
        }

        Ok(builder.build())
    }

    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml(&source)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn requirement(&self, operation: &str) -> Requirement<'_> {
        if self.public.contains(operation) {
            return Requirement::Public;
        }
        match self.requirements.get(operation) {
            Some(required) if !required.is_empty() => Requirement::AnyOf(required),
            _ => Requirement::Unrestricted,
        }
    }

    pub fn is_public(&self, operation: &str) -> bool {
        self.public.contains(operation)
    }

    /// Restricted operations in name order
    pub fn operations(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.requirements.iter().map(|(op, set)| (op.as_str(), set))
    }

    pub fn public_operations(&self) -> impl Iterator<Item = &str> {
        self.public.iter().map(String::as_str)
    }

    /// Every permission name referenced by the table
    pub fn permission_names(&self) -> BTreeSet<&str> {
        self.requirements
            .values()
            .flatten()
            .map(String::as_str)
            .collect()
    }
}

/// Mutable staging area for a [`PermissionRegistry`]
#[derive(Debug, Clone)]
pub struct PermissionRegistryBuilder {
    service: String,
    requirements: BTreeMap<String, BTreeSet<String>>,
    public: BTreeSet<String>,
}

impl PermissionRegistryBuilder {
    /// Add permissions that authorize `operation`; repeated calls accumulate
    pub fn require<I, S>(mut self, operation: impl Into<String>, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requirements
            .entry(operation.into())
            .or_default()
            .extend(permissions.into_iter().map(Into::into));
        self
    }

    pub fn public(mut self, operation: impl Into<String>) -> Self {
        self.public.insert(operation.into());
        self
    }

    pub fn build(self) -> PermissionRegistry {
        PermissionRegistry {
            service: self.service,
            requirements: self.requirements,
            public: self.public,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    service: String,
    #[serde(default)]
    public: Vec<String>,
    #[serde(default)]
    operation: Vec<OperationEntry>,
}

#[derive(Debug, Deserialize)]
struct OperationEntry {
    name: String,
    #[serde(default)]
    permissions: Vec<String>,
}
