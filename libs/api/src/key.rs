//! Work-queue keys.

use std::fmt;

/// The resource kinds the controller reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Pool,
    BatchSandbox,
}

impl ResourceKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pool => "Pool",
            ResourceKind::BatchSandbox => "BatchSandbox",
        }
    }

    /// Parse the value stored in the owner-kind label.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pool" => Some(ResourceKind::Pool),
            "BatchSandbox" => Some(ResourceKind::BatchSandbox),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a reconciled object: kind plus namespace/name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn pool(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(ResourceKind::Pool, namespace, name)
    }

    pub fn batch_sandbox(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(ResourceKind::BatchSandbox, namespace, name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.kind, self.namespace, self.name)
    }
}
