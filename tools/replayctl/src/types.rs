use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Redis,
    Sqlite,
}

impl StoreKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Redis => "redis",
            Self::Sqlite => "sqlite",
        }
    }
}

/// Where a resolved value came from. Ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Origin {
    Default,
    File,
    Cli,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setting<T> {
    pub value: T,
    pub origin: Origin,
}

impl<T> Setting<T> {
    pub fn defaulted(value: T) -> Self {
        Self {
            value,
            origin: Origin::Default,
        }
    }

    /// Layers `candidate` over the current value when it comes from an equal
    /// or stronger source.
    pub fn layer(&mut self, candidate: Option<T>, origin: Origin) {
        if let Some(value) = candidate {
            if origin >= self.origin {
                self.value = value;
                self.origin = origin;
            }
        }
    }

    /// Replaces the value only while it is still the built-in default.
    pub fn fill_default(&mut self, value: T) {
        if self.origin == Origin::Default {
            self.value = value;
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

/// Redis connection pieces carried by a `redis://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub addr: String,
    pub db: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeScope {
    pub process_cwd: PathBuf,
    pub repo_root: Option<PathBuf>,
    pub root: PathBuf,
}
