//! Loader error types

use std::io;

use ne16_format::FormatError;
use serde::Serialize;
use thiserror::Error;

use crate::record::ModuleHandle;
use crate::registry::ModuleState;

/// Errors returned by module loading and lookup
#[derive(Debug, Error)]
pub enum LoadError {
    /// No source could provide the module
    #[error("Module not found: {0}")]
    NotFound(String),

    /// The image could not be decoded
    #[error("Invalid image for {module}: {source}")]
    Format {
        /// Module being loaded
        module: String,
        /// Underlying decode failure
        #[source]
        source: FormatError,
    },

    /// The arena could not hold the module
    #[error("Out of arena memory loading {module} ({requested} bytes)")]
    ResourceExhaustion {
        /// Module being loaded
        module: String,
        /// Size of the failed allocation
        requested: usize,
    },

    /// A referenced module failed to load
    #[error("Module {module} requires {dependency}: {source}")]
    Dependency {
        /// Module whose reference failed
        module: String,
        /// Name of the reference
        dependency: String,
        /// Why the reference failed
        #[source]
        source: Box<LoadError>,
    },

    /// Reading the image failed for a reason other than a short read
    #[error("IO error loading {module}: {source}")]
    Io {
        /// Module being loaded
        module: String,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },

    /// The segment host rejected the module
    #[error("Host failed for {module}: {message}")]
    Host {
        /// Module the host was working on
        module: String,
        /// Host-provided reason
        message: String,
    },

    /// The handle does not name a loaded module
    #[error("Invalid module handle: {0}")]
    InvalidHandle(ModuleHandle),
}

/// Caller-facing classification of a [`LoadError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadErrorKind {
    /// No source for the module
    NotFound,
    /// Corrupt or truncated image
    InvalidFormat,
    /// A flat 32-bit image
    WrongArchitecture,
    /// A linear executable image
    UnsupportedVariant,
    /// Arena exhausted
    ResourceExhaustion,
    /// A dependency failed
    Dependency,
    /// The segment host failed
    Host,
    /// Bad handle
    InvalidHandle,
}

impl LoadError {
    /// Classify the error
    pub fn kind(&self) -> LoadErrorKind {
        match self {
            LoadError::NotFound(_) => LoadErrorKind::NotFound,
            LoadError::Format { source, .. } => match source {
                FormatError::WrongArchitecture => LoadErrorKind::WrongArchitecture,
                FormatError::UnsupportedVariant { .. } => LoadErrorKind::UnsupportedVariant,
                _ => LoadErrorKind::InvalidFormat,
            },
            LoadError::Io { .. } => LoadErrorKind::InvalidFormat,
            LoadError::ResourceExhaustion { .. } => LoadErrorKind::ResourceExhaustion,
            LoadError::Dependency { .. } => LoadErrorKind::Dependency,
            LoadError::Host { .. } => LoadErrorKind::Host,
            LoadError::InvalidHandle(_) => LoadErrorKind::InvalidHandle,
        }
    }

    /// The innermost error of a dependency chain
    pub fn root_cause(&self) -> &LoadError {
        let mut current = self;
        while let LoadError::Dependency { source, .. } = current {
            current = source;
        }
        current
    }

    /// Names along a dependency chain, outermost first
    pub fn dependency_chain(&self) -> Vec<&str> {
        let mut chain = Vec::new();
        let mut current = self;
        while let LoadError::Dependency {
            module,
            dependency,
            source,
        } = current
        {
            if chain.is_empty() {
                chain.push(module.as_str());
            }
            chain.push(dependency.as_str());
            current = source;
        }
        chain
    }
}

/// Errors from entry-point resolution
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntryError {
    /// No bundle assigns the ordinal
    #[error("Ordinal {ordinal} not found")]
    NotFound {
        /// Requested ordinal
        ordinal: u16,
    },

    /// No exported name matches
    #[error("No export named {0}")]
    UnknownName(String),

    /// The module's segments are not loaded yet
    #[error("Module not ready for entry resolution ({0})")]
    NotReady(ModuleState),

    /// The handle does not name a loaded module
    #[error("Invalid module handle: {0}")]
    InvalidHandle(ModuleHandle),
}

/// Result alias for loading
pub type LoadResult<T> = Result<T, LoadError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn missing(name: &str) -> LoadError {
        LoadError::NotFound(name.to_string())
    }

    #[test]
    fn test_kind_mapping() {
        let pe = LoadError::Format {
            module: "X".into(),
            source: FormatError::WrongArchitecture,
        };
        assert_eq!(pe.kind(), LoadErrorKind::WrongArchitecture);

        let truncated = LoadError::Format {
            module: "X".into(),
            source: FormatError::Truncated { offset: 0, len: 2 },
        };
        assert_eq!(truncated.kind(), LoadErrorKind::InvalidFormat);
        assert_eq!(missing("X").kind(), LoadErrorKind::NotFound);
    }

    #[test]
    fn test_dependency_chain() {
        let err = LoadError::Dependency {
            module: "APP".into(),
            dependency: "A".into(),
            source: Box::new(LoadError::Dependency {
                module: "A".into(),
                dependency: "B".into(),
                source: Box::new(missing("B.DLL")),
            }),
        };
        assert_eq!(err.kind(), LoadErrorKind::Dependency);
        assert_eq!(err.dependency_chain(), vec!["APP", "A", "B"]);
        assert_eq!(err.root_cause().kind(), LoadErrorKind::NotFound);
        assert!(err.to_string().contains("requires A"));
    }
}
