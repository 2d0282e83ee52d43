use std::fmt;

use anyhow::anyhow;
use serde::Serialize;

pub type Result<T> = std::result::Result<T, LibError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Conflict,
    Database,
    Forbidden,
    InvalidInput,
    NotFound,
    Unknown,
}

/// Structured context attached to errors that clients may want to act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorDetails {
    DepthExceeded {
        max_depth: usize,
        attempted_depth: usize,
    },
    MissingAbility {
        action: String,
        ability: String,
    },
}

#[derive(Debug)]
pub struct LibError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub public: &'static str,
    pub details: Option<ErrorDetails>,
    pub source: anyhow::Error,
}

impl LibError {
    pub fn database(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Database,
            code: "database_error",
            public,
            details: None,
            source,
        }
    }

    pub fn invalid(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            code: "invalid_input",
            public,
            details: None,
            source,
        }
    }

    pub fn invalid_with_code(
        code: &'static str,
        public: &'static str,
        source: anyhow::Error,
    ) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            code,
            public,
            details: None,
            source,
        }
    }

    pub fn depth_exceeded(max_depth: usize, attempted_depth: usize, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            code: "tree_depth_exceeded",
            public: "Move would exceed the maximum tree depth",
            details: Some(ErrorDetails::DepthExceeded {
                max_depth,
                attempted_depth,
            }),
            source,
        }
    }

    pub fn cycle_rejected(source: anyhow::Error) -> Self {
        Self::invalid_with_code(
            "tree_cycle_rejected",
            "Cannot set parent: would create circular reference in tree structure",
            source,
        )
    }

    pub fn forbidden(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Forbidden,
            code: "forbidden",
            public,
            details: None,
            source,
        }
    }

    pub fn forbidden_with_code(
        code: &'static str,
        public: &'static str,
        source: anyhow::Error,
    ) -> Self {
        Self {
            kind: ErrorKind::Forbidden,
            code,
            public,
            details: None,
            source,
        }
    }

    pub fn unauthorized_action(action: &str, ability: &str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Forbidden,
            code: "unauthorized_action",
            public: "You are not allowed to perform this action",
            details: Some(ErrorDetails::MissingAbility {
                action: action.to_string(),
                ability: ability.to_string(),
            }),
            source,
        }
    }

    pub fn conflict(code: &'static str, public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Conflict,
            code,
            public,
            details: None,
            source,
        }
    }

    pub fn not_found(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            code: "not_found",
            public,
            details: None,
            source,
        }
    }

    pub fn action_not_resolvable(name: &str) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            code: "action_not_resolvable",
            public: "Action not found on tree",
            details: None,
            source: anyhow!("action [{}] not found on tree", name),
        }
    }

    pub fn unknown(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            code: "unknown_error",
            public,
            details: None,
            source,
        }
    }

    pub fn message(public: &'static str) -> Self {
        Self::unknown(public, anyhow!(public))
    }
}

impl fmt::Display for LibError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.public, self.code, self.source)
    }
}

impl std::error::Error for LibError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for LibError {
    fn from(value: sqlx::Error) -> Self {
        Self::database("Database request failed", anyhow!(value))
    }
}
