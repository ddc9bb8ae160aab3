//! The credential directory and the access levels it hands out.
//!
//! A small directory ships compiled in; `--users` swaps it for a TOML file
//! with a single `[users]` table of `username = "password"` pairs.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

/// Reserved username that authenticates with any password, at the lowest
/// non-rejected level.
pub const ANONYMOUS_USERNAME: &str = "anonymous";

/// What a connected client is allowed to do, ordered by privilege.
///
/// The discriminants are the wire representation used when the client map is
/// replicated to a joining server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccessLevel {
    Unauthenticated = 0,
    Anonymous = 1,
    Authorized = 2,
}

impl AccessLevel {
    pub fn as_wire(self) -> i64 {
        self as i64
    }

    pub fn from_wire(value: i64) -> Option<Self> {
        match value {
            0 => Some(AccessLevel::Unauthenticated),
            1 => Some(AccessLevel::Anonymous),
            2 => Some(AccessLevel::Authorized),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UsersError {
    #[error("reading credential file: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing credential file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("credential file has no [users] table")]
    MissingTable,
}

#[derive(Debug, Deserialize)]
struct RawUserFile {
    users: Option<HashMap<String, String>>,
}

/// Maps (username, password) to an access level.
#[derive(Debug, Clone)]
pub struct UserDirectory {
    users: HashMap<String, String>,
}

impl Default for UserDirectory {
    fn default() -> Self {
        let users = [("sar", "sar"), ("sza", "sza"), ("samuel", "konstantin")]
            .into_iter()
            .map(|(u, p)| (u.to_owned(), p.to_owned()))
            .collect();
        UserDirectory { users }
    }
}

impl UserDirectory {
    pub fn from_toml_file(path: &Path) -> Result<Self, UsersError> {
        let text = std::fs::read_to_string(path)?;
        let raw: RawUserFile = toml::from_str(&text)?;
        let users = raw.users.ok_or(UsersError::MissingTable)?;
        Ok(UserDirectory { users })
    }

    /// Three outcomes: the anonymous user passes with any password, a known
    /// user needs an exact password match, everything else is rejected.
    pub fn check(&self, username: &str, password: &str) -> AccessLevel {
        if username == ANONYMOUS_USERNAME {
            AccessLevel::Anonymous
        } else if self.users.get(username).is_some_and(|p| p == password) {
            AccessLevel::Authorized
        } else {
            AccessLevel::Unauthenticated
        }
    }
}
