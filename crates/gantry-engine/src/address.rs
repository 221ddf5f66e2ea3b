//! Engine socket address resolution
//!
//! Calls target either the system-wide engine instance (a fixed well-known
//! socket) or the invoking user's own instance (a socket under the runtime
//! directory). Resolution happens on every call so an environment change
//! takes effect immediately; nothing is cached.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;

use gantry_core::prelude::*;

/// Well-known socket path of the system (elevated) engine instance.
pub const SYSTEM_SOCKET: &str = "/run/podman/podman.sock";

/// Per-user socket path, relative to the runtime directory.
const USER_SOCKET_SUFFIX: &str = "podman/podman.sock";

/// Which engine instance a call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// The system-wide engine instance, running elevated.
    System,
    /// The invoking user's own engine instance.
    User,
}

impl Scope {
    /// Resolve the Unix socket path for this scope.
    ///
    /// # Errors
    ///
    /// [`Error::Address`] when the user scope is requested but
    /// `XDG_RUNTIME_DIR` is unset or empty.
    pub fn socket_path(&self) -> Result<PathBuf> {
        resolve_socket_path(*self, std::env::var_os("XDG_RUNTIME_DIR"))
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Scope::System)
    }

    /// Short label used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::System => "system",
            Scope::User => "user",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolution over an explicit runtime-dir value, for testability.
fn resolve_socket_path(scope: Scope, runtime_dir: Option<OsString>) -> Result<PathBuf> {
    match scope {
        Scope::System => Ok(PathBuf::from(SYSTEM_SOCKET)),
        Scope::User => {
            let dir = runtime_dir.filter(|dir| !dir.is_empty()).ok_or_else(|| {
                Error::address("XDG_RUNTIME_DIR is not set; cannot locate the user engine socket")
            })?;
            Ok(PathBuf::from(dir).join(USER_SOCKET_SUFFIX))
        }
    }
}
