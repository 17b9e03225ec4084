//! Browser profile directories.
//!
//! A [`ProfileRoot`] is created once by the process entry point and handed
//! to the fetcher by reference. Each browser session gets its own
//! [`SessionProfile`] underneath it, so concurrent fetches never share a
//! `--user-data-dir`.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::FetchError;

/// Process-wide parent directory for session profiles.
#[derive(Debug)]
pub struct ProfileRoot {
    path: PathBuf,
    // Removed on drop when we created it.
    _temp: Option<TempDir>,
}

impl ProfileRoot {
    /// Create a fresh temporary root, removed when this value is dropped.
    pub fn temporary() -> Result<Self, FetchError> {
        let temp = tempfile::Builder::new().prefix("cdpfetch-").tempdir()?;
        tracing::debug!(path = %temp.path().display(), "created temporary profile root");
        Ok(Self {
            path: temp.path().to_path_buf(),
            _temp: Some(temp),
        })
    }

    /// Use (and create if needed) an existing directory. It is left in place
    /// when this value is dropped.
    pub fn at(path: impl Into<PathBuf>) -> Result<Self, FetchError> {
        let path = path.into();
        std::fs::create_dir_all(&path)?;
        Ok(Self { path, _temp: None })
    }

    /// `at(path)` when configured, otherwise a temporary root.
    pub fn from_config(path: Option<&Path>) -> Result<Self, FetchError> {
        match path {
            Some(p) => Self::at(p),
            None => Self::temporary(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocate a unique profile directory for one session.
    pub fn session_profile(&self) -> Result<SessionProfile, FetchError> {
        let dir = tempfile::Builder::new()
            .prefix("session-")
            .tempdir_in(&self.path)?;
        Ok(SessionProfile { dir })
    }
}

/// Profile directory owned by one browser session; removed on drop.
#[derive(Debug)]
pub struct SessionProfile {
    dir: TempDir,
}

impl SessionProfile {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_root_removed_on_drop() {
        let root = ProfileRoot::temporary().unwrap();
        let path = root.path().to_path_buf();
        assert!(path.is_dir());
        drop(root);
        assert!(!path.exists());
    }

    #[test]
    fn test_session_profiles_are_isolated() {
        let root = ProfileRoot::temporary().unwrap();
        let a = root.session_profile().unwrap();
        let b = root.session_profile().unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().starts_with(root.path()));
        assert!(b.path().starts_with(root.path()));
    }

    #[test]
    fn test_session_profile_removed_on_drop() {
        let root = ProfileRoot::temporary().unwrap();
        let profile = root.session_profile().unwrap();
        let path = profile.path().to_path_buf();
        drop(profile);
        assert!(!path.exists());
        assert!(root.path().exists());
    }

    #[test]
    fn test_configured_root_is_kept() {
        let outer = tempfile::tempdir().unwrap();
        let configured = outer.path().join("profiles");
        let root = ProfileRoot::from_config(Some(&configured)).unwrap();
        assert!(configured.is_dir());
        drop(root);
        assert!(configured.is_dir());
    }
}
