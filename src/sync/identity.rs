//! Local user identity.
//!
//! Generated once with a random name and color and cached as JSON on disk, so
//! the same person keeps the same id across sessions. The id is never
//! validated by the relay.

use std::path::Path;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const NAMES: &[&str] = &[
    "Alice", "Bob", "Charlie", "Diana", "Eve", "Frank", "Grace", "Henry", "Ivy", "Jack", "Kate",
    "Leo", "Maya", "Noah", "Olivia", "Peter", "Quinn", "Ruby", "Sam", "Tara", "Uma", "Victor",
    "Wendy", "Xavier",
];

const COLORS: &[&str] = &[
    "#EF4444", // red
    "#F97316", // orange
    "#F59E0B", // amber
    "#84CC16", // lime
    "#22C55E", // green
    "#14B8A6", // teal
    "#06B6D4", // cyan
    "#0EA5E9", // sky
    "#3B82F6", // blue
    "#6366F1", // indigo
    "#8B5CF6", // violet
    "#A855F7", // purple
    "#D946EF", // fuchsia
    "#EC4899", // pink
    "#F43F5E", // rose
];

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Stable identity of the local user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    pub name: String,
    pub color: String,
}

impl UserIdentity {
    /// A fresh identity with a random id, name and color
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let id: String = (&mut rng)
            .sample_iter(rand::distributions::Alphanumeric)
            .take(13)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();

        Self {
            id,
            name: NAMES.choose(&mut rng).copied().unwrap_or("Anonymous").to_string(),
            color: random_color(),
        }
    }

    /// Read the cached identity at `path`, or generate and cache a new one.
    ///
    /// An unreadable or corrupt file is replaced rather than reported.
    pub fn load_or_create(path: &Path) -> Result<Self, IdentityError> {
        match Self::load(path) {
            Ok(identity) => {
                debug!(id = %identity.id, "Loaded user identity");
                return Ok(identity);
            }
            Err(IdentityError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Discarding unreadable identity at {}: {}", path.display(), e),
        }

        let identity = Self::generate();
        identity.store(path)?;
        debug!(id = %identity.id, name = %identity.name, "Created user identity");
        Ok(identity)
    }

    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn store(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Uppercased first letter of the name, for avatars
    pub fn initials(&self) -> String {
        self.name
            .chars()
            .next()
            .map(|c| c.to_uppercase().collect())
            .unwrap_or_default()
    }
}

/// Pick a random color from the presence palette
pub fn random_color() -> String {
    COLORS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("#3B82F6")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generate_uses_palette() {
        let identity = UserIdentity::generate();
        assert_eq!(identity.id.len(), 13);
        assert!(NAMES.contains(&identity.name.as_str()));
        assert!(COLORS.contains(&identity.color.as_str()));
    }

    #[test]
    fn test_load_or_create_is_stable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("user.json");

        let first = UserIdentity::load_or_create(&path).unwrap();
        let second = UserIdentity::load_or_create(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_corrupt_file_is_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("user.json");
        std::fs::write(&path, "{not json").unwrap();

        let identity = UserIdentity::load_or_create(&path).unwrap();
        assert_eq!(UserIdentity::load(&path).unwrap(), identity);
    }

    #[test]
    fn test_initials() {
        let identity = UserIdentity {
            id: "x".into(),
            name: "maya".into(),
            color: "#000000".into(),
        };
        assert_eq!(identity.initials(), "M");
    }
}
