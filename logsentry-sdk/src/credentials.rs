use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Locally stored SDK credentials, provisioned by the onboarding CLI.
///
/// The file lives in the user's home directory with `0600` permissions and is
/// written only by the CLI after a successful device-authorization poll. The
/// SDK reads it when [`init`](crate::init) receives no explicit API key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    /// The provisioned API key.
    pub api_key: String,
    /// Base URL of the ingest server.
    pub dsn: String,
    /// The bound app.
    pub app_id: String,
    /// Name of the bound app.
    pub app_name: String,
}

/// Returns the default credentials path, `~/.logsentry/credentials.json`.
pub fn default_path() -> Option<PathBuf> {
    Some(dirs::home_dir()?.join(".logsentry").join("credentials.json"))
}

impl Credentials {
    /// Loads credentials from the default path.
    ///
    /// Returns `None` when the file is missing or unreadable; a malformed
    /// file is treated the same as a missing one.
    pub fn load() -> Option<Self> {
        Self::load_from(&default_path()?)
    }

    /// Loads credentials from an explicit path.
    pub fn load_from(path: &std::path::Path) -> Option<Self> {
        let contents = fs::read_to_string(path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Writes credentials to the given path with owner-only permissions.
    pub fn save_to(&self, path: &std::path::Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).truncate(true).create(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let file = options.open(path)?;
        serde_json::to_writer_pretty(&file, self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("credentials.json");

        let credentials = Credentials {
            api_key: "sk_0123456789abcdef0123456789abcdef".to_owned(),
            dsn: "http://localhost:8001".to_owned(),
            app_id: "7f8b24ea-4d5e-4a0f-97a3-2a54cf7ab84c".to_owned(),
            app_name: "api".to_owned(),
        };
        credentials.save_to(&path).unwrap();

        assert_eq!(Credentials::load_from(&path), Some(credentials));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_malformed_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(&path, "not json").unwrap();

        assert_eq!(Credentials::load_from(&path), None);
    }
}
