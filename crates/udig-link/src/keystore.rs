//! On-disk storage of the link key pair.
//!
//! The tunnel name is derived from the public key, so the pair is generated
//! once and reused on every start. The file is JSON with both keys in
//! standard base64:
//!
//! ```json
//! { "public": "...", "private": "..." }
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use udig_common::{IdentityError, KeyPair};

#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("Failed to access key pair file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode key pair file {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid base64 in key pair file {path:?}: {source}")]
    Base64 {
        path: PathBuf,
        #[source]
        source: base64::DecodeError,
    },

    #[error("Invalid key pair in {path:?}: {source}")]
    Identity {
        path: PathBuf,
        #[source]
        source: IdentityError,
    },
}

#[derive(Serialize, Deserialize)]
struct KeyPairFile {
    public: String,
    private: String,
}

/// `{config_dir}/udiglink/keypair.json`
pub fn default_keypair_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("udiglink").join("keypair.json"))
}

/// Load the key pair at `path`, creating and saving a new one if the file
/// does not exist yet.
pub fn ensure_keypair(path: &Path) -> Result<KeyPair, KeystoreError> {
    if path.exists() {
        return load_keypair(path);
    }

    let keys = KeyPair::generate();
    save_keypair(path, &keys)?;
    tracing::info!("Generated new key pair at {}", path.display());
    Ok(keys)
}

pub fn load_keypair(path: &Path) -> Result<KeyPair, KeystoreError> {
    let content = fs::read(path).map_err(|source| KeystoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: KeyPairFile = serde_json::from_slice(&content).map_err(|source| KeystoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let decode = |value: &str| {
        STANDARD.decode(value).map_err(|source| KeystoreError::Base64 {
            path: path.to_path_buf(),
            source,
        })
    };
    let public = decode(&file.public)?;
    let private = decode(&file.private)?;

    KeyPair::from_bytes(&public, &private).map_err(|source| KeystoreError::Identity {
        path: path.to_path_buf(),
        source,
    })
}

pub fn save_keypair(path: &Path, keys: &KeyPair) -> Result<(), KeystoreError> {
    let io_err = |source| KeystoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_private_dir(parent).map_err(io_err)?;
    }

    let file = KeyPairFile {
        public: STANDARD.encode(keys.public_key()),
        private: STANDARD.encode(keys.private_key()),
    };
    let json = serde_json::to_vec_pretty(&file).map_err(|source| KeystoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let mut out = create_private_file(path).map_err(io_err)?;
    out.write_all(&json).map_err(io_err)?;
    out.write_all(b"\n").map_err(io_err)?;
    Ok(())
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn create_private_file(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_private_file(path: &Path) -> std::io::Result<fs::File> {
    fs::File::create(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_creates_then_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("keypair.json");

        let first = ensure_keypair(&path).unwrap();
        assert!(path.exists());

        let second = ensure_keypair(&path).unwrap();
        assert_eq!(first.tunnel_id(), second.tunnel_id());
    }

    #[cfg(unix)]
    #[test]
    fn test_permissions_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let key_dir = dir.path().join("udiglink");
        let path = key_dir.join("keypair.json");
        ensure_keypair(&path).unwrap();

        let dir_mode = fs::metadata(&key_dir).unwrap().permissions().mode() & 0o777;
        let file_mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
        assert_eq!(file_mode, 0o600);
    }

    #[test]
    fn test_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keypair.json");
        let keys = KeyPair::generate();
        save_keypair(&path, &keys).unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        let public = STANDARD.decode(value["public"].as_str().unwrap()).unwrap();
        let private = STANDARD.decode(value["private"].as_str().unwrap()).unwrap();
        assert_eq!(public, keys.public_key());
        assert_eq!(private.len(), 64);
        assert_eq!(&private[32..], &public[..]);
    }

    #[test]
    fn test_mismatched_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keypair.json");
        let file = KeyPairFile {
            public: STANDARD.encode(KeyPair::generate().public_key()),
            private: STANDARD.encode(KeyPair::generate().private_key()),
        };
        fs::write(&path, serde_json::to_vec(&file).unwrap()).unwrap();

        assert!(matches!(
            ensure_keypair(&path),
            Err(KeystoreError::Identity {
                source: IdentityError::KeyMismatch,
                ..
            })
        ));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keypair.json");
        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            ensure_keypair(&path),
            Err(KeystoreError::Json { .. })
        ));

        fs::write(&path, br#"{"public": "!!", "private": "!!"}"#).unwrap();
        assert!(matches!(
            ensure_keypair(&path),
            Err(KeystoreError::Base64 { .. })
        ));
    }
}
