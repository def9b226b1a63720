//! SSH key provisioning for the deploy command.
//!
//! Key material is copied verbatim from the build's stored keypair; nothing is
//! generated or validated here.

use crate::error::CredentialError;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Stored SSH keypair of the build.
#[derive(Clone)]
pub struct KeyMaterial {
    pub private_key: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl KeyMaterial {
    pub fn new(private_key: impl Into<Vec<u8>>, public_key: impl Into<Vec<u8>>) -> Self {
        Self {
            private_key: private_key.into(),
            public_key: public_key.into(),
        }
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("private_key", &format_args!("<{} bytes>", self.private_key.len()))
            .field("public_key", &format_args!("<{} bytes>", self.public_key.len()))
            .finish()
    }
}

/// Where a keypair was written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SshKeyPaths {
    pub private_key: PathBuf,
    pub public_key: PathBuf,
}

impl SshKeyPaths {
    /// Private key at `path`, public key at `<path>.pub`.
    pub fn at(path: &Path) -> Self {
        let mut public: OsString = path.as_os_str().to_owned();
        public.push(".pub");
        Self {
            private_key: path.to_path_buf(),
            public_key: PathBuf::from(public),
        }
    }
}

/// Writes the build's keypair to disk.
pub trait CredentialWriter: Send + Sync {
    /// Write to freshly generated paths.
    fn write_default(&self) -> Result<SshKeyPaths, CredentialError>;

    /// Write the private key to `path` and the public key to `<path>.pub`.
    fn write_at(&self, path: &Path) -> Result<SshKeyPaths, CredentialError>;
}

/// Filesystem-backed [`CredentialWriter`].
///
/// Generated paths look like `<key_dir>/dep_<build_id>_<random>` so concurrent
/// builds never share a key file.
///
/// Returned paths are always absolute. Relative ones are taken from the base
/// dir (the directory `dep` runs in), or the process cwd when none is set, so
/// the cleanup command removes the same files wherever it runs.
#[derive(Debug, Clone)]
pub struct FsCredentialWriter {
    keys: Option<KeyMaterial>,
    key_dir: PathBuf,
    build_id: String,
    base_dir: Option<PathBuf>,
}

impl FsCredentialWriter {
    pub fn new(keys: Option<KeyMaterial>, key_dir: impl Into<PathBuf>, build_id: &str) -> Self {
        Self {
            keys,
            key_dir: key_dir.into(),
            build_id: sanitize(build_id),
            base_dir: None,
        }
    }

    /// Resolve relative key paths against `dir`.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    fn keys(&self) -> Result<&KeyMaterial, CredentialError> {
        self.keys.as_ref().ok_or(CredentialError::NoStoredKeys)
    }
}

impl CredentialWriter for FsCredentialWriter {
    fn write_default(&self) -> Result<SshKeyPaths, CredentialError> {
        let keys = self.keys()?;
        let key_dir = absolute_in(self.base_dir.as_deref(), &self.key_dir)?;

        let mut private = tempfile::Builder::new()
            .prefix(&format!("dep_{}_", self.build_id))
            .rand_bytes(8)
            .tempfile_in(&key_dir)
            .map_err(|source| CredentialError::Io {
                path: key_dir.clone(),
                source,
            })?;

        // Dropping the temp file on error removes it.
        private
            .write_all(&keys.private_key)
            .and_then(|_| private.flush())
            .map_err(|source| CredentialError::Io {
                path: private.path().to_path_buf(),
                source,
            })?;

        let (_, private_path) = private.keep().map_err(|e| CredentialError::Io {
            path: e.file.path().to_path_buf(),
            source: e.error,
        })?;

        let paths = SshKeyPaths::at(&private_path);
        write_public_key(&paths, &keys.public_key, true)?;

        debug!(private_key = %paths.private_key.display(), "Wrote build keypair");
        Ok(paths)
    }

    fn write_at(&self, path: &Path) -> Result<SshKeyPaths, CredentialError> {
        let keys = self.keys()?;
        let paths = SshKeyPaths::at(&absolute_in(self.base_dir.as_deref(), path)?);

        write_key_file(&paths.private_key, &keys.private_key, false)?;
        write_public_key(&paths, &keys.public_key, false)?;

        debug!(private_key = %paths.private_key.display(), "Wrote build keypair");
        Ok(paths)
    }
}

/// [`CredentialWriter`] for plan previews: reports paths, writes nothing.
#[derive(Debug, Clone)]
pub struct PreviewCredentialWriter {
    key_dir: PathBuf,
    build_id: String,
    base_dir: Option<PathBuf>,
}

impl PreviewCredentialWriter {
    pub fn new(key_dir: impl Into<PathBuf>, build_id: &str) -> Self {
        Self {
            key_dir: key_dir.into(),
            build_id: sanitize(build_id),
            base_dir: None,
        }
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }
}

impl CredentialWriter for PreviewCredentialWriter {
    fn write_default(&self) -> Result<SshKeyPaths, CredentialError> {
        let key_dir = absolute_in(self.base_dir.as_deref(), &self.key_dir)?;
        let placeholder = key_dir.join(format!("dep_{}_XXXXXXXX", self.build_id));
        Ok(SshKeyPaths::at(&placeholder))
    }

    fn write_at(&self, path: &Path) -> Result<SshKeyPaths, CredentialError> {
        Ok(SshKeyPaths::at(&absolute_in(self.base_dir.as_deref(), path)?))
    }
}

/// Write the public half of an already written pair; on failure the private
/// key is removed again.
fn write_public_key(
    paths: &SshKeyPaths,
    contents: &[u8],
    create_new: bool,
) -> Result<(), CredentialError> {
    write_key_file(&paths.public_key, contents, create_new).inspect_err(|_| {
        if let Err(e) = std::fs::remove_file(&paths.private_key) {
            warn!(path = %paths.private_key.display(), error = %e, "Could not remove private key");
        }
    })
}

fn absolute_in(base: Option<&Path>, path: &Path) -> Result<PathBuf, CredentialError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let base = match base {
        Some(base) if base.is_absolute() => base.to_path_buf(),
        _ => {
            let cwd = std::env::current_dir().map_err(|source| CredentialError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            match base {
                Some(base) => cwd.join(base),
                None => cwd,
            }
        }
    };
    Ok(base.join(path))
}

fn write_key_file(path: &Path, contents: &[u8], create_new: bool) -> Result<(), CredentialError> {
    let io_err = |source| CredentialError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = open_owner_only(path, create_new).map_err(io_err)?;
    file.write_all(contents).and_then(|_| file.flush()).map_err(io_err)
}

fn open_owner_only(path: &Path, create_new: bool) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true);
    if create_new {
        options.create_new(true);
    } else {
        options.create(true).truncate(true);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let file = options.open(path)?;

    // `mode` only applies on create; tighten files that already existed.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(file)
}

fn sanitize(build_id: &str) -> String {
    let cleaned: String = build_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "build".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer(dir: &Path) -> FsCredentialWriter {
        FsCredentialWriter::new(
            Some(KeyMaterial::new("PRIVATE KEY", "ssh-rsa AAAA test@ci")),
            dir,
            "42",
        )
    }

    #[test]
    fn test_write_default_uses_unique_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = writer(dir.path());

        let first = writer.write_default().expect("first write");
        let second = writer.write_default().expect("second write");
        assert_ne!(first.private_key, second.private_key);

        let name = first.private_key.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("dep_42_"), "unexpected name {}", name);
        assert_eq!(first.public_key, SshKeyPaths::at(&first.private_key).public_key);

        assert_eq!(std::fs::read(&first.private_key).unwrap(), b"PRIVATE KEY");
        assert_eq!(std::fs::read(&first.public_key).unwrap(), b"ssh-rsa AAAA test@ci");
    }

    #[test]
    fn test_write_at_appends_pub_suffix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("id_rsa");

        let paths = writer(dir.path()).write_at(&target).expect("write");
        assert_eq!(paths.private_key, target);
        assert_eq!(paths.public_key, dir.path().join("id_rsa.pub"));
        assert_eq!(std::fs::read(&paths.private_key).unwrap(), b"PRIVATE KEY");
        assert_eq!(std::fs::read(&paths.public_key).unwrap(), b"ssh-rsa AAAA test@ci");
    }

    #[cfg(unix)]
    #[test]
    fn test_key_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let paths = writer(dir.path()).write_at(&dir.path().join("key")).expect("write");
        let mode = std::fs::metadata(&paths.private_key).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_existing_file_is_made_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("id_rsa");
        std::fs::write(&target, "stale").unwrap();
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o644)).unwrap();

        let paths = writer(dir.path()).write_at(&target).expect("write");
        let mode = std::fs::metadata(&paths.private_key).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read(&paths.private_key).unwrap(), b"PRIVATE KEY");
    }

    #[test]
    fn test_public_key_failure_removes_private_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("id_rsa");
        let public = dir.path().join("id_rsa.pub");
        std::fs::create_dir(&public).unwrap();

        let err = writer(dir.path()).write_at(&target).unwrap_err();
        assert!(matches!(err, CredentialError::Io { ref path, .. } if path == &public));
        assert!(!target.exists());
    }

    #[test]
    fn test_public_key_failure_on_generated_pair() {
        // Same rollback write_default relies on, with a blocked `.pub` path.
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = SshKeyPaths::at(&dir.path().join("dep_42_abcdefgh"));
        std::fs::write(&paths.private_key, "PRIVATE KEY").unwrap();
        std::fs::create_dir(&paths.public_key).unwrap();

        assert!(write_public_key(&paths, b"ssh-rsa AAAA", true).is_err());
        assert!(!paths.private_key.exists());
    }

    #[test]
    fn test_relative_paths_resolve_against_base_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = writer(Path::new("keys")).with_base_dir(dir.path());
        std::fs::create_dir(dir.path().join("keys")).unwrap();

        let explicit = writer.write_at(Path::new("id_deploy")).expect("write");
        assert_eq!(explicit.private_key, dir.path().join("id_deploy"));
        assert!(explicit.public_key.is_absolute());
        assert!(explicit.private_key.exists());

        let generated = writer.write_default().expect("write");
        assert!(generated.private_key.starts_with(dir.path().join("keys")));
        assert!(generated.private_key.exists());
    }

    #[test]
    fn test_missing_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = FsCredentialWriter::new(None, dir.path(), "1");
        assert!(matches!(writer.write_default(), Err(CredentialError::NoStoredKeys)));
        assert!(matches!(
            writer.write_at(&dir.path().join("k")),
            Err(CredentialError::NoStoredKeys)
        ));
    }

    #[test]
    fn test_unwritable_location_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("missing-dir").join("id_rsa");
        let err = writer(dir.path()).write_at(&target).unwrap_err();
        assert!(matches!(err, CredentialError::Io { ref path, .. } if path == &target));
    }

    #[test]
    fn test_sanitize_build_id() {
        assert_eq!(sanitize("feature/x 1"), "feature_x_1");
        assert_eq!(sanitize(""), "build");
    }

    #[test]
    fn test_preview_writer_touches_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let preview = PreviewCredentialWriter::new(dir.path(), "9");

        let paths = preview.write_default().expect("preview");
        assert_eq!(paths.private_key, dir.path().join("dep_9_XXXXXXXX"));
        assert!(!paths.private_key.exists());

        let explicit = preview.write_at(&dir.path().join("id_rsa")).expect("preview");
        assert!(!explicit.private_key.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_debug_hides_key_material() {
        let keys = KeyMaterial::new("secret", "public");
        let rendered = format!("{:?}", keys);
        assert!(!rendered.contains("secret"));
    }
}
