//! Secure script loader.
//!
//! Resolves a [`ScriptRef`] against the storage root and reads it, refusing
//! anything that could escape the root or exceed the size ceiling.

use std::fs;
use std::io::{ErrorKind as IoErrorKind, Read};
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::SecurityError;
use crate::request::ScriptRef;

/// A script read from the store, with the digest of its content.
#[derive(Debug, Clone)]
pub struct LoadedScript {
    pub script_ref: ScriptRef,
    pub path: PathBuf,
    pub content: String,
    pub sha256: String,
}

impl LoadedScript {
    /// Name used in scan reports: the reference, never the host path.
    pub fn display_name(&self) -> &str {
        self.script_ref.as_str()
    }
}

#[derive(Debug, Clone)]
pub struct SecureLoader {
    root: PathBuf,
    max_bytes: u64,
}

impl SecureLoader {
    /// Canonicalizes the root once; fails if it does not exist.
    pub fn new(root: impl AsRef<Path>, max_bytes: u64) -> std::io::Result<Self> {
        let root = fs::canonicalize(root.as_ref())?;
        Ok(Self { root, max_bytes })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn load(&self, script_ref: &ScriptRef) -> Result<LoadedScript, SecurityError> {
        let relative = check_reference(script_ref.as_str())?;

        let candidate = self.root.join(relative);
        let resolved = match fs::canonicalize(&candidate) {
            Ok(path) => path,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Err(SecurityError::NotFound),
            Err(e) => {
                debug!(script_ref = %script_ref, error = %e, "failed to resolve script");
                return Err(SecurityError::Unreadable);
            }
        };
        if !resolved.starts_with(&self.root) {
            warn!(script_ref = %script_ref, "script reference resolves outside the storage root");
            return Err(SecurityError::OutsideRoot);
        }

        let metadata = fs::metadata(&resolved).map_err(|_| SecurityError::Unreadable)?;
        if !metadata.is_file() {
            return Err(SecurityError::NotFound);
        }
        if metadata.len() > self.max_bytes {
            return Err(SecurityError::TooLarge {
                size: metadata.len(),
                limit: self.max_bytes,
            });
        }

        // Read one byte past the limit so growth after the metadata check is caught.
        let file = fs::File::open(&resolved).map_err(|_| SecurityError::Unreadable)?;
        let mut bytes = Vec::with_capacity(metadata.len() as usize);
        file.take(self.max_bytes + 1)
            .read_to_end(&mut bytes)
            .map_err(|_| SecurityError::Unreadable)?;
        if bytes.len() as u64 > self.max_bytes {
            return Err(SecurityError::TooLarge {
                size: bytes.len() as u64,
                limit: self.max_bytes,
            });
        }

        let sha256 = format!("{:x}", Sha256::digest(&bytes));
        let content = String::from_utf8(bytes).map_err(|_| SecurityError::InvalidEncoding)?;

        debug!(script_ref = %script_ref, bytes = content.len(), %sha256, "script loaded");
        Ok(LoadedScript {
            script_ref: script_ref.clone(),
            path: resolved,
            content,
            sha256,
        })
    }
}

/// Lexical checks that run before the filesystem is touched.
pub(crate) fn check_reference(reference: &str) -> Result<&Path, SecurityError> {
    if reference.trim().is_empty() {
        return Err(SecurityError::invalid_reference("reference is empty"));
    }
    if reference.contains('\0') {
        return Err(SecurityError::invalid_reference("reference contains NUL"));
    }
    if reference.starts_with('/') || reference.starts_with('\\') || has_drive_prefix(reference) {
        return Err(SecurityError::invalid_reference("absolute references are not allowed"));
    }
    if reference.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(SecurityError::invalid_reference(
            "parent-directory segments are not allowed",
        ));
    }
    let path = Path::new(reference);
    if path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(SecurityError::invalid_reference("reference is not a relative path"));
    }
    Ok(path)
}

fn has_drive_prefix(reference: &str) -> bool {
    let bytes = reference.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, SecureLoader) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("alice")).unwrap();
        fs::write(dir.path().join("alice/double.py"), "def f(x, p):\n    return x * 2\n").unwrap();
        let loader = SecureLoader::new(dir.path(), 64).unwrap();
        (dir, loader)
    }

    #[test]
    fn loads_script_with_digest() {
        let (_dir, loader) = store();
        let script = loader.load(&ScriptRef::new("alice/double.py")).unwrap();
        assert!(script.content.contains("return x * 2"));
        assert_eq!(script.sha256.len(), 64);
        assert!(script.path.starts_with(loader.root()));
    }

    #[test]
    fn rejects_traversal_and_absolute_references() {
        let (_dir, loader) = store();
        for reference in ["../etc/passwd", "alice/../../x", "/etc/passwd", "\\share\\x", "C:\\x", "a\0b", ""] {
            let err = loader.load(&ScriptRef::new(reference)).unwrap_err();
            assert!(
                matches!(err, SecurityError::InvalidReference { .. }),
                "{reference:?} gave {err:?}"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_out_of_root() {
        let (dir, loader) = store();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret.py"), "x = 1\n").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret.py"), dir.path().join("alice/link.py"))
            .unwrap();
        assert_eq!(
            loader.load(&ScriptRef::new("alice/link.py")).unwrap_err(),
            SecurityError::OutsideRoot
        );
    }

    #[test]
    fn rejects_missing_oversize_and_binary() {
        let (dir, loader) = store();
        assert_eq!(
            loader.load(&ScriptRef::new("alice/none.py")).unwrap_err(),
            SecurityError::NotFound
        );

        fs::write(dir.path().join("alice/big.py"), "x".repeat(65)).unwrap();
        assert!(matches!(
            loader.load(&ScriptRef::new("alice/big.py")).unwrap_err(),
            SecurityError::TooLarge { size: 65, limit: 64 }
        ));

        fs::write(dir.path().join("alice/bin.py"), [0xff, 0xfe, 0x00]).unwrap();
        assert_eq!(
            loader.load(&ScriptRef::new("alice/bin.py")).unwrap_err(),
            SecurityError::InvalidEncoding
        );
    }

    #[test]
    fn directories_are_not_scripts() {
        let (_dir, loader) = store();
        assert_eq!(
            loader.load(&ScriptRef::new("alice")).unwrap_err(),
            SecurityError::NotFound
        );
    }
}
