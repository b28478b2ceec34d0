use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::Path;
use std::time::SystemTime;
use tasklane_core::{TasklaneError, TasklaneResult};

/// Identity of a file's content at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub len: u64,
    pub modified: Option<SystemTime>,
    /// Hex SHA-256 of the bytes that were read.
    pub sha256: String,
}

/// File bytes together with the fingerprint taken when they were read.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// `None` when the file does not exist.
    pub fingerprint: Option<Fingerprint>,
    pub bytes: Vec<u8>,
}

impl Snapshot {
    /// Read `path`. A missing file yields an empty snapshot, not an error.
    pub fn read(path: &Path) -> TasklaneResult<Self> {
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let fingerprint = Fingerprint {
            len: meta.len(),
            modified: meta.modified().ok(),
            sha256: hex::encode(Sha256::digest(&bytes)),
        };
        Ok(Self {
            fingerprint: Some(fingerprint),
            bytes,
        })
    }

    pub fn exists(&self) -> bool {
        self.fingerprint.is_some()
    }

    /// Fail with [`TasklaneError::ConcurrentModification`] if `path` no longer
    /// matches this snapshot.
    pub fn ensure_unchanged(&self, path: &Path) -> TasklaneResult<()> {
        let now = Self::read(path)?;
        if now.fingerprint != self.fingerprint {
            return Err(TasklaneError::ConcurrentModification(format!(
                "{} changed while it was being imported",
                path.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let snap = Snapshot::read(&dir.path().join("absent.jsonl")).unwrap();
        assert!(!snap.exists());
        assert!(snap.bytes.is_empty());
    }

    #[test]
    fn test_unchanged_file_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.jsonl");
        std::fs::write(&path, "{}\n").unwrap();
        let snap = Snapshot::read(&path).unwrap();
        assert_eq!(snap.fingerprint.as_ref().unwrap().len, 3);
        snap.ensure_unchanged(&path).unwrap();
    }

    #[test]
    fn test_rewritten_file_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.jsonl");
        std::fs::write(&path, "aaa\n").unwrap();
        let snap = Snapshot::read(&path).unwrap();

        // Same length, different content.
        std::fs::write(&path, "bbb\n").unwrap();
        assert!(matches!(
            snap.ensure_unchanged(&path),
            Err(TasklaneError::ConcurrentModification(_))
        ));
    }

    #[test]
    fn test_deleted_file_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.jsonl");
        std::fs::write(&path, "x\n").unwrap();
        let snap = Snapshot::read(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(snap.ensure_unchanged(&path).is_err());
    }
}
