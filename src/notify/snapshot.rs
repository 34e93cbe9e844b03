use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, TimeZone};
use std::path::{Path, PathBuf};

use super::SnapshotStore;

/// Writes snapshots under a root directory.
///
/// Each snapshot lands in `<root>/<YYYY>/<MM>/<DD>/<label>/<HHMMSS>.jpg` (local
/// time of the batch) and is also copied to `<root>/<label>.jpg`, which always
/// holds the most recent snapshot for the label.
#[derive(Clone, Debug)]
pub struct FilesystemSnapshotStore {
    root: PathBuf,
}

impl FilesystemSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create snapshot directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Dated path for a snapshot of `label` taken at `frame_time`.
    pub fn dated_path(&self, label: &str, frame_time: f64) -> Result<PathBuf> {
        let taken = local_time(frame_time)?;
        Ok(self
            .root
            .join(taken.format("%Y").to_string())
            .join(taken.format("%m").to_string())
            .join(taken.format("%d").to_string())
            .join(sanitize_component(label))
            .join(format!("{}.jpg", taken.format("%H%M%S"))))
    }

    pub fn latest_path(&self, label: &str) -> PathBuf {
        self.root.join(format!("{}.jpg", sanitize_component(label)))
    }
}

impl SnapshotStore for FilesystemSnapshotStore {
    fn store(&self, camera: &str, label: &str, snapshot: &[u8], frame_time: f64) -> Result<()> {
        let dated = self.dated_path(label, frame_time)?;
        if let Some(parent) = dated.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        std::fs::write(&dated, snapshot)
            .with_context(|| format!("write snapshot {}", dated.display()))?;

        let latest = self.latest_path(label);
        std::fs::write(&latest, snapshot)
            .with_context(|| format!("write snapshot {}", latest.display()))?;

        log::debug!(
            "stored snapshot camera={} label={} at {}",
            camera,
            label,
            dated.display()
        );
        Ok(())
    }
}

fn local_time(frame_time: f64) -> Result<DateTime<Local>> {
    let secs = frame_time.floor() as i64;
    Local
        .timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| anyhow!("frame_time {} is not a valid local time", frame_time))
}

// Labels come from the tracker; keep them to one path component.
fn sanitize_component(label: &str) -> String {
    label
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_dated_and_latest_copies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FilesystemSnapshotStore::new(dir.path()).unwrap();
        let frame_time = 1_600_000_000.5;

        store.store("front", "person", b"jpeg-1", frame_time).unwrap();

        let dated = store.dated_path("person", frame_time).unwrap();
        assert!(dated.starts_with(dir.path()));
        assert!(dated.to_string_lossy().contains("/person/"));
        assert_eq!(std::fs::read(&dated).unwrap(), b"jpeg-1");
        assert_eq!(std::fs::read(store.latest_path("person")).unwrap(), b"jpeg-1");

        store.store("front", "person", b"jpeg-2", frame_time + 5.0).unwrap();
        assert_eq!(std::fs::read(store.latest_path("person")).unwrap(), b"jpeg-2");
    }

    #[test]
    fn label_cannot_escape_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FilesystemSnapshotStore::new(dir.path()).unwrap();
        assert_eq!(
            store.latest_path("../etc/passwd"),
            dir.path().join("___etc_passwd.jpg")
        );
    }
}
