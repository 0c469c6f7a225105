//! The persistent side-channel of the update-check engine: which
//! repositories were contacted when for an item, and with what outcome.
//!
//! Artifacts get a `<file>.lastUpdated` properties sidecar next to the
//! cached file; metadata shares a `resolver-status.properties` bag in its
//! directory. Entries are keyed by repository id and normalized URL so
//! repositories with colliding URLs keep separate state.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use fs4::fs_std::FileExt;

use crate::check::{CachedError, CheckItem, CheckKind, RemoteRepository, UpdateCheck};
use crate::properties;

const NOT_FOUND_CLASS: &str = "NotFoundCached";
const TRANSFER_CLASS: &str = "TransferErrorCached";

/// What the sidecar remembers about one `(repository, item)` pair.
#[derive(Debug, Clone, Default)]
pub struct TrackingEntry {
    /// When the repository was last contacted, if ever.
    pub last_updated: Option<DateTime<Utc>>,
    /// The recorded failure of that contact, if it failed.
    pub error: Option<CachedError>,
}

/// Holds an advisory OS lock on the sidecar for the duration of one read or
/// rewrite. The lock is released when the guard drops, also on panic.
struct LockedFile {
    file: std::fs::File,
}

impl LockedFile {
    fn shared(file: std::fs::File) -> std::io::Result<Self> {
        file.lock_shared()?;
        Ok(Self { file })
    }

    fn exclusive(file: std::fs::File) -> std::io::Result<Self> {
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn sidecar_path<T: CheckItem>(check: &UpdateCheck<T>) -> PathBuf {
    match check.item.kind() {
        CheckKind::Artifact => {
            let mut path = check.local_file.clone().into_os_string();
            path.push(".lastUpdated");
            PathBuf::from(path)
        }
        CheckKind::Metadata => check
            .local_file
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("resolver-status.properties"),
    }
}

fn key_base(repository: &RemoteRepository) -> String {
    format!("{}.{}", repository.id, repository.normalized_url())
}

fn decode_error(repository: &str, value: &str) -> CachedError {
    let (class, message) = match value.split_once(": ") {
        Some((class, message)) => (class, message),
        None => (value, ""),
    };
    if class == NOT_FOUND_CLASS {
        CachedError::not_found(repository, message)
    } else {
        CachedError::transfer(repository, message)
    }
}

fn encode_error(error: &CachedError) -> String {
    let class = if error.is_not_found() {
        NOT_FOUND_CLASS
    } else {
        TRANSFER_CLASS
    };
    if error.message().is_empty() {
        class.to_string()
    } else {
        format!("{class}: {}", error.message())
    }
}

fn read_entries(path: &Path) -> std::io::Result<BTreeMap<String, String>> {
    let file = std::fs::File::open(path)?;
    let mut locked = LockedFile::shared(file)?;
    let mut bytes = Vec::new();
    locked.file.read_to_end(&mut bytes)?;
    Ok(properties::parse(&String::from_utf8_lossy(&bytes)))
}

/// Returns the recorded state for the check's repository. Unreadable or
/// corrupt sidecar state reads as "never checked".
pub fn read<T: CheckItem>(check: &UpdateCheck<T>) -> TrackingEntry {
    let path = sidecar_path(check);
    let entries = match read_entries(&path) {
        Ok(entries) => entries,
        Err(error) => {
            tracing::debug!("no tracking state at {}: {error}", path.display());
            return TrackingEntry::default();
        }
    };

    let base = key_base(&check.repository);
    let last_updated = entries
        .get(&format!("last.updated.{base}"))
        .and_then(|millis| millis.parse::<i64>().ok())
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single());
    let error = entries
        .get(&format!("error.{base}"))
        .map(|value| decode_error(&check.repository.id, value));
    TrackingEntry {
        last_updated,
        error,
    }
}

/// Records the check's outcome under the current wall clock. Entries for
/// other repositories or items in the same sidecar are preserved.
pub(crate) fn touch<T: CheckItem>(
    check: &UpdateCheck<T>,
    now: DateTime<Utc>,
) -> std::io::Result<()> {
    let path = sidecar_path(check);
    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent)?;
    }

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;
    let mut locked = LockedFile::exclusive(file)?;

    let mut bytes = Vec::new();
    locked.file.read_to_end(&mut bytes)?;
    let mut entries = properties::parse(&String::from_utf8_lossy(&bytes));

    let base = key_base(&check.repository);
    entries.insert(
        format!("last.updated.{base}"),
        now.timestamp_millis().to_string(),
    );
    let error_key = format!("error.{base}");
    match &check.error {
        Some(error) => {
            entries.insert(error_key, encode_error(error));
        }
        None => {
            entries.remove(&error_key);
        }
    }

    let rendered = properties::serialize(&entries);
    locked.file.seek(SeekFrom::Start(0))?;
    locked.file.set_len(0)?;
    locked.file.write_all(rendered.as_bytes())
}

#[cfg(test)]
mod test {
    use chrono::{Duration, Utc};
    use url::Url;

    use super::{read, touch};
    use crate::check::{CachedError, Coordinates, MetadataKey, RemoteRepository, UpdateCheck};
    use quarry_version::Version;

    fn repository(id: &str) -> RemoteRepository {
        RemoteRepository::new(id, Url::parse("https://repo.example.org/releases/").unwrap())
    }

    fn artifact_check(dir: &std::path::Path, repository_id: &str) -> UpdateCheck<Coordinates> {
        UpdateCheck::new(
            Coordinates::new("org.example", "demo", Version::new("1.0")),
            dir.join("demo-1.0.jar"),
            repository(repository_id),
        )
    }

    #[test]
    fn read_without_sidecar_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let entry = read(&artifact_check(dir.path(), "central"));
        assert!(entry.last_updated.is_none());
        assert!(entry.error.is_none());
    }

    #[test]
    fn touch_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut check = artifact_check(dir.path(), "central");
        check.error = Some(CachedError::not_found("central", "no such artifact"));

        let before = Utc::now();
        touch(&check, before).unwrap();

        let entry = read(&check);
        let recorded = entry.last_updated.unwrap();
        // the sidecar stores milliseconds
        assert!((recorded - before).abs() < Duration::seconds(1));
        let error = entry.error.unwrap();
        assert!(error.is_not_found());

        let sidecar = dir.path().join("demo-1.0.jar.lastUpdated");
        assert!(sidecar.is_file());
    }

    #[test]
    fn success_clears_a_recorded_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut check = artifact_check(dir.path(), "central");
        check.error = Some(CachedError::transfer("central", "connection reset"));
        touch(&check, Utc::now()).unwrap();
        assert!(read(&check).error.is_some());

        check.error = None;
        touch(&check, Utc::now()).unwrap();
        assert!(read(&check).error.is_none());
    }

    #[test]
    fn repositories_keep_separate_state() {
        let dir = tempfile::tempdir().unwrap();
        let central = artifact_check(dir.path(), "central");
        let mirror = artifact_check(dir.path(), "mirror");

        touch(&central, Utc::now()).unwrap();

        assert!(read(&central).last_updated.is_some());
        assert!(read(&mirror).last_updated.is_none());
    }

    #[test]
    fn unrelated_entries_survive_a_touch() {
        let dir = tempfile::tempdir().unwrap();
        let central = artifact_check(dir.path(), "central");
        let mirror = artifact_check(dir.path(), "mirror");

        touch(&central, Utc::now()).unwrap();
        touch(&mirror, Utc::now()).unwrap();

        assert!(read(&central).last_updated.is_some());
        assert!(read(&mirror).last_updated.is_some());
    }

    #[test]
    fn corrupt_sidecar_reads_as_never_checked() {
        let dir = tempfile::tempdir().unwrap();
        let check = artifact_check(dir.path(), "central");
        std::fs::write(dir.path().join("demo-1.0.jar.lastUpdated"), b"\xff\xfenot properties").unwrap();
        let entry = read(&check);
        assert!(entry.last_updated.is_none());
    }

    #[test]
    fn metadata_shares_a_status_bag() {
        let dir = tempfile::tempdir().unwrap();
        let mut check = UpdateCheck::new(
            MetadataKey::new("org.example", "demo", "versions.properties"),
            dir.path().join("versions.properties"),
            repository("central"),
        );
        check.error = None;
        touch(&check, Utc::now()).unwrap();

        assert!(dir.path().join("resolver-status.properties").is_file());
        assert!(read(&check).last_updated.is_some());
    }
}
