use std::path::PathBuf;

use chrono::{DateTime, Utc};
use quarry_version::Version;
use thiserror::Error;
use url::Url;

/// A remote repository an item can be fetched from. Only the parts the
/// update-check engine needs: a stable id and the base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRepository {
    pub id: String,
    pub url: Url,
}

impl RemoteRepository {
    pub fn new(id: impl Into<String>, url: Url) -> Self {
        Self { id: id.into(), url }
    }

    /// The URL rendition used in tracking keys; repositories that differ
    /// only in a trailing slash share state.
    pub(crate) fn normalized_url(&self) -> &str {
        self.url.as_str().trim_end_matches('/')
    }
}

/// Distinguishes the two flavors of checked items. Artifacts carry a
/// sidecar file of their own; metadata shares a properties bag per
/// directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckKind {
    Artifact,
    Metadata,
}

/// An item whose freshness can be checked.
pub trait CheckItem {
    /// A stable identity for session deduplication, unique within a
    /// repository.
    fn identity(&self) -> String;

    fn kind(&self) -> CheckKind;
}

/// Artifact coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coordinates {
    pub group: String,
    pub name: String,
    pub version: Version,
}

impl Coordinates {
    pub fn new(group: impl Into<String>, name: impl Into<String>, version: Version) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            version,
        }
    }
}

impl CheckItem for Coordinates {
    fn identity(&self) -> String {
        format!("{}:{}:{}", self.group, self.name, self.version)
    }

    fn kind(&self) -> CheckKind {
        CheckKind::Artifact
    }
}

/// Identity of a repository metadata file, e.g. a version listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataKey {
    pub group: String,
    pub name: String,
    pub file_name: String,
}

impl MetadataKey {
    pub fn new(
        group: impl Into<String>,
        name: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            file_name: file_name.into(),
        }
    }
}

impl CheckItem for MetadataKey {
    fn identity(&self) -> String {
        format!("{}:{}:{}", self.group, self.name, self.file_name)
    }

    fn kind(&self) -> CheckKind {
        CheckKind::Metadata
    }
}

/// A previously observed download outcome, replayable under the session's
/// error-cache policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CachedError {
    /// The remote authoritatively reported the item as missing.
    #[error("not found in {repository}: {message}")]
    NotFound {
        repository: String,
        message: String,
        /// Whether this instance was replayed from cached state rather
        /// than observed on this attempt.
        from_cache: bool,
    },
    /// The transfer failed for another reason (I/O, authorization, ...).
    #[error("transfer from {repository} failed: {message}")]
    Transfer {
        repository: String,
        message: String,
        from_cache: bool,
    },
}

impl CachedError {
    pub fn not_found(repository: impl Into<String>, message: impl Into<String>) -> Self {
        CachedError::NotFound {
            repository: repository.into(),
            message: message.into(),
            from_cache: false,
        }
    }

    pub fn transfer(repository: impl Into<String>, message: impl Into<String>) -> Self {
        CachedError::Transfer {
            repository: repository.into(),
            message: message.into(),
            from_cache: false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CachedError::NotFound { .. })
    }

    pub fn is_from_cache(&self) -> bool {
        match self {
            CachedError::NotFound { from_cache, .. } | CachedError::Transfer { from_cache, .. } => {
                *from_cache
            }
        }
    }

    /// A copy marked as replayed from cache.
    pub(crate) fn replayed(&self) -> Self {
        let mut replay = self.clone();
        match &mut replay {
            CachedError::NotFound { from_cache, .. } | CachedError::Transfer { from_cache, .. } => {
                *from_cache = true;
            }
        }
        replay
    }

    pub(crate) fn message(&self) -> &str {
        match self {
            CachedError::NotFound { message, .. } | CachedError::Transfer { message, .. } => {
                message
            }
        }
    }
}

/// The update-check engine never fails for sidecar I/O; this only reports
/// violated call preconditions.
#[derive(Debug, Error)]
pub enum UpdateCheckError {
    /// The check was submitted without a local file path.
    #[error("update check requires a local file path")]
    PreconditionViolated,
}

/// A single freshness question: "must `item`, cached at `local_file`, be
/// re-fetched from `repository`?". Inputs are filled by the caller
/// ([`UpdateCheck::load_tracking`] pulls `last_updated` and
/// `previous_error` from the sidecar); [`crate::Session::check`] fills the
/// `required`/`error` outputs.
#[derive(Debug, Clone)]
pub struct UpdateCheck<T> {
    pub item: T,
    pub local_file: PathBuf,
    /// The repository the item is attributed to.
    pub authoritative_repository: RemoteRepository,
    /// The repository actually contacted, e.g. a mirror.
    pub repository: RemoteRepository,
    pub policy: crate::UpdatePolicy,
    /// When this repository was last contacted for this item, if known.
    pub last_updated: Option<DateTime<Utc>>,
    /// Whether the bytes at `local_file` passed validation.
    pub file_valid: bool,
    /// The outcome recorded for the previous contact, if it failed.
    pub previous_error: Option<CachedError>,

    // Outputs.
    pub required: bool,
    pub error: Option<CachedError>,
}

impl<T: CheckItem> UpdateCheck<T> {
    pub fn new(item: T, local_file: impl Into<PathBuf>, repository: RemoteRepository) -> Self {
        Self {
            item,
            local_file: local_file.into(),
            authoritative_repository: repository.clone(),
            repository,
            policy: crate::UpdatePolicy::Daily,
            last_updated: None,
            file_valid: true,
            previous_error: None,
            required: false,
            error: None,
        }
    }

    pub fn with_policy(mut self, policy: crate::UpdatePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Fills `last_updated` and `previous_error` from the tracking sidecar.
    /// Unreadable sidecar state reads as "never checked".
    pub fn load_tracking(&mut self) {
        let entry = crate::tracking::read(self);
        self.last_updated = entry.last_updated;
        self.previous_error = entry.error;
    }
}
