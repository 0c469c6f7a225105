use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;

use crate::check::{CachedError, CheckItem, CheckKind, UpdateCheck, UpdateCheckError};
use crate::{tracking, UpdatePolicy};

/// How the session-scoped deduplication of update checks behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// A `(repository, item)` pair is checked against the remote at most
    /// once per session.
    #[default]
    Enabled,
    /// Every check is evaluated as if it were the first of the session.
    Disabled,
    /// Checks ignore the recorded session state but still record their
    /// outcome for diagnostics.
    Bypass,
}

impl SessionMode {
    /// Parses the configuration string, accepting the legacy boolean
    /// values. Unrecognized input selects the default.
    pub fn from_config_str(value: &str) -> Self {
        match value {
            "enabled" | "true" => SessionMode::Enabled,
            "disabled" | "false" => SessionMode::Disabled,
            "bypass" => SessionMode::Bypass,
            other => {
                tracing::warn!("unknown session mode {other:?}, assuming enabled");
                SessionMode::Enabled
            }
        }
    }
}

/// Which classes of previously recorded download failures are replayed
/// instead of retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCachePolicy {
    pub cache_not_found: bool,
    pub cache_transfer_error: bool,
}

impl Default for ErrorCachePolicy {
    fn default() -> Self {
        Self {
            cache_not_found: true,
            cache_transfer_error: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    repository_id: String,
    url: String,
    identity: String,
    kind: CheckKind,
}

impl SessionKey {
    fn of<T: CheckItem>(check: &UpdateCheck<T>) -> Self {
        Self {
            repository_id: check.repository.id.clone(),
            url: check.repository.normalized_url().to_string(),
            identity: check.item.identity(),
            kind: check.item.kind(),
        }
    }
}

/// One resolution session. Holds the deduplication map and the error-cache
/// policy; the map is only touched under its own mutex and no I/O happens
/// while it is held.
#[derive(Debug, Default)]
pub struct Session {
    mode: SessionMode,
    error_policy: ErrorCachePolicy,
    checked: Mutex<HashMap<SessionKey, Option<CachedError>>>,
}

impl Session {
    pub fn new(mode: SessionMode, error_policy: ErrorCachePolicy) -> Self {
        Self {
            mode,
            error_policy,
            checked: Mutex::default(),
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Decides whether the checked item must be re-fetched, filling
    /// `check.required` and `check.error`. Never fails for I/O; the only
    /// error is a missing local file path, which is a caller bug.
    pub fn check<T: CheckItem>(&self, check: &mut UpdateCheck<T>) -> Result<(), UpdateCheckError> {
        if check.local_file.as_os_str().is_empty() {
            return Err(UpdateCheckError::PreconditionViolated);
        }

        // Session-scoped deduplication comes first: once a pair has been
        // touched this session, the recorded outcome is authoritative.
        if self.mode == SessionMode::Enabled {
            if let Some(recorded) = self.checked.lock().get(&SessionKey::of(check)) {
                check.required = false;
                check.error = recorded.clone();
                return Ok(());
            }
        }

        if !check.local_file.exists() || !check.file_valid {
            if let Some(previous) = &check.previous_error {
                let replay = if previous.is_not_found() {
                    self.error_policy.cache_not_found
                } else {
                    self.error_policy.cache_transfer_error
                };
                if replay {
                    check.required = false;
                    check.error = Some(previous.replayed());
                    return Ok(());
                }
            }

            // With nothing cached the file must be fetched no matter the
            // policy, except that `never` without any recorded contact
            // also forbids the first fetch.
            let never = matches!(check.policy, UpdatePolicy::Never | UpdatePolicy::Unknown);
            check.required = !(never && check.last_updated.is_none());
            check.error = None;
            return Ok(());
        }

        check.required = check.policy.is_stale(check.last_updated, Utc::now());
        check.error = None;
        Ok(())
    }

    /// Records the outcome of a completed check: marks the session key as
    /// touched and persists the tracking sidecar under the current wall
    /// clock. Sidecar I/O failures are logged, never propagated.
    pub fn touch<T: CheckItem>(&self, check: &UpdateCheck<T>) {
        self.checked
            .lock()
            .insert(SessionKey::of(check), check.error.clone());
        if let Err(error) = tracking::touch(check, Utc::now()) {
            tracing::warn!(
                "failed to record update check for {}: {error}",
                check.local_file.display()
            );
        }
    }
}
