//! Decides when a locally cached artifact or metadata file must be
//! re-fetched.
//!
//! The engine combines four signals: a per-repository [`UpdatePolicy`],
//! the `.lastUpdated` tracking sidecar next to the cached file, a
//! session-scoped deduplication map, and an error-cache policy that can
//! replay previously observed download failures instead of retrying them.
//! It never performs network I/O itself; callers run
//! [`Session::check`] before a fetch and [`Session::touch`] after.

mod check;
mod policy;
mod properties;
mod session;
mod tracking;

pub use check::{
    CachedError, CheckItem, CheckKind, Coordinates, MetadataKey, RemoteRepository, UpdateCheck,
    UpdateCheckError,
};
pub use policy::UpdatePolicy;
pub use session::{ErrorCachePolicy, Session, SessionMode};
pub use tracking::{read, TrackingEntry};
