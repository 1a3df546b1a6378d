//! The `TrackerAdapter` trait: the capability interface over one remote
//! tracker.
//!
//! The GitHub and Jira adapters implement this trait. It is object-safe, so
//! callers hold `Arc<dyn TrackerAdapter>` in the [`super::TrackerRegistry`].

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::error::TrackerError;
use super::types::{ArtifactDraft, IssueDraft, IssueFilter, Lookup, RemoteRecord, TrackerKind};
use crate::hash::FieldSet;
use crate::plan::EntityKind;

/// List, create, update, and find operations against one remote tracker.
///
/// Every failure is normalized to [`TrackerError`]; transport, auth and
/// rate-limit details stay inside the implementation. Adapters never call
/// each other.
#[async_trait]
pub trait TrackerAdapter: Send + Sync {
    fn kind(&self) -> TrackerKind;

    /// The part of `fields` this tracker can store for `kind`.
    ///
    /// The reconciler hashes plan content through this projection, so a
    /// field the tracker has no slot for never reads as drift.
    fn representable_fields(&self, _kind: EntityKind, fields: &FieldSet) -> FieldSet {
        fields.clone()
    }

    /// Lazily page through the tracker's epic and story issues.
    ///
    /// The stream is finite. Each call re-queries current remote state, so a
    /// dropped stream can simply be requested again.
    fn list_issues<'a>(
        &'a self,
        filter: &'a IssueFilter,
    ) -> BoxStream<'a, Result<RemoteRecord, TrackerError>>;

    async fn create_issue(&self, draft: &IssueDraft) -> Result<RemoteRecord, TrackerError>;

    async fn update_issue(
        &self,
        remote_id: &str,
        draft: &IssueDraft,
    ) -> Result<RemoteRecord, TrackerError>;

    /// Find a remote counterpart by key first, then by exact title.
    ///
    /// For sprint and view kinds this searches project artifacts. Returns
    /// [`TrackerError::NotFound`] when nothing matches.
    async fn find_by_title_or_key(&self, lookup: &Lookup) -> Result<RemoteRecord, TrackerError>;

    /// Create the remote counterpart of a sprint or view.
    async fn create_project_artifact(
        &self,
        kind: EntityKind,
        artifact: &ArtifactDraft,
    ) -> Result<RemoteRecord, TrackerError>;

    async fn update_project_artifact(
        &self,
        kind: EntityKind,
        remote_id: &str,
        artifact: &ArtifactDraft,
    ) -> Result<RemoteRecord, TrackerError>;
}

// Compile-time assertion: TrackerAdapter must be object-safe.
// If this line compiles, the trait can be used as `dyn TrackerAdapter`.
const _: () = {
    fn _assert_object_safe(_: &dyn TrackerAdapter) {}
};
