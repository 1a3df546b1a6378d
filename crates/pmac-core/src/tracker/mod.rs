//! Tracker adapters for the remote systems a plan is synced to.
//!
//! # Architecture
//!
//! ```text
//! Reconciler / Executor
//!     |
//!     v
//! TrackerRegistry --get(TrackerKind::GitHub)--> Arc<dyn TrackerAdapter>
//!                                                   |
//!     list_issues / find_by_title_or_key            |
//!     create_issue / update_issue                   |
//!     create_project_artifact / update_..._artifact |
//!                                                   v
//!                                        dyn Transport (reqwest or scripted)
//! ```

pub mod error;
pub mod github;
pub mod jira;
pub mod registry;
pub mod trait_def;
pub mod transport;
pub mod types;

pub use error::{ErrorKind, TrackerError};
pub use github::{GitHubAdapter, GitHubConfig};
pub use jira::{JiraAdapter, JiraConfig};
pub use registry::TrackerRegistry;
pub use trait_def::TrackerAdapter;
pub use transport::{Credentials, HttpTransport, Method, Request, Transport, TransportError};
pub use types::{
    ArtifactDraft, IssueDraft, IssueFilter, Lookup, ParentLink, RemoteRecord, TrackerKind,
};
