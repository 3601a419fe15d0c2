//! Change sessions: the open-PR surface a reconciler drives.
//!
//! A reconciler's output for a path or issue is an open change (pull
//! request) on a conventional head ref. The session capability discovers
//! any existing change and exposes just enough of its state for the
//! refresh decision; the decision logic itself is pure and lives here so
//! every session implementation shares it.

use std::time::Duration;

use async_trait::async_trait;
use shepherd_core::{Action, ReconcileError, Resource};
use thiserror::Error;
use tracing::debug;

/// Change session failures. All retriable: the session fronts the GitHub
/// API.
#[derive(Debug, Error)]
pub enum ChangeError {
    /// The API call failed.
    #[error("change api call failed")]
    Api(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ChangeError {
    /// Wrap an underlying API failure.
    pub fn api(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        ChangeError::Api(err.into())
    }
}

/// Head-ref convention for changes owned by `identity`:
/// `"{identity}/{path|issue-N}"`.
pub fn head_ref_for(identity: &str, resource: &Resource) -> String {
    match resource {
        Resource::Path { path, .. } => format!("{identity}/{path}"),
        Resource::Issue { number, .. } | Resource::PullRequest { number, .. } => {
            format!("{identity}/issue-{number}")
        }
    }
}

/// A failed CI check run on the open change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    /// The check run's name.
    pub check: String,
    /// Its failure summary.
    pub summary: String,
}

/// What the session observed about an existing open change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeState {
    /// Head commit of the change branch.
    pub head_sha: String,
    /// Failed check runs.
    pub findings: Vec<Finding>,
    /// Checks still running.
    pub pending_checks: Vec<String>,
    /// Labels on the change.
    pub labels: Vec<String>,
    /// Merge state; `None` while GitHub is still computing mergeability.
    pub mergeable: Option<bool>,
    /// Fingerprint of the data embedded in the change body, compared
    /// against the desired state to detect drift.
    pub fingerprint: String,
}

/// Why a change needs to be refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    /// No open change exists yet.
    NoChange,
    /// The change no longer merges cleanly.
    MergeConflict,
    /// CI produced findings that a refresh may clear.
    Findings,
    /// The embedded data no longer matches the desired state.
    ContentDrift,
}

/// The pure upsert decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertDecision {
    /// The open change already matches the desired state.
    UpToDate,
    /// Re-create or force-push the change for the given reason.
    Refresh(RefreshReason),
    /// GitHub has not finished computing mergeability; check back later.
    AwaitMergeability,
}

/// Decide whether an observed change needs a refresh against the desired
/// fingerprint.
pub fn upsert_decision(existing: Option<&ChangeState>, desired_fingerprint: &str) -> UpsertDecision {
    let Some(change) = existing else {
        return UpsertDecision::Refresh(RefreshReason::NoChange);
    };
    if change.mergeable.is_none() {
        return UpsertDecision::AwaitMergeability;
    }
    if change.mergeable == Some(false) {
        return UpsertDecision::Refresh(RefreshReason::MergeConflict);
    }
    if !change.findings.is_empty() {
        return UpsertDecision::Refresh(RefreshReason::Findings);
    }
    if change.fingerprint != desired_fingerprint {
        return UpsertDecision::Refresh(RefreshReason::ContentDrift);
    }
    UpsertDecision::UpToDate
}

/// One resource's change surface.
#[async_trait]
pub trait ChangeSession: Send + Sync {
    /// Find the open change on the conventional head ref, if any.
    async fn find_existing(&self) -> Result<Option<ChangeState>, ChangeError>;

    /// Rebuild the change's content and force-push it.
    async fn push_refresh(&self, reason: RefreshReason) -> Result<(), ChangeError>;

    /// Close any outstanding change with `message`.
    async fn close_any_outstanding(&self, message: &str) -> Result<(), ChangeError>;
}

/// Drive one upsert through `session`: observe, decide, refresh if needed.
/// While GitHub is still computing mergeability the resource is
/// rescheduled after `mergeability_poll`.
pub async fn upsert<S: ChangeSession>(
    session: &S,
    desired_fingerprint: &str,
    mergeability_poll: Duration,
) -> Result<Action, ReconcileError> {
    let existing = session.find_existing().await.map_err(ReconcileError::failed)?;
    match upsert_decision(existing.as_ref(), desired_fingerprint) {
        UpsertDecision::UpToDate => Ok(Action::done()),
        UpsertDecision::AwaitMergeability => Ok(Action::requeue_after(mergeability_poll)),
        UpsertDecision::Refresh(reason) => {
            debug!(?reason, "refreshing change");
            session.push_refresh(reason).await.map_err(ReconcileError::failed)?;
            Ok(Action::done())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        head_ref_for, upsert, upsert_decision, ChangeError, ChangeSession, ChangeState, Finding,
        RefreshReason, UpsertDecision,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use shepherd_core::{Action, Resource};
    use std::time::Duration;

    #[test]
    fn head_ref_follows_the_identity_convention() {
        let path: Resource = "path:octo/widgets/main/docs/guide.md".parse().unwrap();
        assert_eq!(head_ref_for("shepherd-bot", &path), "shepherd-bot/docs/guide.md");

        let issue: Resource = "https://github.com/octo/widgets/issues/7".parse().unwrap();
        assert_eq!(head_ref_for("shepherd-bot", &issue), "shepherd-bot/issue-7");
    }

    fn clean_change() -> ChangeState {
        ChangeState {
            head_sha: "abc123".into(),
            mergeable: Some(true),
            fingerprint: "v1".into(),
            ..ChangeState::default()
        }
    }

    #[test]
    fn decision_table() {
        assert_eq!(
            upsert_decision(None, "v1"),
            UpsertDecision::Refresh(RefreshReason::NoChange)
        );

        let mut change = clean_change();
        assert_eq!(upsert_decision(Some(&change), "v1"), UpsertDecision::UpToDate);

        change.mergeable = None;
        assert_eq!(upsert_decision(Some(&change), "v1"), UpsertDecision::AwaitMergeability);

        change.mergeable = Some(false);
        assert_eq!(
            upsert_decision(Some(&change), "v1"),
            UpsertDecision::Refresh(RefreshReason::MergeConflict)
        );

        change = clean_change();
        change.findings.push(Finding {
            check: "ci/test".into(),
            summary: "2 failed".into(),
        });
        assert_eq!(
            upsert_decision(Some(&change), "v1"),
            UpsertDecision::Refresh(RefreshReason::Findings)
        );

        change = clean_change();
        assert_eq!(
            upsert_decision(Some(&change), "v2"),
            UpsertDecision::Refresh(RefreshReason::ContentDrift)
        );
    }

    struct FakeSession {
        existing: Option<ChangeState>,
        refreshed: Mutex<Vec<RefreshReason>>,
    }

    #[async_trait]
    impl ChangeSession for FakeSession {
        async fn find_existing(&self) -> Result<Option<ChangeState>, ChangeError> {
            Ok(self.existing.clone())
        }

        async fn push_refresh(&self, reason: RefreshReason) -> Result<(), ChangeError> {
            self.refreshed.lock().push(reason);
            Ok(())
        }

        async fn close_any_outstanding(&self, _message: &str) -> Result<(), ChangeError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn upsert_refreshes_and_completes() {
        let session = FakeSession {
            existing: None,
            refreshed: Mutex::new(Vec::new()),
        };
        let action = upsert(&session, "v1", Duration::from_secs(30)).await.unwrap();
        assert_eq!(action, Action::Done);
        assert_eq!(session.refreshed.lock().clone(), vec![RefreshReason::NoChange]);
    }

    #[tokio::test]
    async fn upsert_waits_for_mergeability() {
        let mut change = clean_change();
        change.mergeable = None;
        let session = FakeSession {
            existing: Some(change),
            refreshed: Mutex::new(Vec::new()),
        };
        let action = upsert(&session, "v1", Duration::from_secs(30)).await.unwrap();
        assert_eq!(action, Action::RequeueAfter(Duration::from_secs(30)));
        assert!(session.refreshed.lock().is_empty());
    }

    #[tokio::test]
    async fn upsert_leaves_a_clean_change_alone() {
        let session = FakeSession {
            existing: Some(clean_change()),
            refreshed: Mutex::new(Vec::new()),
        };
        let action = upsert(&session, "v1", Duration::from_secs(30)).await.unwrap();
        assert_eq!(action, Action::Done);
        assert!(session.refreshed.lock().is_empty());
    }
}
