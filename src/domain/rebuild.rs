//! Signalling the query-build collaborator that the cohort changed.
//!
//! Rebuilding a backend query is comparatively expensive, so signals are
//! queued and coalesced: only the newest pending signal is delivered, and a
//! signal describing the same query as the last delivered one is dropped.

use std::sync::Arc;

use serde::Serialize;

use crate::domain::{tree::ComposedNode, CohortState, TemporalConstraint};

/// Everything a query builder needs to rebuild the backend query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildSignal {
    /// The revision the signal was raised for.
    pub revision: u64,
    /// Fingerprint of the query-relevant content.
    pub fingerprint: String,
    /// The composed tree.
    pub query: Arc<ComposedNode>,
    /// The temporal constraints.
    pub temporal_constraints: Vec<TemporalConstraint>,
}

impl RebuildSignal {
    /// Captures the query-relevant parts of `state`.
    #[must_use]
    pub fn from_state(state: &CohortState) -> Self {
        Self {
            revision: state.revision(),
            fingerprint: state.fingerprint(),
            query: state.composed(),
            temporal_constraints: state.constraints().to_vec(),
        }
    }
}

/// Consumes rebuild signals.
pub trait QueryBuilder {
    /// The error returned when a rebuild fails.
    type Error;

    /// Rebuilds the backend query from `signal`.
    ///
    /// # Errors
    ///
    /// Implementation defined. A failed rebuild is retried with the next
    /// flush.
    fn rebuild(&mut self, signal: &RebuildSignal) -> Result<(), Self::Error>;
}

/// Coalesces rebuild signals between flushes.
#[derive(Debug, Default)]
pub struct RebuildQueue {
    pending: Option<RebuildSignal>,
    delivered: Option<String>,
}

impl RebuildQueue {
    /// A queue that has already delivered a query with the given fingerprint,
    /// for example in an earlier session.
    #[must_use]
    pub const fn delivered(fingerprint: String) -> Self {
        Self {
            pending: None,
            delivered: Some(fingerprint),
        }
    }

    /// Queues a signal for `state`, replacing any pending one.
    ///
    /// Returns `false` if `state` produces the same query as the last
    /// delivered signal, in which case nothing is queued.
    pub fn notify(&mut self, state: &CohortState) -> bool {
        let signal = RebuildSignal::from_state(state);
        if self.delivered.as_deref() == Some(signal.fingerprint.as_str()) {
            tracing::debug!(
                revision = signal.revision,
                "Query unchanged; dropping rebuild signal"
            );
            self.pending = None;
            return false;
        }
        if let Some(superseded) = self.pending.replace(signal) {
            tracing::trace!(revision = superseded.revision, "Superseded rebuild signal");
        }
        true
    }

    /// Whether a signal is waiting to be delivered.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Delivers the pending signal, if any, and returns its revision.
    ///
    /// # Errors
    ///
    /// Returns the builder's error. The signal stays pending.
    pub fn flush<B: QueryBuilder>(&mut self, builder: &mut B) -> Result<Option<u64>, B::Error> {
        let Some(signal) = self.pending.take() else {
            return Ok(None);
        };
        if let Err(e) = builder.rebuild(&signal) {
            tracing::warn!(revision = signal.revision, "Query rebuild failed");
            self.pending = Some(signal);
            return Err(e);
        }
        tracing::debug!(revision = signal.revision, "Delivered rebuild signal");
        let revision = signal.revision;
        self.delivered = Some(signal.fingerprint);
        Ok(Some(revision))
    }
}

#[cfg(test)]
mod tests {
    use non_empty_string::NonEmptyString;

    use super::*;
    use crate::domain::{LeafDraft, NodeId};

    #[derive(Default)]
    struct Recorder {
        revisions: Vec<u64>,
        fail: bool,
    }

    impl QueryBuilder for Recorder {
        type Error = &'static str;

        fn rebuild(&mut self, signal: &RebuildSignal) -> Result<(), Self::Error> {
            if self.fail {
                return Err("backend unavailable");
            }
            self.revisions.push(signal.revision);
            Ok(())
        }
    }

    fn with_leaf(state: &CohortState, title: &str) -> CohortState {
        let draft = LeafDraft::new(NonEmptyString::new("Condition".to_string()).unwrap())
            .with_title(title);
        state.add_leaf(NodeId::ROOT, draft).unwrap().0
    }

    #[test]
    fn only_latest_signal_is_delivered() {
        let mut queue = RebuildQueue::default();
        let mut builder = Recorder::default();

        let first = with_leaf(&CohortState::default(), "a");
        let second = with_leaf(&first, "b");
        assert!(queue.notify(&first));
        assert!(queue.notify(&second));

        assert_eq!(queue.flush(&mut builder), Ok(Some(second.revision())));
        assert_eq!(builder.revisions, vec![second.revision()]);
        assert_eq!(queue.flush(&mut builder), Ok(None));
    }

    #[test]
    fn unchanged_query_is_not_rebuilt() {
        let mut queue = RebuildQueue::default();
        let mut builder = Recorder::default();

        let state = with_leaf(&CohortState::default(), "a");
        queue.notify(&state);
        queue.flush(&mut builder).unwrap();

        let mut leaf = state.tree().leaf(NodeId::new(1)).unwrap().clone();
        leaf.title = "renamed".to_string();
        let renamed = state.edit_leaf(leaf).unwrap();
        assert!(!queue.notify(&renamed));
        assert!(!queue.is_pending());
    }

    #[test]
    fn failed_rebuild_stays_pending() {
        let mut queue = RebuildQueue::default();
        let mut builder = Recorder {
            fail: true,
            ..Recorder::default()
        };

        let state = with_leaf(&CohortState::default(), "a");
        queue.notify(&state);
        assert!(queue.flush(&mut builder).is_err());
        assert!(queue.is_pending());

        builder.fail = false;
        assert_eq!(queue.flush(&mut builder), Ok(Some(state.revision())));
    }
}
