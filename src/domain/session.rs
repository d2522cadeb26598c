//! Editing a single criterion while population counts are held back.
//!
//! Counts describe the committed tree. While a criterion form is open the
//! user is changing a leaf that is not committed yet, so counting is
//! suspended for the life of the session and resumed however it ends.

use crate::domain::{
    counts::CountRequests, state::TreeError, CohortState, Leaf, LeafDraft, NodeId, NodeRef,
};

/// What a session will do when committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafTarget {
    /// Add a new leaf under the given group.
    New {
        /// The group the leaf is added to.
        parent: NodeId,
    },
    /// Replace the leaf with the given id.
    Existing(NodeId),
}

/// An open criterion form.
///
/// Dropping the session without committing abandons it.
#[derive(Debug)]
pub struct LeafEditSession<'a> {
    requests: &'a mut CountRequests,
    target: LeafTarget,
}

impl<'a> LeafEditSession<'a> {
    /// Opens a form for a new leaf under `parent`.
    pub fn create(requests: &'a mut CountRequests, parent: NodeId) -> Self {
        requests.suspend();
        Self {
            requests,
            target: LeafTarget::New { parent },
        }
    }

    /// Opens a form for the existing leaf `id`, returning its current content.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` does not exist or is a group. Counts are not
    /// suspended in that case.
    pub fn edit(
        requests: &'a mut CountRequests,
        state: &CohortState,
        id: NodeId,
    ) -> Result<(Self, Leaf), TreeError> {
        let leaf = match state.tree().get(id) {
            Some(NodeRef::Leaf(leaf)) => leaf.clone(),
            Some(NodeRef::Group(_)) => return Err(TreeError::NotALeaf(id)),
            None => return Err(TreeError::NodeNotFound(id)),
        };
        requests.suspend();
        let session = Self {
            requests,
            target: LeafTarget::Existing(id),
        };
        Ok((session, leaf))
    }

    /// What committing this session will do.
    #[must_use]
    pub const fn target(&self) -> LeafTarget {
        self.target
    }

    /// Applies `draft` to `state` and closes the form.
    ///
    /// Returns the new state and the id of the added or edited leaf. Counts
    /// resume whether or not the change is accepted.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the change is rejected.
    pub fn commit(
        self,
        state: &CohortState,
        draft: LeafDraft,
    ) -> Result<(CohortState, NodeId), TreeError> {
        match self.target {
            LeafTarget::New { parent } => state.add_leaf(parent, draft),
            LeafTarget::Existing(id) => state
                .edit_leaf(Leaf::from_draft(id, draft))
                .map(|next| (next, id)),
        }
    }

    /// Closes the form without changing anything.
    pub fn abandon(self) {
        tracing::debug!(form = ?self.target, "Abandoned criterion form");
    }
}

impl Drop for LeafEditSession<'_> {
    fn drop(&mut self) {
        self.requests.resume();
    }
}

#[cfg(test)]
mod tests {
    use non_empty_string::NonEmptyString;

    use super::*;

    fn draft(title: &str) -> LeafDraft {
        LeafDraft::new(NonEmptyString::new("Condition".to_string()).unwrap()).with_title(title)
    }

    #[test]
    fn counts_are_suspended_while_open() {
        let mut requests = CountRequests::default();
        let state = CohortState::default();

        let session = LeafEditSession::create(&mut requests, NodeId::ROOT);
        let (state, id) = session.commit(&state, draft("Diabetes")).unwrap();
        assert!(!requests.is_suspended());
        assert_eq!(state.tree().leaf(id).unwrap().title, "Diabetes");
    }

    #[test]
    fn abandoning_leaves_state_untouched() {
        let mut requests = CountRequests::default();
        let state = CohortState::default();

        let session = LeafEditSession::create(&mut requests, NodeId::ROOT);
        session.abandon();
        assert!(!requests.is_suspended());
        assert_eq!(state.revision(), 0);
        assert!(requests.issue(state.revision()).is_some());
    }

    #[test]
    fn editing_replaces_the_leaf() {
        let mut requests = CountRequests::default();
        let (state, id) = CohortState::default()
            .add_leaf(NodeId::ROOT, draft("Diabetes"))
            .unwrap();

        let (session, current) = LeafEditSession::edit(&mut requests, &state, id).unwrap();
        assert_eq!(session.target(), LeafTarget::Existing(id));
        assert_eq!(current.title, "Diabetes");
        let (state, edited) = session.commit(&state, draft("Type 2 diabetes")).unwrap();
        assert_eq!(edited, id);
        assert_eq!(state.tree().leaf(id).unwrap().title, "Type 2 diabetes");
        assert!(!requests.is_suspended());
    }

    #[test]
    fn rejected_commit_still_resumes() {
        let mut requests = CountRequests::default();
        let state = CohortState::default();

        let session = LeafEditSession::create(&mut requests, NodeId::new(-4));
        let err = session.commit(&state, draft("x")).unwrap_err();
        assert_eq!(err, TreeError::NodeNotFound(NodeId::new(-4)));
        assert!(!requests.is_suspended());
    }

    #[test]
    fn editing_a_group_is_refused() {
        let mut requests = CountRequests::default();
        let state = CohortState::default();
        let err = LeafEditSession::edit(&mut requests, &state, NodeId::ROOT).unwrap_err();
        assert_eq!(err, TreeError::NotALeaf(NodeId::ROOT));
        assert!(!requests.is_suspended());
    }
}
