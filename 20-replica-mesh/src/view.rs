//! Membership view: the set of replicas a process knows about.
//!
//! The view only grows. There is no leave protocol, so once a replica is
//! learned it stays for the lifetime of the process. The coordinator is
//! never stored: it is derived from the member set on every lookup, which
//! keeps it correct as the view grows.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::identity::{PeerId, PeerIdentity, PublicKey};

#[derive(Debug, Clone, Default)]
pub struct MembershipView {
    members: BTreeMap<PeerId, PeerIdentity>,
}

impl MembershipView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_members(members: impl IntoIterator<Item = PeerIdentity>) -> Self {
        let mut view = Self::new();
        for member in members {
            view.add_member(member);
        }
        view
    }

    /// Appends `peer` if its id is unknown. Returns `true` when the view changed.
    ///
    /// Re-adding a known id is a no-op, even if the new entry carries a
    /// different address; the first registration wins.
    pub fn add_member(&mut self, peer: PeerIdentity) -> bool {
        if self.members.contains_key(&peer.id) {
            return false;
        }
        self.members.insert(peer.id, peer);
        true
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerIdentity> {
        self.members.get(&id)
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.members.contains_key(&id)
    }

    /// Lowest known id. Before any join this is the lowest id of the
    /// bootstrap file; an empty view has no coordinator.
    pub fn coordinator_id(&self) -> Option<PeerId> {
        self.members.keys().next().copied()
    }

    pub fn coordinator(&self) -> Option<&PeerIdentity> {
        self.coordinator_id().and_then(|id| self.get(id))
    }

    pub fn members(&self) -> impl Iterator<Item = &PeerIdentity> {
        self.members.values()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.members.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Fills in a missing public key for a known member.
    ///
    /// Keys are resolved from local trust storage after the view is loaded,
    /// so this is the only in-place edit an entry ever sees.
    pub fn resolve_public_key(&mut self, id: PeerId, key: PublicKey) {
        if let Some(member) = self.members.get_mut(&id) {
            member.public_key.get_or_insert(key);
        }
    }
}

/// Process-wide handle to the view.
///
/// The dispatch loop is the only writer; listeners and the connection
/// manager read from other tasks, so access goes through a lock that is
/// never held across an await point or a network call.
#[derive(Debug, Clone, Default)]
pub struct SharedView {
    inner: Arc<RwLock<MembershipView>>,
}

impl SharedView {
    pub fn new(view: MembershipView) -> Self {
        Self {
            inner: Arc::new(RwLock::new(view)),
        }
    }

    /// Runs `f` against the current view under a read lock.
    pub fn read<R>(&self, f: impl FnOnce(&MembershipView) -> R) -> R {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    pub fn snapshot(&self) -> MembershipView {
        self.read(MembershipView::clone)
    }

    pub fn get(&self, id: PeerId) -> Option<PeerIdentity> {
        self.read(|view| view.get(id).cloned())
    }

    pub fn coordinator_id(&self) -> Option<PeerId> {
        self.read(MembershipView::coordinator_id)
    }

    pub fn add_member(&self, peer: PeerIdentity) -> bool {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard.add_member(peer)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn peer(id: PeerId) -> PeerIdentity {
        PeerIdentity::new(id, "127.0.0.1", 7000 + id as u16)
    }

    #[test]
    fn add_member_is_idempotent() {
        let mut view = MembershipView::from_members([peer(1), peer(2)]);

        assert!(view.add_member(peer(3)));
        let after_first = view.ids();

        let mut moved = peer(3);
        moved.port = 9999;
        assert!(!view.add_member(moved));

        assert_eq!(view.ids(), after_first);
        assert_eq!(view.len(), 3);
        assert_eq!(view.get(3).map(|p| p.port), Some(7003));
    }

    #[test]
    fn coordinator_follows_lowest_id() {
        let mut view = MembershipView::from_members([peer(4), peer(2)]);
        assert_eq!(view.coordinator_id(), Some(2));

        view.add_member(peer(1));
        assert_eq!(view.coordinator_id(), Some(1));
        assert_eq!(view.coordinator().map(|p| p.id), Some(1));
    }

    #[test]
    fn empty_view_has_no_coordinator() {
        let view = MembershipView::new();
        assert_eq!(view.coordinator_id(), None);
        assert!(view.coordinator().is_none());
    }

    #[test]
    fn resolve_public_key_does_not_overwrite() {
        let mut view = MembershipView::from_members([peer(1)]);
        view.resolve_public_key(1, PublicKey::from_bytes([1; 32]));
        view.resolve_public_key(1, PublicKey::from_bytes([2; 32]));
        view.resolve_public_key(9, PublicKey::from_bytes([9; 32]));

        assert_eq!(
            view.get(1).and_then(|p| p.public_key),
            Some(PublicKey::from_bytes([1; 32]))
        );
        assert!(!view.contains(9));
    }

    #[test]
    fn shared_view_writes_are_visible_to_clones() {
        let shared = SharedView::new(MembershipView::from_members([peer(2)]));
        let reader = shared.clone();

        assert!(shared.add_member(peer(1)));
        assert_eq!(reader.coordinator_id(), Some(1));
        assert_eq!(reader.snapshot().len(), 2);
    }

    proptest! {
        #[test]
        fn coordinator_is_min_of_members(ids in proptest::collection::vec(any::<u32>(), 1..32)) {
            let view = MembershipView::from_members(ids.iter().map(|&id| PeerIdentity::new(id, "h", 1)));
            prop_assert_eq!(view.coordinator_id(), ids.iter().min().copied());
        }

        #[test]
        fn re_adding_leaves_view_unchanged(ids in proptest::collection::vec(0u32..64, 1..32)) {
            let mut view = MembershipView::from_members(ids.iter().map(|&id| PeerIdentity::new(id, "h", 1)));
            let before = view.ids();
            for &id in &ids {
                prop_assert!(!view.add_member(PeerIdentity::new(id, "other", 2)));
            }
            prop_assert_eq!(view.ids(), before);
        }
    }
}
