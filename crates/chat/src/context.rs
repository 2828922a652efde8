//! Knowledge-source selection for the next conversation.
//!
//! Brain mode (the whole corpus) and explicit sources (bookmarks, collections, captures) are
//! mutually exclusive. Explicit sources combine freely with each other.

use std::collections::BTreeSet;

use recall_llm::{ContextSnapshot, IdList, ToggleState};

/// Which kind of selection the draft currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextMode {
    Brain,
    Explicit,
    /// Nothing selected; sending is not allowed.
    Empty,
}

/// Mutable selection edited before a conversation starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextDraft {
    brain_enabled: bool,
    bookmarks_enabled: bool,
    collections: BTreeSet<String>,
    captures: BTreeSet<String>,
}

impl Default for ContextDraft {
    fn default() -> Self {
        Self {
            brain_enabled: true,
            bookmarks_enabled: false,
            collections: BTreeSet::new(),
            captures: BTreeSet::new(),
        }
    }
}

impl ContextDraft {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flips brain mode. Turning it on clears every explicit source.
    pub fn toggle_brain(&mut self) {
        self.brain_enabled = !self.brain_enabled;
        if self.brain_enabled {
            self.clear_explicit();
        }
        tracing::trace!(brain_enabled = self.brain_enabled, "toggled brain mode");
    }

    /// Flips bookmarks. Turning them on leaves brain mode and drops picked collections and
    /// captures.
    pub fn toggle_bookmarks(&mut self) {
        self.bookmarks_enabled = !self.bookmarks_enabled;
        if self.bookmarks_enabled {
            self.brain_enabled = false;
            self.collections.clear();
            self.captures.clear();
        }
    }

    pub fn toggle_collection(&mut self, id: &str) {
        toggle_member(&mut self.collections, id);
        self.brain_enabled = false;
    }

    pub fn toggle_capture(&mut self, id: &str) {
        toggle_member(&mut self.captures, id);
        self.brain_enabled = false;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_brain_active(&self) -> bool {
        self.brain_enabled
    }

    pub fn bookmarks_enabled(&self) -> bool {
        self.bookmarks_enabled
    }

    pub fn collections(&self) -> &BTreeSet<String> {
        &self.collections
    }

    pub fn captures(&self) -> &BTreeSet<String> {
        &self.captures
    }

    pub fn has_explicit_context(&self) -> bool {
        self.bookmarks_enabled || !self.collections.is_empty() || !self.captures.is_empty()
    }

    pub fn can_send(&self) -> bool {
        self.brain_enabled || self.has_explicit_context()
    }

    pub fn mode(&self) -> ContextMode {
        if self.brain_enabled {
            ContextMode::Brain
        } else if self.has_explicit_context() {
            ContextMode::Explicit
        } else {
            ContextMode::Empty
        }
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        build_snapshot(self)
    }

    fn clear_explicit(&mut self) {
        self.bookmarks_enabled = false;
        self.collections.clear();
        self.captures.clear();
    }
}

fn toggle_member(set: &mut BTreeSet<String>, id: &str) {
    if !set.remove(id) {
        set.insert(id.to_string());
    }
}

/// Freezes `draft` into the snapshot a new conversation carries.
///
/// Brain mode wins over any stray explicit state. Id lists come out sorted.
pub fn build_snapshot(draft: &ContextDraft) -> ContextSnapshot {
    if draft.brain_enabled {
        return ContextSnapshot::brain();
    }

    ContextSnapshot {
        brain: ToggleState { enabled: false },
        bookmarks: ToggleState {
            enabled: draft.bookmarks_enabled,
        },
        collections: IdList {
            ids: draft.collections.iter().cloned().collect(),
        },
        captures: IdList {
            ids: draft.captures.iter().cloned().collect(),
        },
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn default_draft_is_brain_mode() {
        let draft = ContextDraft::new();

        assert!(draft.is_brain_active());
        assert!(!draft.has_explicit_context());
        assert!(draft.can_send());
        assert_eq!(draft.mode(), ContextMode::Brain);
    }

    #[test]
    fn picking_a_collection_leaves_brain_mode() {
        let mut draft = ContextDraft::new();
        draft.toggle_collection("c1");

        assert!(!draft.is_brain_active());
        assert!(draft.has_explicit_context());
        assert!(draft.can_send());
        assert_eq!(draft.mode(), ContextMode::Explicit);
        assert_eq!(
            build_snapshot(&draft),
            ContextSnapshot {
                brain: ToggleState { enabled: false },
                bookmarks: ToggleState { enabled: false },
                collections: IdList {
                    ids: vec!["c1".to_string()],
                },
                captures: IdList::default(),
            }
        );
    }

    #[test]
    fn explicit_sources_combine() {
        let mut draft = ContextDraft::new();
        draft.toggle_bookmarks();
        draft.toggle_capture("k2");
        draft.toggle_capture("k1");
        draft.toggle_collection("c1");

        let snapshot = draft.snapshot();
        assert!(snapshot.bookmarks.enabled);
        assert_eq!(snapshot.captures.ids, vec!["k1", "k2"]);
        assert_eq!(snapshot.collections.ids, vec!["c1"]);
    }

    #[test]
    fn enabling_brain_clears_explicit_sources() {
        let mut draft = ContextDraft::new();
        draft.toggle_bookmarks();
        draft.toggle_collection("c1");
        draft.toggle_brain();

        assert!(draft.is_brain_active());
        assert!(!draft.has_explicit_context());
        assert_eq!(draft.snapshot(), ContextSnapshot::brain());
    }

    #[test]
    fn disabling_brain_with_nothing_picked_blocks_sending() {
        let mut draft = ContextDraft::new();
        draft.toggle_brain();

        assert!(!draft.can_send());
        assert_eq!(draft.mode(), ContextMode::Empty);
    }

    #[test]
    fn removing_the_last_source_does_not_restore_brain_mode() {
        let mut draft = ContextDraft::new();
        draft.toggle_capture("k1");
        draft.toggle_capture("k1");

        assert!(!draft.is_brain_active());
        assert!(!draft.can_send());
    }

    #[test]
    fn enabling_bookmarks_drops_picked_sets() {
        let mut draft = ContextDraft::new();
        draft.toggle_collection("c1");
        draft.toggle_bookmarks();

        assert!(draft.bookmarks_enabled());
        assert!(draft.collections().is_empty());
    }

    #[test]
    fn reset_restores_brain_mode() {
        let mut draft = ContextDraft::new();
        draft.toggle_bookmarks();
        draft.toggle_capture("k1");
        draft.reset();

        assert_eq!(draft, ContextDraft::default());
    }

    #[derive(Debug, Clone)]
    enum Toggle {
        Brain,
        Bookmarks,
        Collection(u8),
        Capture(u8),
    }

    fn toggle_strategy() -> impl Strategy<Value = Toggle> {
        prop_oneof![
            Just(Toggle::Brain),
            Just(Toggle::Bookmarks),
            (0u8..4).prop_map(Toggle::Collection),
            (0u8..4).prop_map(Toggle::Capture),
        ]
    }

    fn apply(draft: &mut ContextDraft, toggle: &Toggle) {
        match toggle {
            Toggle::Brain => draft.toggle_brain(),
            Toggle::Bookmarks => draft.toggle_bookmarks(),
            Toggle::Collection(id) => draft.toggle_collection(&format!("c{id}")),
            Toggle::Capture(id) => draft.toggle_capture(&format!("k{id}")),
        }
    }

    proptest! {
        #[test]
        fn brain_mode_never_coexists_with_explicit_sources(
            toggles in proptest::collection::vec(toggle_strategy(), 0..40)
        ) {
            let mut draft = ContextDraft::new();
            for toggle in &toggles {
                apply(&mut draft, toggle);
                prop_assert!(!(draft.is_brain_active() && draft.has_explicit_context()));
            }
        }

        #[test]
        fn toggling_a_source_twice_restores_its_set(
            toggles in proptest::collection::vec(toggle_strategy(), 0..20),
            id in 0u8..4,
        ) {
            let mut draft = ContextDraft::new();
            for toggle in &toggles {
                apply(&mut draft, toggle);
            }
            let collections = draft.collections().clone();
            let captures = draft.captures().clone();

            draft.toggle_collection(&format!("c{id}"));
            draft.toggle_collection(&format!("c{id}"));
            draft.toggle_capture(&format!("k{id}"));
            draft.toggle_capture(&format!("k{id}"));

            prop_assert_eq!(draft.collections(), &collections);
            prop_assert_eq!(draft.captures(), &captures);
            prop_assert!(!draft.is_brain_active());
        }

        #[test]
        fn toggling_brain_twice_restores_the_flag(
            toggles in proptest::collection::vec(toggle_strategy(), 0..20),
        ) {
            let mut draft = ContextDraft::new();
            for toggle in &toggles {
                apply(&mut draft, toggle);
            }
            let brain_enabled = draft.is_brain_active();

            draft.toggle_brain();
            draft.toggle_brain();

            prop_assert_eq!(draft.is_brain_active(), brain_enabled);
            prop_assert!(!(draft.is_brain_active() && draft.has_explicit_context()));
        }

        #[test]
        fn toggling_bookmarks_twice_restores_the_flag(
            toggles in proptest::collection::vec(toggle_strategy(), 0..20),
        ) {
            let mut draft = ContextDraft::new();
            for toggle in &toggles {
                apply(&mut draft, toggle);
            }
            let bookmarks_enabled = draft.bookmarks_enabled();

            draft.toggle_bookmarks();
            draft.toggle_bookmarks();

            prop_assert_eq!(draft.bookmarks_enabled(), bookmarks_enabled);
            prop_assert!(!(draft.is_brain_active() && draft.has_explicit_context()));
        }
    }
}
