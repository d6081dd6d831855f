//! Ownership tokens for the persistent/transient handoff.
//!
//! Every tree node in this crate records the [`EditToken`] it was written
//! under. A transient container owns a *live* token; a node may be mutated
//! in place only when its recorded token is the same token the transient
//! owns and that token is still live. Any other combination forces
//! copy-on-write, which is what keeps previously published persistent
//! handles immutable.
//!
//! Converting a transient back to a persistent container freezes the token.
//! Nodes that still carry the frozen token become effectively immutable:
//! no future transient will ever own that token again, so the "same token
//! and live" test can never pass for them.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::ReferenceCounter;

/// Panic message for operations on a transient after it has been converted
/// back to a persistent container.
pub(crate) const USED_AFTER_PERSISTENT: &str = "transient used after persistent conversion";

/// A shared, freezable ownership flag.
///
/// Token identity is pointer identity: two tokens are the same token only
/// if they were cloned from one another. The flag is stored behind the
/// crate's reference counter so that a single `freeze` is observed by every
/// node holding the token.
#[derive(Clone, Debug)]
pub(crate) struct EditToken {
    flag: ReferenceCounter<AtomicBool>,
}

impl EditToken {
    /// Creates a fresh live token for a new transient.
    pub(crate) fn live() -> Self {
        Self {
            flag: ReferenceCounter::new(AtomicBool::new(true)),
        }
    }

    /// Creates a fresh frozen token for a persistent container.
    pub(crate) fn frozen() -> Self {
        Self {
            flag: ReferenceCounter::new(AtomicBool::new(false)),
        }
    }

    /// Returns whether the token is still live.
    pub(crate) fn is_live(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Permanently freezes the token.
    ///
    /// The release store pairs with the acquire load in [`Self::is_live`]
    /// so a reader that observes the frozen flag also observes every node
    /// write that preceded the freeze.
    pub(crate) fn freeze(&self) {
        self.flag.store(false, Ordering::Release);
    }

    /// Returns whether a node carrying `self` may be written in place by
    /// the owner of `owner`.
    pub(crate) fn writable_under(&self, owner: &Self) -> bool {
        ReferenceCounter::ptr_eq(&self.flag, &owner.flag) && owner.is_live()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_live_token_is_writable_under_itself() {
        let token = EditToken::live();
        assert!(token.writable_under(&token));
        assert!(token.clone().writable_under(&token));
    }

    #[rstest]
    fn test_frozen_token_is_never_writable() {
        let token = EditToken::frozen();
        assert!(!token.writable_under(&token));
    }

    #[rstest]
    fn test_distinct_tokens_are_not_writable() {
        let node_token = EditToken::live();
        let owner_token = EditToken::live();
        assert!(!node_token.writable_under(&owner_token));
    }

    #[rstest]
    fn test_freeze_revokes_writability() {
        let token = EditToken::live();
        let node_token = token.clone();
        token.freeze();
        assert!(!token.is_live());
        assert!(!node_token.writable_under(&token));
    }
}
