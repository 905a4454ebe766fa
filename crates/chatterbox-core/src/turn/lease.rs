//! Per-chat turn leases.
//!
//! At most one turn may hold a chat's write path at a time. A second turn
//! on the same chat is rejected with [`TurnError::Busy`] instead of being
//! allowed to interleave its messages with the first.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::TurnError;

/// Chats that currently have a turn in flight.
#[derive(Default)]
pub struct ChatLeases {
    active: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for ChatLeases {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.lock().len();
        write!(f, "ChatLeases({count} active)")
    }
}

impl ChatLeases {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the lease for `chat_id`, or fail if another turn holds it.
    pub fn try_acquire(self: &Arc<Self>, chat_id: &str) -> Result<ChatLease, TurnError> {
        if !self.lock().insert(chat_id.to_owned()) {
            return Err(TurnError::Busy(chat_id.to_owned()));
        }
        Ok(ChatLease {
            leases: Arc::clone(self),
            chat_id: chat_id.to_owned(),
        })
    }

    pub fn is_active(&self, chat_id: &str) -> bool {
        self.lock().contains(chat_id)
    }

    // The set is only ever touched by single insert/remove calls, so it is
    // consistent even if a holder panicked.
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held for the lifetime of one turn; released on drop.
#[derive(Debug)]
pub struct ChatLease {
    leases: Arc<ChatLeases>,
    chat_id: String,
}

impl Drop for ChatLease {
    fn drop(&mut self) {
        self.leases.lock().remove(&self.chat_id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn second_lease_on_same_chat_is_busy_until_release() {
        let leases = ChatLeases::new();
        let first = leases.try_acquire("c1").expect("first lease");
        assert!(matches!(leases.try_acquire("c1"), Err(TurnError::Busy(id)) if id == "c1"));
        assert!(leases.is_active("c1"));

        drop(first);
        assert!(!leases.is_active("c1"));
        let _again = leases.try_acquire("c1").expect("lease after release");
    }

    #[test]
    fn different_chats_do_not_contend() {
        let leases = ChatLeases::new();
        let _a = leases.try_acquire("a").unwrap();
        let _b = leases.try_acquire("b").unwrap();
    }

    #[test]
    fn leases_survive_a_panicking_holder() {
        let leases = ChatLeases::new();
        let poisoner = Arc::clone(&leases);
        let joined = std::thread::spawn(move || {
            let _guard = poisoner.active.lock().unwrap();
            panic!("holder died");
        })
        .join();
        assert!(joined.is_err());
        assert!(leases.active.is_poisoned());

        let lease = leases.try_acquire("c1").expect("lease after poison");
        assert!(leases.is_active("c1"));
        assert!(matches!(leases.try_acquire("c1"), Err(TurnError::Busy(_))));
        drop(lease);
        assert!(!leases.is_active("c1"));
        let _again = leases.try_acquire("c1").expect("lease after release");
        assert_eq!(format!("{leases:?}"), "ChatLeases(1 active)");
    }
}
