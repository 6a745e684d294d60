//! Ending conversations outside the owning request
//!
//! Expired conversations are swept lazily; there is no background thread. A
//! conversation whose lock is held is in use and never reaped.

use super::record::{ConversationRegistry, ManagedConversation};
use crate::context::destroy_all;
use scoped_store::{BoundBeanStore, EagerSessionBeanStore, LockStore, SessionHost};
use std::sync::Arc;
use std::time::Duration;

/// End a conversation and destroy its instances
///
/// The caller holds the conversation's lock, or the session is dying.
pub(crate) fn end_conversation(
    session: &Arc<dyn SessionHost>,
    registry: &ConversationRegistry,
    record: &Arc<ManagedConversation>,
) -> usize {
    record.mark_ended();
    registry.remove(record);
    discard_lock(session.as_ref(), record);
    let mut store = EagerSessionBeanStore::new(record.scheme(), Arc::clone(session));
    store.attach();
    let destroyed = destroy_all(&mut store);
    tracing::debug!(conversation = record.id(), destroyed, "conversation ended");
    destroyed
}

/// Drop the lock handle of an ended conversation
///
/// Current holders and waiters keep the old handle and find the record
/// ended once they get it.
pub(crate) fn discard_lock(session: &dyn SessionHost, record: &ManagedConversation) {
    if !record.is_ended() {
        return;
    }
    if let Some(locks) = LockStore::existing(session) {
        locks.discard(record.lock_key());
    }
}

/// Sweep expired conversations of a deployment in a session
///
/// Returns the number of conversations ended.
pub fn reap_expired(session: &Arc<dyn SessionHost>, context_id: &str, now_ms: u64) -> usize {
    let Some(registry) = ConversationRegistry::existing(session.as_ref(), context_id) else {
        return 0;
    };
    let Some(locks) = LockStore::for_session(session.as_ref()) else {
        return 0;
    };
    let mut reaped = 0;
    for record in registry.all() {
        if !record.is_expired(now_ms) {
            continue;
        }
        let Some(_lock) = locks.try_lock_for(record.lock_key(), Duration::ZERO) else {
            tracing::debug!(conversation = record.id(), "expired conversation is locked, skipped");
            continue;
        };
        if record.is_ended() {
            continue;
        }
        end_conversation(session, &registry, &record);
        reaped += 1;
    }
    if reaped > 0 {
        tracing::debug!(session = session.id(), reaped, "expired conversations reaped");
    }
    reaped
}

/// End every conversation a deployment holds in a dying session
///
/// Returns the number of instances destroyed.
pub fn destroy_conversations(session: &Arc<dyn SessionHost>, context_id: &str) -> usize {
    let Some(registry) = ConversationRegistry::existing(session.as_ref(), context_id) else {
        return 0;
    };
    let locks = LockStore::existing(session.as_ref());
    registry
        .all()
        .iter()
        .map(|record| {
            let held = locks
                .as_ref()
                .and_then(|locks| locks.try_lock_for(record.lock_key(), Duration::ZERO));
            if held.is_none() && locks.is_some() {
                tracing::warn!(conversation = record.id(), "ending locked conversation of destroyed session");
            }
            end_conversation(session, &registry, record)
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use scoped_store::{BeanStore, MemorySession};
    use scoped_test_utils::{instance_of, RecordingContextual};

    fn long_running(session: &Arc<dyn SessionHost>, id: &str, bean: &Arc<RecordingContextual>) -> Arc<ManagedConversation> {
        let registry = ConversationRegistry::for_session(session.as_ref(), "main").unwrap();
        let record = Arc::new(ManagedConversation::new("main", id, 0, 10));
        registry.insert(Arc::clone(&record)).unwrap();
        let mut store = EagerSessionBeanStore::new(record.scheme(), Arc::clone(session));
        store.attach();
        store.put(bean.id().clone(), instance_of(bean));
        record
    }

    #[test]
    fn expired_conversations_are_reaped_once() {
        let session: Arc<dyn SessionHost> = MemorySession::new();
        let bean = RecordingContextual::new("wizard.Step");
        let record = long_running(&session, "1", &bean);
        record.schedule_termination(0);

        assert_eq!(reap_expired(&session, "main", 5), 0);
        assert_eq!(reap_expired(&session, "main", 10), 1);
        assert_eq!(reap_expired(&session, "main", 20), 0);
        assert_eq!(bean.destroyed(), 1);
        assert!(record.is_ended());
    }

    #[test]
    fn locked_conversations_are_not_reaped() {
        let session: Arc<dyn SessionHost> = MemorySession::new();
        let bean = RecordingContextual::new("wizard.Step");
        let record = long_running(&session, "1", &bean);
        record.schedule_termination(0);

        let locks = LockStore::for_session(session.as_ref()).unwrap();
        let held = locks.lock(record.lock_key());
        assert_eq!(reap_expired(&session, "main", 100), 0);
        drop(held);
        assert_eq!(reap_expired(&session, "main", 100), 1);
    }

    #[test]
    fn session_destruction_ends_every_conversation() {
        let session: Arc<dyn SessionHost> = MemorySession::new();
        let a = RecordingContextual::new("a");
        let b = RecordingContextual::new("b");
        long_running(&session, "1", &a);
        long_running(&session, "2", &b);

        assert_eq!(destroy_conversations(&session, "main"), 2);
        assert_eq!(destroy_conversations(&session, "main"), 0);
        assert_eq!(a.destroyed() + b.destroyed(), 2);
    }

    #[test]
    fn other_deployments_are_left_alone() {
        let session: Arc<dyn SessionHost> = MemorySession::new();
        let bean = RecordingContextual::new("wizard.Step");
        long_running(&session, "1", &bean).schedule_termination(0);

        assert_eq!(reap_expired(&session, "other", 100), 0);
        assert_eq!(destroy_conversations(&session, "other"), 0);
        assert_eq!(bean.destroyed(), 0);
        assert_eq!(destroy_conversations(&session, "main"), 1);
    }

    #[test]
    fn ended_conversations_release_their_lock_handle() {
        let session: Arc<dyn SessionHost> = MemorySession::new();
        let locks = LockStore::for_session(session.as_ref()).unwrap();
        for id in 0..20 {
            let bean = RecordingContextual::new("wizard.Step");
            let record = long_running(&session, &id.to_string(), &bean);
            record.schedule_termination(0);
            let held = locks.lock(record.lock_key());
            drop(held);
        }
        assert_eq!(locks.len(), 20);

        assert_eq!(reap_expired(&session, "main", 100), 20);
        assert!(locks.is_empty());
    }
}
