use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use steward_core::domain::message::{ConversationState, SessionId, UserId};

/// Live execution handle of one (user, session) pair.
///
/// The mutex serializes turns: whoever holds it owns the conversation buffer.
#[derive(Debug)]
pub struct SessionHandle {
    pub user_id: UserId,
    pub session_id: SessionId,
    state: Mutex<ConversationState>,
}

impl SessionHandle {
    fn new(user_id: UserId, session_id: SessionId) -> Self {
        Self { user_id, session_id, state: Mutex::new(ConversationState::default()) }
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ConversationState> {
        self.state.lock().await
    }
}

/// Maps (user, session) to its handle. Handles are never evicted.
#[derive(Default)]
pub struct SessionRegistry {
    handles: DashMap<(UserId, SessionId), Arc<SessionHandle>>,
    constructed: AtomicUsize,
}

impl SessionRegistry {
    /// Returns the existing handle or builds one. Construction happens under
    /// the key's shard lock, so concurrent callers for one key share a handle.
    pub fn acquire(&self, user_id: &UserId, session_id: &SessionId) -> Arc<SessionHandle> {
        let entry = self.handles.entry((user_id.clone(), session_id.clone())).or_insert_with(|| {
            self.constructed.fetch_add(1, Ordering::SeqCst);
            debug!(
                event_name = "agent.session.handle_created",
                session_id = %session_id.0,
                user_id = %user_id.0,
                "created session handle"
            );
            Arc::new(SessionHandle::new(user_id.clone(), session_id.clone()))
        });
        Arc::clone(entry.value())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Number of handles ever built.
    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::SeqCst)
    }
}
