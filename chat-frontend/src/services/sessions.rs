use chat_core::ChatSession;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

pub type SessionHandle = Arc<Mutex<ChatSession>>;

struct Entry {
    session: SessionHandle,
    last_seen: Instant,
}

/// Server-side chat sessions keyed by the id kept in the cookie session.
///
/// Each chat session sits behind its own mutex, so one browser runs one turn
/// at a time while other users proceed independently.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    entries: Arc<DashMap<Uuid, Entry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, id: Uuid, create: impl FnOnce() -> ChatSession) -> SessionHandle {
        let mut entry = self.entries.entry(id).or_insert_with(|| Entry {
            session: Arc::new(Mutex::new(create())),
            last_seen: Instant::now(),
        });
        entry.last_seen = Instant::now();
        entry.session.clone()
    }

    pub fn get(&self, id: &Uuid) -> Option<SessionHandle> {
        self.entries.get_mut(id).map(|mut entry| {
            entry.last_seen = Instant::now();
            entry.session.clone()
        })
    }

    pub fn remove(&self, id: &Uuid) -> Option<SessionHandle> {
        self.entries.remove(id).map(|(_, entry)| entry.session)
    }

    /// Drop sessions idle longer than `idle`. Sessions mid-turn are kept.
    pub fn sweep_idle(&self, idle: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            entry.last_seen.elapsed() < idle || entry.session.try_lock().is_err()
        });
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
