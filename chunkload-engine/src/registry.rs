//! In-memory table of live upload sessions
//!
//! Each entry is mutated under its shard lock only, so two uploads never
//! serialize on a global lock while chunks of one upload are applied one at
//! a time. No method holds an entry guard across an `.await`.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, SystemTime};
use chunkload_core::*;

#[derive(Debug, Default)]
pub struct UploadRegistry {
    sessions: DashMap<SessionId, UploadSession>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly initiated session, which must be `uploading`
    pub fn create(&self, session: UploadSession) -> Result<SessionId> {
        if session.status() != UploadStatus::Uploading {
            return Err(ChunkloadError::Internal(format!(
                "new session {} must start as uploading, not {}",
                session.id,
                session.status()
            )));
        }

        let id = session.id;
        match self.sessions.entry(id) {
            Entry::Occupied(_) => Err(ChunkloadError::Internal(format!("duplicate session id {}", id))),
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(id)
            }
        }
    }

    /// Clone of the full session state
    pub fn get(&self, id: &SessionId) -> Result<UploadSession> {
        self.sessions
            .get(id)
            .map(|s| s.value().clone())
            .ok_or(ChunkloadError::SessionNotFound(*id))
    }

    pub fn snapshot(&self, id: &SessionId) -> Result<StatusSnapshot> {
        self.sessions
            .get(id)
            .map(|s| s.snapshot())
            .ok_or(ChunkloadError::SessionNotFound(*id))
    }

    /// Validate that chunk `index` may be written and report whether it is
    /// already received. Returns the session plan.
    pub fn check_chunk(&self, id: &SessionId, index: u32) -> Result<(ChunkPlan, bool)> {
        let session = self.sessions.get(id).ok_or(ChunkloadError::SessionNotFound(*id))?;
        session.plan.check_index(index)?;
        session.ensure_accepting()?;
        Ok((session.plan, session.is_received(index)))
    }

    /// Atomically flip one bitmap entry; returns whether every chunk is now received
    pub fn mutate_chunk(&self, id: &SessionId, index: u32, accepted: bool) -> Result<bool> {
        let mut session = self.sessions.get_mut(id).ok_or(ChunkloadError::SessionNotFound(*id))?;
        session.mark_chunk(index, accepted)
    }

    /// Compare-and-swap status transition. Exactly one concurrent caller wins.
    pub fn transition(&self, id: &SessionId, from: UploadStatus, to: UploadStatus) -> Result<()> {
        let mut session = self.sessions.get_mut(id).ok_or(ChunkloadError::SessionNotFound(*id))?;
        session.transition(from, to)
    }

    /// Compare-and-swap into `failed`, recording `message`
    pub fn fail(&self, id: &SessionId, from: UploadStatus, message: impl Into<String>) -> Result<()> {
        let mut session = self.sessions.get_mut(id).ok_or(ChunkloadError::SessionNotFound(*id))?;
        session.fail(from, message)
    }

    pub fn delete(&self, id: &SessionId) -> Option<UploadSession> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    /// Remove a session unless a merge currently owns it
    pub fn abandon(&self, id: &SessionId) -> Result<UploadSession> {
        match self.sessions.entry(*id) {
            Entry::Vacant(_) => Err(ChunkloadError::SessionNotFound(*id)),
            Entry::Occupied(entry) if entry.get().status() == UploadStatus::Merging => {
                Err(ChunkloadError::SessionNotAcceptingChunks {
                    id: *id,
                    status: UploadStatus::Merging,
                })
            }
            Entry::Occupied(entry) => Ok(entry.remove()),
        }
    }

    /// Sessions not updated for at least `older_than`
    pub fn stale(&self, older_than: Duration) -> Vec<StatusSnapshot> {
        let now = SystemTime::now();
        let mut stale: Vec<StatusSnapshot> = self
            .sessions
            .iter()
            .filter(|s| {
                now.duration_since(s.updated_at())
                    .map(|age| age >= older_than)
                    .unwrap_or(false)
            })
            .map(|s| s.snapshot())
            .collect();
        stale.sort_by_key(|s| s.updated_at);
        stale
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn new_session(total: u64, chunk: u64) -> UploadSession {
        UploadSession::new(SessionId::new(), "video.mp4", ChunkPlan::new(total, chunk).unwrap())
    }

    #[test]
    fn test_create_get_delete() {
        let registry = UploadRegistry::new();
        let id = registry.create(new_session(100, 10)).unwrap();

        let session = registry.get(&id).unwrap();
        assert_eq!(session.status(), UploadStatus::Uploading);
        assert_eq!(registry.len(), 1);

        assert!(registry.delete(&id).is_some());
        assert!(matches!(registry.get(&id), Err(ChunkloadError::SessionNotFound(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_mutate_chunk_reports_completion() {
        let registry = UploadRegistry::new();
        let id = registry.create(new_session(25, 10)).unwrap();

        assert!(!registry.mutate_chunk(&id, 1, true).unwrap());
        assert!(!registry.mutate_chunk(&id, 2, true).unwrap());
        assert!(registry.mutate_chunk(&id, 0, true).unwrap());
        assert_eq!(registry.snapshot(&id).unwrap().uploaded_bytes, 25);

        assert!(matches!(
            registry.mutate_chunk(&id, 3, true),
            Err(ChunkloadError::InvalidIndex { index: 3, count: 3 })
        ));
        assert!(matches!(
            registry.mutate_chunk(&SessionId::new(), 0, true),
            Err(ChunkloadError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_check_chunk_rejects_after_merge_started() {
        let registry = UploadRegistry::new();
        let id = registry.create(new_session(10, 10)).unwrap();

        assert_eq!(registry.check_chunk(&id, 0).unwrap().1, false);
        registry.mutate_chunk(&id, 0, true).unwrap();
        assert_eq!(registry.check_chunk(&id, 0).unwrap().1, true);

        registry.transition(&id, UploadStatus::Uploading, UploadStatus::Merging).unwrap();
        assert!(matches!(
            registry.check_chunk(&id, 0),
            Err(ChunkloadError::SessionNotAcceptingChunks { .. })
        ));
        assert!(matches!(
            registry.mutate_chunk(&id, 0, true),
            Err(ChunkloadError::SessionNotAcceptingChunks { .. })
        ));
    }

    #[test]
    fn test_concurrent_transition_has_single_winner() {
        let registry = Arc::new(UploadRegistry::new());
        let id = registry.create(new_session(10, 10)).unwrap();
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    if registry
                        .transition(&id, UploadStatus::Uploading, UploadStatus::Merging)
                        .is_ok()
                    {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(registry.get(&id).unwrap().status(), UploadStatus::Merging);
    }

    #[test]
    fn test_concurrent_chunks_on_one_session() {
        let registry = Arc::new(UploadRegistry::new());
        let id = registry.create(new_session(64 * 10 - 3, 10)).unwrap();

        let handles: Vec<_> = (0..64u32)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.mutate_chunk(&id, i, true).unwrap())
            })
            .collect();
        let completions = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|complete| *complete)
            .count();

        assert_eq!(completions, 1);
        let snap = registry.snapshot(&id).unwrap();
        assert_eq!(snap.uploaded_bytes, 64 * 10 - 3);
        assert!(snap.missing_chunks.is_empty());
    }

    #[test]
    fn test_fail_and_abandon() {
        let registry = UploadRegistry::new();
        let id = registry.create(new_session(10, 10)).unwrap();

        registry.transition(&id, UploadStatus::Uploading, UploadStatus::Merging).unwrap();
        assert!(registry.abandon(&id).is_err());

        registry.fail(&id, UploadStatus::Merging, "disk full").unwrap();
        let snap = registry.snapshot(&id).unwrap();
        assert_eq!(snap.status, UploadStatus::Failed);
        assert_eq!(snap.error.as_deref(), Some("disk full"));

        registry.abandon(&id).unwrap();
        assert!(matches!(registry.abandon(&id), Err(ChunkloadError::SessionNotFound(_))));
    }

    #[test]
    fn test_stale_listing() {
        let registry = UploadRegistry::new();
        let id = registry.create(new_session(10, 10)).unwrap();

        assert!(registry.stale(Duration::from_secs(3600)).is_empty());
        let stale = registry.stale(Duration::ZERO);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].session_id, id);
    }
}
