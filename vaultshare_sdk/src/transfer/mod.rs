//! Transfer sessions: server-side state for in-flight chunked
//! uploads and downloads.
//!
//! One registry is shared by all connection workers. Sessions are
//! keyed by an opaque transfer id and advance strictly one chunk at
//! a time; any sequencing violation kills the session (the client
//! must restart from `init`), while ownership violations fail the
//! request without touching session state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::definitions::CHUNK_SIZE;

pub use error::TransferError;

mod error;

/// What a session is moving; all three kinds share the same chunk
/// machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    File,
    Signature,
    Key,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone)]
pub struct TransferSession {
    pub id: String,
    pub kind: PayloadKind,
    pub direction: Direction,
    pub workspace: String,
    pub owner: String,
    pub target_name: String,
    pub total_size: u64,
    pub total_chunks: u32,
    pub next_chunk: u32,
    pub bytes_moved: u64,
    pub complete: bool,
    /// Staging file for uploads; the stored source file for
    /// downloads.
    pub backing: PathBuf,
}

/// One validated chunk step: where to read or write, and how much.
#[derive(Debug)]
pub struct ChunkStep {
    pub direction: Direction,
    pub kind: PayloadKind,
    pub path: PathBuf,
    pub offset: u64,
    /// Exact number of bytes this chunk must carry, derived from the
    /// declared (upload) or measured (download) total size.
    pub len: u64,
}

pub fn chunk_count(size: u64) -> u32 {
    size.div_ceil(CHUNK_SIZE as u64) as u32
}

pub struct Registry {
    temp_dir: PathBuf,
    sessions: Mutex<HashMap<String, TransferSession>>,
}

impl Registry {
    pub fn new(temp_dir: PathBuf) -> Registry {
        Registry {
            temp_dir,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Staging location for an upload session's partial data.
    pub fn staging_path(&self, id: &str) -> PathBuf {
        self.temp_dir.join(format!("{id}.part"))
    }

    /// Open an upload session. The declared chunk count must match
    /// the declared size at the fixed chunk size.
    pub fn open_upload(
        &self,
        kind: PayloadKind,
        workspace: &str,
        owner: &str,
        target_name: &str,
        total_size: u64,
        total_chunks: u32,
    ) -> Result<String, TransferError> {
        if total_chunks != chunk_count(total_size) {
            return Err(TransferError::Declaration {
                declared: total_chunks,
                size: total_size,
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let session = TransferSession {
            id: id.clone(),
            kind,
            direction: Direction::Upload,
            workspace: workspace.into(),
            owner: owner.into(),
            target_name: target_name.into(),
            total_size,
            total_chunks,
            next_chunk: 0,
            bytes_moved: 0,
            complete: false,
            backing: self.staging_path(&id),
        };

        self.sessions
            .lock()
            .expect("transfer registry poisoned")
            .insert(id.clone(), session);

        Ok(id)
    }

    /// Open a download session over an existing stored file. Size and
    /// chunk count are computed here, never taken from the client.
    pub fn open_download(
        &self,
        kind: PayloadKind,
        workspace: &str,
        owner: &str,
        target_name: &str,
        source: PathBuf,
        total_size: u64,
    ) -> (String, u32) {
        let id = uuid::Uuid::new_v4().to_string();
        let total_chunks = chunk_count(total_size);
        let session = TransferSession {
            id: id.clone(),
            kind,
            direction: Direction::Download,
            workspace: workspace.into(),
            owner: owner.into(),
            target_name: target_name.into(),
            total_size,
            total_chunks,
            next_chunk: 0,
            bytes_moved: 0,
            complete: false,
            backing: source,
        };

        self.sessions
            .lock()
            .expect("transfer registry poisoned")
            .insert(id.clone(), session);

        (id, total_chunks)
    }

    /// Workspace and owner of a session, for membership re-checks.
    pub fn route_of(&self, id: &str) -> Option<(String, String)> {
        let sessions = self.sessions.lock().expect("transfer registry poisoned");
        sessions
            .get(id)
            .map(|s| (s.workspace.clone(), s.owner.clone()))
    }

    /// Validate one chunk step without performing any I/O. A chunk
    /// index mismatch from the session owner aborts the session; a
    /// foreign caller gets an error and the session is untouched.
    pub fn begin_chunk(
        &self,
        id: &str,
        caller: &str,
        chunk_id: u32,
    ) -> Result<ChunkStep, TransferError> {
        let mut sessions = self.sessions.lock().expect("transfer registry poisoned");
        let session = sessions
            .get(id)
            .ok_or_else(|| TransferError::NotFound(id.into()))?;

        if session.owner != caller {
            return Err(TransferError::NotOwner(id.into()));
        }
        if session.complete {
            return Err(TransferError::AlreadyComplete(id.into()));
        }
        if chunk_id != session.next_chunk {
            let expected = session.next_chunk;
            let session = sessions.remove(id).expect("session present");
            drop(sessions);
            discard_staging(&session);
            return Err(TransferError::OutOfOrder {
                expected,
                got: chunk_id,
            });
        }
        // all declared chunks delivered; only `complete` is valid now
        if chunk_id >= session.total_chunks {
            let total = session.total_chunks;
            let session = sessions.remove(id).expect("session present");
            drop(sessions);
            discard_staging(&session);
            return Err(TransferError::PastEnd {
                got: chunk_id,
                total,
            });
        }

        let offset = chunk_id as u64 * CHUNK_SIZE as u64;
        Ok(ChunkStep {
            direction: session.direction,
            kind: session.kind,
            path: session.backing.clone(),
            offset,
            len: (session.total_size - offset).min(CHUNK_SIZE as u64),
        })
    }

    /// Record a successfully moved chunk.
    pub fn commit_chunk(&self, id: &str, len: u64) -> Result<(), TransferError> {
        let mut sessions = self.sessions.lock().expect("transfer registry poisoned");
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| TransferError::NotFound(id.into()))?;

        session.next_chunk += 1;
        session.bytes_moved += len;

        Ok(())
    }

    /// Finalize a session: all chunks must have been moved. The
    /// session record is removed and handed to the caller, who
    /// persists (upload) or simply forgets (download) the backing
    /// file.
    pub fn complete(&self, id: &str, caller: &str) -> Result<TransferSession, TransferError> {
        let mut sessions = self.sessions.lock().expect("transfer registry poisoned");
        let session = sessions
            .get(id)
            .ok_or_else(|| TransferError::NotFound(id.into()))?;

        if session.owner != caller {
            return Err(TransferError::NotOwner(id.into()));
        }
        if session.complete {
            return Err(TransferError::AlreadyComplete(id.into()));
        }
        if session.next_chunk != session.total_chunks
            || session.bytes_moved != session.total_size
        {
            return Err(TransferError::Incomplete(id.into()));
        }

        let mut session = sessions.remove(id).expect("session present");
        session.complete = true;

        Ok(session)
    }

    /// Drop a session and discard its partial staging data.
    pub fn abort(&self, id: &str) {
        let session = self
            .sessions
            .lock()
            .expect("transfer registry poisoned")
            .remove(id);
        if let Some(session) = session {
            discard_staging(&session);
        }
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.sessions
            .lock()
            .expect("transfer registry poisoned")
            .contains_key(id)
    }

    /// Startup sweep: delete staging files left behind by sessions
    /// that were abandoned on connection loss.
    pub fn sweep_orphans(&self) -> std::io::Result<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.temp_dir)? {
            let path = entry?.path();
            let id = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default();
            if !self.is_active(id) {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }

        Ok(removed)
    }
}

fn discard_staging(session: &TransferSession) {
    if session.direction == Direction::Upload {
        // best effort; the startup sweep catches anything left over
        let _ = std::fs::remove_file(&session.backing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path().to_path_buf());
        (dir, registry)
    }

    #[test]
    fn chunk_math() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK_SIZE as u64), 1);
        assert_eq!(chunk_count(CHUNK_SIZE as u64 + 1), 2);
        // 300 KB, as in a five-chunk upload
        assert_eq!(chunk_count(300 * 1024), 5);
    }

    #[test]
    fn upload_declaration_must_match() {
        let (_dir, registry) = registry();
        let result = registry.open_upload(PayloadKind::File, "ws1", "alice", "a.txt", 300 * 1024, 4);
        assert!(matches!(result, Err(TransferError::Declaration { .. })));
    }

    #[test]
    fn strict_chunk_monotonicity() {
        let (_dir, registry) = registry();
        let id = registry
            .open_upload(PayloadKind::File, "ws1", "alice", "a.txt", 300 * 1024, 5)
            .unwrap();

        for chunk in 0..3u32 {
            let step = registry.begin_chunk(&id, "alice", chunk).unwrap();
            assert_eq!(step.offset, chunk as u64 * CHUNK_SIZE as u64);
            registry.commit_chunk(&id, CHUNK_SIZE as u64).unwrap();
        }

        // skipping ahead kills the session outright
        let err = registry.begin_chunk(&id, "alice", 4).unwrap_err();
        assert!(matches!(
            err,
            TransferError::OutOfOrder {
                expected: 3,
                got: 4
            }
        ));
        assert!(!registry.is_active(&id));
    }

    #[test]
    fn repeated_chunk_is_fatal_too() {
        let (_dir, registry) = registry();
        let id = registry
            .open_upload(PayloadKind::File, "ws1", "alice", "a.txt", 2 * CHUNK_SIZE as u64, 2)
            .unwrap();

        registry.begin_chunk(&id, "alice", 0).unwrap();
        registry.commit_chunk(&id, CHUNK_SIZE as u64).unwrap();

        let err = registry.begin_chunk(&id, "alice", 0).unwrap_err();
        assert!(matches!(err, TransferError::OutOfOrder { .. }));
        assert!(!registry.is_active(&id));
    }

    #[test]
    fn chunk_past_the_declared_end_is_fatal() {
        let (_dir, registry) = registry();
        let id = registry
            .open_upload(PayloadKind::File, "ws1", "alice", "a.txt", 100, 1)
            .unwrap();

        let step = registry.begin_chunk(&id, "alice", 0).unwrap();
        assert_eq!(step.len, 100);
        registry.commit_chunk(&id, 100).unwrap();

        // the next in-sequence index is one past the declared count;
        // only `complete` is acceptable here
        let err = registry.begin_chunk(&id, "alice", 1).unwrap_err();
        assert!(matches!(err, TransferError::PastEnd { got: 1, total: 1 }));
        assert!(!registry.is_active(&id));
        assert!(matches!(
            registry.complete(&id, "alice"),
            Err(TransferError::NotFound(_))
        ));
    }

    #[test]
    fn empty_uploads_accept_no_chunks_at_all() {
        let (_dir, registry) = registry();
        let id = registry
            .open_upload(PayloadKind::File, "ws1", "alice", "a.txt", 0, 0)
            .unwrap();

        let err = registry.begin_chunk(&id, "alice", 0).unwrap_err();
        assert!(matches!(err, TransferError::PastEnd { got: 0, total: 0 }));
        assert!(!registry.is_active(&id));
    }

    #[test]
    fn undersized_chunks_never_complete() {
        let (_dir, registry) = registry();
        let id = registry
            .open_upload(PayloadKind::File, "ws1", "alice", "a.txt", 300 * 1024, 5)
            .unwrap();

        // commit far less than each chunk's share of the declared size
        for chunk in 0..5u32 {
            registry.begin_chunk(&id, "alice", chunk).unwrap();
            registry.commit_chunk(&id, 1).unwrap();
        }

        assert!(matches!(
            registry.complete(&id, "alice"),
            Err(TransferError::Incomplete(_))
        ));
    }

    #[test]
    fn ownership_isolation_without_state_mutation() {
        let (_dir, registry) = registry();
        let id = registry
            .open_upload(PayloadKind::File, "ws1", "alice", "a.txt", 100, 1)
            .unwrap();

        assert!(matches!(
            registry.begin_chunk(&id, "mallory", 0),
            Err(TransferError::NotOwner(_))
        ));
        assert!(matches!(
            registry.complete(&id, "mallory"),
            Err(TransferError::NotOwner(_))
        ));

        // the rightful owner can still proceed where they left off
        assert!(registry.is_active(&id));
        registry.begin_chunk(&id, "alice", 0).unwrap();
    }

    #[test]
    fn complete_requires_all_chunks() {
        let (_dir, registry) = registry();
        let id = registry
            .open_upload(PayloadKind::File, "ws1", "alice", "a.txt", 2 * CHUNK_SIZE as u64, 2)
            .unwrap();

        registry.begin_chunk(&id, "alice", 0).unwrap();
        registry.commit_chunk(&id, CHUNK_SIZE as u64).unwrap();

        assert!(matches!(
            registry.complete(&id, "alice"),
            Err(TransferError::Incomplete(_))
        ));

        registry.begin_chunk(&id, "alice", 1).unwrap();
        registry.commit_chunk(&id, CHUNK_SIZE as u64).unwrap();

        let session = registry.complete(&id, "alice").unwrap();
        assert!(session.complete);
        assert_eq!(session.bytes_moved, 2 * CHUNK_SIZE as u64);

        // finalizing twice fails: the session is gone
        assert!(matches!(
            registry.complete(&id, "alice"),
            Err(TransferError::NotFound(_))
        ));
    }

    #[test]
    fn download_sessions_compute_their_own_geometry() {
        let (_dir, registry) = registry();
        let (id, chunks) = registry.open_download(
            PayloadKind::File,
            "ws1",
            "bob",
            "a.txt",
            PathBuf::from("/data/ws1/a.txt"),
            CHUNK_SIZE as u64 + 17,
        );

        assert_eq!(chunks, 2);
        let step = registry.begin_chunk(&id, "bob", 0).unwrap();
        assert_eq!(step.len, CHUNK_SIZE as u64);
        registry.commit_chunk(&id, step.len).unwrap();

        let step = registry.begin_chunk(&id, "bob", 1).unwrap();
        assert_eq!(step.len, 17);
    }

    #[test]
    fn orphan_sweep_preserves_active_staging() {
        let (dir, registry) = registry();
        let id = registry
            .open_upload(PayloadKind::File, "ws1", "alice", "a.txt", 100, 1)
            .unwrap();

        let active = dir.path().join(format!("{id}.part"));
        let orphan = dir.path().join("dead-beef.part");
        std::fs::write(&active, b"partial").unwrap();
        std::fs::write(&orphan, b"stale").unwrap();

        assert_eq!(registry.sweep_orphans().unwrap(), 1);
        assert!(active.exists());
        assert!(!orphan.exists());
    }
}
