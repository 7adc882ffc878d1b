//! In-progress blob upload sessions

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{RegistryError, RegistryResult};

/// How long an upload may go untouched before it is abandoned.
pub const DEFAULT_UPLOAD_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug)]
struct Upload {
    data: BytesMut,
    touched: Instant,
}

/// Chunks received so far for each open upload, keyed by session id.
///
/// Sessions only live in memory: an upload interrupted by a restart has to
/// be started again. Sessions idle for longer than the idle timeout are
/// dropped whenever a new one starts.
#[derive(Debug)]
pub(crate) struct UploadSessions {
    sessions: Mutex<HashMap<Uuid, Upload>>,
    idle_timeout: Duration,
}

impl Default for UploadSessions {
    fn default() -> Self {
        Self::new(DEFAULT_UPLOAD_IDLE_TIMEOUT)
    }
}

impl UploadSessions {
    pub(crate) fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::default(),
            idle_timeout,
        }
    }

    /// Open a new, empty upload session.
    pub(crate) fn start(&self) -> Uuid {
        let id = Uuid::new_v4();
        let mut sessions = self.sessions.lock();

        let before = sessions.len();
        sessions.retain(|_, upload| upload.touched.elapsed() <= self.idle_timeout);
        let expired = before - sessions.len();
        if expired > 0 {
            tracing::debug!(expired, "dropped idle upload sessions");
        }

        sessions.insert(
            id,
            Upload {
                data: BytesMut::new(),
                touched: Instant::now(),
            },
        );
        id
    }

    /// Number of open sessions.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Append a chunk, returning the number of bytes received so far.
    ///
    /// When the client says where the chunk starts, it must start exactly
    /// where the previous one ended.
    pub(crate) fn append(&self, id: &str, offset: Option<u64>, chunk: &[u8]) -> RegistryResult<u64> {
        let id = parse_id(id)?;
        let mut sessions = self.sessions.lock();
        let upload = sessions
            .get_mut(&id)
            .ok_or_else(|| RegistryError::BlobUploadUnknown(id.to_string()))?;

        if let Some(offset) = offset {
            if offset != upload.data.len() as u64 {
                return Err(RegistryError::RangeNotSatisfiable);
            }
        }

        upload.data.extend_from_slice(chunk);
        upload.touched = Instant::now();
        Ok(upload.data.len() as u64)
    }

    /// Bytes received so far.
    pub(crate) fn received(&self, id: &str) -> RegistryResult<u64> {
        let id = parse_id(id)?;
        self.sessions
            .lock()
            .get(&id)
            .map(|upload| upload.data.len() as u64)
            .ok_or_else(|| RegistryError::BlobUploadUnknown(id.to_string()))
    }

    /// Close a session, returning everything it received.
    pub(crate) fn finish(&self, id: &str) -> RegistryResult<Bytes> {
        let id = parse_id(id)?;
        self.sessions
            .lock()
            .remove(&id)
            .map(|upload| upload.data.freeze())
            .ok_or_else(|| RegistryError::BlobUploadUnknown(id.to_string()))
    }

    /// Abandon a session.
    pub(crate) fn cancel(&self, id: &str) -> RegistryResult<()> {
        self.finish(id).map(|_| ())
    }
}

fn parse_id(id: &str) -> RegistryResult<Uuid> {
    id.parse()
        .map_err(|_| RegistryError::BlobUploadUnknown(id.to_owned()))
}

/// The `Range` header value for an upload which has received `received` bytes.
pub(crate) fn range(received: u64) -> String {
    format!("0-{}", received.saturating_sub(1))
}
