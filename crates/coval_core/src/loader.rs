//! On-demand co-value loading with bounded waits.

use crate::co_id::CoId;
use crate::error::{CovalError, Result};
use crate::peer::{CoHandle, Peer};
use std::rc::Rc;
use tracing::debug;

/// Loads co-values from the peer's storage on demand, waiting for
/// availability within a caller-provided budget.
///
/// Waits are deadline loops over [`Peer::pump`]: when the peer is idle and
/// the value is still unavailable, the wait resolves to `Timeout` at once
/// instead of spinning. The loader never retries internally.
#[derive(Clone)]
pub struct CoValueLoader {
    peer: Rc<dyn Peer>,
}

impl CoValueLoader {
    /// Creates a loader over a peer.
    pub fn new(peer: Rc<dyn Peer>) -> Self {
        Self { peer }
    }

    /// Ensures a co-value handle, triggering a load when necessary.
    ///
    /// With `wait` unset, the (possibly still unavailable) handle is
    /// returned immediately after the load request; the caller is expected
    /// to subscribe. With `wait` set, pumps the peer until availability or
    /// the deadline.
    ///
    /// # Errors
    ///
    /// `InvalidId` for malformed ids (fatal at the caller), `NotFound` when
    /// the peer does not know the id, `Timeout` when the budget elapses
    /// (recoverable; read paths translate it into an error state).
    pub fn ensure(&self, id: &str, wait: bool, timeout_ms: u64) -> Result<CoHandle> {
        let id = CoId::parse(id)?;
        let handle = self.peer.entry(&id);
        if handle.is_available() {
            return Ok(handle);
        }
        if !self.peer.is_known(&id) {
            return Err(CovalError::NotFound(id.as_str().to_string()));
        }

        self.peer.load(&id);
        if !wait {
            return Ok(handle);
        }

        let start = self.peer.now_ms();
        loop {
            if handle.is_available() {
                return Ok(handle);
            }
            if self.peer.now_ms().saturating_sub(start) >= timeout_ms as i64 {
                break;
            }
            if !self.peer.pump() {
                // Idle peer: nothing left that could flip availability.
                break;
            }
        }

        if handle.is_available() {
            return Ok(handle);
        }
        debug!(id = %id, timeout_ms, "co-value did not become available");
        Err(CovalError::Timeout {
            what: id.as_str().to_string(),
            timeout_ms,
        })
    }

    /// Waits for the header's `$schema` metadata.
    ///
    /// Availability does not imply header metadata has synced; this pumps
    /// until the header carries a valid schema co-id or the budget elapses.
    pub fn await_schema_in_header(&self, id: &CoId, timeout_ms: u64) -> Result<CoId> {
        let handle = self.ensure(id.as_str(), true, timeout_ms)?;

        let start = self.peer.now_ms();
        loop {
            if let Some(schema) = handle.header().and_then(|h| h.schema) {
                return Ok(schema);
            }
            if self.peer.now_ms().saturating_sub(start) >= timeout_ms as i64 {
                break;
            }
            if !self.peer.pump() {
                break;
            }
        }

        match handle.header().and_then(|h| h.schema) {
            Some(schema) => Ok(schema),
            None => Err(CovalError::Timeout {
                what: format!("schema in header of {}", id.as_str()),
                timeout_ms,
            }),
        }
    }
}
