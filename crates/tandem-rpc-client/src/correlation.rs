//! Request/response correlation.
//!
//! Foreground callers register a pending call before writing the request;
//! the background receive loop satisfies the slot when a response with a
//! matching id arrives. Waiters poll the table at a bounded interval rather
//! than parking on a per-id wait primitive; the interval keeps the poll both
//! responsive and cheap, and must stay within 1-10ms.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tandem_json_rpc::JsonRpcResponse;

/// Poll interval for [`CorrelationTable::await_response`].
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A call that has been written but not yet answered.
#[derive(Debug)]
struct PendingCall {
    created_at: Instant,
    response: Option<JsonRpcResponse>,
}

/// Thread-safe id allocation and pending-call tracking for one connection.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingCall>>,
    closed: AtomicBool,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Allocate the next call id. Strictly increasing, starting at 1.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Create the unsatisfied slot for a call about to be written.
    pub fn register(&self, id: u64) {
        let mut pending = self.pending.lock();
        pending.insert(
            id,
            PendingCall {
                created_at: Instant::now(),
                response: None,
            },
        );
    }

    /// Satisfy a pending call from the receive loop. A response for an id
    /// with no pending call (late or unsolicited) is dropped, and a slot is
    /// set at most once: further responses for the same id are dropped too.
    /// Returns whether a slot was satisfied.
    pub fn complete(&self, id: u64, response: JsonRpcResponse) -> bool {
        let mut pending = self.pending.lock();
        match pending.get_mut(&id) {
            Some(slot) => {
                if slot.response.is_some() {
                    debug!(id, "dropping extra response for an already-satisfied call");
                    return false;
                }
                slot.response = Some(response);
                true
            }
            None => {
                debug!(id, "dropping response with no pending call");
                false
            }
        }
    }

    /// Drop a pending call without satisfying it.
    pub fn remove(&self, id: u64) {
        self.pending.lock().remove(&id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Mark the connection closed, waking every waiter with "no response".
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Block the caller (cooperatively) until the slot is satisfied, the
    /// timeout elapses, the cancellation signal fires, or the connection is
    /// marked closed. The pending entry is removed on every exit path.
    ///
    /// A `None` or zero timeout waits forever.
    pub async fn await_response(
        &self,
        id: u64,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Option<JsonRpcResponse> {
        let deadline = timeout
            .filter(|t| !t.is_zero())
            .map(|t| Instant::now() + t);

        loop {
            {
                let mut pending = self.pending.lock();
                if let Some(slot) = pending.get_mut(&id) {
                    if slot.response.is_some() {
                        let slot = pending.remove(&id);
                        return slot.and_then(|s| s.response);
                    }
                } else {
                    // Entry vanished (connection teardown retired it).
                    return None;
                }
            }

            let expired = deadline.is_some_and(|d| Instant::now() >= d);
            if expired || cancel.is_cancelled() || self.is_closed() {
                if let Some(slot) = self.pending.lock().remove(&id) {
                    debug!(
                        id,
                        elapsed_ms = slot.created_at.elapsed().as_millis() as u64,
                        expired,
                        "retiring pending call without response"
                    );
                }
                return None;
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use serde_json::json;

    fn response(id: u64) -> JsonRpcResponse {
        JsonRpcResponse::success(id, json!(format!("r{}", id)))
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let table = CorrelationTable::new();
        assert_eq!(table.next_id(), 1);
        assert_eq!(table.next_id(), 2);
        assert_eq!(table.next_id(), 3);
    }

    #[test]
    fn test_unsolicited_response_dropped() {
        let table = CorrelationTable::new();
        assert!(!table.complete(99, response(99)));
    }

    #[tokio::test]
    async fn test_satisfied_slot_is_not_overwritten() {
        use tandem_json_rpc::JsonRpcErrorObject;

        let table = CorrelationTable::new();
        let id = table.next_id();
        table.register(id);

        // Fan-out dispatch can write several replies for one id; the first
        // must win and later ones must be dropped.
        let first =
            JsonRpcResponse::error(Some(id), JsonRpcErrorObject::invalid_params("wrong shape"));
        assert!(table.complete(id, first));
        assert!(!table.complete(id, response(id)));

        let resolved = table
            .await_response(id, Some(Duration::from_secs(1)), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!resolved.is_success());
        assert_eq!(resolved.error.unwrap().code, -32602);
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_satisfied_slot_resolves() {
        let table = Arc::new(CorrelationTable::new());
        let id = table.next_id();
        table.register(id);

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move {
                table
                    .await_response(id, Some(Duration::from_secs(1)), &CancellationToken::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(table.complete(id, response(id)));

        let resolved = waiter.await.unwrap().unwrap();
        assert_eq!(resolved.id, Some(id));
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_returns_none_and_removes_entry() {
        let table = CorrelationTable::new();
        let id = table.next_id();
        table.register(id);

        let started = Instant::now();
        let resolved = table
            .await_response(id, Some(Duration::from_millis(50)), &CancellationToken::new())
            .await;
        let elapsed = started.elapsed();

        assert!(resolved.is_none());
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(120), "elapsed: {:?}", elapsed);
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_wakes_waiter() {
        let table = Arc::new(CorrelationTable::new());
        let id = table.next_id();
        table.register(id);

        let cancel = CancellationToken::new();
        let waiter = {
            let table = table.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { table.await_response(id, None, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(15)).await;
        cancel.cancel();

        assert!(waiter.await.unwrap().is_none());
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_retires_all_waiters() {
        let table = Arc::new(CorrelationTable::new());
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let id = table.next_id();
            table.register(id);
            let table = table.clone();
            waiters.push(tokio::spawn(async move {
                table.await_response(id, None, &CancellationToken::new()).await
            }));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        table.mark_closed();

        for waiter in waiters {
            assert!(waiter.await.unwrap().is_none());
        }
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_resolve_by_id() {
        let table = Arc::new(CorrelationTable::new());

        let mut waiters = Vec::new();
        for _ in 0..100 {
            let id = table.next_id();
            table.register(id);
            let table = table.clone();
            waiters.push((
                id,
                tokio::spawn(async move {
                    table
                        .await_response(id, Some(Duration::from_secs(5)), &CancellationToken::new())
                        .await
                }),
            ));
        }

        // Deliver responses in reverse order; each waiter must still get
        // the response matching its own id.
        for id in (1..=100).rev() {
            assert!(table.complete(id, response(id)));
        }

        for (id, waiter) in waiters {
            let resolved = waiter.await.unwrap().unwrap();
            assert_eq!(resolved.id, Some(id));
            assert_eq!(
                resolved.result_as::<String>().unwrap().unwrap(),
                format!("r{}", id)
            );
        }
        assert_eq!(table.pending_count(), 0);
    }
}
