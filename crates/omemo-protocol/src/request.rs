use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::ProtocolError;
use crate::stanza::{Iq, IqKind, Stanza, Transport};

/// Default deadline for a correlated response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Correlates outbound IQ requests with their responses by stanza id.
///
/// A request that times out, or whose future is dropped, releases its
/// pending entry immediately; nothing is retried. Once closed, the tracker
/// refuses new requests.
pub struct RequestTracker {
    pending: Mutex<HashMap<String, oneshot::Sender<Iq>>>,
    timeout: Duration,
    /// Only written with `pending` locked.
    closed: AtomicBool,
}

/// Removes the pending entry when the waiting future finishes or is dropped.
struct PendingGuard<'a> {
    tracker: &'a RequestTracker,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.tracker.pending.lock().remove(&self.id);
    }
}

impl RequestTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Send `iq` and wait for the correlated response.
    ///
    /// An error response surfaces as `ProtocolError::Remote`.
    pub async fn request(&self, transport: &dyn Transport, iq: Iq) -> Result<Iq, ProtocolError> {
        let request_id = iq.id.clone();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if self.closed.load(Ordering::SeqCst) {
                return Err(ProtocolError::Cancelled);
            }
            pending.insert(request_id.clone(), tx);
        }
        let _guard = PendingGuard {
            tracker: self,
            id: request_id.clone(),
        };

        transport.send(Stanza::Iq(iq))?;

        let response = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(ProtocolError::Cancelled),
            Err(_) => {
                tracing::warn!(request_id = %request_id, timeout = ?self.timeout, "request timed out");
                return Err(ProtocolError::Timeout { request_id });
            }
        };

        match response.kind {
            IqKind::Error { condition } => Err(ProtocolError::Remote { condition }),
            _ => Ok(response),
        }
    }

    /// Hand a response to its waiter. Returns `false` if nobody is waiting
    /// (unknown id, or the request already timed out).
    pub fn resolve(&self, response: Iq) -> bool {
        let Some(tx) = self.pending.lock().remove(&response.id) else {
            tracing::debug!(request_id = %response.id, "dropping uncorrelated response");
            return false;
        };
        tx.send(response).is_ok()
    }

    /// Abandon every pending request; waiters observe `Cancelled`.
    pub fn cancel_all(&self) {
        let cancelled = {
            let mut pending = self.pending.lock();
            let count = pending.len();
            pending.clear();
            count
        };
        if cancelled > 0 {
            tracing::debug!(cancelled, "cancelled pending requests");
        }
    }

    /// Cancel everything pending and refuse any later request.
    pub fn close(&self) {
        {
            let _pending = self.pending.lock();
            self.closed.store(true, Ordering::SeqCst);
        }
        self.cancel_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::element::Element;

    /// Records sent stanzas; never answers.
    #[derive(Default)]
    struct SilentTransport {
        sent: Mutex<Vec<Stanza>>,
    }

    impl Transport for SilentTransport {
        fn send(&self, stanza: Stanza) -> Result<(), ProtocolError> {
            self.sent.lock().push(stanza);
            Ok(())
        }
    }

    struct BrokenTransport;

    impl Transport for BrokenTransport {
        fn send(&self, _stanza: Stanza) -> Result<(), ProtocolError> {
            Err(ProtocolError::Transport("connection closed".into()))
        }
    }

    #[tokio::test]
    async fn response_is_correlated_by_id() {
        let tracker = Arc::new(RequestTracker::new(Duration::from_secs(5)));
        let transport = Arc::new(SilentTransport::default());
        let iq = Iq::get(None, Element::new("query"));
        let reply = iq.reply(IqKind::Result, Some(Element::new("answer")));

        let waiter = {
            let tracker = Arc::clone(&tracker);
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { tracker.request(transport.as_ref(), iq).await })
        };
        while tracker.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(tracker.resolve(reply));

        let response = waiter.await.unwrap().unwrap();
        assert_eq!(response.payload.unwrap().name, "answer");
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_releases_pending_state() {
        let tracker = RequestTracker::new(Duration::from_secs(10));
        let transport = SilentTransport::default();
        let iq = Iq::get(None, Element::new("query"));
        let id = iq.id.clone();

        let err = tracker.request(&transport, iq).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout { request_id } if request_id == id));
        assert_eq!(tracker.pending_count(), 0);
        assert!(!tracker.resolve(Iq {
            id,
            from: None,
            to: None,
            kind: IqKind::Result,
            payload: None,
        }));
    }

    #[tokio::test]
    async fn error_response_is_remote_error() {
        let tracker = Arc::new(RequestTracker::default());
        let transport = Arc::new(SilentTransport::default());
        let iq = Iq::get(None, Element::new("query"));
        let reply = iq.reply(
            IqKind::Error {
                condition: "item-not-found".into(),
            },
            None,
        );

        let waiter = {
            let tracker = Arc::clone(&tracker);
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { tracker.request(transport.as_ref(), iq).await })
        };
        while tracker.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        tracker.resolve(reply);
        assert!(waiter.await.unwrap().unwrap_err().is_item_not_found());
    }

    #[tokio::test]
    async fn cancel_all_wakes_waiters() {
        let tracker = Arc::new(RequestTracker::default());
        let transport = Arc::new(SilentTransport::default());
        let waiter = {
            let tracker = Arc::clone(&tracker);
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                tracker
                    .request(transport.as_ref(), Iq::get(None, Element::new("query")))
                    .await
            })
        };
        while tracker.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        tracker.cancel_all();
        assert!(matches!(waiter.await.unwrap(), Err(ProtocolError::Cancelled)));
    }

    #[tokio::test]
    async fn closed_tracker_refuses_new_requests() {
        let tracker = RequestTracker::new(Duration::from_secs(30));
        let transport = SilentTransport::default();
        tracker.close();
        assert!(tracker.is_closed());

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            tracker.request(&transport, Iq::get(None, Element::new("query"))),
        )
        .await
        .expect("a closed tracker answers at once");
        assert!(matches!(result, Err(ProtocolError::Cancelled)));
        assert!(transport.sent.lock().is_empty());
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn send_failure_leaves_nothing_pending() {
        let tracker = RequestTracker::default();
        let err = tracker
            .request(&BrokenTransport, Iq::get(None, Element::new("query")))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Transport(_)));
        assert_eq!(tracker.pending_count(), 0);
    }
}
