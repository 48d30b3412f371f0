//! Correlation-id keyed request table.
//!
//! A single pump task owns the receiving half of the [`Transport`] and
//! resolves pending requests as their responses arrive. Callers suspend on a
//! channel with a per-call timeout instead of polling a callback queue, so the
//! main flow can wait on a request while the pump keeps draining the link.

use crate::error::{ErrorKind, Result};
use crate::messages::{Envelope, JobId, Request, Response};
use crate::transport::TransportHandle;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

enum Pending {
    Single(oneshot::Sender<Result<Response>>),
    Multi(mpsc::UnboundedSender<Result<Response>>),
}

impl Pending {
    fn fail(self, kind: impl FnOnce() -> ErrorKind) {
        // Nobody listening means the caller already gave up.
        let _ = match self {
            Self::Single(tx) => tx.send(Err(exn::Exn::from(kind()))).map_err(|_| ()),
            Self::Multi(tx) => tx.send(Err(exn::Exn::from(kind()))).map_err(|_| ()),
        };
    }
}

struct Inner {
    transport: TransportHandle,
    pending: Mutex<HashMap<JobId, Pending>>,
    next_job: AtomicU64,
    shutdown: CancellationToken,
}

/// Handle for issuing correlated requests. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Spawn the pump task for `transport` and return the request handle.
    pub fn spawn(transport: TransportHandle) -> (Self, JoinHandle<()>) {
        let inner = Arc::new(Inner {
            transport,
            pending: Mutex::new(HashMap::new()),
            next_job: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });
        let pump = tokio::spawn(pump(inner.clone()));
        (Self { inner }, pump)
    }

    /// Stop the pump. Outstanding and future calls fail with
    /// [`Closed`](ErrorKind::Closed).
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Fire a request that expects no answer.
    pub async fn notify(&self, request: Request) -> Result<()> {
        let job = self.next_job();
        self.inner.transport.send(Envelope { job, body: request }).await
    }

    /// Issue a request answered by exactly one response.
    pub async fn call(&self, request: Request, timeout: Duration) -> Result<Response> {
        let operation = request.operation();
        let job = self.next_job();
        let (tx, rx) = oneshot::channel();
        self.send_registered(job, Pending::Single(tx), request).await?;

        let outcome = tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(exn::Exn::from(ErrorKind::Closed)),
            res = tokio::time::timeout(timeout, rx) => match res {
                Ok(Ok(response)) => response,
                Ok(Err(_dropped)) => Err(exn::Exn::from(ErrorKind::Closed)),
                Err(_elapsed) => Err(exn::Exn::from(ErrorKind::Timeout { operation, after: timeout })),
            },
        };
        if outcome.is_err() {
            self.remove_pending(job).await;
        }
        outcome
    }

    /// Issue a request that may be answered in several parts, draining parts
    /// until one reports that nothing more is pending. `timeout` bounds the
    /// whole exchange, not each part.
    pub async fn call_multi(&self, request: Request, timeout: Duration) -> Result<Vec<Response>> {
        let operation = request.operation();
        let job = self.next_job();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.send_registered(job, Pending::Multi(tx), request).await?;

        let outcome = tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(exn::Exn::from(ErrorKind::Closed)),
            res = tokio::time::timeout(timeout, drain_parts(&mut rx)) => match res {
                Ok(parts) => parts,
                Err(_elapsed) => Err(exn::Exn::from(ErrorKind::Timeout { operation, after: timeout })),
            },
        };
        // Multi-part entries are only removed by the pump on the final part,
        // so clean up unconditionally.
        self.remove_pending(job).await;
        outcome
    }

    fn next_job(&self) -> JobId {
        JobId(self.inner.next_job.fetch_add(1, Ordering::Relaxed))
    }

    async fn send_registered(&self, job: JobId, pending: Pending, request: Request) -> Result<()> {
        if self.is_shutdown() {
            exn::bail!(ErrorKind::Closed);
        }
        self.inner.pending.lock().await.insert(job, pending);
        tracing::trace!(%job, operation = request.operation(), "sending request");
        if let Err(e) = self.inner.transport.send(Envelope { job, body: request }).await {
            self.remove_pending(job).await;
            return Err(e);
        }
        Ok(())
    }

    async fn remove_pending(&self, job: JobId) {
        self.inner.pending.lock().await.remove(&job);
    }

    #[cfg(test)]
    async fn pending_len(&self) -> usize {
        self.inner.pending.lock().await.len()
    }
}

async fn drain_parts(rx: &mut mpsc::UnboundedReceiver<Result<Response>>) -> Result<Vec<Response>> {
    let mut parts = Vec::new();
    while let Some(part) = rx.recv().await {
        let part = part?;
        let last = part.is_final();
        parts.push(part);
        if last {
            return Ok(parts);
        }
    }
    exn::bail!(ErrorKind::Closed)
}

async fn pump(inner: Arc<Inner>) {
    let reason = loop {
        let frame = tokio::select! {
            _ = inner.shutdown.cancelled() => break None,
            frame = inner.transport.recv() => frame,
        };
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break Some("link closed by remote"),
            Err(e) => {
                let kind: &ErrorKind = &e;
                tracing::warn!(transport = inner.transport.name(), error = %kind, "inbound link failed");
                break Some("inbound link failed");
            },
        };
        route(&inner, frame).await;
    };
    if let Some(reason) = reason {
        tracing::debug!(transport = inner.transport.name(), reason, "dispatch pump stopped");
    }
    inner.shutdown.cancel();
    let pending = std::mem::take(&mut *inner.pending.lock().await);
    for (_job, entry) in pending {
        entry.fail(|| ErrorKind::Closed);
    }
}

async fn route(inner: &Inner, frame: Envelope<Response>) {
    let Envelope { job, body } = frame;
    let mut pending = inner.pending.lock().await;
    match pending.remove(&job) {
        Some(Pending::Single(tx)) => {
            let _ = tx.send(Ok(body));
        },
        Some(Pending::Multi(tx)) => {
            let last = body.is_final();
            if tx.send(Ok(body)).is_ok() && !last {
                pending.insert(job, Pending::Multi(tx));
            }
        },
        None => tracing::debug!(%job, "dropping response for unknown job"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ChangesResponse, ProductInfoPart};
    use crate::transport::MockTransport;

    fn changes(current: u32) -> Response {
        Response::Changes(ChangesResponse {
            current_change_number: current,
            ..ChangesResponse::default()
        })
    }

    fn part(pending: bool) -> Response {
        Response::ProductInfo(ProductInfoPart {
            response_pending: pending,
            ..ProductInfoPart::default()
        })
    }

    fn product_info() -> Request {
        Request::ProductInfo { apps: vec![] }
    }

    #[tokio::test]
    async fn test_call_resolves_matching_job() {
        let transport = Arc::new(MockTransport::new(|_| vec![changes(42)]));
        let (dispatcher, _pump) = Dispatcher::spawn(transport);
        let request = Request::ChangesSince {
            since: 0,
            send_app_changes: false,
            send_package_changes: false,
        };
        let response = dispatcher.call(request, Duration::from_secs(5)).await.unwrap();
        assert_eq!(response, changes(42));
        assert_eq!(dispatcher.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_multi_part_drains_until_final() {
        let transport = Arc::new(MockTransport::new(|_| vec![part(true), part(true), part(false)]));
        let (dispatcher, _pump) = Dispatcher::spawn(transport);
        let parts = dispatcher.call_multi(product_info(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(parts.len(), 3);
        assert!(parts.last().unwrap().is_final());
        assert_eq!(dispatcher.pending_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out_and_forgets_job() {
        let transport = Arc::new(MockTransport::new(|_| vec![]));
        let (dispatcher, _pump) = Dispatcher::spawn(transport);
        let err = dispatcher.call(Request::AccessTokens { apps: vec![1] }, Duration::from_secs(300)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Timeout { operation: "access tokens", .. }));
        assert_eq!(dispatcher.pending_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_part_times_out_when_parts_stop() {
        let transport = Arc::new(MockTransport::new(|_| vec![part(true)]));
        let (dispatcher, _pump) = Dispatcher::spawn(transport);
        let err = dispatcher.call_multi(product_info(), Duration::from_secs(600)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Timeout { operation: "product info", .. }));
        assert_eq!(dispatcher.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_closed_link_fails_outstanding_calls() {
        let transport = Arc::new(MockTransport::new(|_| vec![]));
        let (dispatcher, pump) = Dispatcher::spawn(transport.clone());
        let waiting = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .call(Request::AccessTokens { apps: vec![] }, Duration::from_secs(60))
                    .await
            })
        };
        // Let the request register before the link goes away.
        while transport.requests().is_empty() {
            tokio::task::yield_now().await;
        }
        transport.close();
        pump.await.unwrap();
        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(&*err, ErrorKind::Closed));
        assert!(dispatcher.is_shutdown());
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_not_crossed() {
        let transport = Arc::new(MockTransport::new(|request| match request {
            Request::ChangesSince { since, .. } => vec![changes(*since)],
            _ => vec![],
        }));
        let (dispatcher, _pump) = Dispatcher::spawn(transport);
        let calls = (0..20u32).map(|since| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let request = Request::ChangesSince { since, send_app_changes: true, send_package_changes: false };
                (since, dispatcher.call(request, Duration::from_secs(5)).await.unwrap())
            })
        });
        for call in calls {
            let (since, response) = call.await.unwrap();
            assert_eq!(response, changes(since));
        }
    }
}
