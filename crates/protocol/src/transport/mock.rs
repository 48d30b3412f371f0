//! In-memory transport for testing.

use crate::error::{ErrorKind, Result};
use crate::messages::{Envelope, Request, Response};
use crate::transport::Transport;
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

type Responder = Box<dyn FnMut(&Request) -> Vec<Response> + Send>;

/// Scripted in-memory transport.
///
/// Every request sent is recorded and handed to the responder closure; each
/// response it returns is queued as an inbound frame carrying the request's
/// job id, in order. Returning an empty `Vec` leaves the request unanswered,
/// which is how tests provoke timeouts.
///
/// # Examples
///
/// ```
/// use picsmap_protocol::messages::{ChangesResponse, Request, Response};
/// use picsmap_protocol::transport::MockTransport;
///
/// let transport = MockTransport::new(|request| match request {
///     Request::ChangesSince { .. } => vec![Response::Changes(ChangesResponse::default())],
///     _ => vec![],
/// });
/// assert!(transport.requests().is_empty());
/// ```
pub struct MockTransport {
    name: String,
    responder: Mutex<Responder>,
    requests: Mutex<Vec<Request>>,
    inbound_tx: Mutex<Option<UnboundedSender<Envelope<Response>>>>,
    inbound_rx: AsyncMutex<UnboundedReceiver<Envelope<Response>>>,
}

impl MockTransport {
    pub fn new(responder: impl FnMut(&Request) -> Vec<Response> + Send + 'static) -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            name: "mock".to_string(),
            responder: Mutex::new(Box::new(responder)),
            requests: Mutex::new(Vec::new()),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: AsyncMutex::new(rx),
        }
    }

    /// A transport that answers every logon with `OK` and otherwise defers
    /// to `responder`.
    pub fn logged_on(mut responder: impl FnMut(&Request) -> Vec<Response> + Send + 'static) -> Self {
        Self::new(move |request| match request {
            Request::LogOnAnonymous => vec![Response::LoggedOn { result: "OK".to_string() }],
            Request::LogOff => vec![],
            other => responder(other),
        })
    }

    /// Snapshot of every request sent so far.
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().map(|guard| guard.clone()).unwrap_or_default()
    }

    /// Simulate the remote end closing the link.
    pub fn close(&self) {
        if let Ok(mut tx) = self.inbound_tx.lock() {
            tx.take();
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, frame: Envelope<Request>) -> Result<()> {
        // The panic here is DELIBERATE: a poisoned lock means a responder
        // panicked, and the test should fail loudly.
        let responses = {
            let mut responder = self.responder.lock().expect("mock responder panicked");
            responder(&frame.body)
        };
        self.requests.lock().expect("mock responder panicked").push(frame.body);
        let tx = self.inbound_tx.lock().expect("mock responder panicked");
        let Some(tx) = tx.as_ref() else {
            exn::bail!(ErrorKind::Closed);
        };
        for body in responses {
            // Receiver lives as long as `self`.
            let _ = tx.send(Envelope { job: frame.job, body });
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Envelope<Response>>> {
        Ok(self.inbound_rx.lock().await.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ChangesResponse, JobId};

    #[tokio::test]
    async fn test_responses_carry_job_id() {
        let transport = MockTransport::new(|_| {
            vec![
                Response::Changes(ChangesResponse::default()),
                Response::Changes(ChangesResponse::default()),
            ]
        });
        transport.send(Envelope { job: JobId(5), body: Request::LogOff }).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap().job, JobId(5));
        assert_eq!(transport.recv().await.unwrap().unwrap().job, JobId(5));
        assert_eq!(transport.requests(), vec![Request::LogOff]);
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let transport = MockTransport::new(|_| vec![]);
        transport.close();
        assert!(transport.recv().await.unwrap().is_none());
        let err = transport.send(Envelope { job: JobId(1), body: Request::LogOff }).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Closed));
    }
}
