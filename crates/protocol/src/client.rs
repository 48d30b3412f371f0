//! Typed catalog calls and session bootstrap.

use crate::dispatch::Dispatcher;
use crate::error::{ErrorKind, Result};
use crate::messages::{
    AccessTokensResponse, AppId, ChangeNumber, ChangesResponse, ProductInfoPart, ProductRequest, Request, Response,
};
use crate::transport::TransportHandle;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::instrument;

/// Timeouts applied to each kind of remote round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub login: Duration,
    /// Calls answered by a single response.
    pub call: Duration,
    /// Whole multi-part product-info exchange.
    pub product_info: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            login: Duration::from_secs(30),
            call: Duration::from_secs(5 * 60),
            product_info: Duration::from_secs(10 * 60),
        }
    }
}

/// Request surface of the catalog. Cheap to clone; every clone shares the
/// same dispatcher.
#[derive(Clone)]
pub struct CatalogClient {
    dispatcher: Dispatcher,
    timeouts: Timeouts,
}

impl CatalogClient {
    pub fn new(dispatcher: Dispatcher, timeouts: Timeouts) -> Self {
        Self { dispatcher, timeouts }
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Changes since `since`, with per-app change details.
    pub async fn changes_since(&self, since: ChangeNumber) -> Result<ChangesResponse> {
        let request = Request::ChangesSince {
            since,
            send_app_changes: true,
            send_package_changes: true,
        };
        match self.dispatcher.call(request, self.timeouts.call).await? {
            Response::Changes(changes) => Ok(changes),
            _ => exn::bail!(ErrorKind::UnexpectedResponse("changes since")),
        }
    }

    /// The catalog's current global change number.
    pub async fn current_change_number(&self) -> Result<ChangeNumber> {
        let request = Request::ChangesSince {
            since: 0,
            send_app_changes: false,
            send_package_changes: false,
        };
        match self.dispatcher.call(request, self.timeouts.call).await? {
            Response::Changes(changes) => Ok(changes.current_change_number),
            _ => exn::bail!(ErrorKind::UnexpectedResponse("changes since")),
        }
    }

    pub async fn access_tokens(&self, apps: &[AppId]) -> Result<AccessTokensResponse> {
        let request = Request::AccessTokens { apps: apps.to_vec() };
        match self.dispatcher.call(request, self.timeouts.call).await? {
            Response::AccessTokens(tokens) => Ok(tokens),
            _ => exn::bail!(ErrorKind::UnexpectedResponse("access tokens")),
        }
    }

    /// Product info for `apps`, collecting every part of the answer.
    pub async fn product_info(&self, apps: Vec<ProductRequest>) -> Result<Vec<ProductInfoPart>> {
        let request = Request::ProductInfo { apps };
        let responses = self.dispatcher.call_multi(request, self.timeouts.product_info).await?;
        responses
            .into_iter()
            .map(|response| match response {
                Response::ProductInfo(part) => Ok(part),
                _ => Err(exn::Exn::from(ErrorKind::UnexpectedResponse("product info"))),
            })
            .collect()
    }
}

/// A logged-on link to the catalog.
pub struct Session {
    client: CatalogClient,
    pump: JoinHandle<()>,
}

impl Session {
    /// Start pumping `transport` and log on anonymously.
    ///
    /// A failed or timed-out logon tears the pump down again before
    /// returning the error.
    #[instrument(skip_all, fields(transport = transport.name()))]
    pub async fn establish(transport: TransportHandle, timeouts: Timeouts) -> Result<Self> {
        let (dispatcher, pump) = Dispatcher::spawn(transport);
        let session = Self {
            client: CatalogClient::new(dispatcher, timeouts),
            pump,
        };
        match session.log_on().await {
            Ok(()) => Ok(session),
            Err(e) => {
                session.abort();
                Err(e)
            },
        }
    }

    async fn log_on(&self) -> Result<()> {
        tracing::info!("logging in anonymously");
        let response = self.client.dispatcher.call(Request::LogOnAnonymous, self.client.timeouts.login).await?;
        match response {
            Response::LoggedOn { result } if result.eq_ignore_ascii_case("ok") => {
                tracing::info!("logged in");
                Ok(())
            },
            Response::LoggedOn { result } => exn::bail!(ErrorKind::LogonFailed(result)),
            _ => exn::bail!(ErrorKind::UnexpectedResponse("logon")),
        }
    }

    pub fn client(&self) -> &CatalogClient {
        &self.client
    }

    /// Log off (best effort) and stop the pump.
    pub async fn close(self) {
        if let Err(e) = self.client.dispatcher.notify(Request::LogOff).await {
            let kind: &ErrorKind = &e;
            tracing::debug!(error = %kind, "logoff not delivered");
        }
        self.client.dispatcher.shutdown();
        let _ = self.pump.await;
        tracing::debug!("session closed");
    }

    fn abort(self) {
        self.client.dispatcher.shutdown();
        self.pump.abort();
    }
}
