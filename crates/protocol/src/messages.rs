//! Catalog wire model.
//!
//! Every frame travelling in either direction is an [`Envelope`] carrying the
//! [`JobId`] the response must be correlated with.

use crate::KeyValue;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifier of a product in the catalog.
pub type AppId = u32;
/// Identifier of a content package.
pub type DepotId = u32;
/// Position in the catalog's global change history.
pub type ChangeNumber = u32;

/// Correlation id pairing a request with its response(s).
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub job: JobId,
    pub body: T,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRequest {
    pub app_id: AppId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    LogOnAnonymous,
    LogOff,
    ChangesSince {
        since: ChangeNumber,
        send_app_changes: bool,
        send_package_changes: bool,
    },
    AccessTokens {
        apps: Vec<AppId>,
    },
    ProductInfo {
        apps: Vec<ProductRequest>,
    },
}

impl Request {
    /// Short label used in logs and timeout errors.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::LogOnAnonymous => "logon",
            Self::LogOff => "logoff",
            Self::ChangesSince { .. } => "changes since",
            Self::AccessTokens { .. } => "access tokens",
            Self::ProductInfo { .. } => "product info",
        }
    }
}

/// A single app entry of a change-feed response. Only the key is consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppChange {
    #[serde(default)]
    pub change_number: ChangeNumber,
    #[serde(default)]
    pub needs_token: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub current_change_number: ChangeNumber,
    pub last_change_number: ChangeNumber,
    #[serde(default)]
    pub requires_full_update: bool,
    #[serde(default)]
    pub requires_full_app_update: bool,
    #[serde(default)]
    pub app_changes: BTreeMap<AppId, AppChange>,
}

impl ChangesResponse {
    /// The feed cannot describe the requested range incrementally.
    pub fn requires_full(&self) -> bool {
        self.requires_full_update || self.requires_full_app_update
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokensResponse {
    #[serde(default)]
    pub app_tokens: BTreeMap<AppId, u64>,
    #[serde(default)]
    pub denied: Vec<AppId>,
}

/// One part of a (possibly multi-part) product-info answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfoPart {
    #[serde(default)]
    pub apps: BTreeMap<AppId, KeyValue>,
    #[serde(default)]
    pub unknown_apps: Vec<AppId>,
    /// More parts follow for the same job.
    #[serde(default)]
    pub response_pending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Response {
    LoggedOn { result: String },
    Changes(ChangesResponse),
    AccessTokens(AccessTokensResponse),
    ProductInfo(ProductInfoPart),
}

impl Response {
    /// `false` while further parts for the same job are still expected.
    pub fn is_final(&self) -> bool {
        match self {
            Self::ProductInfo(part) => !part.response_pending,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_frame_shape() {
        let frame = Envelope {
            job: JobId(7),
            body: Request::ChangesSince {
                since: 100,
                send_app_changes: true,
                send_package_changes: false,
            },
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "job": 7,
                "body": {
                    "type": "changes_since",
                    "since": 100,
                    "send_app_changes": true,
                    "send_package_changes": false
                }
            })
        );
    }

    #[test]
    fn test_product_info_frame_parses_with_defaults() {
        let raw = r#"{"job":3,"body":{"type":"product_info",
            "data":{"apps":{"10":{"common":{"name":"CS"}}},"response_pending":true}}}"#;
        let frame: Envelope<Response> = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.job, JobId(3));
        let Response::ProductInfo(part) = &frame.body else {
            panic!("expected product info, got {:?}", frame.body);
        };
        assert!(part.unknown_apps.is_empty());
        assert!(!frame.body.is_final());
        assert_eq!(part.apps[&10].path(["common", "name"]).and_then(KeyValue::as_str), Some("CS"));
    }

    #[test]
    fn test_requires_full() {
        let mut changes = ChangesResponse::default();
        assert!(!changes.requires_full());
        changes.requires_full_app_update = true;
        assert!(changes.requires_full());
    }
}
