//! Raw SIP message surface
//!
//! The router only reads class, method, and the `(app, call)` pair from a
//! message; everything else stays opaque and travels to the worker as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{AppId, CallId};

/// Message class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SipClass {
    /// A SIP request
    Request,
    /// A SIP response
    Response,
}

/// SIP request method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SipMethod {
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Register,
    Info,
    Update,
    Subscribe,
    Notify,
    Refer,
    Message,
    Prack,
    Publish,
    /// Extension method
    Other(String),
}

impl SipMethod {
    /// Whether a request with this method establishes a dialog
    pub fn creates_dialog(&self) -> bool {
        matches!(self, Self::Invite | Self::Subscribe | Self::Refer)
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(m) => write!(f, "{}", m.to_uppercase()),
            other => write!(f, "{}", format!("{:?}", other).to_uppercase()),
        }
    }
}

/// A raw SIP message as handed over by the transport layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSipMsg {
    /// Request or response
    pub class: SipClass,
    /// Application the transport resolved this message to
    pub app: AppId,
    /// Call-ID extracted from the message
    pub call: CallId,
    /// Request method (for responses: the method of the matched request)
    pub method: SipMethod,
    /// Response status code, when `class` is `Response`
    pub status: Option<u16>,
    /// Receive timestamp
    pub received_at: DateTime<Utc>,
    /// Undecoded remainder of the message
    pub payload: serde_json::Value,
}

impl RawSipMsg {
    /// Build an incoming request
    pub fn request(app: AppId, call: CallId, method: SipMethod, payload: serde_json::Value) -> Self {
        Self {
            class: SipClass::Request,
            app,
            call,
            method,
            status: None,
            received_at: Utc::now(),
            payload,
        }
    }

    /// Build an incoming response
    pub fn response(
        app: AppId,
        call: CallId,
        method: SipMethod,
        status: u16,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            class: SipClass::Response,
            app,
            call,
            method,
            status: Some(status),
            received_at: Utc::now(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialog_creating_methods() {
        assert!(SipMethod::Invite.creates_dialog());
        assert!(SipMethod::Subscribe.creates_dialog());
        assert!(!SipMethod::Options.creates_dialog());
        assert!(!SipMethod::Other("PING".to_string()).creates_dialog());
    }

    #[test]
    fn test_method_display() {
        assert_eq!(SipMethod::Invite.to_string(), "INVITE");
        assert_eq!(SipMethod::Other("ping".to_string()).to_string(), "PING");
    }

    #[test]
    fn test_response_carries_status() {
        let msg = RawSipMsg::response(
            AppId::new("app1"),
            CallId::new("c1"),
            SipMethod::Invite,
            200,
            serde_json::json!({}),
        );
        assert_eq!(msg.class, SipClass::Response);
        assert_eq!(msg.status, Some(200));
    }
}
