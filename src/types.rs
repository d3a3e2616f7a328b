//! Call identities and entity handles
//!
//! A call is identified by `(AppId, CallId)`, both opaque strings. Entity
//! handles (`DialogId`, `MsgId`, `TransactionId`) embed that pair so a
//! handle alone is enough to route a request to the owning shard. Handles
//! render to a textual form (`D_<tag>@<call>/<app>` and friends) and parse
//! back with `from_handle`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{RouterError, RouterResult};

/// Application identifier (opaque string)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(String);

impl AppId {
    /// Create an application ID
    pub fn new<S: Into<String>>(s: S) -> Self {
        Self(s.into())
    }

    /// View as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SIP Call-ID (opaque string, globally unique per SIP semantics)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Create a call ID from an existing value
    pub fn new<S: Into<String>>(s: S) -> Self {
        Self(s.into())
    }

    /// Generate a fresh locally-unique call ID for this deployment
    pub fn random(global_id: &str) -> Self {
        Self(format!("{}@{}", uuid::Uuid::new_v4().simple(), global_id))
    }

    /// View as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry key: the `(application, call)` pair a worker is bound to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallKey {
    /// Owning application
    pub app: AppId,
    /// Call identifier
    pub call: CallId,
}

impl CallKey {
    /// Build a key from its parts
    pub fn new(app: AppId, call: CallId) -> Self {
        Self { app, call }
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app, self.call)
    }
}

/// Generate a short entity tag
fn fresh_tag() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

/// Parse `<prefix><tag>@<call>/<app>` back into its parts.
///
/// Tags are router-generated tokens and never contain `@`; the application
/// component is taken from the last `/` so call IDs may contain both.
fn parse_handle(prefix: &str, s: &str) -> RouterResult<(String, CallId, AppId)> {
    let invalid = || RouterError::InvalidCall(s.to_string());
    let rest = s.strip_prefix(prefix).ok_or_else(invalid)?;
    let (left, app) = rest.rsplit_once('/').ok_or_else(invalid)?;
    let (tag, call) = left.split_once('@').ok_or_else(invalid)?;
    if tag.is_empty() || call.is_empty() || app.is_empty() {
        return Err(invalid());
    }
    Ok((tag.to_string(), CallId::new(call), AppId::new(app)))
}

macro_rules! entity_handle {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name {
            /// Owning application
            pub app: AppId,
            /// Owning call
            pub call: CallId,
            /// Entity tag, unique within the call
            pub tag: String,
        }

        impl $name {
            /// Create a handle with a fresh tag
            pub fn generate(app: AppId, call: CallId) -> Self {
                Self {
                    app,
                    call,
                    tag: fresh_tag(),
                }
            }

            /// Parse the textual handle form
            pub fn from_handle(s: &str) -> RouterResult<Self> {
                let (tag, call, app) = parse_handle($prefix, s)?;
                Ok(Self { app, call, tag })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}@{}/{}", $prefix, self.tag, self.call, self.app)
            }
        }
    };
}

entity_handle!(
    /// Dialog handle
    DialogId,
    "D_"
);
entity_handle!(
    /// SIP message handle
    MsgId,
    "M_"
);
entity_handle!(
    /// Transaction handle
    TransactionId,
    "T_"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_call_ids_are_unique() {
        let a = CallId::random("deploy1");
        let b = CallId::random("deploy1");
        assert_ne!(a, b);
        assert!(a.as_str().ends_with("@deploy1"));
    }

    #[test]
    fn test_dialog_handle_round_trip() {
        let dialog = DialogId::generate(AppId::new("app1"), CallId::new("abc@host"));
        let parsed = DialogId::from_handle(&dialog.to_string()).unwrap();
        assert_eq!(parsed, dialog);
    }

    #[test]
    fn test_malformed_handle_rejected() {
        assert!(matches!(
            DialogId::from_handle("not-a-handle"),
            Err(RouterError::InvalidCall(_))
        ));
        assert!(matches!(
            MsgId::from_handle("M_tag-without-call"),
            Err(RouterError::InvalidCall(_))
        ));
        // Wrong prefix for the type
        assert!(DialogId::from_handle("T_tag@call/app").is_err());
    }

    #[test]
    fn test_handle_with_at_in_call_id() {
        let msg = MsgId::generate(AppId::new("app1"), CallId::new("x@y@z"));
        let parsed = MsgId::from_handle(&msg.to_string()).unwrap();
        assert_eq!(parsed.call, msg.call);
    }
}
