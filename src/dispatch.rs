//! OSC envelope → viewer event dispatch (spec §4.3, §6.2).
//!
//! Pure lookup and transform: no I/O, no protocol knowledge. The registry
//! is frozen by [`crate::manager::ConnectionManager`] after the first
//! connection is accepted (spec §4.7, §9).

use crate::osc::Envelope;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A structured message derived from an OSC envelope, forwarded to the
/// client as a `viewer` WsMessage.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewerEvent {
    pub kind: String,
    pub payload: Value,
}

pub type OscHandler = Arc<dyn Fn(&Envelope) -> Option<ViewerEvent> + Send + Sync>;

/// Registry mapping OSC numeric code to handler.
#[derive(Default, Clone)]
pub struct OscDispatcher {
    handlers: HashMap<u16, OscHandler>,
}

impl OscDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `code`. Registering a second handler for the
    /// same code is a programmer error and panics, matching the spec's
    /// "idempotent at registration time ... second handler is a programmer
    /// error" contract.
    pub fn register(&mut self, code: u16, handler: OscHandler) {
        if self.handlers.insert(code, handler).is_some() {
            panic!("duplicate OSC handler registered for code {code}");
        }
    }

    /// Look up and invoke the handler for `envelope.code`. An unknown code
    /// returns `None`; callers are responsible for any unknown-code
    /// telemetry.
    pub fn dispatch(&self, envelope: &Envelope) -> Option<ViewerEvent> {
        self.handlers.get(&envelope.code).and_then(|h| h(envelope))
    }

    pub fn is_registered(&self, code: u16) -> bool {
        self.handlers.contains_key(&code)
    }
}

/// Parse an OSC 1337 payload of the form `Key=Value` (or bare `Key`) into a
/// viewer event. Known keys: `ViewImage`, `ViewVideo`, `ViewMarkdown`,
/// `ViewHtml`, `ViewLog`, `ViewCert`, `QuerySQL`, `HTTPRequest`, `JWT`.
pub fn handle_1337(envelope: &Envelope) -> Option<ViewerEvent> {
    let (key, value) = split_kv(&envelope.payload);
    let kind = match key {
        "ViewImage" => "image",
        "ViewVideo" => "video",
        "ViewMarkdown" => "markdown",
        "ViewHtml" => "html",
        "ViewLog" => "log",
        "ViewCert" => "cert",
        "QuerySQL" => "sql",
        "HTTPRequest" => "http-request",
        "JWT" => "jwt",
        _ => return None,
    };
    let payload = match value {
        Some(path) => serde_json::json!({ "path": path }),
        None => serde_json::json!({}),
    };
    Some(ViewerEvent {
        kind: kind.to_string(),
        payload,
    })
}

/// Parse an OSC 1338 payload for the ebook viewer (`ViewEbook=<path>`).
pub fn handle_1338(envelope: &Envelope) -> Option<ViewerEvent> {
    let (key, value) = split_kv(&envelope.payload);
    if key != "ViewEbook" {
        return None;
    }
    Some(ViewerEvent {
        kind: "ebook".to_string(),
        payload: serde_json::json!({ "path": value.unwrap_or_default() }),
    })
}

fn split_kv(payload: &str) -> (&str, Option<&str>) {
    match payload.split_once('=') {
        Some((k, v)) => (k, Some(v)),
        None => (payload, None),
    }
}

/// Build the dispatcher with the known-code registrations from spec §6.2.
/// Collaborators (e.g. the ebook viewer) may add further codes via
/// [`OscDispatcher::register`] before the first connection is accepted.
pub fn default_dispatcher() -> OscDispatcher {
    let mut d = OscDispatcher::new();
    d.register(1337, Arc::new(handle_1337));
    d.register(1338, Arc::new(handle_1338));
    d
}
