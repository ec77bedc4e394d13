//! Transport negotiation: connection slot allocation, origin and bearer
//! checks.

use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use rand::RngCore;
use tracing::debug;

use strand_protocol::{AvailableTransport, NegotiateResponse, TransferFormat};

use crate::config::{AuthConfig, Config};

/// Generate a fresh URL-safe connection id or token: 16 random bytes,
/// base64url without padding.
#[must_use]
pub fn new_connection_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

struct PendingSlot {
    connection_id: String,
    created_at: Instant,
}

/// Connection slots issued by negotiate and not yet claimed by a transport.
///
/// Slots are single-use and expire after the configured TTL; an expired or
/// already-claimed token looks exactly like an unknown one.
pub struct NegotiateSlots {
    pending: DashMap<String, PendingSlot>,
    ttl: Duration,
}

impl NegotiateSlots {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            ttl,
        }
    }

    /// Allocate a slot and build the negotiate response for it.
    ///
    /// With `negotiate_version >= 1` a distinct connection token is issued
    /// and used as the slot key; otherwise the connection id doubles as the
    /// token.
    #[must_use]
    pub fn allocate(&self, negotiate_version: u32) -> NegotiateResponse {
        self.sweep();

        let connection_id = new_connection_id();
        let connection_token = (negotiate_version >= 1).then(new_connection_id);
        let slot_key = connection_token
            .clone()
            .unwrap_or_else(|| connection_id.clone());

        self.pending.insert(
            slot_key,
            PendingSlot {
                connection_id: connection_id.clone(),
                created_at: Instant::now(),
            },
        );
        debug!(connection = %connection_id, "negotiated connection slot");

        NegotiateResponse {
            connection_id,
            connection_token,
            negotiate_version: negotiate_version.min(1),
            available_transports: available_transports(),
        }
    }

    /// Claim the slot for a transport request. Consumes the slot; returns
    /// the connection id, or `None` for unknown, expired, or reused tokens.
    #[must_use]
    pub fn claim(&self, token: &str) -> Option<String> {
        let (_, slot) = self.pending.remove(token)?;
        if slot.created_at.elapsed() > self.ttl {
            debug!(connection = %slot.connection_id, "connection token expired");
            return None;
        }
        Some(slot.connection_id)
    }

    fn sweep(&self) {
        let ttl = self.ttl;
        self.pending
            .retain(|_, slot| slot.created_at.elapsed() <= ttl);
    }
}

/// The transports this server offers, WebSockets first.
#[must_use]
pub fn available_transports() -> Vec<AvailableTransport> {
    vec![
        AvailableTransport {
            transport: "WebSockets".to_owned(),
            transfer_formats: vec![
                TransferFormat::Text.as_str().to_owned(),
                TransferFormat::Binary.as_str().to_owned(),
            ],
        },
        AvailableTransport {
            transport: "ServerSentEvents".to_owned(),
            transfer_formats: vec![TransferFormat::Text.as_str().to_owned()],
        },
    ]
}

/// Check the `Origin` header against the configured allow patterns.
///
/// Patterns match the whole origin or just its host; `*` allows anything.
/// Requests without an `Origin` header (non-browser clients) pass.
#[must_use]
pub fn origin_allowed(config: &Config, origin: Option<&str>) -> bool {
    if config.insecure_skip_verify {
        return true;
    }
    let Some(origin) = origin else {
        return true;
    };

    let host = url::Url::parse(origin)
        .ok()
        .and_then(|url| url.host_str().map(str::to_owned));

    config.allowed_origin_patterns.iter().any(|pattern| {
        if pattern == "*" {
            return true;
        }
        let Ok(pattern) = glob::Pattern::new(pattern) else {
            return false;
        };
        pattern.matches(origin) || host.as_deref().is_some_and(|host| pattern.matches(host))
    })
}

/// Check a static bearer token, from the `Authorization` header or the
/// `access_token` query parameter.
#[must_use]
pub fn bearer_authorized(
    auth: &AuthConfig,
    authorization_header: Option<&str>,
    access_token: Option<&str>,
) -> bool {
    if !auth.enabled {
        return true;
    }
    let presented = authorization_header
        .and_then(|value| value.strip_prefix("Bearer "))
        .or(access_token);
    match presented {
        Some(token) => constant_time_eq(token.as_bytes(), auth.token.as_bytes()),
        None => false,
    }
}

/// Constant-time byte comparison: the whole input is always scanned so the
/// comparison time does not depend on where a mismatch occurs.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut difference = 0u8;
    for (x, y) in a.iter().zip(b) {
        difference |= x ^ y;
    }
    difference == 0
}
