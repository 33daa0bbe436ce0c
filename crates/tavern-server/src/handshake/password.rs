//! Shared-password handshake.
//!
//! The client opens with one JSON payload:
//!
//! ```json
//! {"name": "Aria", "version": "1.4.0", "password": "hunter2"}
//! ```
//!
//! and the server answers with `{"code": "ok"}` or
//! `{"code": "error", "message": "..."}` before admitting or dropping it.
//! Versions must match exactly unless either side is a development build.
//! Player names are unique per server, compared case-insensitively.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tavern_core::constants::DEVELOPMENT_VERSION;
use tracing::debug;

use super::{Handshake, HandshakeProvider};
use crate::connection::Connection;
use crate::errors::HandshakeFailure;

/// Client's opening message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Player name.
    pub name: String,
    /// Client version.
    pub version: String,
    /// Shared server password.
    pub password: String,
}

/// Outcome code in [`HandshakeResponse`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseCode {
    /// Admitted.
    Ok,
    /// Refused; see the message.
    Error,
}

/// Server's reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Outcome.
    pub code: ResponseCode,
    /// Reason for a refusal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HandshakeResponse {
    /// Admission reply.
    pub fn ok() -> Self {
        Self {
            code: ResponseCode::Ok,
            message: None,
        }
    }

    /// Refusal reply.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: ResponseCode::Error,
            message: Some(message.into()),
        }
    }
}

type NameCheck = Arc<dyn Fn(&str) -> bool + Send + Sync>;

struct Player {
    name: String,
    conn: Weak<dyn Connection>,
}

// Admitted players keyed by connection id. Entries whose connection has died
// are ignored and pruned on the next lookup.
#[derive(Default)]
struct Roster {
    players: HashMap<String, Player>,
}

impl Roster {
    fn prune(&mut self) {
        self.players
            .retain(|_, p| p.conn.upgrade().is_some_and(|c| c.is_alive()));
    }

    fn is_taken(&mut self, name: &str) -> bool {
        self.prune();
        let wanted = name.to_lowercase();
        self.players
            .values()
            .any(|p| p.name.to_lowercase() == wanted)
    }
}

/// Provider for [`HandshakeRequest`]-based admission.
#[derive(Clone)]
pub struct PasswordHandshakeProvider {
    password: Arc<str>,
    version: Arc<str>,
    roster: Arc<Mutex<Roster>>,
    name_taken: Option<NameCheck>,
}

impl PasswordHandshakeProvider {
    /// Accept clients presenting `password` at a compatible `version`.
    pub fn new(password: impl Into<Arc<str>>, version: impl Into<Arc<str>>) -> Self {
        Self {
            password: password.into(),
            version: version.into(),
            roster: Arc::new(Mutex::new(Roster::default())),
            name_taken: None,
        }
    }

    /// Also refuse names for which `check` returns `true`.
    #[must_use]
    pub fn with_name_check(mut self, check: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.name_taken = Some(Arc::new(check));
        self
    }

    /// Name the player on `conn_id` presented, if admitted and still alive.
    pub fn player_name(&self, conn_id: &str) -> Option<String> {
        let mut roster = self.roster.lock();
        roster.prune();
        roster.players.get(conn_id).map(|p| p.name.clone())
    }

    /// Names of the players currently admitted.
    pub fn player_names(&self) -> Vec<String> {
        let mut roster = self.roster.lock();
        roster.prune();
        let mut names: Vec<_> = roster.players.values().map(|p| p.name.clone()).collect();
        names.sort();
        names
    }

    fn evaluate(&self, request: &HandshakeRequest) -> Result<(), String> {
        if request.password != *self.password {
            return Err("wrong password".to_string());
        }
        if !versions_compatible(&request.version, &self.version) {
            return Err(format!(
                "client version {} does not match server version {}",
                request.version, self.version
            ));
        }
        let name = request.name.trim();
        if name.is_empty() {
            return Err("player name must not be empty".to_string());
        }
        if self.name_taken.as_ref().is_some_and(|check| check(name)) {
            return Err(format!("player name '{name}' is already in use"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for PasswordHandshakeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordHandshakeProvider")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Whether a client at `client` may join a server at `server`.
pub fn versions_compatible(client: &str, server: &str) -> bool {
    client == server || client == DEVELOPMENT_VERSION || server == DEVELOPMENT_VERSION
}

impl HandshakeProvider for PasswordHandshakeProvider {
    fn get_connection_handshake(&self, conn: &Arc<dyn Connection>) -> Box<dyn Handshake> {
        Box::new(PasswordHandshake {
            provider: self.clone(),
            conn: Arc::downgrade(conn),
        })
    }
}

struct PasswordHandshake {
    provider: PasswordHandshakeProvider,
    conn: Weak<dyn Connection>,
}

impl PasswordHandshake {
    fn conn(&self) -> Result<Arc<dyn Connection>, HandshakeFailure> {
        self.conn.upgrade().ok_or(HandshakeFailure::Disconnected)
    }

    fn reply(conn: &Arc<dyn Connection>, response: &HandshakeResponse) -> Result<(), HandshakeFailure> {
        let body = serde_json::to_vec(response)
            .map_err(|e| HandshakeFailure::Protocol(e.to_string()))?;
        conn.send(None, Bytes::from(body))
            .map_err(|_| HandshakeFailure::Disconnected)
    }
}

#[async_trait]
impl Handshake for PasswordHandshake {
    async fn perform(&mut self) -> Result<(), HandshakeFailure> {
        let conn = self.conn()?;
        let Some(raw) = conn.recv().await else {
            return Err(HandshakeFailure::Disconnected);
        };

        let request: HandshakeRequest = match serde_json::from_slice(&raw) {
            Ok(request) => request,
            Err(e) => {
                let _ = Self::reply(&conn, &HandshakeResponse::error("malformed handshake"));
                return Err(HandshakeFailure::Protocol(e.to_string()));
            }
        };

        // Check and claim the name under one lock.
        let verdict = {
            let mut roster = self.provider.roster.lock();
            let verdict = self.provider.evaluate(&request).and_then(|()| {
                if roster.is_taken(request.name.trim()) {
                    Err(format!("player name '{}' is already in use", request.name.trim()))
                } else {
                    Ok(())
                }
            });
            if verdict.is_ok() {
                let _ = roster.players.insert(
                    conn.id().to_owned(),
                    Player {
                        name: request.name.trim().to_owned(),
                        conn: Arc::downgrade(&conn),
                    },
                );
            }
            verdict
        };

        match verdict {
            Ok(()) => {
                Self::reply(&conn, &HandshakeResponse::ok())?;
                debug!(conn_id = conn.id(), player = %request.name, "password handshake accepted");
                Ok(())
            }
            Err(reason) => {
                let _ = Self::reply(&conn, &HandshakeResponse::error(reason.clone()));
                Err(HandshakeFailure::Rejected(reason))
            }
        }
    }
}
