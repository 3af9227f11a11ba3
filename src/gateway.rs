//! Room credentials from the backend authority.

use std::future::Future;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::SessionConfig;
use crate::signaling::RoomId;

/// Upper bound (exclusive) of the number appended to guest names
pub const GUEST_SUFFIX_RANGE: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Guest,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("backend request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Raw grant as the backend returns it
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomGrant {
    pub room_id: RoomId,
    pub nickname: String,
}

/// Credential for one session; fixed once issued
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomCredential {
    room: RoomId,
    display: String,
    role: Role,
}

impl RoomCredential {
    pub fn new(room: RoomId, display: impl Into<String>, role: Role) -> Self {
        Self {
            room,
            display: display.into(),
            role,
        }
    }

    pub fn room(&self) -> RoomId {
        self.room
    }

    pub fn display(&self) -> &str {
        &self.display
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

/// Whoever hands out rooms. One round trip, no retries.
pub trait RoomAuthority {
    fn request_room(&self, role: Role) -> impl Future<Output = Result<RoomGrant, GatewayError>> + Send;
}

/// `POST createRoom` / `POST joinRoom` against the backend
#[derive(Debug, Clone)]
pub struct HttpAuthority {
    base_url: String,
    bearer_token: Option<String>,
    http: reqwest::Client,
}

impl HttpAuthority {
    pub fn new(config: &SessionConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(config.backend_timeout)
            .build()?;
        Ok(Self {
            base_url: config.backend_url.trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token.clone(),
            http,
        })
    }
}

impl RoomAuthority for HttpAuthority {
    async fn request_room(&self, role: Role) -> Result<RoomGrant, GatewayError> {
        let path = match role {
            Role::Host => "/createRoom",
            Role::Guest => "/joinRoom",
        };

        let mut request = self.http.post(format!("{}{}", self.base_url, path));
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

/// Turns authority grants into session credentials.
#[derive(Debug, Clone)]
pub struct SessionGateway<A> {
    authority: A,
}

impl<A: RoomAuthority> SessionGateway<A> {
    pub fn new(authority: A) -> Self {
        Self { authority }
    }

    pub async fn request_room(&self, role: Role) -> Result<RoomCredential, GatewayError> {
        let grant = self.authority.request_room(role).await?;
        let name = match role {
            Role::Host => grant.nickname,
            Role::Guest => disambiguate(&grant.nickname),
        };
        info!("Room {} granted to {} ({:?})", grant.room_id, name, role);
        Ok(RoomCredential::new(grant.room_id, name, role))
    }
}

/// Append a random `_<n>` so two guests with the same nickname stay
/// apart on screen. Roster identity still comes from relay ids.
pub fn disambiguate(nickname: &str) -> String {
    let n = rand::rng().random_range(0..GUEST_SUFFIX_RANGE);
    format!("{}_{}", nickname, n)
}
