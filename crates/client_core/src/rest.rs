use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header::ACCEPT_LANGUAGE, Client};
use serde::Serialize;
use shared::{
    domain::{RoomId, RoomKey, UserId},
    protocol::{AiChatConfig, HistoryPage, MembershipStatus},
};

use crate::config::Settings;

/// Paged message history. Idempotent and safely retriable per page.
#[async_trait]
pub trait HistoryApi: Send + Sync {
    async fn fetch_page(&self, room: RoomKey, page: u32, page_size: u32) -> Result<HistoryPage>;
}

/// Out-of-band membership check for restricted rooms.
#[async_trait]
pub trait MembershipApi: Send + Sync {
    async fn check_membership(&self, user_id: UserId, room_id: RoomId) -> Result<bool>;
}

/// AI chat limits used for local precondition checks.
#[async_trait]
pub trait AiConfigApi: Send + Sync {
    async fn fetch_chat_config(&self) -> Result<AiChatConfig>;
}

/// Single reqwest-backed implementation of all three REST seams.
pub struct RestApi {
    http: Client,
    base_url: String,
    language: String,
}

impl RestApi {
    pub fn new(settings: &Settings) -> Self {
        Self {
            http: Client::new(),
            base_url: settings.server_url.trim_end_matches('/').to_string(),
            language: settings.language.clone(),
        }
    }
}

#[derive(Serialize)]
struct PageQuery {
    page: u32,
    limit: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MembershipQuery {
    user_id: i64,
}

#[async_trait]
impl HistoryApi for RestApi {
    async fn fetch_page(&self, room: RoomKey, page: u32, page_size: u32) -> Result<HistoryPage> {
        let response: HistoryPage = self
            .http
            .get(format!(
                "{}/rooms/{}/{}/messages",
                self.base_url,
                room.kind.as_str(),
                room.room_id.0
            ))
            .header(ACCEPT_LANGUAGE, &self.language)
            .query(&PageQuery {
                page,
                limit: page_size,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("invalid history page payload for room {room}"))?;
        Ok(response)
    }
}

#[async_trait]
impl MembershipApi for RestApi {
    async fn check_membership(&self, user_id: UserId, room_id: RoomId) -> Result<bool> {
        let status: MembershipStatus = self
            .http
            .get(format!("{}/clans/{}/membership", self.base_url, room_id.0))
            .query(&MembershipQuery { user_id: user_id.0 })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(status.is_member)
    }
}

#[async_trait]
impl AiConfigApi for RestApi {
    async fn fetch_chat_config(&self) -> Result<AiChatConfig> {
        let config: AiChatConfig = self
            .http
            .get(format!("{}/ai/config", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(config)
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
