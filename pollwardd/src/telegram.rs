//! Bot API long-poll source
use async_trait::async_trait;
use pollward::api::{unix_millis, ContentType, WorkRecord};
use pollward::supervisor::{BoxError, PolledUpdate, UpdateSource};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Upper bound of updates returned by one `getUpdates` call
const BATCH_LIMIT: u32 = 100;

#[derive(Error, Debug)]
pub enum TelegramError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("api error {code}: {description}")]
    Api { code: i64, description: String },
}

#[derive(Deserialize, Debug)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize, Debug)]
struct Update {
    update_id: u64,
    message: Option<Message>,
}

#[derive(Deserialize, Debug)]
struct Message {
    date: i64,
    chat: Chat,
    from: Option<User>,
    text: Option<String>,
    voice: Option<Voice>,
}

#[derive(Deserialize, Debug)]
struct Chat {
    id: i64,
}

#[derive(Deserialize, Debug)]
struct User {
    id: i64,
}

#[derive(Deserialize, Debug)]
struct Voice {
    file_id: String,
}

impl Update {
    /// Commands and unsupported content are acknowledged but not queued
    fn into_polled(self) -> PolledUpdate {
        let update_id = self.update_id;
        let work = self.message.and_then(|message| {
            let user_id = message
                .from
                .as_ref()
                .map(|user| user.id)
                .unwrap_or(message.chat.id)
                .to_string();
            let (content_type, text, media_link) = match (message.text, message.voice) {
                (Some(text), _) if text.starts_with('/') => return None,
                (Some(text), _) => (ContentType::Text, Some(text), None),
                (None, Some(voice)) => (ContentType::Voice, None, Some(voice.file_id)),
                (None, None) => return None,
            };
            Some(WorkRecord {
                content_type,
                update_id,
                user_id,
                source_timestamp: message.date,
                received_timestamp_ms: unix_millis(),
                text,
                media_link,
                class_id: None,
            })
        });
        PolledUpdate { update_id, work }
    }
}

pub struct TelegramSource {
    http: reqwest::Client,
    url: String,
    poll_timeout: Duration,
}

impl TelegramSource {
    pub fn new(api_url: &str, token: &str, poll_timeout: Duration) -> Result<Self, TelegramError> {
        // the long poll itself must not trip the client timeout
        let http = reqwest::Client::builder()
            .timeout(poll_timeout + Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            url: format!("{}/bot{token}/getUpdates", api_url.trim_end_matches('/')),
            poll_timeout,
        })
    }

    async fn get_updates(&self, from: u64) -> Result<Vec<Update>, TelegramError> {
        trace!(from, "getUpdates");
        let response: ApiResponse = self
            .http
            .post(&self.url)
            .json(&serde_json::json!({
                "offset": from,
                "timeout": self.poll_timeout.as_secs(),
                "limit": BATCH_LIMIT,
                "allowed_updates": ["message"],
            }))
            .send()
            .await?
            .json()
            .await?;

        if !response.ok {
            return Err(TelegramError::Api {
                code: response.error_code,
                description: response.description,
            });
        }
        Ok(response.result)
    }
}

#[async_trait]
impl UpdateSource for TelegramSource {
    async fn poll(&self, from: u64) -> Result<Vec<PolledUpdate>, BoxError> {
        let updates = self.get_updates(from).await?;
        if !updates.is_empty() {
            debug!(from, count = updates.len(), "Updates received");
        }
        Ok(updates.into_iter().map(Update::into_polled).collect())
    }
}
