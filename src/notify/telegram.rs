//! Telegram Bot API sink and `/vaults` command listener.
//!
//! ```text
//!   Notifier ──► dispatcher ──► TelegramSink.deliver() ──► sendMessage
//!
//!   getUpdates (long poll) ──► "/vaults" ──► LiveVaultService ──► sendMessage
//! ```

use crate::chain::ChainReader;
use crate::notify::{format, NotificationSink, NotifyError, VaultEvent};
use crate::query::LiveVaultService;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Telegram rejects messages above 4096 characters.
const MAX_MESSAGE_CHARS: usize = 4000;
const LONG_POLL_SECS: u64 = 25;

fn api_base(bot_token: &str) -> String {
    format!("https://api.telegram.org/bot{}", bot_token)
}

/// Split on line boundaries so each chunk fits in one message. A single
/// line longer than `max_chars` is cut at character boundaries.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.chars().count() > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            let chars: Vec<char> = line.chars().collect();
            let mut pieces = chars.chunks(max_chars).map(|c| c.iter().collect::<String>());
            // The tail stays open so following lines can share its chunk
            current = pieces.next_back().unwrap_or_default();
            chunks.extend(pieces);
            continue;
        }
        let needed = current.chars().count() + line.chars().count() + 1;
        if !current.is_empty() && needed > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

async fn send_html(
    client: &Client,
    api_base: &str,
    chat_id: &str,
    text: &str,
) -> Result<(), NotifyError> {
    for chunk in split_message(text, MAX_MESSAGE_CHARS) {
        let resp = client
            .post(format!("{}/sendMessage", api_base))
            .json(&json!({
                "chat_id": chat_id,
                "text": chunk,
                "parse_mode": "HTML",
                "disable_web_page_preview": true,
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Status { status, body });
        }
    }
    Ok(())
}

/// Delivers rendered events to one chat. Single attempt, no retries.
pub struct TelegramSink {
    client: Client,
    api_base: String,
    chat_id: String,
}

impl std::fmt::Debug for TelegramSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramSink")
            .field("chat_id", &self.chat_id)
            .field("api_base", &"<redacted>")
            .finish()
    }
}

impl TelegramSink {
    pub fn new(bot_token: &str, chat_id: &str) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            api_base: api_base(bot_token),
            chat_id: chat_id.to_string(),
        })
    }

    pub async fn send_message(&self, text: &str) -> Result<(), NotifyError> {
        send_html(&self.client, &self.api_base, &self.chat_id, text).await
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn deliver(&self, event: &VaultEvent) -> Result<(), NotifyError> {
        self.send_message(&format::render(event)).await
    }
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

/// True for `/vaults`, `/live` and their `@botname` forms.
pub fn is_live_vaults_command(text: &str) -> bool {
    let command = text.split_whitespace().next().unwrap_or("");
    let command = command.split('@').next().unwrap_or("");
    matches!(command, "/vaults" | "/live")
}

/// Answers live-vault queries posted in the configured chat.
pub struct TelegramCommandListener<R: ChainReader> {
    client: Client,
    api_base: String,
    chat_id: String,
    service: Arc<LiveVaultService<R>>,
}

impl<R: ChainReader + 'static> TelegramCommandListener<R> {
    pub fn new(
        bot_token: &str,
        chat_id: &str,
        service: Arc<LiveVaultService<R>>,
    ) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(LONG_POLL_SECS + 10))
            .build()?;
        Ok(Self {
            client,
            api_base: api_base(bot_token),
            chat_id: chat_id.to_string(),
            service,
        })
    }

    /// Long-poll for commands until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("telegram command listener started");
        let mut offset: i64 = 0;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = self.poll(offset) => match result {
                    Ok(next) => offset = next,
                    Err(e) => {
                        warn!(error = %e, "telegram getUpdates failed");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                },
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("telegram command listener stopped");
    }

    async fn poll(&self, offset: i64) -> Result<i64, NotifyError> {
        let resp = self
            .client
            .get(format!("{}/getUpdates", self.api_base))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", LONG_POLL_SECS.to_string()),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Status { status, body });
        }
        let updates: UpdatesResponse = resp.json().await?;
        if !updates.ok {
            return Err(NotifyError::Status {
                status: 200,
                body: "getUpdates returned ok=false".to_string(),
            });
        }

        let mut next = offset;
        for update in updates.result {
            next = next.max(update.update_id + 1);
            let Some(message) = update.message else {
                continue;
            };
            if message.chat.id.to_string() != self.chat_id {
                debug!(chat = message.chat.id, "ignoring message from other chat");
                continue;
            }
            let Some(text) = message.text else {
                continue;
            };
            if is_live_vaults_command(&text) {
                let report = self.service.list_live_vaults().await;
                if let Err(e) =
                    send_html(&self.client, &self.api_base, &self.chat_id, report.rendered()).await
                {
                    warn!(error = %e, "failed to answer /vaults");
                }
            }
        }
        Ok(next)
    }
}
