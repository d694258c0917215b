//! Telegram side of the pipeline seams
//!
//! [`TelegramNotifier`] renders progress into one throttled message and
//! posts stage and final notices; [`TelegramMediaSink`] sends delivery items
//! as documents, audio or video.

use super::resilient::{edit_message_safe_resilient, send_message_resilient};
use super::views;
use crate::config::PROGRESS_EDIT_THROTTLE_MS;
use crate::download::{ProgressEvent, SessionId};
use crate::pipeline::{PipelineNotifier, PipelineOutcome, Stage};
use crate::upload::{DeliveryItem, MediaKind, MediaSink, SendError};
use async_trait::async_trait;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{InputFile, MessageId, ParseMode};
use teloxide::RequestError;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Progress and notices for one request in one chat.
pub struct TelegramNotifier {
    bot: Bot,
    chat_id: ChatId,
    progress_message: MessageId,
    session_id: SessionId,
    throttle: Duration,
    last_edit: Mutex<Option<Instant>>,
}

impl TelegramNotifier {
    /// Notifier editing `progress_message` in `chat_id`.
    #[must_use]
    pub fn new(bot: Bot, chat_id: ChatId, progress_message: MessageId, session_id: SessionId) -> Self {
        Self {
            bot,
            chat_id,
            progress_message,
            session_id,
            throttle: Duration::from_millis(PROGRESS_EDIT_THROTTLE_MS),
            last_edit: Mutex::new(None),
        }
    }

    async fn send_notice(&self, text: &str) {
        if let Err(e) =
            send_message_resilient(&self.bot, self.chat_id, text, Some(ParseMode::Html), None).await
        {
            warn!(chat_id = self.chat_id.0, error = %e, "Failed to send notice");
        }
    }
}

#[async_trait]
impl PipelineNotifier for TelegramNotifier {
    async fn progress(&self, event: &ProgressEvent) {
        let terminal = event.status.is_terminal();
        {
            let mut last_edit = self.last_edit.lock().await;
            let now = Instant::now();
            if !terminal && last_edit.is_some_and(|at| now.duration_since(at) < self.throttle) {
                debug!(session_id = %self.session_id, "Progress edit throttled");
                return;
            }
            *last_edit = Some(now);
        }

        let markup = (!terminal).then(|| views::cancel_keyboard(self.session_id));
        edit_message_safe_resilient(
            &self.bot,
            self.chat_id,
            self.progress_message,
            &views::progress_message(event),
            markup,
        )
        .await;
    }

    async fn stage(&self, stage: Stage) {
        self.send_notice(&views::stage_message(stage)).await;
    }

    async fn finished(&self, outcome: &PipelineOutcome) {
        if matches!(outcome, PipelineOutcome::Cancelled) {
            edit_message_safe_resilient(
                &self.bot,
                self.chat_id,
                self.progress_message,
                views::download_cancelled(),
                None,
            )
            .await;
        }
        self.send_notice(&views::final_message(outcome)).await;
    }
}

/// Sends delivery items into one chat.
#[derive(Clone)]
pub struct TelegramMediaSink {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramMediaSink {
    /// Sink for `chat_id`
    #[must_use]
    pub const fn new(bot: Bot, chat_id: ChatId) -> Self {
        Self { bot, chat_id }
    }
}

#[async_trait]
impl MediaSink for TelegramMediaSink {
    async fn send_media(&self, item: &DeliveryItem) -> Result<(), SendError> {
        debug!(
            chat_id = self.chat_id.0,
            path = %item.path.display(),
            kind = ?item.kind,
            mime = item.mime_type.unwrap_or("unknown"),
            "Sending item"
        );
        let file = InputFile::file(item.path.clone());
        let caption = item.caption.clone();

        let result = match item.kind {
            MediaKind::Document => self
                .bot
                .send_document(self.chat_id, file)
                .caption(caption)
                .await
                .map(drop),
            MediaKind::Audio => self
                .bot
                .send_audio(self.chat_id, file)
                .caption(caption)
                .await
                .map(drop),
            MediaKind::Video { width, height } => self
                .bot
                .send_video(self.chat_id, file)
                .caption(caption)
                .width(width)
                .height(height)
                .supports_streaming(true)
                .await
                .map(drop),
        };

        result.map_err(classify_send_error)
    }
}

/// Map a Telegram error onto the dispatcher's retry vocabulary.
fn classify_send_error(err: RequestError) -> SendError {
    match err {
        RequestError::RetryAfter(seconds) => SendError::RateLimited {
            retry_after: Some(seconds.duration()),
        },
        other => {
            let text = other.to_string();
            if text.contains("Too Many Requests") {
                SendError::RateLimited { retry_after: None }
            } else {
                SendError::Other(text)
            }
        }
    }
}
