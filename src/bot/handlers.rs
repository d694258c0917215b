use super::denial_cache::{DenialNoticeCache, NoticeKind};
use super::resilient::{edit_message_safe_resilient, send_message_resilient};
use super::state::State;
use super::transport::{TelegramMediaSink, TelegramNotifier};
use super::views;
use crate::download::SessionId;
use crate::guard::{AccessDenied, AccessGuard};
use crate::pipeline::{Pipeline, PipelineError, RunOptions};
use crate::upload::Discipline;
use crate::utils::find_url;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use teloxide::{
    dispatching::dialogue::InMemStorage,
    prelude::*,
    types::{MessageId, ParseMode},
    utils::command::BotCommands,
};
use tracing::{info, warn};

/// Dialogue shared by message and callback handlers
pub type FetchDialogue = Dialogue<State, InMemStorage<State>>;

/// Supported commands for the bot
#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Supported commands:")]
pub enum Command {
    /// Show the welcome message
    #[command(description = "Start the bot.")]
    Start,
    /// Show usage
    #[command(description = "Show help.")]
    Help,
    /// Drop a download that is still waiting for answers
    #[command(description = "Drop a pending download.")]
    Cancel,
}

/// Safe extraction of user ID from a message.
/// Returns 0 if the user information is missing.
pub fn get_user_id_safe(msg: &Message) -> i64 {
    msg.from.as_ref().map_or(0, |u| u.id.0.cast_signed())
}

fn get_user_name(msg: &Message) -> String {
    msg.from.as_ref().map_or_else(
        || "Unknown".to_string(),
        |user| {
            user.username
                .clone()
                .unwrap_or_else(|| user.first_name.clone())
        },
    )
}

async fn current_state(dialogue: &FetchDialogue) -> Result<State> {
    Ok(dialogue
        .get()
        .await
        .map_err(|e| anyhow!(e.to_string()))?
        .unwrap_or_default())
}

async fn set_state(dialogue: &FetchDialogue, state: State) -> Result<()> {
    dialogue
        .update(state)
        .await
        .map_err(|e| anyhow!(e.to_string()))
}

/// Cancel the session the dialogue is holding, if any, and reset it.
async fn drop_pending(dialogue: &FetchDialogue, pipeline: &Pipeline) -> Result<bool> {
    let dropped = match current_state(dialogue).await?.pending_session() {
        Some(session_id) => pipeline.registry().cancel(session_id).await,
        None => false,
    };
    set_state(dialogue, State::Start).await?;
    Ok(dropped)
}

/// Start handler
///
/// # Errors
///
/// Returns an error if the dialogue cannot be reset or the reply fails.
pub async fn start(
    bot: Bot,
    msg: Message,
    dialogue: FetchDialogue,
    pipeline: Arc<Pipeline>,
) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    info!("User {user_id} ({}) initiated /start command.", get_user_name(&msg));

    drop_pending(&dialogue, &pipeline).await?;
    bot.send_message(msg.chat.id, views::welcome_message())
        .parse_mode(ParseMode::Html)
        .await?;
    Ok(())
}

/// Help handler
///
/// # Errors
///
/// Returns an error if the reply fails.
pub async fn help(bot: Bot, msg: Message) -> Result<()> {
    bot.send_message(msg.chat.id, views::help_message()).await?;
    Ok(())
}

/// `/cancel`: drop a prepared download that was never started.
///
/// # Errors
///
/// Returns an error if the dialogue or the reply fails.
pub async fn cancel_pending(
    bot: Bot,
    msg: Message,
    dialogue: FetchDialogue,
    pipeline: Arc<Pipeline>,
) -> Result<()> {
    let dropped = drop_pending(&dialogue, &pipeline).await?;
    info!(user_id = get_user_id_safe(&msg), dropped, "Pending download cancel requested");
    bot.send_message(msg.chat.id, views::pending_dropped(dropped))
        .await?;
    Ok(())
}

/// What an inbound text message amounts to
#[derive(Debug, PartialEq, Eq)]
pub enum Screening<'a> {
    /// Over quota
    Denied(AccessDenied),
    /// Admitted, but carries no link
    NoLink,
    /// Admitted link
    Link(&'a str),
}

/// Charge the user for the message, then look for a link in it.
///
/// Every message consumes a rate-limit point, link or not.
pub async fn screen_message<'a>(
    guard: &AccessGuard,
    user_id: i64,
    text: Option<&'a str>,
) -> Screening<'a> {
    // Telegram does not expose the sender's address
    if let Err(denied) = guard.admit(user_id, None).await {
        return Screening::Denied(denied);
    }
    match text.and_then(find_url) {
        Some(url) => Screening::Link(url),
        None => Screening::NoLink,
    }
}

/// Text message handler: a link starts a new request.
///
/// # Errors
///
/// Returns an error if a reply cannot be sent or the dialogue fails.
pub async fn handle_text(
    bot: Bot,
    msg: Message,
    dialogue: FetchDialogue,
    pipeline: Arc<Pipeline>,
    guard: Arc<AccessGuard>,
    notices: Arc<DenialNoticeCache>,
) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    let chat_id = msg.chat.id;
    let url = match screen_message(&guard, user_id, msg.text()).await {
        Screening::Link(url) => url,
        Screening::NoLink => {
            bot.send_message(chat_id, views::send_valid_link()).await?;
            return Ok(());
        }
        Screening::Denied(denied) => {
            notify_denied(&bot, chat_id, user_id, &denied, &notices).await;
            return Ok(());
        }
    };

    drop_pending(&dialogue, &pipeline).await?;
    info!(user_id, url, "Link received");
    bot.send_message(chat_id, views::link_accepted()).await?;

    let prepared = match pipeline.prepare(user_id, url).await {
        Ok(prepared) => prepared,
        Err(PipelineError::InvalidUrl(reason)) => {
            info!(user_id, reason, "Rejected link");
            bot.send_message(chat_id, views::send_valid_link()).await?;
            return Ok(());
        }
        Err(e) => {
            warn!(user_id, error = %e, "Could not prepare download");
            bot.send_message(chat_id, views::download_failed()).await?;
            return Ok(());
        }
    };

    bot.send_message(chat_id, views::file_name_message(&prepared.file_name))
        .parse_mode(ParseMode::Html)
        .await?;

    let session_id = prepared.session_id;
    if prepared.is_archive {
        set_state(&dialogue, State::AwaitingExtractChoice { session_id }).await?;
        bot.send_message(chat_id, views::ask_extract())
            .reply_markup(views::extract_keyboard())
            .await?;
    } else {
        set_state(
            &dialogue,
            State::AwaitingDeliveryMode {
                session_id,
                extract: false,
            },
        )
        .await?;
        bot.send_message(chat_id, views::not_a_zip()).await?;
        bot.send_message(chat_id, views::ask_delivery_mode())
            .reply_markup(views::delivery_mode_keyboard())
            .await?;
    }
    Ok(())
}

async fn notify_denied(
    bot: &Bot,
    chat_id: ChatId,
    user_id: i64,
    denied: &AccessDenied,
    notices: &DenialNoticeCache,
) {
    info!(user_id, reason = %denied, "Request denied");
    if !notices.should_send(user_id, NoticeKind::TooManyRequests).await {
        return;
    }
    match bot.send_message(chat_id, views::too_many_requests()).await {
        Ok(_) => notices.mark_sent(user_id, NoticeKind::TooManyRequests).await,
        Err(e) => warn!(user_id, error = %e, "Failed to send rate limit notice"),
    }
}

/// Notice for users outside the allow-list
///
/// # Errors
///
/// Never fails; send errors are logged.
pub async fn handle_unauthorized(
    bot: Bot,
    msg: Message,
    notices: Arc<DenialNoticeCache>,
) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    if notices.should_send(user_id, NoticeKind::AccessDenied).await {
        info!(
            "⛔️ Unauthorized access from user {} ({}). Sending denial message.",
            user_id,
            get_user_name(&msg)
        );
        match bot.send_message(msg.chat.id, "⛔️ Access denied").await {
            Ok(_) => notices.mark_sent(user_id, NoticeKind::AccessDenied).await,
            Err(e) => warn!("Failed to send access denied message to {user_id}: {e}"),
        }
    }
    Ok(())
}

/// Inline keyboard callbacks: extract and mode answers, cancel button.
///
/// # Errors
///
/// Returns an error if the callback carries no message or a Telegram call fails.
pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    dialogue: FetchDialogue,
    pipeline: Arc<Pipeline>,
) -> Result<()> {
    let Some(data) = q.data.as_deref() else {
        return Ok(());
    };
    let user_id = q.from.id.0.cast_signed();
    let (chat_id, message_id) = q
        .message
        .as_ref()
        .map(|msg| (msg.chat().id, msg.id()))
        .ok_or_else(|| anyhow!("Callback message missing chat id"))?;

    if let Some(session_id) = views::parse_cancel_callback(data) {
        return cancel_download(&bot, &q, chat_id, message_id, user_id, session_id, &pipeline).await;
    }

    let state = current_state(&dialogue).await?;

    if let Some(extract) = views::parse_extract_callback(data) {
        let State::AwaitingExtractChoice { session_id } = state else {
            return answer_expired(&bot, &q).await;
        };
        if !pipeline.registry().contains(session_id).await {
            set_state(&dialogue, State::Start).await?;
            return answer_expired(&bot, &q).await;
        }
        bot.answer_callback_query(q.id.clone()).await?;
        let _ = bot.delete_message(chat_id, message_id).await;
        set_state(&dialogue, State::AwaitingDeliveryMode { session_id, extract }).await?;
        bot.send_message(chat_id, views::ask_delivery_mode())
            .reply_markup(views::delivery_mode_keyboard())
            .await?;
        return Ok(());
    }

    if let Some(mode) = views::parse_mode_callback(data) {
        let State::AwaitingDeliveryMode { session_id, extract } = state else {
            return answer_expired(&bot, &q).await;
        };
        if !pipeline.registry().contains(session_id).await {
            set_state(&dialogue, State::Start).await?;
            return answer_expired(&bot, &q).await;
        }
        bot.answer_callback_query(q.id.clone()).await?;
        let _ = bot.delete_message(chat_id, message_id).await;
        set_state(&dialogue, State::Start).await?;

        let options = RunOptions {
            extract,
            mode,
            discipline: Discipline::Sequential,
        };
        let result = launch(bot, chat_id, session_id, options, Arc::clone(&pipeline)).await;
        if result.is_err() {
            pipeline.registry().cancel(session_id).await;
        }
        return result;
    }

    bot.answer_callback_query(q.id.clone()).await?;
    Ok(())
}

async fn answer_expired(bot: &Bot, q: &CallbackQuery) -> Result<()> {
    bot.answer_callback_query(q.id.clone())
        .text(views::question_expired())
        .await?;
    Ok(())
}

async fn cancel_download(
    bot: &Bot,
    q: &CallbackQuery,
    chat_id: ChatId,
    message_id: MessageId,
    user_id: i64,
    session_id: SessionId,
    pipeline: &Pipeline,
) -> Result<()> {
    if pipeline.registry().cancel_owned(session_id, user_id).await {
        edit_message_safe_resilient(bot, chat_id, message_id, views::download_cancelled(), None)
            .await;
        bot.answer_callback_query(q.id.clone())
            .text(views::cancel_succeeded())
            .await?;
    } else {
        bot.answer_callback_query(q.id.clone())
            .text(views::cancel_not_found())
            .await?;
    }
    Ok(())
}

/// Post the progress message and run the pipeline in the background.
async fn launch(
    bot: Bot,
    chat_id: ChatId,
    session_id: SessionId,
    options: RunOptions,
    pipeline: Arc<Pipeline>,
) -> Result<()> {
    bot.send_message(chat_id, views::choice_summary(options.mode, options.extract))
        .await?;
    let progress = send_message_resilient(
        &bot,
        chat_id,
        views::download_started(),
        None,
        Some(views::cancel_keyboard(session_id)),
    )
    .await?;

    tokio::spawn(async move {
        let notifier = TelegramNotifier::new(bot.clone(), chat_id, progress.id, session_id);
        let sink = TelegramMediaSink::new(bot, chat_id);
        pipeline.run(session_id, options, &notifier, &sink).await;
    });
    Ok(())
}
