use super::denial_cache::DenialNoticeCache;
use super::handlers::{self, get_user_id_safe, Command, FetchDialogue};
use super::state::State;
use crate::config::{
    Settings, DENIAL_NOTICE_CACHE_MAX_SIZE, DENIAL_NOTICE_COOLDOWN_SECS, PENDING_SESSION_TTL_SECS,
};
use crate::download::SessionRegistry;
use crate::guard::{AccessGuard, IpBlocklist, RateLimiter};
use crate::pipeline::Pipeline;
use crate::transfer::HttpTransferEngine;
use crate::upload::FfprobeProber;
use crate::workspace::Workspace;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use teloxide::dispatching::dialogue::InMemStorage;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use teloxide::types::CallbackQuery;
use tracing::{error, info};

/// Moment the bot came up; older messages are ignored
#[derive(Debug, Clone, Copy)]
pub struct StartedAt(pub DateTime<Utc>);

/// Run the Telegram bot until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the HTTP client or the Bot API URL cannot be set up.
pub async fn run_bot(settings: Arc<Settings>) -> Result<()> {
    let bot = init_bot(&settings)?;

    let workspace = Workspace::new(settings.download_path.clone(), settings.extract_path.clone());
    let engine = Arc::new(HttpTransferEngine::new()?);
    let pipeline = Arc::new(Pipeline::new(engine, workspace, Arc::new(FfprobeProber)));
    info!(
        download_path = %settings.download_path.display(),
        extract_path = %settings.extract_path.display(),
        "Pipeline initialized."
    );
    spawn_pending_reaper(Arc::clone(pipeline.registry()));

    let blocked = settings.blocked_ips();
    info!("Initializing AccessGuard ({} blocked origins)", blocked.len());
    let guard = Arc::new(AccessGuard::new(
        RateLimiter::default(),
        IpBlocklist::new(blocked),
    ));

    info!(
        "Initializing DenialNoticeCache (cooldown: {}s, max_size: {})",
        DENIAL_NOTICE_COOLDOWN_SECS, DENIAL_NOTICE_CACHE_MAX_SIZE
    );
    let notices = Arc::new(DenialNoticeCache::new(
        DENIAL_NOTICE_COOLDOWN_SECS,
        DENIAL_NOTICE_CACHE_MAX_SIZE,
    ));

    let bot_state = InMemStorage::<State>::new();
    let started_at = StartedAt(Utc::now());
    let handler = setup_handler();

    info!("Bot is running...");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![
            settings,
            pipeline,
            guard,
            notices,
            bot_state,
            started_at
        ])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

/// Periodically drop sessions whose setup questions were never answered.
fn spawn_pending_reaper(registry: Arc<SessionRegistry>) {
    let max_age = Duration::from_secs(PENDING_SESSION_TTL_SECS);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(max_age / 2);
        loop {
            ticker.tick().await;
            registry.expire_pending(max_age).await;
        }
    });
}

fn init_bot(settings: &Settings) -> Result<Bot> {
    let bot = Bot::new(settings.telegram_token.clone());
    match settings.base_api_url.as_deref() {
        Some(raw) => {
            let url = reqwest::Url::parse(raw)
                .with_context(|| format!("Invalid BASE_API_URL `{raw}`"))?;
            info!("Using custom Bot API server at {url}");
            Ok(bot.set_api_url(url))
        }
        None => Ok(bot),
    }
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    dptree::entry()
        .branch(
            Update::filter_callback_query()
                .filter(|q: CallbackQuery, settings: Arc<Settings>| {
                    settings.is_user_allowed(q.from.id.0.cast_signed())
                })
                .enter_dialogue::<CallbackQuery, InMemStorage<State>, State>()
                .endpoint(handle_callback),
        )
        .branch(
            Update::filter_message()
                .filter(|msg: Message, started_at: StartedAt| msg.date >= started_at.0)
                .branch(
                    dptree::filter(|msg: Message, settings: Arc<Settings>| {
                        settings.is_user_allowed(get_user_id_safe(&msg))
                    })
                    .enter_dialogue::<Message, InMemStorage<State>, State>()
                    .branch(
                        dptree::entry()
                            .filter_command::<Command>()
                            .endpoint(handle_command),
                    )
                    .branch(
                        dptree::filter(|msg: Message| msg.text().is_some())
                            .endpoint(handle_text),
                    ),
                )
                // Everyone not admitted above
                .branch(dptree::endpoint(handle_unauthorized)),
        )
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    dialogue: FetchDialogue,
    pipeline: Arc<Pipeline>,
) -> Result<(), teloxide::RequestError> {
    let res = match cmd {
        Command::Start => handlers::start(bot, msg, dialogue, pipeline).await,
        Command::Help => handlers::help(bot, msg).await,
        Command::Cancel => handlers::cancel_pending(bot, msg, dialogue, pipeline).await,
    };
    if let Err(e) = res {
        error!("Command error: {}", e);
    }
    respond(())
}

async fn handle_text(
    bot: Bot,
    msg: Message,
    dialogue: FetchDialogue,
    pipeline: Arc<Pipeline>,
    guard: Arc<AccessGuard>,
    notices: Arc<DenialNoticeCache>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handlers::handle_text(bot, msg, dialogue, pipeline, guard, notices).await {
        error!("Text handler error: {}", e);
    }
    respond(())
}

async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    dialogue: FetchDialogue,
    pipeline: Arc<Pipeline>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handlers::handle_callback(bot, q, dialogue, pipeline).await {
        error!("Callback handler error: {}", e);
    }
    respond(())
}

async fn handle_unauthorized(
    bot: Bot,
    msg: Message,
    settings: Arc<Settings>,
    notices: Arc<DenialNoticeCache>,
) -> Result<(), teloxide::RequestError> {
    // Admitted users with non-text messages land here too
    if settings.is_user_allowed(get_user_id_safe(&msg)) {
        return respond(());
    }
    if let Err(e) = handlers::handle_unauthorized(bot, msg, notices).await {
        error!("Unauthorized handler error: {}", e);
    }
    respond(())
}
