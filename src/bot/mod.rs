/// Throttled denial notices
pub mod denial_cache;
/// Command, message and callback handlers
pub mod handlers;
/// Telegram API wrappers with retry
pub mod resilient;
/// Dispatcher setup and entry point
pub mod runner;
/// User state and dialogue management
pub mod state;
/// Pipeline notifier and media sink over Telegram
pub mod transport;
/// Keyboards, callback data and texts
pub mod views;

pub use denial_cache::{DenialNoticeCache, NoticeKind};
pub use runner::run_bot;
