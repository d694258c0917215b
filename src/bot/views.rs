//! Chat UI components
//!
//! Callback data, inline keyboards, fixed texts and the progress message.

use crate::download::{ProgressEvent, SessionId};
use crate::pipeline::{PipelineError, PipelineOutcome, Stage};
use crate::transfer::TransferState;
use crate::upload::DeliveryMode;
use html_escape::encode_text;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

// ─────────────────────────────────────────────────────────────────────────────
// Callback constants
// ─────────────────────────────────────────────────────────────────────────────

/// Extract the archive
pub const CALLBACK_EXTRACT_YES: &str = "extract:yes";
/// Deliver the archive as is
pub const CALLBACK_EXTRACT_NO: &str = "extract:no";
/// Everything as documents
pub const CALLBACK_MODE_DOCUMENT: &str = "mode:document";
/// Audio and video as native media
pub const CALLBACK_MODE_MEDIA: &str = "mode:media";
/// Prefix of the per-session cancel button
pub const CALLBACK_CANCEL_PREFIX: &str = "cancel:";

/// Callback data of the cancel button for `id`
#[must_use]
pub fn cancel_callback(id: SessionId) -> String {
    format!("{CALLBACK_CANCEL_PREFIX}{id}")
}

/// Session id carried by a cancel callback
#[must_use]
pub fn parse_cancel_callback(data: &str) -> Option<SessionId> {
    data.strip_prefix(CALLBACK_CANCEL_PREFIX)?.parse().ok()
}

/// Delivery mode chosen by a mode callback
#[must_use]
pub fn parse_mode_callback(data: &str) -> Option<DeliveryMode> {
    match data {
        CALLBACK_MODE_DOCUMENT => Some(DeliveryMode::Document),
        CALLBACK_MODE_MEDIA => Some(DeliveryMode::Auto),
        _ => None,
    }
}

/// Extract choice carried by an extract callback
#[must_use]
pub fn parse_extract_callback(data: &str) -> Option<bool> {
    match data {
        CALLBACK_EXTRACT_YES => Some(true),
        CALLBACK_EXTRACT_NO => Some(false),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Keyboards
// ─────────────────────────────────────────────────────────────────────────────

/// Yes / No for extraction
#[must_use]
pub fn extract_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback("Yes", CALLBACK_EXTRACT_YES),
        InlineKeyboardButton::callback("No", CALLBACK_EXTRACT_NO),
    ]])
}

/// Document / Media
#[must_use]
pub fn delivery_mode_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback("Document", CALLBACK_MODE_DOCUMENT),
        InlineKeyboardButton::callback("Media", CALLBACK_MODE_MEDIA),
    ]])
}

/// Cancel button attached to the progress message
#[must_use]
pub fn cancel_keyboard(id: SessionId) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
        "❌ Cancel Download",
        cancel_callback(id),
    )]])
}

// ─────────────────────────────────────────────────────────────────────────────
// Texts
// ─────────────────────────────────────────────────────────────────────────────

/// Reply to /start
#[must_use]
pub const fn welcome_message() -> &'static str {
    "👋 <b>Send me a link and I will bring the file here.</b>\n\n\
     • Zip archives can be extracted before sending\n\
     • Files arrive as documents or as playable media\n\
     • A running download can be cancelled from its progress message"
}

/// Reply to /help
#[must_use]
pub const fn help_message() -> &'static str {
    "Send any http(s) link to a file.\n\n\
     /start - show the welcome message\n\
     /cancel - drop a download that has not started yet\n\
     /help - this message"
}

/// A URL was recognised
#[must_use]
pub const fn link_accepted() -> &'static str {
    "Okay! This is a valid link. Please wait..."
}

/// Text without a URL
#[must_use]
pub const fn send_valid_link() -> &'static str {
    "Please send a valid link."
}

/// Resolved file name
#[must_use]
pub fn file_name_message(file_name: &str) -> String {
    format!("File name: <code>{}</code>", encode_text(file_name))
}

/// Extraction question
#[must_use]
pub const fn ask_extract() -> &'static str {
    "Do you want to extract the zip file?"
}

/// Shown for downloads that are not archives
#[must_use]
pub const fn not_a_zip() -> &'static str {
    "This is not a zip file."
}

/// Delivery mode question
#[must_use]
pub const fn ask_delivery_mode() -> &'static str {
    "How would you like to receive the files?"
}

/// Echo of the user's choices
#[must_use]
pub fn choice_summary(mode: DeliveryMode, extract: bool) -> String {
    let mode = match mode {
        DeliveryMode::Document => "document",
        DeliveryMode::Auto => "media",
    };
    format!("Your choice is {mode} and extract: {extract}")
}

/// Placeholder for the progress message
#[must_use]
pub const fn download_started() -> &'static str {
    "Download started..."
}

/// Progress message body after cancelling
#[must_use]
pub const fn download_cancelled() -> &'static str {
    "Download cancelled."
}

/// Callback answer after a successful cancel
#[must_use]
pub const fn cancel_succeeded() -> &'static str {
    "Download cancelled successfully"
}

/// Callback answer when there is nothing to cancel
#[must_use]
pub const fn cancel_not_found() -> &'static str {
    "Download not found or already finished"
}

/// Reply to /cancel
#[must_use]
pub fn pending_dropped(dropped: bool) -> &'static str {
    if dropped {
        "Pending download dropped."
    } else {
        "Nothing to cancel. Running downloads are cancelled from their progress message."
    }
}

/// Answer to a stale keyboard
#[must_use]
pub const fn question_expired() -> &'static str {
    "This question has expired, please send the link again."
}

/// Rate limited notice
#[must_use]
pub const fn too_many_requests() -> &'static str {
    "Too many requests. Please slow down."
}

/// Shown when the file name could not be resolved
#[must_use]
pub const fn download_failed() -> &'static str {
    "File download failed due to timeout or error."
}

/// Announcement for a post-download stage
#[must_use]
pub fn stage_message(stage: Stage) -> String {
    match stage {
        Stage::Extracting => "Extracting the archive...".to_string(),
        Stage::Uploading { items } if items > 1 => format!("Sending {items} files..."),
        Stage::Uploading { .. } => "Sending the file...".to_string(),
    }
}

/// Final notice for a request
#[must_use]
pub fn final_message(outcome: &PipelineOutcome) -> String {
    match outcome {
        PipelineOutcome::Delivered { report } if report.undelivered() == 0 => {
            "Upload complete. All files and directories have been cleaned up.".to_string()
        }
        PipelineOutcome::Delivered { report } => format!(
            "Upload complete, {} of {} files could not be sent. All files and directories have been cleaned up.",
            report.undelivered(),
            report.items.len()
        ),
        PipelineOutcome::Cancelled => "Download was cancelled by user.".to_string(),
        PipelineOutcome::Failed(PipelineError::Extraction(e)) => {
            format!("Extraction failed: {}", encode_text(&e.to_string()))
        }
        PipelineOutcome::Failed(_) => "An error occurred during download.".to_string(),
    }
}

/// HTML body of the progress message
#[must_use]
pub fn progress_message(event: &ProgressEvent) -> String {
    let status = match event.status {
        TransferState::Pending => "⏳ Waiting",
        TransferState::Active => "▶️ In Progress",
        TransferState::Finished => "✅ Finished",
        TransferState::Cancelled => "⏹ Cancelled",
        TransferState::Failed => "❌ Failed",
    };
    format!(
        "<b>File Name:</b> <code>{}</code>\n\
         <b>Action:</b> {}\n\
         <b>Status:</b> {status}\n\
         <b>Transferred:</b> {}\n\
         <b>Speed:</b> {}\n\
         <b>Time Left:</b> {}\n\
         <b>Percentage:</b> {}",
        encode_text(&event.file_name),
        encode_text(&event.action),
        event.transferred_of_total,
        event.speed,
        event.time_left,
        event.percentage,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::{DeliveryReport, ItemOutcome, ItemReport};
    use std::path::PathBuf;

    #[test]
    fn cancel_callback_round_trip_fits_telegram_limit() {
        let id = SessionId::new();
        let data = cancel_callback(id);
        assert!(data.len() <= 64);
        assert_eq!(parse_cancel_callback(&data), Some(id));
        assert_eq!(parse_cancel_callback("cancel:nope"), None);
        assert_eq!(parse_cancel_callback(CALLBACK_EXTRACT_YES), None);
    }

    #[test]
    fn choice_callbacks() {
        assert_eq!(parse_extract_callback(CALLBACK_EXTRACT_YES), Some(true));
        assert_eq!(parse_extract_callback(CALLBACK_EXTRACT_NO), Some(false));
        assert_eq!(parse_mode_callback(CALLBACK_MODE_MEDIA), Some(DeliveryMode::Auto));
        assert_eq!(parse_mode_callback("mode:other"), None);
    }

    #[test]
    fn file_name_is_escaped() {
        assert_eq!(
            file_name_message("<a&b>.zip"),
            "File name: <code>&lt;a&amp;b&gt;.zip</code>"
        );
    }

    #[test]
    fn final_message_variants() {
        let full = PipelineOutcome::Delivered {
            report: DeliveryReport::default(),
        };
        assert!(final_message(&full).starts_with("Upload complete. All files"));

        let partial = PipelineOutcome::Delivered {
            report: DeliveryReport {
                items: vec![ItemReport {
                    path: PathBuf::from("a"),
                    caption: "a".into(),
                    outcome: ItemOutcome::Exhausted { attempts: 5 },
                }],
            },
        };
        assert!(final_message(&partial).contains("1 of 1"));
        assert_eq!(
            final_message(&PipelineOutcome::Cancelled),
            "Download was cancelled by user."
        );
    }
}
