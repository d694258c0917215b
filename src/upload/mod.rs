//! Delivery of downloaded files back to the chat.

/// Retrying, paced delivery of upload tasks.
pub mod dispatcher;
/// Media kind detection.
pub mod media;

pub use dispatcher::{
    AllowAll, ContentPolicy, DeliveryError, DeliveryItem, DeliveryReport, Discipline,
    ItemOutcome, ItemReport, MediaSink, SendError, UploadDispatcher, UploadTask,
};
pub use media::{classify, mime_type, DeliveryMode, FfprobeProber, MediaKind, VideoProber};
