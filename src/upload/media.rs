//! Media classification for delivery items.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use mime_guess::mime;
use serde::Deserialize;
use std::path::Path;
use tokio::process::Command;

/// How a single file is presented in the chat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// Plain file attachment
    Document,
    /// Audio player
    Audio,
    /// Inline video with known dimensions
    Video {
        /// Frame width in pixels
        width: u32,
        /// Frame height in pixels
        height: u32,
    },
}

/// User's choice of presentation for a whole upload task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Everything is sent as a document
    #[default]
    Document,
    /// Audio and video are detected and sent natively
    Auto,
}

/// MIME type guessed from the file extension.
#[must_use]
pub fn mime_type(path: &Path) -> Option<&'static str> {
    mime_guess::from_path(path).first_raw()
}

/// Reads the dimensions of a video file.
#[async_trait]
pub trait VideoProber: Send + Sync {
    /// `(width, height)` of the first video stream.
    async fn dimensions(&self, path: &Path) -> Result<(u32, u32)>;
}

/// Prober backed by the `ffprobe` binary on `PATH`.
#[derive(Debug, Clone, Default)]
pub struct FfprobeProber;

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
}

#[async_trait]
impl VideoProber for FfprobeProber {
    async fn dimensions(&self, path: &Path) -> Result<(u32, u32)> {
        let output = Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height",
                "-of",
                "json",
            ])
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await
            .context("failed to run ffprobe")?;

        if !output.status.success() {
            return Err(anyhow!(
                "ffprobe exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        parse_probe_output(&output.stdout)
    }
}

fn parse_probe_output(stdout: &[u8]) -> Result<(u32, u32)> {
    let parsed: ProbeOutput =
        serde_json::from_slice(stdout).context("unexpected ffprobe output")?;
    parsed
        .streams
        .iter()
        .find_map(|s| s.width.zip(s.height))
        .ok_or_else(|| anyhow!("no video stream with dimensions"))
}

/// Decide how `path` is sent under `mode`.
///
/// # Errors
///
/// Returns the prober's error for videos whose dimensions cannot be read.
pub async fn classify(path: &Path, mode: DeliveryMode, prober: &dyn VideoProber) -> Result<MediaKind> {
    if mode == DeliveryMode::Document {
        return Ok(MediaKind::Document);
    }
    let Some(guessed) = mime_guess::from_path(path).first() else {
        return Ok(MediaKind::Document);
    };
    if guessed.type_() == mime::AUDIO {
        return Ok(MediaKind::Audio);
    }
    if guessed.type_() == mime::VIDEO {
        let (width, height) = prober
            .dimensions(path)
            .await
            .with_context(|| format!("cannot probe {}", path.display()))?;
        return Ok(MediaKind::Video { width, height });
    }
    Ok(MediaKind::Document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProber;

    #[test]
    fn mime_lookup_is_case_insensitive() {
        assert_eq!(mime_type(Path::new("a/Song.MP3")), Some("audio/mpeg"));
        assert_eq!(mime_type(Path::new("clip.webm")), Some("video/webm"));
        assert_eq!(mime_type(Path::new("noext")), None);
        assert_eq!(mime_type(Path::new("weird.qqqz")), None);
    }

    #[tokio::test]
    async fn less_common_containers_are_media() -> Result<()> {
        let prober = FakeProber::new(320, 240);
        for name in ["a.flv", "a.wmv", "A.MOV", "a.3gp"] {
            assert_eq!(
                classify(Path::new(name), DeliveryMode::Auto, &prober).await?,
                MediaKind::Video {
                    width: 320,
                    height: 240
                },
                "{name}"
            );
        }
        for name in ["a.wma", "a.mka", "a.aiff", "a.flac"] {
            assert_eq!(
                classify(Path::new(name), DeliveryMode::Auto, &prober).await?,
                MediaKind::Audio,
                "{name}"
            );
        }
        Ok(())
    }

    #[test]
    fn probe_output_parsing() -> Result<()> {
        let json = br#"{"programs":[],"streams":[{"width":1280,"height":720}]}"#;
        assert_eq!(parse_probe_output(json)?, (1280, 720));
        assert!(parse_probe_output(br#"{"streams":[]}"#).is_err());
        assert!(parse_probe_output(b"garbage").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn document_mode_never_probes() -> Result<()> {
        let prober = FakeProber::failing();
        let kind = classify(Path::new("clip.mp4"), DeliveryMode::Document, &prober).await?;
        assert_eq!(kind, MediaKind::Document);
        Ok(())
    }

    #[tokio::test]
    async fn auto_mode_detects_media() -> Result<()> {
        let prober = FakeProber::new(640, 480);
        assert_eq!(
            classify(Path::new("a.mp3"), DeliveryMode::Auto, &prober).await?,
            MediaKind::Audio
        );
        assert_eq!(
            classify(Path::new("a.mkv"), DeliveryMode::Auto, &prober).await?,
            MediaKind::Video {
                width: 640,
                height: 480
            }
        );
        assert_eq!(
            classify(Path::new("a.pdf"), DeliveryMode::Auto, &prober).await?,
            MediaKind::Document
        );
        Ok(())
    }

    #[tokio::test]
    async fn probe_failure_is_an_error() {
        let prober = FakeProber::failing();
        assert!(classify(Path::new("a.mp4"), DeliveryMode::Auto, &prober)
            .await
            .is_err());
    }
}
