//! Log setup with bot token redaction.
//!
//! The Bot API puts the token into every request URL, and teloxide and
//! reqwest errors echo those URLs. Everything written by the subscriber
//! passes through [`redact`] first.

use lazy_regex::lazy_regex;
use std::borrow::Cow;
use std::io::{self, Write};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{prelude::*, EnvFilter};

const MASK: &str = "[TELEGRAM_TOKEN]";

/// Filter used when `RUST_LOG` is unset and `DEBUG_MODE` is off
const DEFAULT_FILTER: &str = "oxide_fetch=info,hyper=warn,h2=error,reqwest=warn,teloxide=warn,tokio=warn";

/// `bot<id>:<secret>`, as it appears in API URLs
#[allow(clippy::non_std_lazy_statics)]
static RE_URL_TOKEN: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"\b(bot)[0-9]{6,12}:[A-Za-z0-9_-]+");

/// A bare `<id>:<35 chars>` token anywhere in a line
#[allow(clippy::non_std_lazy_statics)]
static RE_BARE_TOKEN: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"\b[0-9]{8,10}:[A-Za-z0-9_-]{35}\b");

/// Mask Telegram bot tokens in `input`.
#[must_use]
pub fn redact(input: &str) -> Cow<'_, str> {
    match RE_URL_TOKEN.replace_all(input, format!("${{1}}{MASK}")) {
        Cow::Borrowed(unchanged) => RE_BARE_TOKEN.replace_all(unchanged, MASK),
        Cow::Owned(masked) => Cow::Owned(RE_BARE_TOKEN.replace_all(&masked, MASK).into_owned()),
    }
}

/// Writer that redacts each buffer before passing it on
pub struct RedactingWriter<W> {
    inner: W,
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        self.inner.write_all(redact(&text).as_bytes())?;
        // Report the original length; the masked text may differ in size.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// [`MakeWriter`] wrapping stderr in a [`RedactingWriter`]
#[derive(Debug, Clone, Copy, Default)]
pub struct RedactingStderr;

impl<'a> MakeWriter<'a> for RedactingStderr {
    type Writer = RedactingWriter<io::Stderr>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: io::stderr(),
        }
    }
}

fn filter(debug_mode: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug_mode {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new(DEFAULT_FILTER)
        }
    })
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `DEBUG_MODE=true` (or `1`) turns on
/// debug output for every crate.
pub fn init() {
    let debug_mode = std::env::var("DEBUG_MODE").is_ok_and(|v| v == "true" || v == "1");

    tracing_subscriber::registry()
        .with(filter(debug_mode))
        .with(tracing_subscriber::fmt::layer().with_writer(RedactingStderr))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "123456789:AAbbCCddEEffGGhhIIjjKKllMMnnOOppQQr";

    #[test]
    fn token_in_api_url_is_masked() {
        let line = format!("GET https://api.telegram.org/bot{TOKEN}/sendMessage failed");
        assert_eq!(
            redact(&line),
            "GET https://api.telegram.org/bot[TELEGRAM_TOKEN]/sendMessage failed"
        );
    }

    #[test]
    fn bare_token_is_masked() {
        let line = format!("token={TOKEN} loaded");
        assert_eq!(redact(&line), "token=[TELEGRAM_TOKEN] loaded");
    }

    #[test]
    fn plain_text_is_borrowed() {
        assert!(matches!(redact("download finished"), Cow::Borrowed("download finished")));
    }

    #[test]
    fn writer_masks_and_reports_input_length() -> io::Result<()> {
        let mut writer = RedactingWriter { inner: Vec::new() };
        let line = format!("bot{TOKEN}\n");
        assert_eq!(writer.write(line.as_bytes())?, line.len());
        assert_eq!(String::from_utf8_lossy(&writer.inner), "bot[TELEGRAM_TOKEN]\n");
        Ok(())
    }
}
