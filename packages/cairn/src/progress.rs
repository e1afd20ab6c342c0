//! Progress reporting for transfers and checkout.

use std::borrow::Cow;

use derive_more::Deref;
use indicatif::{ProgressBar, ProgressStyle};

/// A progress bar that only draws on interactive terminals.
///
/// In non-interactive environments (CI, pipes) the bar is hidden and the
/// surrounding tracing output carries the story instead.
#[derive(Deref)]
pub struct TransferBar {
    #[deref]
    inner: ProgressBar,
}

impl TransferBar {
    /// Track `items` units of work with the given message.
    pub fn new(items: u64, message: impl Into<Cow<'static, str>>) -> Self {
        let inner = if is_interactive() {
            let bar = ProgressBar::new(items);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                    .expect("invalid progress bar template")
                    .progress_chars("=> "),
            );
            bar
        } else {
            ProgressBar::hidden()
        };
        inner.set_message(message);
        Self { inner }
    }
}

/// Formats a byte count as a string like "10 MB".
pub fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::DECIMAL)
}

/// Detects whether stderr is an interactive terminal.
fn is_interactive() -> bool {
    console::Term::stderr().is_term()
}
