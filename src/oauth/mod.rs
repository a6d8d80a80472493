//! Local OAuth callback capture.
//!
//! The interactive login flow:
//! 1. Ask the provider for a redirection URL
//! 2. Start the local callback listener (ready before the browser opens)
//! 3. Open the URL in a browser (also printed for manual use)
//! 4. User authorizes on the provider's site
//! 5. Provider redirects to `http://127.0.0.1:<port>/callback?token=...`
//! 6. The listener hands the captured token to the orchestrator
//!
//! Port range: the listener walks [`DEFAULT_PORT_RANGE`] and binds the
//! first free port, so a second tool instance or an unrelated service on
//! the preferred port does not break login.

mod listener;

pub use listener::{CallbackError, CallbackListener, CALLBACK_TIMEOUT};

use std::process::Stdio;
use tracing::debug;

/// Ports tried for the local callback listener, inclusive.
pub const DEFAULT_PORT_RANGE: (u16, u16) = (8976, 8985);

/// Try to open a URL in the user's browser.
///
/// Best-effort: callers treat failure as non-fatal and fall back to the
/// printed URL.
pub fn open_browser(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "macos")]
    let (program, args): (&str, Vec<&str>) = ("open", vec![url]);
    #[cfg(target_os = "windows")]
    let (program, args): (&str, Vec<&str>) = ("cmd", vec!["/C", "start", "", url]);
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let (program, args): (&str, Vec<&str>) = ("xdg-open", vec![url]);

    debug!(program = program, url = %url, "Opening browser");
    std::process::Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(|_| ())
}
