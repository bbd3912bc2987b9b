//! Log sink setup for the in-process proxy.
//!
//! The shared object is loaded into an arbitrary host, so there is no `main`
//! to install a subscriber from. The first bridge instance installs one for
//! the whole process, writing to the file named by `VSTBRIDGE_DEBUG_FILE`
//! when set and to stderr otherwise. Each bridge instance then carries its
//! own span so interleaved instances stay distinguishable in the log.

use std::path::Path;
use std::sync::Once;

use tracing::Level;

pub const DEBUG_FILE_ENV: &str = "VSTBRIDGE_DEBUG_FILE";
pub const DEBUG_LEVEL_ENV: &str = "VSTBRIDGE_DEBUG_LEVEL";

/// Install the process-wide subscriber once. A host that already set one up
/// (or a second plugin instance) wins the race silently.
pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let level = match std::env::var(DEBUG_LEVEL_ENV).ok().as_deref() {
            Some("2") => Level::TRACE,
            Some("1") => Level::DEBUG,
            _ => Level::INFO,
        };

        let file = std::env::var_os(DEBUG_FILE_ENV).and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

        let installed = match file {
            Some(file) => tracing::subscriber::set_global_default(
                tracing_subscriber::fmt()
                    .with_max_level(level)
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .finish(),
            ),
            None => tracing::subscriber::set_global_default(
                tracing_subscriber::fmt()
                    .with_max_level(level)
                    .with_writer(std::io::stderr)
                    .finish(),
            ),
        };
        let _ = installed;
    });
}

/// The per-instance span every bridge operation runs under.
pub fn bridge_span(endpoint: &Path) -> tracing::Span {
    let instance = endpoint
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "vstbridge".to_string());
    tracing::info_span!("bridge", %instance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
    }

    #[test]
    fn test_bridge_span_creation() {
        // Must not panic even when no subscriber is interested.
        let _span = bridge_span(Path::new("/tmp/vstbridge-1234-abcd.sock"));
        let _span = bridge_span(Path::new(""));
    }
}
