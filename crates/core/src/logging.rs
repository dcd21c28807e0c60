//! Logging setup
//!
//! Text or JSON output via tracing-subscriber, always on stderr so that
//! stdout stays free for command output such as `rax keys --output json`.

use anyhow::Result;
use std::{io, sync::Once};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Initialize the global subscriber; later calls are no-ops
///
/// `format` takes precedence over `RAX_LOG_FORMAT`. Anything other than
/// `"json"` selects the human-readable text format.
///
/// ## Environment Variables
///
/// * `RAX_LOG_FORMAT` - `json` or `text`
/// * `RAX_LOG` - filter directives, e.g. `rax_core=debug`
/// * `RUST_LOG` - fallback filter when `RAX_LOG` is unset
///
/// ```rust
/// rax_core::logging::init(Some("text")).expect("logging");
/// assert!(rax_core::logging::is_initialized());
/// ```
pub fn init(format: Option<&str>) -> Result<()> {
    INIT.call_once(|| {
        let filter = create_env_filter();
        let env_format = std::env::var("RAX_LOG_FORMAT").ok();
        let effective_format = format.or(env_format.as_deref()).unwrap_or("text");
        let span_events = span_events_for_format(effective_format);

        match effective_format {
            "json" => {
                tracing_subscriber::registry()
                    .with(
                        fmt::layer()
                            .json()
                            .with_target(true)
                            .with_span_events(span_events)
                            .with_writer(io::stderr),
                    )
                    .with(filter)
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(
                        fmt::layer()
                            .with_target(false)
                            .with_span_events(span_events)
                            .with_writer(io::stderr),
                    )
                    .with(filter)
                    .init();
            }
        }

        tracing::debug!("Logging initialized with format: {}", effective_format);
    });

    Ok(())
}

fn create_env_filter() -> EnvFilter {
    match std::env::var("RAX_LOG") {
        Ok(directives) => EnvFilter::try_new(&directives).unwrap_or_else(|_| {
            eprintln!(
                "Invalid RAX_LOG specification '{}', using default 'info'",
                directives
            );
            EnvFilter::new("info")
        }),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

/// JSON output keeps span open/close events for machine consumers
fn span_events_for_format(format: &str) -> fmt::format::FmtSpan {
    use fmt::format::FmtSpan;
    match format {
        "json" => FmtSpan::NEW | FmtSpan::CLOSE,
        _ => FmtSpan::NONE,
    }
}

pub fn is_initialized() -> bool {
    INIT.is_completed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static TEST_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_init_is_idempotent() {
        let _guard = TEST_MUTEX.lock().unwrap();
        assert!(init(None).is_ok());
        assert!(init(Some("json")).is_ok());
        assert!(init(Some("bogus")).is_ok());
        assert!(is_initialized());
    }

    #[test]
    fn test_span_events_by_format() {
        use fmt::format::FmtSpan;
        assert_eq!(span_events_for_format("json"), FmtSpan::NEW | FmtSpan::CLOSE);
        assert_eq!(span_events_for_format("text"), FmtSpan::NONE);
    }
}
