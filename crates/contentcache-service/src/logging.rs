use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::{MakeWriter, fmt};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Returns the default `RUST_LOG` directives for the given level.
///
/// The cache crates log at the requested level while dependencies are kept at `INFO` or
/// quieter, as `moka` and `reqwest` are rather chatty on `DEBUG`.
pub fn get_rust_log(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN",
        LevelFilter::INFO => "INFO,hyper=WARN",
        LevelFilter::DEBUG => {
            "INFO,\
             hyper=WARN,\
             contentcache=DEBUG,\
             contentcache_service=DEBUG"
        }
        LevelFilter::TRACE => {
            "INFO,\
             hyper=WARN,\
             contentcache=TRACE,\
             contentcache_service=TRACE"
        }
    }
}

/// Installs a global subscriber writing JSON lines, one per event.
pub fn init_json_logging<W>(env_filter: &str, make_writer: W) -> Result<(), TryInitError>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(env_filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(make_writer)
        .finish()
        .with(sentry::integrations::tracing::layer())
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_log_keeps_dependencies_quiet() {
        assert_eq!(get_rust_log(LevelFilter::OFF), "");
        assert!(get_rust_log(LevelFilter::DEBUG).starts_with("INFO,"));
        assert!(get_rust_log(LevelFilter::TRACE).contains("contentcache_service=TRACE"));
    }
}
