//! Tracing setup for applications embedding the engine.
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

pub const DEFAULT_DIRECTIVES: &str = "meshsim=info";

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to `directives`.
///
/// Per-message logging (`SimConfig::msglog`) goes to the `meshsim::msglog` target
/// at `info`, so it can be silenced with `meshsim::msglog=off`.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init(directives: Option<&str>) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives.unwrap_or(DEFAULT_DIRECTIVES)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_thread_names(true)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_only_once() {
        let _ = init(Some("meshsim=debug"));
        assert!(!init(None));
    }
}
