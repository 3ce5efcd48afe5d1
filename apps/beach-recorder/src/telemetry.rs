use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber. Returns `false` when a host process already
/// owns one, in which case recorder logs flow into it unchanged.
pub fn init_tracing(filter: &str) -> bool {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .compact();
    Registry::default()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
}
