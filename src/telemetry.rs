//! Tracing subscriber bootstrap

use tracing::subscriber::set_global_default;
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Build the worker's subscriber: `RUST_LOG` wins over the provided default
/// filter, events go to `sink` through the fmt layer.
pub fn get_subscriber<Sink>(default_filter: &str, sink: Sink) -> impl Subscriber + Send + Sync
where
    Sink: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).with_writer(sink);
    Registry::default().with(env_filter).with(fmt_layer)
}

/// Install the subscriber process-wide. Call once, before anything logs.
pub fn init_subscriber(subscriber: impl Subscriber + Send + Sync) {
    set_global_default(subscriber).expect("failed to set tracing subscriber");
}
