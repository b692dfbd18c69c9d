use std::io;

use bundle_cache::metrics::configure_statsd;
pub use bundle_cache::metrics::{MetricsClient, MetricsHandle};

use crate::config::Metrics;

/// Creates the metrics handle described by the `metrics` config.
///
/// Without a configured statsd host, all metrics are discarded.
pub fn configure_metrics(config: &Metrics) -> io::Result<MetricsHandle> {
    let Some(statsd) = &config.statsd else {
        return Ok(MetricsHandle::noop());
    };

    let client = configure_statsd(&config.prefix, statsd.as_str(), config.custom_tags.clone())?;
    Ok(client.into())
}
