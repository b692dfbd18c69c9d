//! Provides access to the metrics system.
//!
//! Unlike a process-wide statsd client, the [`MetricsHandle`] is handed to each
//! [`ResourceCache`](crate::ResourceCache) when it is built. A default handle discards all metrics.
use std::collections::BTreeMap;
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::ops::Deref;
use std::panic::RefUnwindSafe;
use std::sync::Arc;

use cadence::{Metric, MetricBuilder, MetricSink, StatsdClient, UdpMetricSink};

/// The metrics prelude that is necessary to use the client.
pub mod prelude {
    pub use cadence::prelude::*;
}

#[derive(Debug)]
pub struct MetricsClient {
    /// The raw statsd client.
    pub statsd_client: StatsdClient,

    /// A collection of tags and values that will be sent with every metric.
    tags: BTreeMap<String, String>,
}

impl MetricsClient {
    /// Creates a client that reports through the given sink.
    pub fn from_sink<S>(prefix: &str, sink: S, tags: BTreeMap<String, String>) -> Self
    where
        S: MetricSink + Send + Sync + RefUnwindSafe + 'static,
    {
        Self {
            statsd_client: StatsdClient::from_sink(prefix, sink),
            tags,
        }
    }

    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        for (tag, value) in self.tags.iter() {
            metric = metric.with_tag(tag, value);
        }
        metric.send()
    }
}

impl Deref for MetricsClient {
    type Target = StatsdClient;

    fn deref(&self) -> &Self::Target {
        &self.statsd_client
    }
}

/// Creates a client reporting to the statsd instance at `host`.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    tags: BTreeMap<String, String>,
) -> io::Result<MetricsClient> {
    let addrs: Vec<_> = host.to_socket_addrs()?.collect();
    if let Some(addr) = addrs.first() {
        tracing::info!("Reporting metrics to statsd at {}", addr);
    }
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).map_err(io::Error::other)?;

    Ok(MetricsClient::from_sink(prefix, sink, tags))
}

/// A cheaply cloneable, possibly disabled, reference to a [`MetricsClient`].
#[derive(Clone, Debug, Default)]
pub struct MetricsHandle(Option<Arc<MetricsClient>>);

impl MetricsHandle {
    pub fn new(client: MetricsClient) -> Self {
        Self(Some(Arc::new(client)))
    }

    /// A handle that discards every metric.
    pub fn noop() -> Self {
        Self(None)
    }

    /// Invoke a callback with the statsd client.
    ///
    /// If statsd is not configured the callback is not invoked. For the most part
    /// the [`metric!`](crate::metric) macro should be used instead.
    #[inline(always)]
    pub fn with_client<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&MetricsClient) -> R,
        R: Default,
    {
        match &self.0 {
            Some(client) => f(client),
            None => Default::default(),
        }
    }
}

impl From<MetricsClient> for MetricsHandle {
    fn from(client: MetricsClient) -> Self {
        Self::new(client)
    }
}

/// Emits a metric through the given [`MetricsHandle`].
#[macro_export]
macro_rules! metric {
    // counters
    ($handle:expr, counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $handle.with_client(|client| {
            client.send_metric(
                client.count_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    // gauges
    ($handle:expr, gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $handle.with_client(|client| {
            client.send_metric(
                client.gauge_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    // timers
    ($handle:expr, timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $handle.with_client(|client| {
            client.send_metric(
                client.time_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    // histograms
    ($handle:expr, histogram($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $handle.with_client(|client| {
            client.send_metric(
                client.histogram_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};
}
