//! A high-level statsd metric client built on cadence.
//!
//! ## Defining Metrics
//!
//! In order to use metrics, one needs to first define one of the metric traits
//! on a custom enum. The following types of metrics are available: `counter`,
//! `timer`, `gauge`, `histogram`, and `set`.
//!
//! The metric traits serve only to provide a type safe metric name. All metric
//! types have exactly the same form, they are different only to ensure that a
//! metric can only be used for the type for which it was defined, (e.g. a
//! counter metric cannot be used as a timer metric).
//!
//! ## Initializing the Client
//!
//! Metrics can be used without initializing a statsd client. In that case,
//! invoking [`with_client`] or the [`metric!`] macro will become a noop. Only
//! when configured, metrics will actually be collected.
//!
//! ```no_run
//! # use std::collections::BTreeMap;
//! logsentry_statsd::init("logsentry", "localhost:8125", BTreeMap::new(), 1.0).ok();
//! ```
//!
//! ## Macro Usage
//!
//! The recommended way to record metrics is by using the [`metric!`] macro:
//!
//! ```
//! use logsentry_statsd::{metric, CounterMetric};
//!
//! struct MyCounter;
//!
//! impl CounterMetric for MyCounter {
//!     fn name(&self) -> &'static str {
//!         "counter"
//!     }
//! }
//!
//! metric!(counter(MyCounter) += 1);
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::ops::Deref;
use std::sync::Arc;

use cadence::{
    BufferedUdpMetricSink, Metric, MetricBuilder, MetricSink, QueuingMetricSink, StatsdClient,
};
use parking_lot::RwLock;
use std::sync::Mutex;
use rand::distributions::{Distribution, Uniform};

/// Maximum number of metric events that can be queued before we start dropping
/// them.
const METRICS_MAX_QUEUE_SIZE: usize = 100_000;

/// Client configuration object to store globally.
#[derive(Debug)]
pub struct MetricsClient {
    /// The raw statsd client.
    pub statsd_client: StatsdClient,
    /// Default tags to apply to every metric.
    pub default_tags: BTreeMap<String, String>,
    /// Global sample rate.
    pub sample_rate: f32,
}

impl Deref for MetricsClient {
    type Target = StatsdClient;

    fn deref(&self) -> &StatsdClient {
        &self.statsd_client
    }
}

impl MetricsClient {
    /// Sends a metric with the default tags defined on this `MetricsClient`.
    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        if !self.should_send() {
            return;
        }

        for (k, v) in &self.default_tags {
            metric = metric.with_tag(k, v);
        }

        if let Err(error) = metric.try_send() {
            tracing::error!(
                "error sending a metric: {error}, maximum capacity: {METRICS_MAX_QUEUE_SIZE}"
            );
        };
    }

    fn should_send(&self) -> bool {
        if self.sample_rate <= 0.0 {
            false
        } else if self.sample_rate >= 1.0 {
            true
        } else {
            RNG_UNIFORM_DISTRIBUTION
                .with(|uniform| uniform.sample(&mut rand::thread_rng()) <= self.sample_rate)
        }
    }
}

static METRICS_CLIENT: RwLock<Option<Arc<MetricsClient>>> = RwLock::new(None);

thread_local! {
    static LOCAL_CLIENT: RefCell<Option<Arc<MetricsClient>>> = const { RefCell::new(None) };
    static RNG_UNIFORM_DISTRIBUTION: Uniform<f32> = Uniform::new(0.0, 1.0);
}

/// Internal prelude for the macro.
#[doc(hidden)]
pub mod _pred {
    pub use cadence::prelude::*;
}

/// Sets a new global statsd client.
pub fn set_client(client: MetricsClient) {
    *METRICS_CLIENT.write() = Some(Arc::new(client));
}

/// Disables the client again.
pub fn disable() {
    *METRICS_CLIENT.write() = None;
}

/// Tells the metrics system to report to statsd.
pub fn init<A: ToSocketAddrs + Clone>(
    prefix: &str,
    host: A,
    default_tags: BTreeMap<String, String>,
    sample_rate: f32,
) -> io::Result<()> {
    let addrs: Vec<_> = host.clone().to_socket_addrs()?.collect();
    if let Some(addr) = addrs.first() {
        tracing::info!("reporting metrics to statsd at {addr}");
    }

    let sample_rate = sample_rate.clamp(0.0, 1.0);
    if sample_rate == 0.0 {
        tracing::debug!("metrics sample rate is 0, no metrics will be reported");
    }

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;

    let udp_sink =
        BufferedUdpMetricSink::from(host, socket).map_err(io::Error::other)?;
    let queuing_sink = QueuingMetricSink::with_capacity(udp_sink, METRICS_MAX_QUEUE_SIZE);
    let statsd_client = StatsdClient::from_sink(prefix, queuing_sink);

    set_client(MetricsClient {
        statsd_client,
        default_tags,
        sample_rate,
    });

    Ok(())
}

/// Invokes a callback with the current statsd client.
///
/// If statsd is not configured, the callback is not invoked. For the most part
/// the [`metric!`] macro should be used instead.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    let local = LOCAL_CLIENT.with(|cell| cell.borrow().clone());
    match local.or_else(|| METRICS_CLIENT.read().clone()) {
        Some(client) => f(&client),
        None => R::default(),
    }
}

/// A sink that captures formatted metrics in memory.
#[derive(Clone, Debug, Default)]
struct CaptureSink(Arc<Mutex<Vec<String>>>);

impl MetricSink for CaptureSink {
    fn emit(&self, metric: &str) -> io::Result<usize> {
        self.0.lock().unwrap().push(metric.to_owned());
        Ok(metric.len())
    }
}

/// Installs a capturing test client for the duration of the called function.
///
/// Only metrics emitted on the current thread are captured. The returned
/// strings are in statsd wire format, such as `"metric:1|c|#tag:value"`.
pub fn with_capturing_test_client(f: impl FnOnce()) -> Vec<String> {
    let sink = CaptureSink::default();
    let client = Arc::new(MetricsClient {
        statsd_client: StatsdClient::from_sink("", sink.clone()),
        default_tags: BTreeMap::new(),
        sample_rate: 1.0,
    });

    LOCAL_CLIENT.with(|cell| *cell.borrow_mut() = Some(client));
    f();
    LOCAL_CLIENT.with(|cell| *cell.borrow_mut() = None);

    let captures = sink.0.lock().unwrap().drain(..).collect();
    captures
}

/// A metric for capturing timings.
///
/// Timings are a positive number of milliseconds between a start and end time.
pub trait TimerMetric {
    /// Returns the timer metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// A metric for capturing counters.
///
/// Counters are simple values incremented or decremented by a client.
pub trait CounterMetric {
    /// Returns the counter metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// A metric for capturing histograms.
///
/// Histograms are values whose distribution is calculated by the server.
pub trait HistogramMetric {
    /// Returns the histogram metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// A metric for capturing sets.
///
/// Sets count the number of unique elements in a group.
pub trait SetMetric {
    /// Returns the set metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// A metric for capturing gauges.
///
/// Gauge values are an instantaneous measurement of a value determined by the
/// client.
pub trait GaugeMetric {
    /// Returns the gauge metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// Emits a metric.
///
/// See [module-level documentation](self) for examples.
#[macro_export]
macro_rules! metric {
    // counter increment
    (counter($id:expr) += $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.count_with_tags($crate::CounterMetric::name(&$id), $value)
                    $(.with_tag(stringify!($k), $v))*
            )
        })
    };

    // counter decrement
    (counter($id:expr) -= $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.count_with_tags($crate::CounterMetric::name(&$id), -$value)
                    $(.with_tag(stringify!($k), $v))*
            )
        })
    };

    // gauge set
    (gauge($id:expr) = $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.gauge_with_tags($crate::GaugeMetric::name(&$id), $value)
                    $(.with_tag(stringify!($k), $v))*
            )
        })
    };

    // histogram
    (histogram($id:expr) = $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.histogram_with_tags($crate::HistogramMetric::name(&$id), $value)
                    $(.with_tag(stringify!($k), $v))*
            )
        })
    };

    // sets (count unique occurrences of a value per time interval)
    (set($id:expr) = $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.set_with_tags($crate::SetMetric::name(&$id), $value)
                    $(.with_tag(stringify!($k), $v))*
            )
        })
    };

    // timer value (duration)
    (timer($id:expr) = $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.time_with_tags($crate::TimerMetric::name(&$id), $value)
                    $(.with_tag(stringify!($k), $v))*
            )
        })
    };

    // timed block
    (timer($id:expr), $($k:ident = $v:expr,)* $block:block) => {{
        let now = std::time::Instant::now();
        let rv = {$block};
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.time_with_tags($crate::TimerMetric::name(&$id), now.elapsed())
                    $(.with_tag(stringify!($k), $v))*
            )
        });
        rv
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestCounter;

    impl CounterMetric for TestCounter {
        fn name(&self) -> &'static str {
            "requests"
        }
    }

    struct TestGauge;

    impl GaugeMetric for TestGauge {
        fn name(&self) -> &'static str {
            "queue_size"
        }
    }

    #[test]
    fn test_capturing_client() {
        let captures = with_capturing_test_client(|| {
            metric!(counter(TestCounter) += 1);
            metric!(counter(TestCounter) += 2, status = "ok");
            metric!(gauge(TestGauge) = 42u64);
        });

        assert_eq!(
            captures,
            [
                "requests:1|c",
                "requests:2|c|#status:ok",
                "queue_size:42|g",
            ]
        );
    }

    #[test]
    fn test_noop_without_client() {
        // Must not panic when no client is configured.
        metric!(counter(TestCounter) += 1);
    }
}
