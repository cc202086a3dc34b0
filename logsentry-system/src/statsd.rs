use logsentry_statsd::GaugeMetric;

/// Gauges emitted by the service framework.
pub enum SystemGauges {
    /// Number of messages sitting in a service's inbound channel.
    ///
    /// This metric is tagged with:
    /// - `service`: the service name.
    ServiceBackPressure,
}

impl GaugeMetric for SystemGauges {
    fn name(&self) -> &'static str {
        match self {
            Self::ServiceBackPressure => "service.back_pressure",
        }
    }
}
