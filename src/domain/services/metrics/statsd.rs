use std::net::UdpSocket;
use std::time::Duration;

use cadence::prelude::*;
use cadence::{MetricError, QueuingMetricSink, StatsdClient, UdpMetricSink};
use rand::Rng;
use tracing::debug;

use super::{Metrics, MetricsError};
use crate::domain::models::Event;

const SAMPLE_RATE: f64 = 0.25;

/// Statsd sink over UDP.
///
/// Emits the gauge `<prefix>.connections` and, sampled at 25%, the timings
/// `<prefix>.publish.timing` and `<prefix>.publish.connection_write.timing`
/// (one per successful client write). Metrics are queued and sent from a
/// background thread, so recording never waits on the network.
pub struct StatsdMetrics {
    client: StatsdClient,
    sample_rate: f64,
}

impl StatsdMetrics {
    /// Connects a queued UDP client to the daemon at `addr`.
    ///
    /// # Arguments
    /// * `addr` - Daemon address, e.g. `127.0.0.1:8125`
    /// * `prefix` - Prepended to every metric name
    pub fn connect(addr: &str, prefix: &str) -> Result<Self, MetricsError> {
        let to_error = |source| MetricsError::Statsd {
            addr: addr.to_owned(),
            source,
        };

        let socket =
            UdpSocket::bind("0.0.0.0:0").map_err(|err| to_error(MetricError::from(err)))?;
        let udp = UdpMetricSink::from(addr, socket).map_err(to_error)?;
        let client = StatsdClient::from_sink(prefix, QueuingMetricSink::from(udp));
        debug!(%addr, "statsd metrics connected");

        Ok(Self::new(client))
    }

    pub fn new(client: StatsdClient) -> Self {
        Self {
            client,
            sample_rate: SAMPLE_RATE,
        }
    }

    /// Overrides the share of timings that are sent.
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate.clamp(0.0, 1.0);
        self
    }

    fn timing(&self, rng: &mut impl Rng, key: &str, value: Duration) {
        // The client only tags the rate; dropping is up to the sender.
        if !rng.gen_bool(self.sample_rate) {
            return;
        }
        if let Err(err) = self
            .client
            .time_with_tags(key, value)
            .with_sampling_rate(self.sample_rate)
            .try_send()
        {
            debug!("statsd timing dropped: {}", err);
        }
    }
}

impl std::fmt::Debug for StatsdMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsdMetrics")
            .field("sample_rate", &self.sample_rate)
            .finish_non_exhaustive()
    }
}

impl Metrics for StatsdMetrics {
    fn record_connected_clients(&self, count: usize) {
        if let Err(err) = self.client.gauge("connections", count as u64) {
            debug!("statsd gauge dropped: {}", err);
        }
    }

    fn record_publish_completed(&self, _event: &Event, total: Duration, samples: &[Duration]) {
        let mut rng = rand::thread_rng();

        self.timing(&mut rng, "publish.timing", total);
        for sample in samples.iter().filter(|sample| !sample.is_zero()) {
            self.timing(&mut rng, "publish.connection_write.timing", *sample);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::MessageEvent;

    async fn recv_line(daemon: &tokio::net::UdpSocket) -> String {
        let mut buf = [0u8; 256];
        let len = tokio::time::timeout(Duration::from_secs(2), daemon.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8(buf[..len].to_vec()).unwrap()
    }

    #[tokio::test]
    async fn gauge_reaches_the_daemon() {
        let daemon = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = daemon.local_addr().unwrap().to_string();

        let metrics = StatsdMetrics::connect(&addr, "production").unwrap();
        metrics.record_connected_clients(3);

        assert_eq!(recv_line(&daemon).await, "production.connections:3|g");
    }

    #[tokio::test]
    async fn timings_skip_failed_writes() {
        let daemon = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = daemon.local_addr().unwrap().to_string();

        let metrics = StatsdMetrics::connect(&addr, "staging")
            .unwrap()
            .with_sample_rate(1.0);
        let event: Event = MessageEvent::new(&b"{}"[..]).into();
        metrics.record_publish_completed(
            &event,
            Duration::from_millis(2),
            &[Duration::ZERO, Duration::from_millis(1)],
        );

        assert!(recv_line(&daemon).await.starts_with("staging.publish.timing:2|ms"));
        assert!(
            recv_line(&daemon)
                .await
                .starts_with("staging.publish.connection_write.timing:1|ms")
        );
    }

    #[test]
    fn invalid_daemon_address_is_reported() {
        assert!(matches!(
            StatsdMetrics::connect("not an address", "production"),
            Err(MetricsError::Statsd { .. })
        ));
    }
}
