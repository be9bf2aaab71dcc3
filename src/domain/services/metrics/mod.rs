//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Metrics collaborator of the broadcast registry. The registry reports the live client count
// after every heartbeat and the timing samples of every publish.
//
// | Component       | Description                                                   |
// |-----------------|---------------------------------------------------------------|
// | Metrics         | Trait the registry reports through                            |
// | NoopMetrics     | Discards everything                                           |
// | LogMetrics      | Writes metrics as log lines                                   |
// | StatsdMetrics   | Sends gauges and timings to a statsd daemon over UDP          |
// | BufferedMetrics | Queues records for a background task so callers never block   |
//
//--------------------------------------------------------------------------------------------------

mod statsd;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::domain::models::Event;

pub use statsd::StatsdMetrics;

/// Errors raised while setting up a metrics sink
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Unknown metrics provider: {0}")]
    UnknownProvider(String),

    #[error("Could not reach statsd at {addr}: {source}")]
    Statsd {
        addr: String,
        #[source]
        source: cadence::MetricError,
    },
}

/// Sink for the registry's measurements.
///
/// Implementations are called from dispatch tasks, possibly concurrently,
/// and must return quickly.
#[cfg_attr(test, mockall::automock)]
pub trait Metrics: Send + Sync {
    /// Number of clients a heartbeat was dispatched to.
    fn record_connected_clients(&self, count: usize);

    /// One publish finished.
    ///
    /// # Arguments
    /// * `event` - The published event
    /// * `total` - Time from the start of the dispatch until the last sample arrived
    /// * `samples` - One entry per targeted client; `Duration::ZERO` marks a failed delivery
    fn record_publish_completed(&self, event: &Event, total: Duration, samples: &[Duration]);
}

/// Metrics sink that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn record_connected_clients(&self, _count: usize) {}

    fn record_publish_completed(&self, _event: &Event, _total: Duration, _samples: &[Duration]) {}
}

/// Writes metrics as `[METRIC]` log lines, scoped by a prefix.
#[derive(Debug, Clone)]
pub struct LogMetrics {
    prefix: String,
}

impl LogMetrics {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_owned(),
        }
    }
}

impl Metrics for LogMetrics {
    fn record_connected_clients(&self, count: usize) {
        info!("[METRIC] {}.connections: {}", self.prefix, count);
    }

    fn record_publish_completed(&self, event: &Event, total: Duration, samples: &[Duration]) {
        info!(
            "[METRIC] {}.event_distributed.clients: {} event={} total={:?}",
            self.prefix,
            samples.len(),
            event.label(),
            total
        );
        info!(
            "[METRIC] {}.event_distributed.avg_time: {}ns",
            self.prefix,
            average_nanos(samples)
        );
    }
}

/// Sum of the successful samples divided by the number of samples.
pub(crate) fn average_nanos(samples: &[Duration]) -> u128 {
    if samples.is_empty() {
        return 0;
    }
    let sum: u128 = samples
        .iter()
        .filter(|sample| !sample.is_zero())
        .map(Duration::as_nanos)
        .sum();
    sum / samples.len() as u128
}

enum Record {
    Connected(usize),
    Published {
        event: Event,
        total: Duration,
        samples: Vec<Duration>,
    },
}

/// Puts a bounded queue in front of another sink.
///
/// Records are forwarded by a background task. When the queue is full the
/// record is dropped, so a slow sink can never hold up a dispatch.
pub struct BufferedMetrics {
    queue: mpsc::Sender<Record>,
    worker: JoinHandle<()>,
}

impl BufferedMetrics {
    /// Spawns the forwarding task.
    ///
    /// # Arguments
    /// * `inner` - Sink the records end up in
    /// * `capacity` - Records held before new ones are dropped
    pub fn spawn(inner: Arc<dyn Metrics>, capacity: usize) -> Self {
        let (queue, mut records) = mpsc::channel::<Record>(capacity.max(1));

        let worker = tokio::spawn(async move {
            while let Some(record) = records.recv().await {
                match record {
                    Record::Connected(count) => inner.record_connected_clients(count),
                    Record::Published {
                        event,
                        total,
                        samples,
                    } => inner.record_publish_completed(&event, total, &samples),
                }
            }
            debug!("metrics queue closed");
        });

        Self { queue, worker }
    }

    fn push(&self, record: Record) {
        if let Err(err) = self.queue.try_send(record) {
            debug!("dropping metrics record: {}", err);
        }
    }

    /// Stops accepting records and waits until the queued ones are forwarded.
    pub async fn flush(self) {
        let Self { queue, worker } = self;
        drop(queue);
        let _ = worker.await;
    }
}

impl Metrics for BufferedMetrics {
    fn record_connected_clients(&self, count: usize) {
        self.push(Record::Connected(count));
    }

    fn record_publish_completed(&self, event: &Event, total: Duration, samples: &[Duration]) {
        self.push(Record::Published {
            event: event.clone(),
            total,
            samples: samples.to_vec(),
        });
    }
}

/// Builds the sink named by `provider`.
///
/// # Arguments
/// * `provider` - `log` or `statsd`
/// * `prefix` - Prefix of every metric name
/// * `statsd_addr` - Address of the statsd daemon, only used by `statsd`
pub fn from_provider(
    provider: &str,
    prefix: &str,
    statsd_addr: &str,
) -> Result<Arc<dyn Metrics>, MetricsError> {
    match provider {
        "log" => Ok(Arc::new(LogMetrics::new(prefix))),
        "statsd" => Ok(Arc::new(StatsdMetrics::connect(statsd_addr, prefix)?)),
        other => Err(MetricsError::UnknownProvider(other.to_owned())),
    }
}
