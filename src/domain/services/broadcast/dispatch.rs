use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::join_all;
use tokio::select;
use tracing::{debug, error};

use crate::domain::models::{Client, Event, Payload};
use crate::domain::services::metrics::Metrics;

/// Delivers one event to every target concurrently and reports the samples.
///
/// Resolves once every target has answered, with one sample per target in
/// target order. A heartbeat reports the number of samples as the connected
/// client count; a message reports the full timing.
pub async fn fan_out(event: &Event, targets: &[Client], metrics: &dyn Metrics) -> Vec<Duration> {
    let started = Instant::now();

    let data = match event.to_bytes() {
        Ok(data) => data,
        Err(err) => {
            error!(event = event.label(), "failed to render event: {}", err);
            return Vec::new();
        }
    };

    let samples = join_all(targets.iter().map(|client| deliver(client, data.clone()))).await;
    let total = started.elapsed();

    debug!(
        event = event.label(),
        targets = samples.len(),
        failed = samples.iter().filter(|sample| sample.is_zero()).count(),
        ?total,
        "dispatch completed"
    );

    match event {
        Event::Ping => metrics.record_connected_clients(samples.len()),
        Event::Message(_) => metrics.record_publish_completed(event, total, &samples),
    }

    samples
}

/// Hands one payload to a client and waits for its sample.
///
/// A client whose liveness signal is closed is answered with zero right away
/// instead of being waited on.
pub async fn deliver(client: &Client, data: Bytes) -> Duration {
    let (payload, done) = Payload::new(data);

    select! {
        biased;
        _ = client.liveness().cancelled() => return Duration::ZERO,
        sent = client.mailbox().send(payload) => {
            if sent.is_err() {
                return Duration::ZERO;
            }
        }
    }

    done.await.unwrap_or(Duration::ZERO)
}
