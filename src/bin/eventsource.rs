//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Entry point of the eventsource server. Wires the message bus subscription, the broadcast
// registry and the TCP server together and runs them until a shutdown signal arrives.
//--------------------------------------------------------------------------------------------------

use std::sync::Arc;

use anyhow::{Context, Result};
use rabbitmq::RabbitMQBuilder;
use tracing::{Level, debug, error, info, warn};
use uuid::Uuid;

use eventsource_server::domain::services::metrics::from_provider;
use eventsource_server::shutdown::wait_for_signal;
use eventsource_server::{
    Broadcaster, BufferedMetrics, Config, Handshake, Metrics, NoopMetrics, Server, Shutdown,
    relay,
};

const APP_ID: &str = "eventsource";
const METRICS_QUEUE: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(if config.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    // Metrics sink, buffered so dispatch never waits on it
    let buffered = if config.metrics {
        let sink = from_provider(
            &config.metrics_provider,
            &config.metrics_prefix,
            &config.statsd_addr,
        )
        .context("failed to set up metrics")?;
        info!(provider = %config.metrics_provider, prefix = %config.metrics_prefix, "Metrics enabled");
        Some(Arc::new(BufferedMetrics::spawn(sink, METRICS_QUEUE)))
    } else {
        None
    };
    let metrics: Arc<dyn Metrics> = match &buffered {
        Some(buffered) => buffered.clone(),
        None => Arc::new(NoopMetrics),
    };

    // First signal drains, a second one exits immediately
    let shutdown = Shutdown::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            loop {
                if let Err(err) = wait_for_signal().await {
                    error!("Failed to listen for shutdown signals: {}", err);
                    return;
                }
                if shutdown.drain() {
                    info!("Shutting down, press Ctrl+C again to exit immediately");
                } else {
                    warn!("Second shutdown signal, exiting");
                    std::process::exit(1);
                }
            }
        }
    });

    let (broadcaster, registry_loop) =
        Broadcaster::start(config.broadcast_config(), metrics, shutdown.signal());

    info!("Connecting to RabbitMQ at: {}", config.amqp_url);
    let mut subscription = RabbitMQBuilder::new(&config.amqp_url, APP_ID)
        .exchange(&config.topic, config.exchange_type)
        .queue(config.queue_spec())
        .consumer_tag(&format!("{}-{}", APP_ID, Uuid::new_v4()))
        .prefetch(config.prefetch)
        .subscribe()
        .await
        .context("failed to subscribe to the message bus")?;
    info!(
        exchange = %config.topic,
        queue = %subscription.queue_name(),
        "Subscribed to the message bus"
    );

    let handshake = Handshake::new(
        config.handshake_options(),
        config.channel_resolver(),
        broadcaster.clone(),
    );
    let server = Server::bind(config.server_config(), handshake)
        .await
        .context("failed to bind the server")?;

    let relay_task = tokio::spawn({
        let options = config.relay_options();
        let signal = shutdown.signal();
        async move {
            match relay(&mut subscription, &broadcaster, options, signal.clone()).await {
                Ok(()) => {}
                Err(err) if !signal.is_running() => debug!("Relay ended during shutdown: {}", err),
                Err(err) => {
                    // No reconnect: losing the bus takes the process down.
                    error!("Relay stopped: {}", err);
                    std::process::exit(1);
                }
            }
            if let Err(err) = subscription.close().await {
                warn!("Failed to close the subscription: {}", err);
            }
        }
    });

    server.run_until(shutdown.signal()).await;

    if let Err(err) = relay_task.await {
        error!("Relay task failed: {}", err);
    }
    if let Err(err) = registry_loop.await {
        error!("Registry loop failed: {}", err);
    }
    if let Some(buffered) = buffered.and_then(Arc::into_inner) {
        buffered.flush().await;
    }

    shutdown.stop();
    info!("Shutdown complete");
    Ok(())
}
