//--------------------------------------------------------------------------------------------------
// STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name            | Description                                     | Key Methods               |
// |-----------------|-------------------------------------------------|---------------------------|
// | BroadcastConfig | Heartbeat period and per-write deadline         | default                   |
// | Registration    | A freshly handshaken stream and its channels    | new, with_permit          |
// | Broadcaster     | Cloneable handle to the registry control loop   | start, add, remove,       |
// |                 |                                                 | publish, dispatch         |
//--------------------------------------------------------------------------------------------------

use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::{OwnedSemaphorePermit, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::domain::models::{Client, ClientRef, Event};
use crate::domain::services::connection::{ClientStream, Connection};
use crate::domain::services::metrics::Metrics;
use crate::shutdown::ShutdownSignal;

use super::dispatch::fan_out;
use super::error::{RegistryError, RegistryResult};
use super::roster::Roster;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(10);

const ADD_QUEUE: usize = 64;
const PUBLISH_QUEUE: usize = 1;

/// Settings of the broadcast registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastConfig {
    /// Period of the synthetic heartbeat event
    pub heartbeat_interval: Duration,
    /// Deadline for writing one payload to one client
    pub write_timeout: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// A client ready to be registered: its stream, after the preamble was
/// written, and the channels it subscribed to.
pub struct Registration {
    pub channels: Vec<String>,
    pub stream: ClientStream,
    pub permit: Option<OwnedSemaphorePermit>,
}

impl Registration {
    pub fn new(channels: Vec<String>, stream: ClientStream) -> Self {
        Self {
            channels,
            stream,
            permit: None,
        }
    }

    /// Attaches a connection-limit permit, released when the client's worker ends.
    pub fn with_permit(mut self, permit: Option<OwnedSemaphorePermit>) -> Self {
        self.permit = permit;
        self
    }
}

struct Publish {
    event: Event,
    reply: Option<oneshot::Sender<Vec<Duration>>>,
}

/// Handle to the broadcast registry.
///
/// The registry is a single task that owns the client roster. Every
/// mutation and every dispatch decision goes through its queues:
///
/// +-------------+     add      +-----------------+   spawn   +------------+
/// | handshake   | -----------> |                 | --------> | Connection |
/// +-------------+              |  control loop   |           +------------+
/// | relay       | -- publish ->|  (owns Roster)  |                 |
/// +-------------+              |                 | <-- remove -----+
///                              +-----------------+
///
/// Publishes, heartbeats included, are dispatched one at a time: the next
/// one starts only after every sample of the previous one was collected.
/// Adds and removals keep being served while a dispatch is in flight.
#[derive(Clone)]
pub struct Broadcaster {
    adds: mpsc::Sender<Registration>,
    removals: mpsc::UnboundedSender<ClientRef>,
    publishes: mpsc::Sender<Publish>,
}

impl Broadcaster {
    /// Spawns the registry control loop.
    ///
    /// # Arguments
    /// * `config` - Heartbeat period and write deadline
    /// * `metrics` - Sink for heartbeat counts and publish timings
    /// * `shutdown` - The loop stops and drops every client once this leaves `Running`
    ///
    /// # Returns
    /// The handle and the loop's join handle
    pub fn start(
        config: BroadcastConfig,
        metrics: Arc<dyn Metrics>,
        shutdown: ShutdownSignal,
    ) -> (Self, JoinHandle<()>) {
        let (adds, add_rx) = mpsc::channel(ADD_QUEUE);
        let (removals, removal_rx) = mpsc::unbounded_channel();
        let (publishes, publish_rx) = mpsc::channel(PUBLISH_QUEUE);

        let registry = Registry {
            roster: Roster::new(),
            config,
            metrics,
            removals: removals.clone(),
        };

        info!(
            heartbeat = ?config.heartbeat_interval,
            write_timeout = ?config.write_timeout,
            "Starting broadcast registry"
        );
        let handle = tokio::spawn(registry.run(add_rx, removal_rx, publish_rx, shutdown));

        (
            Self {
                adds,
                removals,
                publishes,
            },
            handle,
        )
    }

    /// Registers a client and starts its connection worker.
    pub async fn add(&self, registration: Registration) -> RegistryResult<()> {
        self.adds
            .send(registration)
            .await
            .map_err(|_| RegistryError::Stopped)
    }

    /// Asks the registry to drop a client.
    pub fn remove(&self, client: ClientRef) -> RegistryResult<()> {
        self.removals
            .send(client)
            .map_err(|_| RegistryError::Stopped)
    }

    /// Queues an event for dispatch.
    ///
    /// Returns once the registry has accepted the event; waits while another
    /// event is queued ahead of it.
    pub async fn publish(&self, event: Event) -> RegistryResult<()> {
        self.publishes
            .send(Publish { event, reply: None })
            .await
            .map_err(|_| RegistryError::Stopped)
    }

    /// Dispatches an event and waits for its timing samples.
    ///
    /// # Returns
    /// One sample per targeted client; `Duration::ZERO` marks a failed delivery
    pub async fn dispatch(&self, event: Event) -> RegistryResult<Vec<Duration>> {
        let (reply, samples) = oneshot::channel();
        self.publishes
            .send(Publish {
                event,
                reply: Some(reply),
            })
            .await
            .map_err(|_| RegistryError::Stopped)?;

        samples.await.map_err(|_| RegistryError::Stopped)
    }
}

struct Registry {
    roster: Roster,
    config: BroadcastConfig,
    metrics: Arc<dyn Metrics>,
    removals: mpsc::UnboundedSender<ClientRef>,
}

impl Registry {
    async fn run(
        mut self,
        mut adds: mpsc::Receiver<Registration>,
        mut removals: mpsc::UnboundedReceiver<ClientRef>,
        mut publishes: mpsc::Receiver<Publish>,
        mut shutdown: ShutdownSignal,
    ) {
        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let (dispatched, mut dispatch_done) = mpsc::channel::<()>(1);
        let mut dispatching = false;
        let mut heartbeat_pending = false;

        loop {
            select! {
                _ = shutdown.draining() => break,

                Some(registration) = adds.recv() => self.add(registration),

                Some(client) = removals.recv() => self.remove(&client),

                Some(()) = dispatch_done.recv() => {
                    dispatching = false;
                    if heartbeat_pending {
                        heartbeat_pending = false;
                        self.start_dispatch(Publish { event: Event::Ping, reply: None }, &dispatched);
                        dispatching = true;
                    }
                }

                Some(publish) = publishes.recv(), if !dispatching => {
                    self.start_dispatch(publish, &dispatched);
                    dispatching = true;
                }

                _ = heartbeat.tick() => {
                    if dispatching {
                        heartbeat_pending = true;
                    } else {
                        self.start_dispatch(Publish { event: Event::Ping, reply: None }, &dispatched);
                        dispatching = true;
                    }
                }
            }
        }

        info!(clients = self.roster.len(), "Broadcast registry stopping");
        self.roster.clear();
    }

    fn add(&mut self, registration: Registration) {
        let Registration {
            channels,
            stream,
            permit,
        } = registration;

        let (client, mailbox) = Client::new(channels);
        let connection = Connection::new(
            stream,
            mailbox,
            self.removals.clone(),
            self.config.write_timeout,
        )
        .with_permit(permit);

        tokio::spawn(connection.run());
        self.roster.add(client);
        debug!(clients = self.roster.len(), "client registered");
    }

    fn remove(&mut self, client: &ClientRef) {
        match self.roster.remove(client) {
            Ok(_) => debug!(clients = self.roster.len(), "client removed"),
            Err(err) => warn!("ignoring removal request: {}", err),
        }
    }

    fn start_dispatch(&self, publish: Publish, dispatched: &mpsc::Sender<()>) {
        let targets: Vec<Client> = publish
            .event
            .select(self.roster.clients())
            .into_iter()
            .cloned()
            .collect();
        let metrics = self.metrics.clone();
        let dispatched = dispatched.clone();

        tokio::spawn(async move {
            let samples = fan_out(&publish.event, &targets, metrics.as_ref()).await;
            drop(targets);

            if let Some(reply) = publish.reply {
                let _ = reply.send(samples);
            }
            // Fails only when the control loop is gone.
            let _ = dispatched.send(()).await;
        });
    }
}
