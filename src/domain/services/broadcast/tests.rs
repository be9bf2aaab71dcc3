use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, DuplexStream, duplex};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::domain::models::{Client, Event, MessageEvent};
use crate::domain::services::broadcast::{
    BroadcastConfig, Broadcaster, RegistryError, Registration,
};
use crate::domain::services::metrics::{MockMetrics, NoopMetrics};
use crate::shutdown::Shutdown;

const WAIT: Duration = Duration::from_secs(2);

fn config() -> BroadcastConfig {
    BroadcastConfig {
        heartbeat_interval: Duration::from_secs(3600),
        write_timeout: Duration::from_millis(10),
    }
}

fn channels(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

fn new_registration(names: &[&str], buffer: usize) -> (Registration, DuplexStream) {
    let (server_side, browser) = duplex(buffer);
    (
        Registration::new(channels(names), Box::new(server_side)),
        browser,
    )
}

// Adds and publishes travel on different queues, so wait until the
// registry reports the expected roster before publishing.
async fn wait_for_clients(broadcaster: &Broadcaster, expected: usize) {
    timeout(WAIT, async {
        loop {
            let samples = broadcaster.dispatch(Event::Ping).await.unwrap();
            if samples.iter().filter(|s| !s.is_zero()).count() == expected
                && samples.len() == expected
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

async fn next_data_frame(browser: &mut DuplexStream) -> String {
    timeout(WAIT, async {
        loop {
            let mut frame = Vec::new();
            while !frame.ends_with(b"\n\n") {
                let mut byte = [0u8; 1];
                browser.read_exact(&mut byte).await.unwrap();
                frame.push(byte[0]);
            }
            if frame != b":ping\n\n" {
                return String::from_utf8(frame).unwrap();
            }
        }
    })
    .await
    .unwrap()
}

async fn nothing_but_pings(browser: &mut DuplexStream) -> bool {
    let mut buf = [0u8; 256];
    match timeout(Duration::from_millis(50), browser.read(&mut buf)).await {
        Err(_) => true,
        Ok(Ok(len)) => buf[..len].chunks(7).all(|chunk| chunk == b":ping\n\n"),
        Ok(Err(_)) => false,
    }
}

#[tokio::test]
async fn heartbeat_reports_connected_clients() {
    let shutdown = Shutdown::new();
    let (counts_tx, mut counts) = mpsc::unbounded_channel();

    let mut metrics = MockMetrics::new();
    metrics
        .expect_record_connected_clients()
        .returning(move |count| {
            let _ = counts_tx.send(count);
        });

    let config = BroadcastConfig {
        heartbeat_interval: Duration::from_millis(200),
        ..config()
    };
    let (broadcaster, _loop) = Broadcaster::start(config, Arc::new(metrics), shutdown.signal());

    let mut browsers = Vec::new();
    for _ in 0..3 {
        let (registration, browser) = new_registration(&[], 1024);
        broadcaster.add(registration).await.unwrap();
        browsers.push(browser);
    }

    let count = timeout(WAIT, counts.recv()).await.unwrap().unwrap();
    assert_eq!(count, 3);

    let mut frame = [0u8; 7];
    for browser in browsers.iter_mut() {
        browser.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame, b":ping\n\n");
    }

    shutdown.drain();
}

#[tokio::test]
async fn publish_reaches_only_subscribed_clients() {
    let shutdown = Shutdown::new();
    let (broadcaster, _loop) =
        Broadcaster::start(config(), Arc::new(NoopMetrics), shutdown.signal());

    let (first, mut first_browser) = new_registration(&["a", "b"], 1024);
    let (second, mut second_browser) = new_registration(&["c", "d"], 1024);
    broadcaster.add(first).await.unwrap();
    broadcaster.add(second).await.unwrap();
    wait_for_clients(&broadcaster, 2).await;

    let event: Event = MessageEvent::new(r#"{"id":1}"#)
        .with_id(1)
        .with_channels(channels(&["b", "e"]))
        .into();
    let samples = broadcaster.dispatch(event).await.unwrap();

    assert_eq!(samples.len(), 1);
    assert!(samples[0] > Duration::ZERO);
    assert_eq!(
        next_data_frame(&mut first_browser).await,
        "id: 1\ndata: {\"id\":1}\n\n"
    );
    assert!(nothing_but_pings(&mut second_browser).await);

    shutdown.drain();
}

#[tokio::test]
async fn global_publish_reaches_everyone_in_order() {
    let shutdown = Shutdown::new();
    let (broadcaster, _loop) =
        Broadcaster::start(config(), Arc::new(NoopMetrics), shutdown.signal());

    let (subscribed, mut subscribed_browser) = new_registration(&["orders"], 1024);
    let (global, mut global_browser) = new_registration(&[], 1024);
    broadcaster.add(subscribed).await.unwrap();
    broadcaster.add(global).await.unwrap();
    wait_for_clients(&broadcaster, 2).await;

    for n in 1..=3 {
        broadcaster
            .publish(MessageEvent::new(format!("{}", n)).into())
            .await
            .unwrap();
    }

    for browser in [&mut subscribed_browser, &mut global_browser] {
        assert_eq!(next_data_frame(browser).await, "data: 1\n\n");
        assert_eq!(next_data_frame(browser).await, "data: 2\n\n");
        assert_eq!(next_data_frame(browser).await, "data: 3\n\n");
    }

    shutdown.drain();
}

#[tokio::test]
async fn slow_client_is_isolated_and_removed() {
    let shutdown = Shutdown::new();
    let (broadcaster, _loop) =
        Broadcaster::start(config(), Arc::new(NoopMetrics), shutdown.signal());

    let (fast, mut fast_browser) = new_registration(&[], 4096);
    // Too small for the payload, and never read.
    let (slow, _slow_browser) = new_registration(&[], 64);
    broadcaster.add(fast).await.unwrap();
    broadcaster.add(slow).await.unwrap();
    wait_for_clients(&broadcaster, 2).await;

    let payload = "x".repeat(512);
    let samples = broadcaster
        .dispatch(MessageEvent::new(payload.clone()).into())
        .await
        .unwrap();

    assert_eq!(samples.len(), 2);
    assert_eq!(samples.iter().filter(|s| s.is_zero()).count(), 1);
    assert_eq!(
        next_data_frame(&mut fast_browser).await,
        format!("data: {}\n\n", payload)
    );

    // The failed worker asks for its own removal.
    timeout(WAIT, async {
        loop {
            if broadcaster.dispatch(Event::Ping).await.unwrap().len() == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let samples = broadcaster
        .dispatch(MessageEvent::new("after").into())
        .await
        .unwrap();
    assert_eq!(samples.len(), 1);
    assert!(samples[0] > Duration::ZERO);
    assert_eq!(next_data_frame(&mut fast_browser).await, "data: after\n\n");

    shutdown.drain();
}

#[tokio::test]
async fn next_publish_waits_for_every_sample_of_the_previous_one() {
    let shutdown = Shutdown::new();
    let write_timeout = Duration::from_millis(200);
    let config = BroadcastConfig {
        write_timeout,
        ..config()
    };
    let (broadcaster, _loop) = Broadcaster::start(config, Arc::new(NoopMetrics), shutdown.signal());

    let (fast, mut fast_browser) = new_registration(&[], 4096);
    let (stalled, _stalled_browser) = new_registration(&[], 256);
    broadcaster.add(fast).await.unwrap();
    broadcaster.add(stalled).await.unwrap();
    wait_for_clients(&broadcaster, 2).await;

    let payload = "a".repeat(1024);
    let started = Instant::now();
    let first = tokio::spawn({
        let broadcaster = broadcaster.clone();
        let event: Event = MessageEvent::new(payload.clone()).into();
        async move { broadcaster.dispatch(event).await }
    });
    assert_eq!(
        next_data_frame(&mut fast_browser).await,
        format!("data: {}\n\n", payload)
    );

    broadcaster
        .publish(MessageEvent::new("second").into())
        .await
        .unwrap();
    assert_eq!(next_data_frame(&mut fast_browser).await, "data: second\n\n");

    // The stalled write only gives up after its deadline.
    assert!(started.elapsed() >= write_timeout);
    let samples = timeout(WAIT, first).await.unwrap().unwrap().unwrap();
    assert_eq!(samples.len(), 2);
    assert_eq!(samples.iter().filter(|s| s.is_zero()).count(), 1);

    shutdown.drain();
}

#[derive(Debug)]
enum Recorded {
    Heartbeat(Instant),
    Published(Instant),
}

#[tokio::test]
async fn heartbeat_during_dispatch_is_sent_once_afterwards() {
    let shutdown = Shutdown::new();
    let (records_tx, mut records) = mpsc::unbounded_channel();

    let mut metrics = MockMetrics::new();
    let heartbeats_tx = records_tx.clone();
    metrics
        .expect_record_connected_clients()
        .returning(move |_| {
            let _ = heartbeats_tx.send(Recorded::Heartbeat(Instant::now()));
        });
    metrics
        .expect_record_publish_completed()
        .returning(move |_, _, _| {
            let _ = records_tx.send(Recorded::Published(Instant::now()));
        });

    // Ticks at 200ms and 400ms land inside the 500ms stalled write; the
    // next regular one is due at 600ms.
    let config = BroadcastConfig {
        heartbeat_interval: Duration::from_millis(200),
        write_timeout: Duration::from_millis(500),
    };
    let (broadcaster, _loop) = Broadcaster::start(config, Arc::new(metrics), shutdown.signal());

    let (fast, _fast_browser) = new_registration(&[], 4096);
    let (stalled, _stalled_browser) = new_registration(&[], 256);
    broadcaster.add(fast).await.unwrap();
    broadcaster.add(stalled).await.unwrap();
    wait_for_clients(&broadcaster, 2).await;
    while records.try_recv().is_ok() {}

    let samples = broadcaster
        .dispatch(MessageEvent::new("a".repeat(1024)).into())
        .await
        .unwrap();
    assert_eq!(samples.iter().filter(|s| s.is_zero()).count(), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut published = None;
    let mut heartbeats = Vec::new();
    while let Ok(record) = records.try_recv() {
        match record {
            Recorded::Published(at) => published = Some(at),
            Recorded::Heartbeat(at) => heartbeats.push(at),
        }
    }

    let published = published.unwrap();
    assert_eq!(heartbeats.len(), 1, "{:?}", heartbeats);
    assert!(heartbeats[0] >= published);

    shutdown.drain();
}

#[tokio::test]
async fn removing_unknown_client_keeps_registry_running() {
    let shutdown = Shutdown::new();
    let (broadcaster, _loop) =
        Broadcaster::start(config(), Arc::new(NoopMetrics), shutdown.signal());

    let (stranger, _mailbox) = Client::new(vec![]);
    broadcaster.remove(stranger.downgrade()).unwrap();

    let (registration, _browser) = new_registration(&[], 1024);
    broadcaster.add(registration).await.unwrap();
    wait_for_clients(&broadcaster, 1).await;

    shutdown.drain();
}

#[tokio::test]
async fn publish_metrics_receive_every_sample() {
    let shutdown = Shutdown::new();
    let (samples_tx, mut reported) = mpsc::unbounded_channel();

    let mut metrics = MockMetrics::new();
    metrics.expect_record_connected_clients().returning(|_| ());
    metrics
        .expect_record_publish_completed()
        .returning(move |event, _total, samples| {
            let _ = samples_tx.send((event.label().to_owned(), samples.len()));
        });

    let (broadcaster, _loop) =
        Broadcaster::start(config(), Arc::new(metrics), shutdown.signal());

    let mut browsers = Vec::new();
    for _ in 0..2 {
        let (registration, browser) = new_registration(&["orders"], 1024);
        broadcaster.add(registration).await.unwrap();
        browsers.push(browser);
    }
    wait_for_clients(&broadcaster, 2).await;

    broadcaster
        .dispatch(
            MessageEvent::new("{}")
                .with_name("order_created")
                .with_channels(channels(&["orders"]))
                .into(),
        )
        .await
        .unwrap();

    let (label, count) = timeout(WAIT, reported.recv()).await.unwrap().unwrap();
    assert_eq!(label, "order_created");
    assert_eq!(count, 2);

    shutdown.drain();
}

#[tokio::test]
async fn shutdown_closes_every_stream() {
    let shutdown = Shutdown::new();
    let (broadcaster, registry_loop) =
        Broadcaster::start(config(), Arc::new(NoopMetrics), shutdown.signal());

    let (registration, mut browser) = new_registration(&[], 1024);
    broadcaster.add(registration).await.unwrap();
    wait_for_clients(&broadcaster, 1).await;

    shutdown.drain();
    timeout(WAIT, registry_loop).await.unwrap().unwrap();

    let mut rest = Vec::new();
    timeout(WAIT, browser.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.chunks(7).all(|chunk| chunk == b":ping\n\n"));

    let (late, _late_browser) = new_registration(&[], 1024);
    assert_eq!(broadcaster.add(late).await, Err(RegistryError::Stopped));
    assert_eq!(
        broadcaster.publish(Event::Ping).await,
        Err(RegistryError::Stopped)
    );
}
