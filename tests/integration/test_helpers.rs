//! Shared helpers for end-to-end tests against `toolpipe-stub-server`.

use std::time::Duration;

use tokio::sync::mpsc;

use toolpipe::client::{Client, ClientEvent};
use toolpipe::config::ClientConfig;

/// Path of the stub server binary built alongside the tests.
pub const STUB: &str = env!("CARGO_BIN_EXE_toolpipe-stub-server");

/// Upper bound for any single wait in these tests.
pub const PATIENCE: Duration = Duration::from_secs(10);

/// Config launching the stub with `args` and short deadlines.
pub fn stub_config(args: &[&str]) -> ClientConfig {
    let mut config = ClientConfig::new(STUB, args.iter().map(|a| (*a).to_owned()).collect());
    config.timeouts.handshake_seconds = 5;
    config.timeouts.request_seconds = 5;
    config.timeouts.tool_call_seconds = 5;
    config.timeouts.shutdown_grace_ms = 500;
    config.timeouts.exit_grace_ms = 200;
    config
}

/// Client plus the receiving end of its event channel.
pub fn new_client(config: ClientConfig) -> (Client, mpsc::Receiver<ClientEvent>) {
    new_client_with_capacity(config, 256)
}

/// [`new_client`] with an event channel holding at most `capacity` events.
pub fn new_client_with_capacity(
    config: ClientConfig,
    capacity: usize,
) -> (Client, mpsc::Receiver<ClientEvent>) {
    let (event_tx, events) = mpsc::channel(capacity);
    let client = Client::new(config, event_tx).expect("valid config");
    (client, events)
}

/// Client that has completed the handshake with a default stub.
pub async fn ready_client() -> (Client, mpsc::Receiver<ClientEvent>) {
    let (client, events) = new_client(stub_config(&[]));
    client.start().await.expect("handshake with stub");
    (client, events)
}

/// Wait for the first event matching `pred`, skipping others.
pub async fn wait_for_event<F>(events: &mut mpsc::Receiver<ClientEvent>, pred: F) -> ClientEvent
where
    F: Fn(&ClientEvent) -> bool,
{
    tokio::time::timeout(PATIENCE, async {
        loop {
            let event = events.recv().await.expect("event channel open");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

/// Collect events already delivered, without waiting.
pub fn drain_events(events: &mut mpsc::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}
