//! Transport subscriber: binds a ZeroMQ `SUB` socket, subscribes to the
//! topic filter, and polls in a loop with a short timeout so it can
//! observe cancellation without blocking forever.

use std::time::Duration;

use kvindex_common::config::EventPoolConfig;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::wire::{decode_seq, parse_topic, Message};

const POLL_TIMEOUT_MS: i64 = 250;
const REOPEN_BACKOFF: Duration = Duration::from_millis(500);

/// Runs the subscriber loop until `cancel` fires, forwarding parsed messages
/// to `tx`. Intended to be driven via `std::thread::spawn` since the `zmq`
/// crate's socket calls are synchronous; `cancel.is_cancelled()` is the
/// synchronous check this blocking thread can afford (it can't `.await`).
pub fn run(config: EventPoolConfig, tx: mpsc::Sender<Message>, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match open_socket(&config) {
            Ok(socket) => poll_loop(&socket, &config, &tx, &cancel),
            Err(e) => {
                warn!(target: "events", error = %e, "failed to open subscriber socket, retrying");
                std::thread::sleep(REOPEN_BACKOFF);
            }
        }
        if !cancel.is_cancelled() {
            warn!(target: "events", "subscriber socket closed, reopening after backoff");
            std::thread::sleep(REOPEN_BACKOFF);
        }
    }
}

fn open_socket(config: &EventPoolConfig) -> Result<zmq::Socket, zmq::Error> {
    let ctx = zmq::Context::new();
    let socket = ctx.socket(zmq::SUB)?;
    socket.bind(&config.zmq_endpoint)?;
    socket.set_subscribe(config.topic_filter.as_bytes())?;
    Ok(socket)
}

fn poll_loop(
    socket: &zmq::Socket,
    config: &EventPoolConfig,
    tx: &mpsc::Sender<Message>,
    cancel: &CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let ready = match socket.poll(zmq::POLLIN, POLL_TIMEOUT_MS) {
            Ok(n) => n,
            Err(_) => return, // transport error: let the caller reopen the socket
        };
        if ready == 0 {
            continue;
        }
        let frames = match socket.recv_multipart(0) {
            Ok(f) => f,
            Err(_) => return,
        };
        if frames.len() != 3 {
            debug!(target: "events", frame_count = frames.len(), "dropping malformed frame set");
            continue;
        }
        let Ok(topic) = std::str::from_utf8(&frames[0]) else {
            debug!(target: "events", "dropping non-UTF8 topic");
            continue;
        };
        let Some((pod_identifier, model_name)) = parse_topic(topic, &config.topic_filter) else {
            debug!(target: "events", topic, "dropping topic not matching kv@<pod>@<model>");
            continue;
        };
        let seq = match decode_seq(&frames[1]) {
            Ok(seq) => seq,
            Err(e) => {
                debug!(target: "events", error = %e, "dropping malformed seq frame");
                continue;
            }
        };
        let message = Message {
            pod_identifier,
            model_name,
            seq,
            payload: frames[2].clone(),
        };
        if tx.blocking_send(message).is_err() {
            return; // pool shut down
        }
    }
}
