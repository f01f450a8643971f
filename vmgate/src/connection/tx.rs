use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::trace;
use vmgate_protocol::OutboundFrame;

/// Cloneable handle workers use to emit frames on a connection.
///
/// Teardown flips the `alive` flag before draining workers, so a worker
/// that races the close cannot get another frame onto the wire. Sends
/// after the receiver is gone are silently dropped for the same reason.
#[derive(Clone)]
pub struct ConnectionTx {
    alive: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

impl ConnectionTx {
    pub fn channel() -> (ConnectionTx, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConnectionTx {
                alive: Arc::new(AtomicBool::new(true)),
                tx,
            },
            rx,
        )
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark the connection dead. Frames sent after this are dropped.
    pub fn close(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn send(&self, frame: OutboundFrame) {
        if !self.is_alive() {
            trace!("dropping frame for closed connection");
            return;
        }
        let _ = self.tx.send(frame);
    }

    pub fn reply(&self, id: &str, data: Value) {
        self.send(OutboundFrame::reply(id, data));
    }

    pub fn error(&self, id: &str, message: impl Into<String>) {
        self.send(OutboundFrame::error(id, message));
    }

    /// Emit a named event. `scope` is the session uuid for session-scoped
    /// events or the originating request id for workflow feedback.
    pub fn event(&self, name: &str, data: Vec<Value>, scope: Option<&str>) {
        self.send(OutboundFrame::event(name, data, scope.map(String::from)));
    }

    /// Workflow terminal: success with a message and optional payload.
    pub fn succeed(&self, event_id: &str, data: Vec<Value>) {
        self.event("succeed", data, Some(event_id));
    }

    /// Workflow terminal: failure with a message and wire code.
    pub fn failed(&self, event_id: &str, message: &str, code: i32) {
        self.event("failed", vec![json!(message), json!(code)], Some(event_id));
    }
}
