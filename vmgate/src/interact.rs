use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde_json::json;
use tokio::sync::{oneshot, Notify};
use tracing::debug;

use crate::connection::tx::ConnectionTx;

/// Result code returned to a prompting worker when the interaction was
/// aborted (connection teardown or page navigation). Never reaches the
/// wire.
pub const UI_ABORTED: i32 = -1;

/// In-daemon prompt dispatcher.
///
/// A workflow worker calls `confirm`/`alert`/... which emits an
/// `interact` event to the page and parks the worker until the page
/// answers with `interactionCallback` or the connection aborts. At most
/// one prompt is outstanding per connection at any time.
///
/// `abort` is sticky: after it fires, every pending and future prompt
/// resolves to `UI_ABORTED` until a handler acknowledges the abort with
/// `abort_handled`.
pub struct UserInteraction {
    tx: ConnectionTx,
    pending: Mutex<Option<oneshot::Sender<i32>>>,
    aborted: AtomicBool,
    abort_notify: Notify,
}

impl UserInteraction {
    pub fn new(tx: ConnectionTx) -> Self {
        Self {
            tx,
            pending: Mutex::new(None),
            aborted: AtomicBool::new(false),
            abort_notify: Notify::new(),
        }
    }

    /// Ask the user a yes/no question. Returns `ui::OK`, `ui::CANCEL`, or
    /// `UI_ABORTED`.
    pub async fn confirm(&self, title: &str, body: &str) -> i32 {
        self.prompt("confirm", title, body).await
    }

    /// Show a message. The reply only acknowledges display.
    #[allow(dead_code)] // reserved for driver-layer prompts
    pub async fn alert(&self, title: &str, body: &str) -> i32 {
        self.prompt("alert", title, body).await
    }

    /// Ask the user to accept an inline license text.
    #[allow(dead_code)] // reserved for driver-layer prompts
    pub async fn confirm_license(&self, title: &str, text: &str) -> i32 {
        self.prompt("confirmLicense", title, text).await
    }

    /// Ask the user to accept a license served at a URL.
    #[allow(dead_code)] // reserved for driver-layer prompts
    pub async fn confirm_license_url(&self, title: &str, url: &str) -> i32 {
        self.prompt("confirmLicenseURL", title, url).await
    }

    async fn prompt(&self, kind: &str, title: &str, body: &str) -> i32 {
        if self.aborted.load(Ordering::Acquire) {
            return UI_ABORTED;
        }

        let (sender, receiver) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            // A replaced sender drops, resolving the stale prompt as
            // aborted on its worker.
            *pending = Some(sender);
        }

        self.tx
            .event("interact", vec![json!(kind), json!(title), json!(body)], None);

        tokio::select! {
            result = receiver => result.unwrap_or(UI_ABORTED),
            _ = self.abort_notify.notified() => UI_ABORTED,
        }
    }

    /// Deliver the page's `interactionCallback` result to the parked
    /// worker. Returns false when no prompt was outstanding.
    pub fn deliver(&self, result: i32) -> bool {
        let sender = self.pending.lock().unwrap().take();
        match sender {
            Some(sender) => sender.send(result).is_ok(),
            None => {
                debug!("interactionCallback with no pending interaction");
                false
            }
        }
    }

    /// Abort the current and all future prompts. Sticky until
    /// `abort_handled`.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.pending.lock().unwrap().take();
        self.abort_notify.notify_waiters();
    }

    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Acknowledge a handled abort, re-arming the dispatcher.
    pub fn abort_handled(&self) {
        self.aborted.store(false, Ordering::Release);
    }
}
