pub mod request;
pub mod tx;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, info, warn};
use vmgate_protocol::{codes, Action, ActionFrame, SessionVerb};

use crate::config::ThrottleConfig;
use crate::core::Core;
use crate::hypervisor::compare_versions;
use crate::interact::UserInteraction;
use crate::session::controller;
use crate::workers::{DrainGate, WorkerPool};

use self::request::WorkflowCtx;
use self::tx::ConnectionTx;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Grace period for workers to notice cancellation during teardown.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Per-connection rate limit on session requests the user has denied.
///
/// Consecutive denials inside one window accumulate; reaching the
/// configured count blocks the connection for its remaining lifetime.
/// Any accept resets the accounting (but never un-blocks).
pub struct Throttle {
    cfg: ThrottleConfig,
    state: Mutex<ThrottleState>,
}

#[derive(Default)]
struct ThrottleState {
    window_start: Option<Instant>,
    denies: u32,
    blocked: bool,
}

impl Throttle {
    pub fn new(cfg: ThrottleConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(ThrottleState::default()),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.state.lock().unwrap().blocked
    }

    pub fn note_denied(&self) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let in_window = state
            .window_start
            .is_some_and(|start| now.duration_since(start).as_millis() as u64 <= self.cfg.timespan_ms);
        if in_window {
            state.denies += 1;
        } else {
            state.window_start = Some(now);
            state.denies = 1;
        }
        if state.denies >= self.cfg.tries {
            state.blocked = true;
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.window_start = None;
        state.denies = 0;
    }
}

/// Per-WebSocket orchestrator: routes framed actions, gates privileged
/// commands, runs the session-request workflow on pooled workers, and
/// coordinates teardown when the socket closes.
pub struct Connection {
    conn_id: u64,
    domain: String,
    core: Arc<Core>,
    tx: ConnectionTx,
    interact: Arc<UserInteraction>,
    workers: Arc<WorkerPool>,
    drain: DrainGate,
    throttle: Arc<Throttle>,
    privileged: AtomicBool,
    /// Set while an installer workflow started by this connection runs.
    install_in_progress: Arc<AtomicBool>,
}

impl Connection {
    pub fn new(core: Arc<Core>, domain: String, tx: ConnectionTx) -> Connection {
        let throttle_cfg = core.config().throttle;
        Connection {
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            domain,
            interact: Arc::new(UserInteraction::new(tx.clone())),
            workers: WorkerPool::new(),
            drain: DrainGate::new(),
            throttle: Arc::new(Throttle::new(throttle_cfg)),
            privileged: AtomicBool::new(false),
            install_in_progress: Arc::new(AtomicBool::new(false)),
            core,
            tx,
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged.load(Ordering::Acquire)
    }

    /// Parse and dispatch one text frame from the socket.
    pub async fn handle_frame(&self, text: &str) {
        match ActionFrame::from_text(text) {
            Ok(frame) => self.handle_action(frame).await,
            Err(_) => {
                // Pull the correlation id out if the JSON is at least an
                // object, so the page can match the error to its request.
                let id = serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|v| v.get("id").and_then(|id| id.as_str().map(String::from)))
                    .unwrap_or_default();
                self.tx.error(&id, "Malformed action frame");
            }
        }
    }

    /// Route one action frame. Runs on the socket task; anything that
    /// can block goes to a pooled worker.
    pub async fn handle_action(&self, frame: ActionFrame) {
        let _slot = self.drain.use_slot().await;

        match frame.action() {
            Action::Handshake => self.action_handshake(&frame),
            Action::InteractionCallback => self.action_interaction_callback(&frame),
            Action::RequestSession => self.action_request_session(&frame).await,
            Action::Session(verb) => self.action_session(verb, frame).await,
            Action::StopService => {
                if self.is_privileged() {
                    info!(conn = self.conn_id, "service stop requested");
                    self.core.request_shutdown();
                } else {
                    debug!(conn = self.conn_id, "ignoring stopService from unprivileged connection");
                }
            }
            Action::EnumSessions => {
                if self.is_privileged() {
                    self.action_enum_sessions(&frame).await;
                } else {
                    debug!(conn = self.conn_id, "ignoring enumSessions from unprivileged connection");
                }
            }
            Action::ControlSession => {
                if self.is_privileged() {
                    self.action_control_session(&frame);
                } else {
                    debug!(conn = self.conn_id, "ignoring controlSession from unprivileged connection");
                }
            }
            Action::Unknown => {
                // Silent ignore, for wire compatibility with older pages.
                debug!(conn = self.conn_id, action = %frame.name, "ignoring unknown action");
            }
        }
    }

    fn action_handshake(&self, frame: &ActionFrame) {
        self.tx
            .reply(&frame.id, json!({"version": env!("CARGO_PKG_VERSION")}));

        if let Some(auth) = frame.get_str("auth") {
            let granted = self.core.keystore().auth_key_valid(auth);
            self.privileged.store(granted, Ordering::Release);
            if granted {
                info!(conn = self.conn_id, domain = %self.domain, "privileged handshake accepted");
            } else {
                warn!(conn = self.conn_id, domain = %self.domain, "privileged handshake rejected");
            }
        }

        self.tx
            .event("privileged", vec![json!(self.is_privileged())], None);
    }

    fn action_interaction_callback(&self, frame: &ActionFrame) {
        match frame.get_num("result") {
            Some(result) => {
                self.interact.deliver(result as i32);
            }
            None => self.tx.error(&frame.id, "Missing 'result' parameter"),
        }
    }

    async fn action_request_session(&self, frame: &ActionFrame) {
        let vmcp_url = match frame.get_str("vmcp") {
            Some(url) => url.to_string(),
            None => {
                self.tx.error(&frame.id, "Missing 'vmcp' parameter");
                return;
            }
        };

        // Fail fast before spawning anything when this connection is
        // already throttled.
        if self.throttle.is_blocked() {
            self.tx.failed(
                &frame.id,
                "Request denied by throttle protection",
                codes::ACCESS_DENIED,
            );
            return;
        }

        // Re-check the hypervisor in case one appeared since startup.
        self.core.sync_hypervisor_reflection().await;

        let min_version = self.core.config().trust.min_hv_version.clone();
        let hv_usable = match self.core.hypervisor().await {
            Some(hv) => compare_versions(&hv.version(), &min_version) != std::cmp::Ordering::Less,
            None => false,
        };

        let ctx = self.workflow_ctx();
        let event_id = frame.id.clone();

        if hv_usable {
            self.workers.spawn(move |cancel| {
                request::run_request_session(ctx, event_id, vmcp_url, cancel)
            });
        } else {
            // No usable hypervisor: route through the installer gate.
            // Only one installer may run process-wide.
            if !self.core.begin_install() {
                self.tx.failed(
                    &frame.id,
                    "A hypervisor installation is in progress, please wait until it's finished and try again.",
                    codes::USAGE_ERROR,
                );
                return;
            }
            self.install_in_progress.store(true, Ordering::Release);
            self.workers.spawn(move |cancel| {
                request::run_install_and_request(ctx, event_id, vmcp_url, cancel)
            });
        }
    }

    async fn action_session(&self, verb: SessionVerb, mut frame: ActionFrame) {
        let session_id = match frame.get_num("session_id") {
            Some(id) => id,
            None => {
                self.tx.error(&frame.id, "Missing 'session_id' parameter");
                return;
            }
        };
        frame.data.remove("session_id");

        let record = match self.core.find_session(session_id as u32).await {
            Some(record) => record,
            None => {
                self.tx
                    .error(&frame.id, "Unable to find a session with the specified session id!");
                return;
            }
        };

        let tx = self.tx.clone();
        let drain = self.drain.clone();
        self.workers.spawn(move |cancel| async move {
            let _slot = drain.use_slot().await;
            if cancel.is_cancelled() {
                return;
            }
            controller::handle_session_action(&record, &tx, verb, &frame).await;
        });
    }

    async fn action_enum_sessions(&self, frame: &ActionFrame) {
        let mut sessions = Vec::new();
        if let Some(hv) = self.core.hypervisor().await {
            for session in hv.sessions() {
                sessions.push(json!({
                    "uuid": session.uuid(),
                    "config": session.state_info(),
                }));
            }
        }
        self.tx.reply(&frame.id, json!({"sessions": sessions}));
    }

    fn action_control_session(&self, frame: &ActionFrame) {
        if frame.get_str("session").is_none() {
            self.tx.error(&frame.id, "Missing 'session' parameter");
            return;
        }
        if frame.get_str("action").is_none() {
            self.tx.error(&frame.id, "Missing 'action' parameter");
            return;
        }
        // Recognized but without a contract yet: acknowledge and do
        // nothing.
        self.tx.reply(&frame.id, json!({}));
    }

    fn workflow_ctx(&self) -> WorkflowCtx {
        WorkflowCtx {
            core: self.core.clone(),
            tx: self.tx.clone(),
            interact: self.interact.clone(),
            throttle: self.throttle.clone(),
            domain: self.domain.clone(),
            conn_id: self.conn_id,
            conn_install: self.install_in_progress.clone(),
            drain: self.drain.clone(),
        }
    }

    /// Tear the connection down after its socket closed: no more frames
    /// out, abort any pending prompt, cancel and drain workers, release
    /// this connection's sessions back to the core.
    pub async fn cleanup(&self) {
        self.tx.close();
        self.interact.abort();
        self.workers.cancel_all();

        match tokio::time::timeout(DRAIN_DEADLINE, self.drain.drain()).await {
            Ok(_hold) => {}
            Err(_) => warn!(conn = self.conn_id, "drain deadline exceeded, aborting workers"),
        }
        self.workers.join_all(DRAIN_DEADLINE).await;

        // An installation this connection started was just aborted with
        // its workers; give the global slot back.
        if self.install_in_progress.swap(false, Ordering::AcqRel) {
            self.core.end_install();
        }

        self.core.release_connection_sessions(self.conn_id).await;
        debug!(conn = self.conn_id, domain = %self.domain, "connection cleaned up");
    }
}
