use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vmgate_protocol::{codes, ui};

use crate::core::Core;
use crate::hypervisor::{ParameterMap, ValidateOutcome};
use crate::interact::UserInteraction;
use crate::progress::ProgressTask;
use crate::workers::DrainGate;

use super::tx::ConnectionTx;
use super::Throttle;

/// Everything a session-request worker needs from its connection.
/// Deliberately not the connection itself: workers outlive no teardown
/// and reach the page only through the alive-gated `tx`.
pub(crate) struct WorkflowCtx {
    pub core: Arc<Core>,
    pub tx: ConnectionTx,
    pub interact: Arc<UserInteraction>,
    pub throttle: Arc<Throttle>,
    pub domain: String,
    pub conn_id: u64,
    pub conn_install: Arc<std::sync::atomic::AtomicBool>,
    pub drain: DrainGate,
}

/// How a stage pipeline ends early: a `failed` event with a wire code,
/// or silently (user navigated away, connection tearing down).
enum StageEnd {
    Fail { message: String, code: i32 },
    Silent,
}

impl StageEnd {
    fn fail(message: impl Into<String>, code: i32) -> StageEnd {
        StageEnd::Fail {
            message: message.into(),
            code,
        }
    }
}

type StageResult<T> = Result<T, StageEnd>;

fn checkpoint(cancel: &CancellationToken) -> StageResult<()> {
    if cancel.is_cancelled() {
        Err(StageEnd::Silent)
    } else {
        Ok(())
    }
}

fn finish(ctx: &WorkflowCtx, event_id: &str, result: StageResult<()>) {
    match result {
        Ok(()) => {}
        Err(StageEnd::Fail { message, code }) => {
            debug!(conn = ctx.conn_id, code, %message, "session request failed");
            ctx.tx.failed(event_id, &message, code);
        }
        Err(StageEnd::Silent) => {
            debug!(conn = ctx.conn_id, "session request ended silently");
        }
    }
}

/// Worker entry: the multi-stage `requestSession` workflow.
pub(crate) async fn run_request_session(
    ctx: WorkflowCtx,
    event_id: String,
    vmcp_url: String,
    cancel: CancellationToken,
) {
    let _slot = ctx.drain.use_slot().await;
    let result = request_session_stages(&ctx, &event_id, &vmcp_url, &cancel).await;
    finish(&ctx, &event_id, result);
}

/// Worker entry: install a hypervisor first, then chain into the
/// session request on the same worker.
pub(crate) async fn run_install_and_request(
    ctx: WorkflowCtx,
    event_id: String,
    vmcp_url: String,
    cancel: CancellationToken,
) {
    let _slot = ctx.drain.use_slot().await;
    let installed = install_stage(&ctx, &event_id, &cancel).await;

    // The install gate opens again whatever happened; a successful
    // install continues as a plain session request.
    ctx.conn_install.store(false, Ordering::Release);
    ctx.core.end_install();

    match installed {
        Ok(()) => {
            let result = request_session_stages(&ctx, &event_id, &vmcp_url, &cancel).await;
            finish(&ctx, &event_id, result);
        }
        Err(end) => finish(&ctx, &event_id, Err(end)),
    }
}

async fn install_stage(
    ctx: &WorkflowCtx,
    event_id: &str,
    cancel: &CancellationToken,
) -> StageResult<()> {
    let progress = ProgressTask::root(ctx.tx.clone(), event_id, 1);

    let (title, message) = match ctx.core.hypervisor().await {
        Some(hv) => (
            "Hypervisor required (upgrade)",
            format!(
                "Your current hypervisor installation (version {}) is too old to be driven \
                 by this service. Would you like us to install the latest version for you?",
                hv.version()
            ),
        ),
        None => (
            "Hypervisor required",
            "For this website to work you must have a hypervisor installed in your system. \
             Would you like us to install one for you?"
                .to_string(),
        ),
    };

    if ctx.interact.confirm(title, &message).await != ui::OK {
        if ctx.interact.aborted() {
            ctx.interact.abort_handled();
            return Err(StageEnd::Silent);
        }
        return Err(StageEnd::fail(
            "You must have a hypervisor installed in your system to continue.",
            codes::USAGE_ERROR,
        ));
    }
    checkpoint(cancel)?;

    let outcome = ctx
        .core
        .platform()
        .install(
            ctx.core.downloader(),
            ctx.core.keystore(),
            ctx.interact.clone(),
            progress,
        )
        .await;

    if ctx.interact.aborted() {
        ctx.interact.abort_handled();
        return Err(StageEnd::Silent);
    }
    checkpoint(cancel)?;

    match outcome {
        Ok(()) => {}
        Err(code) if code == codes::NOT_VALIDATED || code == codes::NOT_TRUSTED => {
            return Err(StageEnd::fail(
                "Integrity validation of the hypervisor configuration failed. Please try again later.",
                codes::USAGE_ERROR,
            ));
        }
        Err(_) => {
            return Err(StageEnd::fail(
                "We were unable to install a hypervisor in your system. Please try again manually.",
                codes::USAGE_ERROR,
            ));
        }
    }

    match ctx.core.redetect_hypervisor().await {
        Some(hv) => {
            info!(version = %hv.version(), "hypervisor installed and detected");
            hv.load_sessions().await;
            Ok(())
        }
        None => Err(StageEnd::fail(
            "The hypervisor installation completed but we were not able to detect it. \
             Please try again later or install it manually.",
            codes::USAGE_ERROR,
        )),
    }
}

async fn request_session_stages(
    ctx: &WorkflowCtx,
    event_id: &str,
    vmcp_url: &str,
    cancel: &CancellationToken,
) -> StageResult<()> {
    // Throttled connections fail before any other work, prompts included.
    if ctx.throttle.is_blocked() {
        return Err(StageEnd::fail(
            "Request denied by throttle protection",
            codes::ACCESS_DENIED,
        ));
    }

    let hv = ctx
        .core
        .hypervisor()
        .await
        .ok_or_else(|| StageEnd::fail("No usable hypervisor is available", codes::USAGE_ERROR))?;
    let keystore = ctx.core.keystore();
    let downloader = ctx.core.downloader();

    let root = ProgressTask::root(ctx.tx.clone(), event_id, 2);
    let init = root.begin("Preparing for session request", 4);

    // -- hypervisor readiness --------------------------------------------

    let ready = init.begin("Initializing hypervisor", 1);
    if let Err(code) = hv
        .wait_till_ready(keystore.clone(), ready, ctx.interact.clone())
        .await
    {
        if !ctx.interact.aborted() {
            return Err(StageEnd::fail("Unable to initialize the hypervisor", code));
        }
    }
    if ctx.interact.aborted() {
        ctx.interact.abort_handled();
        return Err(StageEnd::Silent);
    }
    checkpoint(cancel)?;

    // -- keystore refresh and domain gate --------------------------------

    init.doing("Initializing crypto store");
    keystore.update_authorized(downloader.as_ref(), cancel).await;
    if !keystore.valid() {
        return Err(StageEnd::fail(
            "Unable to initialize cryptographic store",
            codes::NOT_VALIDATED,
        ));
    }
    if !keystore.is_domain_valid(&ctx.domain) {
        return Err(StageEnd::fail("The domain is not trusted", codes::NOT_TRUSTED));
    }
    init.done("Crypto store initialized");
    checkpoint(cancel)?;

    // -- VMCP fetch -------------------------------------------------------

    init.doing("Contacting the VMCP endpoint");
    let salt = keystore.generate_salt();
    let glue = if vmcp_url.contains('?') { "&" } else { "?" };
    let salted_url = format!(
        "{}{}cvm_salt={}&cvm_hostid={}",
        vmcp_url,
        glue,
        salt,
        ctx.core.host_id(&ctx.domain)
    );

    let body = downloader
        .download_text(&salted_url, Some(&init), cancel)
        .await
        .map_err(|code| StageEnd::fail("Unable to contact the VMCP endpoint", code))?;
    checkpoint(cancel)?;

    // -- VMCP parse and schema check --------------------------------------

    init.doing("Validating VMCP data");
    let vmcp = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.as_object().map(ParameterMap::from_json))
        .ok_or_else(|| {
            StageEnd::fail("Unable to parse response data as JSON", codes::QUERY_ERROR)
        })?;

    for key in ["name", "secret", "signature"] {
        if !vmcp.contains(key) {
            return Err(StageEnd::fail(
                format!("Missing '{}' parameter from the VMCP response", key),
                codes::USAGE_ERROR,
            ));
        }
    }
    if vmcp.contains("diskURL") && !vmcp.contains("diskChecksum") {
        return Err(StageEnd::fail(
            "A 'diskURL' was specified, but no 'diskChecksum' was found in the VMCP response",
            codes::USAGE_ERROR,
        ));
    }

    // -- signature check ---------------------------------------------------

    let code = keystore.signature_validate(&ctx.domain, &salt, &vmcp);
    if code < 0 {
        return Err(StageEnd::fail(
            "The VMCP response signature could not be validated",
            code,
        ));
    }
    init.done("Obtained information from VMCP endpoint");
    checkpoint(cancel)?;

    // -- session validity and user consent ---------------------------------

    init.doing("Validating request");
    match hv.session_validate(&vmcp).await {
        ValidateOutcome::PasswordMismatch => {
            return Err(StageEnd::fail(
                "The password specified is invalid for this session",
                codes::PASSWORD_DENIED,
            ));
        }
        ValidateOutcome::New => {
            init.doing("Session is new, asking user for confirmation");
            let message = format!(
                "The website {} is trying to allocate a Virtual Machine \"{}\". \
                 This website is validated and trusted.\n\nDo you want to continue?",
                ctx.domain,
                vmcp.get_or("name", "")
            );
            if ctx.interact.confirm("New VM Session Request", &message).await != ui::OK {
                if ctx.interact.aborted() {
                    ctx.interact.abort_handled();
                    return Err(StageEnd::Silent);
                }
                ctx.throttle.note_denied();
                return Err(StageEnd::fail(
                    "User denied the allocation of new session",
                    codes::ACCESS_DENIED,
                ));
            }
            ctx.throttle.reset();
        }
        ValidateOutcome::Reuse => {}
    }
    init.done("Request validated");
    checkpoint(cancel)?;

    // -- open, register, initial push ---------------------------------------

    let open = root.begin("Open session", 1);
    let session = hv
        .session_open(&vmcp, open)
        .await
        .ok_or_else(|| StageEnd::fail("Unable to open session", codes::ACCESS_DENIED))?;

    // Let the session FSM settle before reporting state.
    session.wait().await;
    checkpoint(cancel)?;

    root.complete("Session open successfully");
    hv.check_daemon_need().await;

    let record = ctx
        .core
        .store_session(ctx.conn_id, ctx.tx.clone(), session.clone(), hv.clone())
        .await;

    ctx.tx.succeed(
        event_id,
        vec![json!("Session open successfully"), json!(record.uuid)],
    );

    // This order is load-bearing: the page relies on `apiStateChanged`
    // (monitor output) never preceding the first `stateChanged`.
    record.send_state_variables();
    let state = session.local().get_num("state", 0);
    ctx.tx
        .event("stateChanged", vec![json!(state)], Some(&record.uuid));
    record.enable_periodic(true);

    Ok(())
}
