use serde_json::json;
use vmgate_protocol::{ActionFrame, SessionVerb};

use crate::connection::tx::ConnectionTx;
use crate::hypervisor::{ControlOutcome, DriverResult, ParameterMap};
use crate::session::SessionRecord;

/// Parameters the page may write through `set`. `get` additionally
/// exposes the computed `apiURL`/`rdpURL` and the read-only `ip`.
const WRITABLE_KEYS: &[&str] = &[
    "cpus",
    "disk",
    "memory",
    "cernvmVersion",
    "cernvmFlavor",
    "executionCap",
    "flags",
];

/// Dispatch one session-scoped action and emit its outcome on `tx`.
///
/// Every lifecycle verb is followed by a `stateVariables` push because
/// the driver may have mutated them while applying the command.
pub async fn handle_session_action(
    record: &SessionRecord,
    tx: &ConnectionTx,
    verb: SessionVerb,
    frame: &ActionFrame,
) {
    if record.aborting() {
        return;
    }
    let session = record.session();

    match verb {
        SessionVerb::Start
        | SessionVerb::Stop
        | SessionVerb::Pause
        | SessionVerb::Resume
        | SessionVerb::Hibernate
        | SessionVerb::Reset
        | SessionVerb::Close => {
            let result: DriverResult = match verb {
                SessionVerb::Start => {
                    let params = ParameterMap::from_json(&frame.data);
                    session.start(&params).await
                }
                SessionVerb::Stop => session.stop().await,
                SessionVerb::Pause => session.pause().await,
                SessionVerb::Resume => session.resume().await,
                SessionVerb::Hibernate => session.hibernate().await,
                SessionVerb::Reset => session.reset().await,
                SessionVerb::Close => session.close().await,
                _ => unreachable!(),
            };

            match result {
                Ok(ControlOutcome::Ok) => {
                    let message = format!("Session {} successfully", past_tense(verb));
                    tx.succeed(&frame.id, vec![json!(message)]);
                }
                Ok(ControlOutcome::Scheduled) => {
                    let message = format!("Session will {} promptly", verb.name());
                    tx.succeed(&frame.id, vec![json!(message)]);
                }
                Err(code) => {
                    let message = format!("Unable to {} session", verb.name());
                    tx.failed(&frame.id, &message, code);
                }
            }

            record.send_state_variables();
        }

        SessionVerb::Sync => {
            record.send_state_variables();
        }

        SessionVerb::Get => {
            let key = frame.get_str("key").unwrap_or_default();
            let params = session.parameters();
            let value = match key {
                "apiURL" => record.api_url(),
                "rdpURL" => format!("{}@{}", session.rdp_address(), session.video_mode()),
                "ip" => params.get_or("ip", ""),
                "cpus" => params.get_or("cpus", "1"),
                "disk" => params.get_or("disk", "1024"),
                "memory" => params.get_or("memory", "512"),
                "cernvmVersion" => params.get_or("cernvmVersion", "1.17-11"),
                "cernvmFlavor" => params.get_or("cernvmFlavor", "prod"),
                "executionCap" => params.get_or("executionCap", "100"),
                "flags" => params.get_or("flags", "0"),
                _ => String::new(),
            };
            tx.succeed(&frame.id, vec![json!(value)]);
        }

        SessionVerb::Set => {
            let key = frame.get_str("key").unwrap_or_default().to_string();
            let value = frame.get_str("value").unwrap_or_default().to_string();
            if WRITABLE_KEYS.contains(&key.as_str()) {
                session.parameters().set(&key, &value);
                if key == "executionCap" {
                    // Apply the cap to the running VM right away.
                    if let Ok(cap) = value.parse::<i64>() {
                        session.set_execution_cap(cap).await;
                    }
                }
            }
            tx.succeed(&frame.id, vec![json!(1)]);
        }

        SessionVerb::SetProperty => {
            let key = frame.get_str("key").unwrap_or_default();
            let value = frame.get_str("value").unwrap_or_default();
            session.set_property(key, value).await;
            tx.succeed(&frame.id, vec![json!(1)]);
        }
    }
}

fn past_tense(verb: SessionVerb) -> &'static str {
    match verb {
        SessionVerb::Start => "started",
        SessionVerb::Stop => "stopped",
        SessionVerb::Pause => "paused",
        SessionVerb::Resume => "resumed",
        SessionVerb::Hibernate => "hibernated",
        SessionVerb::Reset => "reset",
        SessionVerb::Close => "closed",
        _ => "completed",
    }
}
