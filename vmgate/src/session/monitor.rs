use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vmgate_protocol::SessionState;

use crate::hypervisor::ProbeKind;
use crate::session::SessionRecord;

/// Per-session background loop: sync driver state, probe the in-guest
/// API with hysteresis, emit `apiStateChanged` transitions.
///
/// While the API is offline the probe is cheap (short timeout) and runs
/// every tick. Once online, a longer probe runs every
/// `slow_probe_every_ticks` ticks and only `apiport_down_retries`
/// consecutive failures flip the state back, so a single slow response
/// does not flap the page.
pub(crate) async fn monitor_loop(record: Arc<SessionRecord>, cancel: CancellationToken) {
    let cfg = *record.monitor_cfg();
    let mut interval = tokio::time::interval(Duration::from_secs(cfg.tick_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut slow_tick_counter: u32 = 0;
    let mut down_counter: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if record.aborting() {
            break;
        }
        if !record.accepts_periodic() {
            continue;
        }

        record.driver().update(false).await;

        let session = record.session();
        let state = session.local().get_num("state", 0) as i32;
        let online = record.api_online.load(Ordering::Acquire);
        let tx = match record.tx() {
            Some(tx) => tx,
            None => break,
        };

        if state == SessionState::Running.code() {
            if !online {
                if session
                    .is_api_alive(ProbeKind::Http, cfg.fast_probe_timeout_secs)
                    .await
                {
                    record.api_online.store(true, Ordering::Release);
                    slow_tick_counter = 0;
                    down_counter = 0;
                    debug!(session = record.id, "in-guest API came online");
                    tx.event(
                        "apiStateChanged",
                        vec![json!(true), json!(record.api_url())],
                        Some(&record.uuid),
                    );
                }
            } else {
                slow_tick_counter += 1;
                if slow_tick_counter >= cfg.slow_probe_every_ticks {
                    slow_tick_counter = 0;
                    if session
                        .is_api_alive(ProbeKind::Http, cfg.slow_probe_timeout_secs)
                        .await
                    {
                        down_counter = 0;
                    } else {
                        down_counter += 1;
                        if down_counter >= cfg.apiport_down_retries {
                            record.api_online.store(false, Ordering::Release);
                            debug!(session = record.id, "in-guest API went offline");
                            tx.event(
                                "apiStateChanged",
                                vec![json!(false), json!(record.api_url())],
                                Some(&record.uuid),
                            );
                        }
                    }
                }
            }
        } else if online {
            // Any non-running state means the API is gone, no probe needed.
            record.api_online.store(false, Ordering::Release);
            slow_tick_counter = 0;
            down_counter = 0;
            tx.event(
                "apiStateChanged",
                vec![json!(false), json!(record.api_url())],
                Some(&record.uuid),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::connection::tx::ConnectionTx;
    use crate::testutil::{MockDriver, MockSession};
    use vmgate_protocol::OutboundFrame;

    fn fast_cfg() -> MonitorConfig {
        MonitorConfig {
            tick_interval_secs: 1,
            fast_probe_timeout_secs: 1,
            slow_probe_timeout_secs: 1,
            slow_probe_every_ticks: 2,
            apiport_down_retries: 2,
        }
    }

    async fn wait_for_api_event(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<OutboundFrame>,
        expect_online: bool,
    ) {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(30), rx.recv())
                .await
                .expect("timed out waiting for apiStateChanged")
                .expect("channel closed");
            if let OutboundFrame::Event { name, data, .. } = frame {
                if name == "apiStateChanged" {
                    assert_eq!(data[0], json!(expect_online));
                    return;
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn api_coming_online_emits_once() {
        let session = MockSession::new("uuid-1").with_state(SessionState::Running);
        session.set_api_alive(true);
        let driver = MockDriver::new().with_session(session.clone());
        let record = SessionRecord::new(1, session.clone(), driver.clone(), fast_cfg());
        let (tx, mut rx) = ConnectionTx::channel();
        record.bind(1, tx);
        record.enable_periodic(true);

        wait_for_api_event(&mut rx, true).await;
        assert!(record.api_online.load(Ordering::Acquire));
        // Each tick refreshes driver state before probing.
        assert!(driver.updates.load(Ordering::Relaxed) > 0);

        record.release();
    }

    #[tokio::test(start_paused = true)]
    async fn two_failed_slow_probes_take_api_offline() {
        let session = MockSession::new("uuid-1").with_state(SessionState::Running);
        session.set_api_alive(true);
        let driver = MockDriver::new().with_session(session.clone());
        let record = SessionRecord::new(1, session.clone(), driver, fast_cfg());
        let (tx, mut rx) = ConnectionTx::channel();
        record.bind(1, tx);
        record.enable_periodic(true);

        wait_for_api_event(&mut rx, true).await;

        // One failed slow probe is not enough; two strikes are.
        session.set_api_alive(false);
        wait_for_api_event(&mut rx, false).await;
        assert!(!record.api_online.load(Ordering::Acquire));

        record.release();
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_running_emits_offline_without_probe() {
        let session = MockSession::new("uuid-1").with_state(SessionState::Running);
        session.set_api_alive(true);
        let driver = MockDriver::new().with_session(session.clone());
        let record = SessionRecord::new(1, session.clone(), driver, fast_cfg());
        let (tx, mut rx) = ConnectionTx::channel();
        record.bind(1, tx);
        record.enable_periodic(true);

        wait_for_api_event(&mut rx, true).await;

        session.set_state(SessionState::PowerOff);
        wait_for_api_event(&mut rx, false).await;

        record.release();
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_monitor_stays_quiet() {
        let session = MockSession::new("uuid-1").with_state(SessionState::Running);
        session.set_api_alive(true);
        let driver = MockDriver::new().with_session(session.clone());
        let record = SessionRecord::new(1, session.clone(), driver, fast_cfg());
        let (tx, mut rx) = ConnectionTx::channel();
        record.bind(1, tx);
        // enable_periodic never called.

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(session.calls("is_api_alive"), 0);

        record.release();
    }
}
