//! Worker termination and replay tests
//!
//! A synchronous handoff that its target worker never acknowledged must be
//! replayed to exactly one successor worker; cleanup after normal exit is
//! silent and idempotent.

use serde_json::json;
use sip_router::{
    AppDirectory, AppId, AppOpts, CallId, CallReply, CallRouter, DialogId, RawSipMsg,
    RouterConfig, SipMethod,
};
use std::time::Duration;

fn test_config() -> RouterConfig {
    RouterConfig {
        shard_count: 1,
        max_calls: 100,
        ..RouterConfig::default()
    }
}

fn directory() -> AppDirectory {
    let dir = AppDirectory::new();
    dir.register(AppId::new("app1"), AppOpts::new("App One"));
    dir
}

async fn wait_for_calls(router: &CallRouter, expected: usize) {
    for _ in 0..200 {
        if router.get_all_calls().await.unwrap().len() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("router never reached {} calls", expected);
}

#[tokio::test]
async fn test_sync_work_replayed_after_worker_exit_race() {
    // Arrange: a live worker holding an INVITE transaction and dialog
    let router = CallRouter::new(test_config(), directory()).unwrap();
    let app = AppId::new("app1");
    let call = CallId::new("race");
    router
        .send(app.clone(), SipMethod::Invite, "sip:a@b", json!({"call_id": "race"}))
        .await
        .unwrap();

    // Act: queue a stop and a sync work back to back, without yielding in
    // between. The worker reads the stop first and exits with the sync
    // work still in its mailbox, unacknowledged.
    router.stop_call(app.clone(), call.clone()).unwrap();
    let reply = router
        .send(app.clone(), SipMethod::Options, "sip:a@b", json!({"call_id": "race"}))
        .await
        .unwrap();

    // Assert: the work reached a successor worker and the caller got its
    // result anyway
    assert!(matches!(reply, CallReply::Sent { dialog: None, .. }));
    let calls = router.get_all_calls().await.unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(router.counters().live_calls(), 1);
    assert_eq!(router.pending_work().await.unwrap(), 0);

    // The successor started from empty state: no dialog survived from the
    // predecessor, only the replayed OPTIONS transaction exists
    let data = router.get_data(app, call).await.unwrap();
    assert_eq!(data["dialogs"], 0);
    assert_eq!(data["transactions"], 1);
    assert_eq!(data["history"][0], "send");
}

#[tokio::test]
async fn test_normal_exit_cleans_registry_silently() {
    // Arrange: a call whose state drains after one exchange
    let router = CallRouter::new(test_config(), directory()).unwrap();
    let app = AppId::new("app1");
    let call = CallId::new("short");
    router
        .send(app.clone(), SipMethod::Options, "sip:a@b", json!({"call_id": "short"}))
        .await
        .unwrap();
    assert_eq!(router.counters().live_calls(), 1);

    // Act: the final response completes the only transaction; the worker
    // exits on its own
    let response = RawSipMsg::response(app.clone(), call, SipMethod::Options, 200, json!({}));
    router.incoming_async(response).unwrap();

    // Assert
    wait_for_calls(&router, 0).await;
    assert_eq!(router.counters().live_calls(), 0);
    assert_eq!(router.counters().app_calls(&app), 0);
    assert_eq!(router.pending_work().await.unwrap(), 0);
}

#[tokio::test]
async fn test_repeated_stop_is_idempotent() {
    let router = CallRouter::new(test_config(), directory()).unwrap();
    let app = AppId::new("app1");
    let call = CallId::new("twice");
    router
        .send(app.clone(), SipMethod::Invite, "sip:a@b", json!({"call_id": "twice"}))
        .await
        .unwrap();

    // Stopping twice, including once after the worker is gone, is harmless
    router.stop_call(app.clone(), call.clone()).unwrap();
    router.stop_call(app.clone(), call.clone()).unwrap();
    wait_for_calls(&router, 0).await;
    router.stop_call(app, call).unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(router.counters().live_calls(), 0);
}

#[tokio::test]
async fn test_clear_calls_stops_every_worker() {
    // Arrange
    let router = CallRouter::new(test_config(), directory()).unwrap();
    let app = AppId::new("app1");
    for call in ["k1", "k2", "k3"] {
        router
            .send(app.clone(), SipMethod::Invite, "sip:a@b", json!({"call_id": call}))
            .await
            .unwrap();
    }

    // Act
    let stopped = router.clear_calls().await.unwrap();

    // Assert
    assert_eq!(stopped, 3);
    wait_for_calls(&router, 0).await;
    assert_eq!(router.counters().live_calls(), 0);
    assert_eq!(router.pending_msgs().await.unwrap(), 0);
}

#[tokio::test]
async fn test_full_call_lifecycle() {
    // Arrange: establish a dialog
    let router = CallRouter::new(test_config(), directory()).unwrap();
    let app = AppId::new("app1");
    let call = CallId::new("life");
    let reply = router
        .send(app.clone(), SipMethod::Invite, "sip:bob@example.com", json!({"call_id": "life"}))
        .await
        .unwrap();
    let dialog: DialogId = match reply {
        CallReply::Sent { dialog: Some(d), .. } => d,
        other => panic!("unexpected reply: {:?}", other),
    };
    assert_eq!(
        router.get_dialogs(app.clone(), call.clone()).await.unwrap().len(),
        1
    );

    // Act: tear the dialog down through its textual handle, then let the
    // final response drain the INVITE transaction
    router.stop_dialog(dialog.to_string()).unwrap();
    let response = RawSipMsg::response(app.clone(), call.clone(), SipMethod::Invite, 200, json!({}));
    router.incoming_async(response).unwrap();

    // Assert: the worker ends the call by itself
    wait_for_calls(&router, 0).await;
    assert_eq!(router.counters().live_calls(), 0);
}
