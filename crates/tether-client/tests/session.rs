mod support;

use std::sync::Arc;
use std::time::Duration;
use support::{
    ScriptedLoader, ScriptedTokens, ScriptedTransport, confirmed, expired_token, settle, token,
};
use tether_client::error::{OperationError, RefreshError};
use tether_client::navigation::SwitchOptions;
use tether_client::session::ChatSession;
use tether_client::store::{KeyValueStore, MemoryStore};
use tether_client::SessionConfig;
use tether_core::{ClientFrame, ConnectionState, ResourceId, Role, ServerFrame};

const KEY: &str = "tether.credential";

struct Harness {
    store: MemoryStore,
    transport: Arc<ScriptedTransport>,
    tokens: Arc<ScriptedTokens>,
    session: ChatSession,
}

fn harness(tokens: Arc<ScriptedTokens>) -> Harness {
    harness_with(SessionConfig::default(), tokens)
}

fn harness_with(config: SessionConfig, tokens: Arc<ScriptedTokens>) -> Harness {
    let store = MemoryStore::new();
    let transport = ScriptedTransport::new();
    let session = ChatSession::new(
        config,
        transport.clone(),
        tokens.clone(),
        ScriptedLoader::new(),
        Arc::new(store.clone()),
    );
    Harness {
        store,
        transport,
        tokens,
        session,
    }
}

async fn logged_in_on_thread(h: &Harness) {
    h.session.start().await;
    h.session.login(token("alice", 3600)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.session
        .switch_to_thread("t1", SwitchOptions::default())
        .await
        .unwrap();
}

fn sent_messages(transport: &ScriptedTransport) -> Vec<ClientFrame> {
    transport
        .sent()
        .into_iter()
        .filter(|f| matches!(f, ClientFrame::SendMessage { .. }))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn expired_credential_with_rejected_refresh_starts_offline() {
    let h = harness(ScriptedTokens::with(vec![Err(RefreshError::Rejected("revoked".into()))]));
    h.store.set(KEY, &expired_token("alice")).await.unwrap();

    let auth = h.session.start().await;
    assert!(auth.initialized);
    assert!(!auth.loading);
    assert!(auth.credential.is_none());
    assert_eq!(h.store.get(KEY).await.unwrap(), None);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.transport.open_count(), 0);
    assert_eq!(h.session.connection().state(), ConnectionState::Idle);
    h.session.shutdown();
}

#[tokio::test(start_paused = true)]
async fn restored_credential_connects_on_start() {
    let h = harness(ScriptedTokens::new());
    h.store.set(KEY, &token("alice", 3600)).await.unwrap();

    let auth = h.session.start().await;
    assert_eq!(auth.identity().map(|i| i.as_str()), Some("alice"));
    settle().await;

    assert_eq!(h.transport.open_count(), 1);
    assert_eq!(h.session.connection().state(), ConnectionState::Open);
    assert_eq!(h.tokens.calls(), 0);
    h.session.shutdown();
}

#[tokio::test(start_paused = true)]
async fn logout_closes_connection_and_keeps_thread() {
    let h = harness(ScriptedTokens::new());
    logged_in_on_thread(&h).await;
    assert_eq!(h.transport.open_count(), 1);
    assert_eq!(h.session.connection().state(), ConnectionState::Open);

    h.session.logout().await;
    assert_eq!(h.session.connection().state(), ConnectionState::Closed);
    assert_eq!(h.session.navigator().active_resource(), Some(ResourceId::from("t1")));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.session.connection().state(), ConnectionState::Closed);
    assert_eq!(h.transport.open_count(), 1);
    assert!(!h.session.snapshot().auth.is_authenticated());
    h.session.shutdown();
}

#[tokio::test(start_paused = true)]
async fn send_is_reconciled_exactly_once() {
    let h = harness(ScriptedTokens::new());
    logged_in_on_thread(&h).await;

    let pending = h.session.send_message("hello").unwrap();
    assert!(h.session.messages()[0].is_pending());
    assert_eq!(
        sent_messages(&h.transport),
        vec![ClientFrame::SendMessage {
            resource_id: "t1".into(),
            client_ref: pending.temp_id.clone(),
            content: "hello".into(),
        }]
    );

    let echo = confirmed("m1", "t1", "hello", Some(&pending.temp_id));
    h.transport.push(ServerFrame::Message(echo.clone()));
    h.transport.push(ServerFrame::Message(echo));
    settle().await;

    let view = h.session.messages();
    assert_eq!(view.len(), 1);
    assert!(!view[0].is_pending());
    let stats = h.session.snapshot().messages;
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.duplicates_ignored, 1);
    h.session.shutdown();
}

#[tokio::test(start_paused = true)]
async fn sending_requires_an_active_thread() {
    let h = harness(ScriptedTokens::new());
    h.session.start().await;
    assert_eq!(
        h.session.send_message("hi").unwrap_err(),
        OperationError::NoActiveResource
    );
    assert_eq!(
        h.session.add_optimistic_message("hi", Role::Assistant).unwrap_err(),
        OperationError::NoActiveResource
    );
    h.session.shutdown();
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_send_times_out_and_can_be_retried() {
    let h = harness(ScriptedTokens::new());
    logged_in_on_thread(&h).await;

    let pending = h.session.send_message("anyone there?").unwrap();
    tokio::time::sleep(Duration::from_secs(40)).await;

    assert!(h.session.messages().is_empty());
    let failed = h.session.failed_sends();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].temp_id, pending.temp_id);

    h.session.retry_send(&pending.temp_id).unwrap();
    assert_eq!(h.session.messages().len(), 1);
    assert_eq!(sent_messages(&h.transport).len(), 2);
    assert_eq!(
        h.session.retry_send(&pending.temp_id).unwrap_err(),
        OperationError::NothingToRetry
    );
    h.session.shutdown();
}

#[tokio::test(start_paused = true)]
async fn refresh_keeps_connection_and_updates_in_band() {
    let refreshed = token("alice", 7200);
    let h = harness(ScriptedTokens::with(vec![Ok(refreshed.clone())]));
    logged_in_on_thread(&h).await;

    h.session.credentials().refresh_now().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(h.transport.open_count(), 1);
    assert_eq!(h.transport.credential_updates(), vec![refreshed]);
    assert_eq!(h.session.connection().state(), ConnectionState::Open);
    h.session.shutdown();
}

#[tokio::test(start_paused = true)]
async fn login_as_someone_else_reconnects() {
    let h = harness(ScriptedTokens::new());
    logged_in_on_thread(&h).await;

    h.session.login(token("bob", 3600)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(h.transport.open_count(), 2);
    let snapshot = h.session.snapshot().connection;
    assert_eq!(snapshot.identity.map(|i| i.as_str().to_string()).as_deref(), Some("bob"));
    h.session.shutdown();
}

#[tokio::test(start_paused = true)]
async fn logout_in_another_handle_disconnects() {
    let h = harness(ScriptedTokens::new());
    logged_in_on_thread(&h).await;

    let other_tab = h.store.handle();
    other_tab.remove(KEY).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!h.session.snapshot().auth.is_authenticated());
    assert_eq!(h.session.connection().state(), ConnectionState::Closed);
    h.session.shutdown();
}

#[tokio::test(start_paused = true)]
async fn zero_sweep_interval_still_times_out_sends() {
    let mut config = SessionConfig::default();
    config.reconcile.sweep_interval_ms = 0;
    config.reconcile.pending_timeout_ms = 1_000;
    let h = harness_with(config, ScriptedTokens::new());
    logged_in_on_thread(&h).await;

    let pending = h.session.send_message("hello?").unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let failed = h.session.failed_sends();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].temp_id, pending.temp_id);
    assert_eq!(h.session.snapshot().messages.pending, 0);
    h.session.shutdown();
}

#[tokio::test]
async fn expired_credential_with_failing_refresh_closes_connection() {
    let mut config = SessionConfig::default();
    config.credentials.min_check_ms = 200;
    config.credentials.max_check_ms = 500;
    let h = harness_with(config, ScriptedTokens::new());
    h.session.start().await;
    h.session.login(token("alice", 2)).await.unwrap();

    let mut connection = h.session.subscribe_connection();
    tokio::time::timeout(
        Duration::from_secs(1),
        connection.wait_for(|c| c.state == ConnectionState::Open),
    )
    .await
    .unwrap()
    .unwrap();

    let mut auth = h.session.subscribe_auth();
    tokio::time::timeout(Duration::from_secs(5), auth.wait_for(|a| a.credential.is_none()))
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(
        Duration::from_secs(1),
        connection.wait_for(|c| c.state == ConnectionState::Closed),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(!h.session.snapshot().auth.is_authenticated());
    assert!(h.tokens.calls() >= 1);
    // The stored copy is left for another handle to replace.
    assert!(h.store.get(KEY).await.unwrap().is_some());
    assert_eq!(h.transport.open_count(), 1);
    h.session.shutdown();
}
