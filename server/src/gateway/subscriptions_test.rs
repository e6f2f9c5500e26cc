use super::*;
use crate::bus::{MutationAction, USERS_COLLECTION};
use crate::gateway::testing;
use crate::services::DataService;
use crate::services::memory::Visibility;
use messages::ErrorCode;
use serde_json::json;
use tokio::time::{Duration, timeout};
use uuid::Uuid;

async fn recv_frame(rx: &mut tokio::sync::mpsc::Receiver<ServerMessage>) -> ServerMessage {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("frame receive timed out")
        .expect("outbound channel closed unexpectedly")
}

fn subscribe_request(collection: &str, uid: &str) -> SubscribeRequest {
    SubscribeRequest {
        collection: collection.into(),
        item: None,
        query: None,
        status: false,
        uid: Some(uid.into()),
    }
}

fn expect_subscription(frame: &ServerMessage) -> (SubscriptionEvent, &Value, Option<&str>) {
    match frame {
        ServerMessage::Subscription { event, payload, uid, .. } => {
            (*event, payload, uid.as_deref())
        }
        other => panic!("expected subscription frame, got {other:?}"),
    }
}

// =============================================================================
// SUBSCRIBE
// =============================================================================

#[tokio::test]
async fn subscribe_answers_init_with_the_query_result() {
    let fixture = testing::gateway();
    let (handle, mut rx) = testing::register_client(&fixture.gateway).await;

    let request = SubscribeRequest {
        query: Some(Query {
            fields: Some(vec!["id".into(), "title".into()]),
            sort: Some(vec!["id".into()]),
            limit: Some(10),
            ..Query::default()
        }),
        ..subscribe_request("articles", "a1")
    };
    subscribe(&fixture.gateway, &handle, request).await.expect("subscribe");

    let frame = recv_frame(&mut rx).await;
    let (event, payload, uid) = expect_subscription(&frame);
    assert_eq!(event, SubscriptionEvent::Init);
    assert_eq!(uid, Some("a1"));
    assert_eq!(
        payload,
        &json!([{"id": 1, "title": "first"}, {"id": 2, "title": "second"}])
    );
    assert_eq!(fixture.gateway.registry().count("articles").await, 1);
}

#[tokio::test]
async fn subscribe_single_item_returns_an_object_and_records_focus() {
    let fixture = testing::gateway();
    let user = Uuid::new_v4();
    let (handle, mut rx) = testing::register_client(&fixture.gateway).await;
    testing::install_identity(&fixture.gateway, &handle, testing::user_accountability(user));

    let request = SubscribeRequest { item: Some(json!(1)), ..subscribe_request("articles", "one") };
    subscribe(&fixture.gateway, &handle, request).await.expect("subscribe");

    let frame = recv_frame(&mut rx).await;
    let (event, payload, _) = expect_subscription(&frame);
    assert_eq!(event, SubscriptionEvent::Init);
    assert!(payload.is_object(), "single-item mode sends one object, not an array");
    assert_eq!(payload.get("id"), Some(&json!(1)));

    let focus = fixture.gateway.presence().focus_of(user).expect("focus recorded");
    assert_eq!(focus.collection, "articles");
    assert_eq!(focus.item, Some(json!(1)));
}

#[tokio::test]
async fn subscribe_with_meta_attaches_aggregates() {
    let fixture = testing::gateway();
    let (handle, mut rx) = testing::register_client(&fixture.gateway).await;

    let request = SubscribeRequest {
        query: Some(Query { meta: Some("*".into()), ..Query::default() }),
        ..subscribe_request("articles", "m1")
    };
    subscribe(&fixture.gateway, &handle, request).await.expect("subscribe");

    let frame = recv_frame(&mut rx).await;
    let ServerMessage::Subscription { meta: Some(meta), .. } = &frame else {
        panic!("expected meta on the init frame, got {frame:?}");
    };
    assert_eq!(meta.get("total_count"), Some(&json!(2)));
}

#[tokio::test]
async fn subscribe_unknown_collection_fails_without_registering() {
    let fixture = testing::gateway();
    let (handle, _rx) = testing::register_client(&fixture.gateway).await;

    let err = subscribe(&fixture.gateway, &handle, subscribe_request("ghosts", "g1"))
        .await
        .expect_err("unknown collection must fail");
    assert_eq!(err.code(), ErrorCode::InvalidCollection);
    assert_eq!(fixture.gateway.registry().count("ghosts").await, 0);
}

#[tokio::test]
async fn subscribe_forbidden_collection_registers_nothing_and_no_focus() {
    let fixture = testing::gateway();
    let (handle, _rx) = testing::register_client(&fixture.gateway).await;

    // Anonymous caller, authenticated-only collection, single-item mode.
    let request =
        SubscribeRequest { item: Some(json!(10)), ..subscribe_request("notes", "n1") };
    let err = subscribe(&fixture.gateway, &handle, request)
        .await
        .expect_err("hidden collection must fail");
    assert_eq!(err.code(), ErrorCode::InvalidCollection);
    assert_eq!(fixture.gateway.registry().count("notes").await, 0);
}

#[tokio::test]
async fn admin_bypasses_the_schema_gate() {
    let fixture = testing::gateway();
    let (handle, mut rx) = testing::register_client(&fixture.gateway).await;
    testing::install_identity(
        &fixture.gateway,
        &handle,
        testing::admin_accountability(Uuid::new_v4()),
    );
    fixture.platform.set_visibility("notes", Visibility::AdminOnly);

    subscribe(&fixture.gateway, &handle, subscribe_request("notes", "n1"))
        .await
        .expect("admin subscribes to restricted collections");
    let frame = recv_frame(&mut rx).await;
    let (event, _, _) = expect_subscription(&frame);
    assert_eq!(event, SubscriptionEvent::Init);
}

#[tokio::test]
async fn resubscribe_with_the_same_uid_replaces_the_prior_subscription() {
    let fixture = testing::gateway();
    let (handle, mut rx) = testing::register_client(&fixture.gateway).await;

    subscribe(&fixture.gateway, &handle, subscribe_request("articles", "a1"))
        .await
        .expect("first subscribe");
    let _ = recv_frame(&mut rx).await;

    // Second subscribe, same uid, different query.
    let request = SubscribeRequest {
        query: Some(Query {
            filter: Some(json!({"published": {"_eq": true}})),
            ..Query::default()
        }),
        ..subscribe_request("articles", "a1")
    };
    subscribe(&fixture.gateway, &handle, request).await.expect("second subscribe");
    let frame = recv_frame(&mut rx).await;
    let (event, payload, uid) = expect_subscription(&frame);
    assert_eq!(event, SubscriptionEvent::Init);
    assert_eq!(uid, Some("a1"));
    assert_eq!(payload.as_array().map(Vec::len), Some(1), "second query governs");

    // Exactly one subscription survives, carrying the second query.
    assert_eq!(fixture.gateway.registry().count("articles").await, 1);
    let sub = fixture.gateway.registry().snapshot("articles").await.remove(0);
    assert!(sub.query.filter.is_some());
}

// =============================================================================
// UNSUBSCRIBE
// =============================================================================

#[tokio::test]
async fn unsubscribe_by_uid_removes_one_and_is_idempotent() {
    let fixture = testing::gateway();
    let (handle, mut rx) = testing::register_client(&fixture.gateway).await;

    subscribe(&fixture.gateway, &handle, subscribe_request("articles", "a1"))
        .await
        .expect("subscribe a1");
    subscribe(&fixture.gateway, &handle, subscribe_request("articles", "a2"))
        .await
        .expect("subscribe a2");
    let _ = recv_frame(&mut rx).await;
    let _ = recv_frame(&mut rx).await;

    let request = UnsubscribeRequest { uid: Some("a1".into()) };
    unsubscribe(&fixture.gateway, &handle, &request).await;
    assert_eq!(fixture.gateway.registry().count("articles").await, 1);

    // Second removal of the same uid: a no-op, never an error.
    unsubscribe(&fixture.gateway, &handle, &request).await;
    assert_eq!(fixture.gateway.registry().count("articles").await, 1);
}

#[tokio::test]
async fn unsubscribe_without_uid_removes_everything_and_fans_out_focus() {
    let fixture = testing::gateway();
    let (handle, mut rx) = testing::register_client(&fixture.gateway).await;
    let mut bus_rx = fixture.gateway.bus().subscribe();

    subscribe(&fixture.gateway, &handle, subscribe_request("articles", "a1"))
        .await
        .expect("subscribe articles");
    subscribe(
        &fixture.gateway,
        &handle,
        SubscribeRequest { ..subscribe_request(USERS_COLLECTION, "u1") },
    )
    .await
    .expect_err("anonymous cannot see sys_users");
    let _ = recv_frame(&mut rx).await;

    unsubscribe(&fixture.gateway, &handle, &UnsubscribeRequest { uid: None }).await;
    assert_eq!(fixture.gateway.registry().count("articles").await, 0);

    let event = timeout(Duration::from_secs(1), bus_rx.recv())
        .await
        .expect("focus fan-out")
        .expect("bus open");
    assert!(matches!(event, ChangeEvent::Focus { ref collection } if collection == "articles"));
}

// =============================================================================
// DISPATCH
// =============================================================================

#[tokio::test]
async fn mutation_dispatch_rereads_instead_of_relaying_the_payload() {
    let fixture = testing::gateway();
    let (handle, mut rx) = testing::register_client(&fixture.gateway).await;

    let request = SubscribeRequest {
        query: Some(Query {
            filter: Some(json!({"published": {"_eq": true}})),
            fields: Some(vec!["id".into()]),
            sort: Some(vec!["id".into()]),
            ..Query::default()
        }),
        ..subscribe_request("articles", "a1")
    };
    subscribe(&fixture.gateway, &handle, request).await.expect("subscribe");
    let _ = recv_frame(&mut rx).await;

    // A new unpublished row: the dispatch must run and the re-read must
    // exclude it, so the payload still has exactly one row.
    fixture
        .platform
        .create_one("articles", None, json!({"id": 3, "title": "third", "published": false}))
        .await
        .expect("seed row");
    dispatch(
        &fixture.gateway,
        &ChangeEvent::Mutation {
            collection: "articles".into(),
            action: MutationAction::Create,
            keys: vec![json!(3)],
        },
    )
    .await;

    let frame = recv_frame(&mut rx).await;
    let (event, payload, uid) = expect_subscription(&frame);
    assert_eq!(event, SubscriptionEvent::Create);
    assert_eq!(uid, Some("a1"));
    assert_eq!(payload, &json!([{"id": 1}]), "filtered-out rows never appear");
}

#[tokio::test]
async fn dispatch_on_an_empty_bucket_is_free() {
    let fixture = testing::gateway();
    // No subscriptions at all; must simply return.
    dispatch(
        &fixture.gateway,
        &ChangeEvent::Mutation {
            collection: "articles".into(),
            action: MutationAction::Delete,
            keys: vec![json!(1)],
        },
    )
    .await;
}

#[tokio::test]
async fn permission_failure_at_dispatch_reports_but_retains_the_subscription() {
    let fixture = testing::gateway();
    let (handle, mut rx) = testing::register_client(&fixture.gateway).await;

    subscribe(&fixture.gateway, &handle, subscribe_request("articles", "a1"))
        .await
        .expect("subscribe");
    let _ = recv_frame(&mut rx).await;

    // Grants change after registration.
    fixture.platform.set_visibility("articles", Visibility::AdminOnly);
    dispatch(
        &fixture.gateway,
        &ChangeEvent::Mutation {
            collection: "articles".into(),
            action: MutationAction::Update,
            keys: vec![json!(1)],
        },
    )
    .await;

    let frame = recv_frame(&mut rx).await;
    let ServerMessage::Error { error, uid } = &frame else {
        panic!("expected error frame, got {frame:?}");
    };
    assert_eq!(error.code, ErrorCode::Forbidden);
    assert_eq!(uid.as_deref(), Some("a1"));
    assert_eq!(
        fixture.gateway.registry().count("articles").await,
        1,
        "permission failures never tear the subscription down"
    );

    // Grants restored: the next dispatch flows again.
    fixture.platform.set_visibility("articles", Visibility::Public);
    dispatch(
        &fixture.gateway,
        &ChangeEvent::Mutation {
            collection: "articles".into(),
            action: MutationAction::Update,
            keys: vec![json!(1)],
        },
    )
    .await;
    let frame = recv_frame(&mut rx).await;
    let (event, _, _) = expect_subscription(&frame);
    assert_eq!(event, SubscriptionEvent::Update);
}

#[tokio::test]
async fn stale_client_in_the_snapshot_is_dropped_silently() {
    let fixture = testing::gateway();
    let (handle, mut rx) = testing::register_client(&fixture.gateway).await;

    subscribe(&fixture.gateway, &handle, subscribe_request("articles", "a1"))
        .await
        .expect("subscribe");
    let _ = recv_frame(&mut rx).await;

    // The client vanishes but its subscription is still registered.
    fixture.gateway.remove_client(handle.id()).await;
    dispatch(
        &fixture.gateway,
        &ChangeEvent::Mutation {
            collection: "articles".into(),
            action: MutationAction::Create,
            keys: vec![json!(1)],
        },
    )
    .await;
    assert!(rx.try_recv().is_err(), "no frame may reach a departed client");
}

// =============================================================================
// SYNTHETIC EVENT FILTERS
// =============================================================================

#[tokio::test]
async fn focus_events_skip_subscriptions_without_the_side_channel() {
    let fixture = testing::gateway();
    let (plain, mut plain_rx) = testing::register_client(&fixture.gateway).await;
    let (status, mut status_rx) = testing::register_client(&fixture.gateway).await;

    subscribe(&fixture.gateway, &plain, subscribe_request("articles", "p1"))
        .await
        .expect("plain subscribe");
    subscribe(
        &fixture.gateway,
        &status,
        SubscribeRequest { status: true, ..subscribe_request("articles", "s1") },
    )
    .await
    .expect("status subscribe");
    let _ = recv_frame(&mut plain_rx).await;
    let _ = recv_frame(&mut status_rx).await;

    dispatch(&fixture.gateway, &ChangeEvent::Focus { collection: "articles".into() }).await;

    assert!(plain_rx.try_recv().is_err(), "status=false skips focus events");
    let frame = recv_frame(&mut status_rx).await;
    let ServerMessage::Subscription { event, status: Some(snapshot), .. } = &frame else {
        panic!("expected focus frame with presence snapshot, got {frame:?}");
    };
    assert_eq!(*event, SubscriptionEvent::Focus);
    assert!(snapshot.online.is_empty());
}

#[tokio::test]
async fn status_events_skip_single_item_subscriptions() {
    let fixture = testing::gateway();
    let user = Uuid::new_v4();
    let admin = testing::admin_accountability(user);

    let (multi, mut multi_rx) = testing::register_client(&fixture.gateway).await;
    testing::install_identity(&fixture.gateway, &multi, admin.clone());
    let (single, mut single_rx) = testing::register_client(&fixture.gateway).await;
    testing::install_identity(&fixture.gateway, &single, admin.clone());

    fixture
        .platform
        .create_one(USERS_COLLECTION, Some(&admin), json!({"id": user, "email": "a@example.com"}))
        .await
        .expect("seed user row");

    subscribe(
        &fixture.gateway,
        &multi,
        SubscribeRequest { status: true, ..subscribe_request(USERS_COLLECTION, "m1") },
    )
    .await
    .expect("multi subscribe");
    subscribe(
        &fixture.gateway,
        &single,
        SubscribeRequest {
            status: true,
            item: Some(json!(user)),
            ..subscribe_request(USERS_COLLECTION, "s1")
        },
    )
    .await
    .expect("single subscribe");
    let _ = recv_frame(&mut multi_rx).await;
    let _ = recv_frame(&mut single_rx).await;
    // The single-item subscribe records focus, which fans a focus event to
    // status subscriptions on the bucket; drain it from the multi client.
    dispatch(&fixture.gateway, &ChangeEvent::Focus { collection: USERS_COLLECTION.into() }).await;
    let _ = recv_frame(&mut multi_rx).await;
    let _ = recv_frame(&mut single_rx).await;

    dispatch(&fixture.gateway, &ChangeEvent::Status).await;

    let frame = recv_frame(&mut multi_rx).await;
    let (event, _, _) = expect_subscription(&frame);
    assert_eq!(event, SubscriptionEvent::Status);
    assert!(
        single_rx.try_recv().is_err(),
        "status events skip subscriptions that target a single item"
    );
}

// =============================================================================
// ORDERING
// =============================================================================

#[tokio::test]
async fn init_always_precedes_mutation_frames() {
    let fixture = testing::gateway();
    let (handle, mut rx) = testing::register_client(&fixture.gateway).await;

    subscribe(&fixture.gateway, &handle, subscribe_request("articles", "a1"))
        .await
        .expect("subscribe");
    dispatch(
        &fixture.gateway,
        &ChangeEvent::Mutation {
            collection: "articles".into(),
            action: MutationAction::Create,
            keys: vec![json!(1)],
        },
    )
    .await;

    let first = recv_frame(&mut rx).await;
    let (event, _, _) = expect_subscription(&first);
    assert_eq!(event, SubscriptionEvent::Init, "init must be the first frame on a uid");

    let second = recv_frame(&mut rx).await;
    let (event, _, _) = expect_subscription(&second);
    assert_eq!(event, SubscriptionEvent::Create);
}

#[tokio::test]
async fn end_to_end_dispatcher_task_delivers_bus_events() {
    let fixture = testing::gateway();
    let _dispatcher = spawn_dispatcher(&fixture.gateway);
    let (handle, mut rx) = testing::register_client(&fixture.gateway).await;

    subscribe(&fixture.gateway, &handle, subscribe_request("articles", "a1"))
        .await
        .expect("subscribe");
    let _ = recv_frame(&mut rx).await;

    fixture
        .gateway
        .bus()
        .publish_mutation("articles", MutationAction::Delete, vec![json!(2)]);

    let frame = recv_frame(&mut rx).await;
    let (event, payload, _) = expect_subscription(&frame);
    assert_eq!(event, SubscriptionEvent::Delete);
    assert!(payload.is_array());
}
