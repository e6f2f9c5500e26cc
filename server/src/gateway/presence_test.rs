use super::*;
use crate::bus::USERS_COLLECTION;
use serde_json::json;
use uuid::Uuid;

fn tracker() -> (PresenceTracker, tokio::sync::broadcast::Receiver<ChangeEvent>) {
    let bus = Bus::new();
    let rx = bus.subscribe();
    (PresenceTracker::new(bus), rx)
}

fn expect_status(event: &ChangeEvent) {
    assert!(matches!(event, ChangeEvent::Status), "expected a status event, got {event:?}");
    assert_eq!(event.collection(), USERS_COLLECTION);
}

#[tokio::test]
async fn first_entry_dispatches_status_second_tab_is_silent() {
    let (tracker, mut rx) = tracker();
    let user = Uuid::new_v4();

    tracker.enter(user);
    expect_status(&rx.recv().await.expect("status event"));
    assert!(tracker.is_online(user));

    // Same user again (second tab): set semantics, no second event.
    tracker.enter(user);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn exit_removes_user_and_focus() {
    let (tracker, mut rx) = tracker();
    let user = Uuid::new_v4();

    tracker.enter(user);
    let _ = rx.recv().await;
    tracker.set_focus(
        user,
        FocusRecord { collection: "articles".into(), item: Some(json!(1)), field: None },
    );
    let _ = rx.recv().await; // focus event from set_focus

    tracker.exit(user);
    assert!(!tracker.is_online(user));
    assert!(tracker.focus_of(user).is_none());

    expect_status(&rx.recv().await.expect("status on exit"));
    let focus = rx.recv().await.expect("focus removal event");
    assert!(matches!(focus, ChangeEvent::Focus { ref collection } if collection == "articles"));
}

#[tokio::test]
async fn focus_overwrite_is_last_writer_wins() {
    let (tracker, mut rx) = tracker();
    let user = Uuid::new_v4();

    tracker.set_focus(
        user,
        FocusRecord { collection: "articles".into(), item: Some(json!(1)), field: None },
    );
    let _ = rx.recv().await;

    tracker.set_focus(
        user,
        FocusRecord { collection: "articles".into(), item: Some(json!(2)), field: Some("title".into()) },
    );
    let record = tracker.focus_of(user).expect("focus recorded");
    assert_eq!(record.item, Some(json!(2)));
    assert_eq!(record.field.as_deref(), Some("title"));

    // Same collection: exactly one focus event for the overwrite.
    let event = rx.recv().await.expect("focus event");
    assert!(matches!(event, ChangeEvent::Focus { ref collection } if collection == "articles"));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn moving_focus_across_collections_notifies_both() {
    let (tracker, mut rx) = tracker();
    let user = Uuid::new_v4();

    tracker.set_focus(user, FocusRecord { collection: "articles".into(), item: None, field: None });
    let _ = rx.recv().await;

    tracker.set_focus(user, FocusRecord { collection: "notes".into(), item: None, field: None });
    let first = rx.recv().await.expect("new collection event");
    let second = rx.recv().await.expect("old collection event");
    let mut collections = vec![
        match first {
            ChangeEvent::Focus { collection } => collection,
            other => panic!("expected focus, got {other:?}"),
        },
        match second {
            ChangeEvent::Focus { collection } => collection,
            other => panic!("expected focus, got {other:?}"),
        },
    ];
    collections.sort();
    assert_eq!(collections, vec!["articles".to_owned(), "notes".to_owned()]);
}

#[tokio::test]
async fn snapshot_reflects_current_maps() {
    let (tracker, _rx) = tracker();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    tracker.enter(a);
    tracker.enter(b);
    tracker.set_focus(a, FocusRecord { collection: "articles".into(), item: Some(json!(1)), field: None });

    let snapshot = tracker.snapshot();
    assert_eq!(snapshot.online.len(), 2);
    assert!(snapshot.online.contains(&a) && snapshot.online.contains(&b));
    assert_eq!(snapshot.focus.len(), 1);
    assert_eq!(snapshot.focus.get(&a).map(|f| f.collection.as_str()), Some("articles"));
}
