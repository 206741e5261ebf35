use mongodb_core::apm::{ClusterEvent, Listener};
use mongodb_core::connection::ConnectionId;
use mongodb_core::topology::server::{ServerDescription, ServerType};

use crate::mock;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn opened(address: &str) -> ClusterEvent {
    ClusterEvent::ConnectionOpened {
        connection_id: ConnectionId::new(mock::server_id(address), 1),
    }
}

#[test]
fn every_hook_sees_every_event() {
    let listener = Listener::new();
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(Mutex::new(Vec::new()));

    let counter = first.clone();
    listener
        .add_hook(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let seen = second.clone();
    listener
        .add_hook(move |event| seen.lock().unwrap().push(event.to_string()))
        .unwrap();

    listener.emit(&opened("a:27017"));
    listener.emit(&ClusterEvent::ServerOpened {
        server_id: mock::server_id("b:27017"),
    });

    assert_eq!(2, first.load(Ordering::SeqCst));
    let seen = second.lock().unwrap();
    assert_eq!(2, seen.len());
    assert!(seen[0].starts_with("CONNECTION "));
    assert!(seen[0].ends_with(" OPENED"));
    assert!(seen[1].contains("b:27017"));
}

#[test]
fn panicking_hook_does_not_stop_the_others() {
    let listener = Listener::new();
    let count = Arc::new(AtomicUsize::new(0));

    listener.add_hook(|_| panic!("hook failure")).unwrap();
    let counter = count.clone();
    listener
        .add_hook(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    listener.emit(&opened("a:27017"));
    listener.emit(&opened("a:27017"));
    assert_eq!(2, count.load(Ordering::SeqCst));
}

#[test]
fn emit_without_hooks_is_harmless() {
    Listener::new().emit(&opened("a:27017"));
}

#[test]
fn events_display_what_changed() {
    let server_id = mock::server_id("a:27017");
    let old = Arc::new(ServerDescription::unknown(server_id.clone()));
    let new = Arc::new(ServerDescription::new(server_id.clone(), ServerType::ReplicaSetPrimary));

    let event = ClusterEvent::ServerDescriptionChanged { old: old, new: new };
    let text = event.to_string();
    assert!(text.contains("a:27017"));
    assert!(text.contains("Unknown/Disconnected -> ReplicaSetPrimary/Connected"));

    let checked_in = ClusterEvent::ConnectionCheckedIn {
        connection_id: ConnectionId::new(server_id, 7),
    };
    assert!(checked_in.to_string().ends_with("#7 CHECKED IN"));
}
