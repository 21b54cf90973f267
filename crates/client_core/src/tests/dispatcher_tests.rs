use super::*;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use chrono::Utc;
use shared::domain::{DeliveryStatus, Message, UserId};

fn message(id: &str, conversation: &str) -> MessageEvent {
    MessageEvent::from(Message {
        id: MessageId::from(id),
        conversation_id: ConversationId::from(conversation),
        sender_id: UserId::from("u2"),
        text: format!("text of {id}"),
        created_at: Utc::now(),
        delivered_at: None,
        read_at: None,
        status: Some(DeliveryStatus::Sent),
        is_temporary: false,
        client_temp_id: None,
    })
}

fn status(id: &str, conversation: &str) -> StatusEvent {
    StatusEvent {
        message_id: MessageId::from(id),
        conversation_id: ConversationId::from(conversation),
        status: DeliveryStatus::Delivered,
        read_at: None,
    }
}

#[test]
fn repeated_message_id_reaches_listeners_once() {
    let dispatcher = Dispatcher::new(16, 8);
    let hits = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&hits);
    let _sub = dispatcher.messages().subscribe(ConversationId::from("42"), move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
    });

    assert!(dispatcher.admit(&MessageId::from("m1")));
    assert_eq!(dispatcher.deliver_message(&message("m1", "42")), 1);
    assert!(!dispatcher.admit(&MessageId::from("m1")));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(dispatcher.has_seen(&MessageId::from("m1")));
}

#[test]
fn dedup_window_evicts_oldest_ids() {
    let dispatcher = Dispatcher::new(2, 8);

    assert!(dispatcher.admit(&MessageId::from("a")));
    assert!(dispatcher.admit(&MessageId::from("b")));
    assert!(dispatcher.admit(&MessageId::from("c")));

    assert!(!dispatcher.has_seen(&MessageId::from("a")));
    assert!(dispatcher.has_seen(&MessageId::from("b")));
    assert!(!dispatcher.admit(&MessageId::from("c")));
}

#[test]
fn status_events_fan_out_to_scoped_and_global_listeners() {
    let dispatcher = Dispatcher::new(16, 8);
    let hits = Arc::new(AtomicUsize::new(0));
    let scoped = Arc::clone(&hits);
    let global = Arc::clone(&hits);
    let _a = dispatcher.statuses().subscribe(ConversationId::from("42"), move |_| {
        scoped.fetch_add(1, Ordering::SeqCst);
    });
    let _b = dispatcher.statuses().subscribe_global(move |_| {
        global.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(dispatcher.dispatch_status(&status("m1", "42")), 2);
    assert_eq!(dispatcher.dispatch_status(&status("m1", "42")), 2);
    assert_eq!(hits.load(Ordering::SeqCst), 4);
}

#[test]
fn held_events_are_released_in_arrival_order() {
    let dispatcher = Dispatcher::new(16, 8);
    let room = ConversationId::from("42");
    let first = InboundEvent::Message(message("m1", "42"));
    let second = InboundEvent::Status(status("m1", "42"));

    assert!(dispatcher.hold(&room, first.clone()).is_none());
    assert!(dispatcher.hold(&room, second.clone()).is_none());
    assert_eq!(dispatcher.held_count(&room), 2);

    assert_eq!(dispatcher.release(&room), vec![first, second]);
    assert_eq!(dispatcher.held_count(&room), 0);
    assert!(dispatcher.release(&room).is_empty());
}

#[test]
fn full_buffer_is_handed_back_instead_of_dropping() {
    let dispatcher = Dispatcher::new(16, 2);
    let room = ConversationId::from("42");

    assert!(dispatcher
        .hold(&room, InboundEvent::Status(status("m1", "42")))
        .is_none());
    let overflow = dispatcher
        .hold(&room, InboundEvent::Status(status("m2", "42")))
        .expect("buffer full");

    assert_eq!(overflow.len(), 2);
    assert_eq!(dispatcher.held_count(&room), 0);
}

#[test]
fn release_all_drains_every_room() {
    let dispatcher = Dispatcher::new(16, 8);
    dispatcher.hold(&ConversationId::from("20"), InboundEvent::Status(status("b", "20")));
    dispatcher.hold(&ConversationId::from("10"), InboundEvent::Status(status("a", "10")));

    let released = dispatcher.release_all();

    assert_eq!(
        released,
        vec![
            InboundEvent::Status(status("a", "10")),
            InboundEvent::Status(status("b", "20")),
        ]
    );
    assert_eq!(dispatcher.held_count(&ConversationId::from("10")), 0);
}
