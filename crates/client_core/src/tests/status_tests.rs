use super::*;

use chrono::TimeZone;
use shared::domain::{ConversationId, UserId};

fn id(value: &str) -> MessageId {
    MessageId::from(value)
}

#[test]
fn advance_follows_sent_delivered_read() {
    use DeliveryStatus::*;

    assert_eq!(advance(None, Sent), Transition::Applied);
    assert_eq!(advance(Some(Sent), Delivered), Transition::Applied);
    assert_eq!(advance(Some(Sent), Read), Transition::Applied);
    assert_eq!(advance(Some(Delivered), Delivered), Transition::Unchanged);
    assert_eq!(advance(Some(Read), Delivered), Transition::IgnoredRegression);
    assert_eq!(advance(Some(Delivered), Sent), Transition::IgnoredRegression);
}

#[test]
fn stale_delivered_update_cannot_undo_read() {
    let book = StatusBook::new(16);
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("timestamp");
    assert_eq!(book.mark_read_local(&id("m1"), at), Transition::Applied);

    let transition = book.apply_remote(&id("m1"), DeliveryStatus::Delivered, None, None);

    assert_eq!(transition, Transition::IgnoredRegression);
    assert_eq!(
        book.entry(&id("m1")),
        Some(StatusEntry {
            status: DeliveryStatus::Read,
            read_at: Some(at),
        })
    );
}

#[test]
fn record_seeds_from_message_without_regressing() {
    let book = StatusBook::new(16);
    let mut message = Message::temporary("t", ConversationId::from("42"), UserId::from("u"), "hi");
    message.id = id("m1");
    message.status = Some(DeliveryStatus::Delivered);

    assert_eq!(book.record(&message), Transition::Applied);
    message.status = Some(DeliveryStatus::Sent);
    assert_eq!(book.record(&message), Transition::IgnoredRegression);
    message.status = None;
    assert_eq!(book.record(&message), Transition::Unchanged);
    assert_eq!(book.status(&id("m1")), Some(DeliveryStatus::Delivered));
}

#[test]
fn repeated_read_fills_in_missing_timestamp() {
    let book = StatusBook::new(16);
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("timestamp");
    book.apply_remote(&id("m1"), DeliveryStatus::Read, None, None);

    assert_eq!(
        book.apply_remote(&id("m1"), DeliveryStatus::Read, Some(at), None),
        Transition::Unchanged
    );
    assert_eq!(book.entry(&id("m1")).and_then(|entry| entry.read_at), Some(at));
}

#[test]
fn oldest_entries_are_forgotten_past_capacity() {
    let book = StatusBook::new(2);
    book.apply_remote(&id("a"), DeliveryStatus::Sent, None, None);
    book.apply_remote(&id("b"), DeliveryStatus::Sent, None, None);
    book.apply_remote(&id("a"), DeliveryStatus::Delivered, None, None);
    book.apply_remote(&id("c"), DeliveryStatus::Sent, None, None);

    assert_eq!(book.status(&id("a")), None);
    assert_eq!(book.status(&id("b")), Some(DeliveryStatus::Sent));
    assert_eq!(book.status(&id("c")), Some(DeliveryStatus::Sent));
}

#[test]
fn forgotten_entry_is_judged_against_the_timeline_status() {
    let book = StatusBook::new(1);
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("timestamp");
    book.apply_remote(&id("m1"), DeliveryStatus::Read, Some(at), None);
    book.apply_remote(&id("m2"), DeliveryStatus::Sent, None, None);
    assert_eq!(book.status(&id("m1")), None);

    let shown = StatusEntry {
        status: DeliveryStatus::Read,
        read_at: Some(at),
    };
    let transition = book.apply_remote(&id("m1"), DeliveryStatus::Delivered, None, Some(shown));

    assert_eq!(transition, Transition::IgnoredRegression);
    assert_eq!(book.entry(&id("m1")), Some(shown));
}
