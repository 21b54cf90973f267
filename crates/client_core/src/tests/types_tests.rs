use super::*;

#[test]
fn parses_message_received_into_message_event() {
    let event = InboundEvent::parse(
        r#"{"event":"message_received","data":{"id":"m1","conversation_id":"42","sender_id":"9","sender_email":"b@example.com","sender_role":"employer","message_text":"hello","created_at":"2024-03-01T10:00:00Z","status":"delivered"}}"#,
    )
    .expect("valid frame");

    let InboundEvent::Message(message) = event else {
        panic!("expected message event");
    };
    assert_eq!(message.message_id().as_str(), "m1");
    assert_eq!(message.conversation_id().as_str(), "42");
    assert_eq!(message.sender_role.as_deref(), Some("employer"));
    assert_eq!(message.message.status, Some(DeliveryStatus::Delivered));
}

#[test]
fn rejects_message_without_conversation() {
    let err = InboundEvent::parse(
        r#"{"event":"message_received","data":{"id":"m1","conversation_id":"","sender_id":"9","message_text":"x"}}"#,
    )
    .expect_err("empty conversation id must be rejected");
    assert!(matches!(err, SyncError::InvalidEvent(_)));
}

#[test]
fn rejects_unknown_event_names_and_garbage() {
    assert!(InboundEvent::parse(r#"{"event":"typing","data":{}}"#).is_err());
    assert!(InboundEvent::parse("not json").is_err());
}

#[test]
fn parses_join_acknowledgment() {
    let event =
        InboundEvent::parse(r#"{"event":"conversation_joined","data":{"conversationId":10}}"#)
            .expect("valid ack");
    assert_eq!(
        event,
        InboundEvent::JoinAcknowledged(ConversationId::from("10"))
    );
    assert_eq!(
        event.conversation_id().map(ConversationId::as_str),
        Some("10")
    );
}

#[test]
fn credential_debug_redacts_token() {
    let credential = Credential::new("7", "secret-token");
    let rendered = format!("{credential:?}");
    assert!(!rendered.contains("secret-token"));
}
