use super::*;

#[test]
fn decodes_message_received_with_numeric_ids() {
    let raw = r#"{
        "event": "message_received",
        "data": {
            "id": 981,
            "conversation_id": 42,
            "sender_id": 7,
            "sender_email": "ana@example.com",
            "sender_role": "candidate",
            "message_text": "hello",
            "created_at": "2024-03-01T10:00:00Z",
            "delivered_at": null,
            "read_at": null,
            "status": "sent"
        }
    }"#;

    let frame: ServerFrame = serde_json::from_str(raw).expect("decode frame");
    let ServerFrame::MessageReceived(payload) = frame else {
        panic!("expected message_received frame");
    };
    assert_eq!(payload.id, MessageId::from("981"));
    assert_eq!(payload.conversation_id, ConversationId::from("42"));
    assert_eq!(payload.status, Some(DeliveryStatus::Sent));

    let message = payload.into_message();
    assert_eq!(message.text, "hello");
    assert!(!message.is_temporary);
}

#[test]
fn decodes_camel_case_status_update() {
    let raw = r#"{
        "event": "message_status_update",
        "data": {"messageId": "m1", "conversationId": "42", "status": "read", "readAt": "2024-03-01T10:05:00Z"}
    }"#;

    let frame: ServerFrame = serde_json::from_str(raw).expect("decode frame");
    let ServerFrame::MessageStatusUpdate(update) = frame else {
        panic!("expected status update frame");
    };
    assert_eq!(update.message_id, MessageId::from("m1"));
    assert_eq!(update.status, DeliveryStatus::Read);
    assert!(update.read_at.is_some());
}

#[test]
fn missing_created_at_falls_back_to_receive_time() {
    let payload: MessagePayload = serde_json::from_str(
        r#"{"id": "m2", "conversation_id": "1", "sender_id": "u", "message_text": "x"}"#,
    )
    .expect("decode payload");
    let before = Utc::now();
    let message = payload.into_message();
    assert!(message.created_at >= before);
    assert_eq!(message.status, None);
}

#[test]
fn client_frames_use_event_envelope_with_camel_case_fields() {
    let frame = ClientFrame::MessageRead {
        message_id: MessageId::from("m1"),
        conversation_id: ConversationId::from("42"),
    };
    let value = serde_json::to_value(&frame).expect("encode");
    assert_eq!(value["event"], "message_read");
    assert_eq!(value["data"]["messageId"], "m1");
    assert_eq!(value["data"]["conversationId"], "42");
    assert!(!frame.is_membership());
    assert!(ClientFrame::JoinConversation {
        conversation_id: ConversationId::from("42")
    }
    .is_membership());
}

#[test]
fn delivery_status_orders_sent_before_delivered_before_read() {
    assert!(DeliveryStatus::Sent < DeliveryStatus::Delivered);
    assert!(DeliveryStatus::Delivered < DeliveryStatus::Read);
}
