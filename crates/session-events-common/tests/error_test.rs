use session_events_common::CoreError;
use uuid::Uuid;

#[test]
fn test_listener_stopped_display() {
    let err = CoreError::ListenerStopped;
    assert_eq!(err.to_string(), "notify listener is not running");
}

#[test]
fn test_listen_timeout_display_includes_channel() {
    let err = CoreError::ListenTimeout("session:abc".to_string());
    assert!(err.to_string().contains("session:abc"));
}

#[test]
fn test_connection_not_found_display_includes_uuid() {
    let id = Uuid::new_v4();
    let err = CoreError::ConnectionNotFound(id);
    assert!(err.to_string().contains(&id.to_string()));
}

#[test]
fn test_serialization_error_wraps_serde_json() {
    let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
    let err: CoreError = json_err.into();
    assert!(matches!(err, CoreError::Serialization(_)));
}
