//! WebSocket protocol message types.
//!
//! Defines the JSON message format for client-server communication.

use cart_metrics::DashboardPayload;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Message sent from client to server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to one application's dashboard, leaving any previous one.
    RequestDashboardData {
        /// Application id, number or numeric string. Validated by the
        /// lifecycle manager, not here.
        #[serde(default, alias = "scope")]
        app: Value,
    },
    /// Ping message for keepalive.
    Ping,
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Message sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full dashboard state of the subscribed application.
    DashboardUpdate(DashboardPayload),
    /// Pong response to ping.
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;
    use cart_metrics::RawCartRecord;
    use serde_json::json;

    #[test]
    fn test_client_message_deserialize() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"request_dashboard_data","app":15}"#).unwrap();
        match msg {
            ClientMessage::RequestDashboardData { app } => assert_eq!(app, json!(15)),
            _ => panic!("Wrong message type"),
        }

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"request_dashboard_data","scope":"7"}"#).unwrap();
        match msg {
            ClientMessage::RequestDashboardData { app } => assert_eq!(app, json!("7")),
            _ => panic!("Wrong message type"),
        }

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn test_missing_app_is_null() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"request_dashboard_data"}"#).unwrap();
        match msg {
            ClientMessage::RequestDashboardData { app } => assert!(app.is_null()),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_unknown_message_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[test]
    fn test_server_message_serialize() {
        let json = serde_json::to_value(ServerMessage::Pong).unwrap();
        assert_eq!(json, json!({"type": "pong"}));

        let payload = DashboardPayload::from_records(vec![RawCartRecord {
            app: json!(15),
            cart_counter: json!(5),
            cart_counter_max: json!(10),
            ..Default::default()
        }]);
        let json = serde_json::to_value(ServerMessage::DashboardUpdate(payload)).unwrap();
        assert_eq!(json["type"], "dashboard_update");
        assert_eq!(json["zones"].as_array().unwrap().len(), 4);
        assert_eq!(json["cartDetails"][0]["percentage"], 50);
        assert_eq!(json["rawData"].as_array().unwrap().len(), 1);
    }
}
