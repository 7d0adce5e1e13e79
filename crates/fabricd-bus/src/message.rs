//! Wire format of object-change messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of mutation a message announces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Oper {
    /// A resource was created.
    #[serde(rename = "CREATE")]
    Create,
    /// A resource was updated by an explicit request.
    #[serde(rename = "UPDATE")]
    Update,
    /// A resource was deleted.
    #[serde(rename = "DELETE")]
    Delete,
    /// A resource changed as a side effect (its back-refs moved).
    #[serde(rename = "UPDATE-IMPLICIT")]
    UpdateImplicit,
}

/// One object-change announcement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Correlates the message with the API request that caused it.
    pub request_id: String,
    /// Mutation kind.
    pub oper: Oper,
    /// Resource type of the mutated object.
    #[serde(rename = "type")]
    pub type_name: String,
    /// UUID of the mutated object.
    pub uuid: String,
    /// Fully-qualified name of the mutated object.
    pub fq_name: Vec<String>,
    /// Optional serialized object body (present on CREATE).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub obj_dict: Value,
}

impl BusMessage {
    /// Builds a message for a mutation.
    pub fn new(request_id: &str, oper: Oper, type_name: &str, uuid: &str, fq_name: &[String]) -> Self {
        Self {
            request_id: request_id.to_string(),
            oper,
            type_name: type_name.to_string(),
            uuid: uuid.to_string(),
            fq_name: fq_name.to_vec(),
            obj_dict: Value::Null,
        }
    }

    /// Attaches the serialized object body.
    pub fn with_obj_dict(mut self, obj_dict: Value) -> Self {
        self.obj_dict = obj_dict;
        self
    }
}

/// A published message plus its bus-assigned sequence number.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    /// Monotonic sequence assigned at publish time.
    pub sequence: u64,
    /// The announcement.
    pub message: BusMessage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_oper_wire_names() {
        assert_eq!(serde_json::to_value(Oper::Create).unwrap(), json!("CREATE"));
        assert_eq!(
            serde_json::to_value(Oper::UpdateImplicit).unwrap(),
            json!("UPDATE-IMPLICIT")
        );
        let parsed: Oper = serde_json::from_value(json!("DELETE")).unwrap();
        assert_eq!(parsed, Oper::Delete);
    }

    #[test]
    fn test_message_serialization() {
        let msg = BusMessage::new(
            "req-1",
            Oper::Create,
            "virtual-network",
            "u1",
            &["default-domain".to_string(), "p".to_string(), "vn".to_string()],
        )
        .with_obj_dict(json!({"display_name": "vn"}));
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], json!("virtual-network"));
        assert_eq!(v["oper"], json!("CREATE"));
        assert_eq!(v["obj_dict"]["display_name"], json!("vn"));

        let update = BusMessage::new("req-2", Oper::Update, "virtual-network", "u1", &[]);
        let v = serde_json::to_value(&update).unwrap();
        assert!(v.get("obj_dict").is_none());
    }
}
