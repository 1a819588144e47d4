use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::Partition;
use crate::utils;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "STATE_TRANSITION")]
    StateTransition,
}

/// A state transition request addressed to a single instance session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub msg_type: MessageType,
    pub partition_name: String,
    pub resource_name: String,
    pub instance_name: String,
    pub from_state: String,
    pub to_state: String,
    pub session_id: String,
    pub state_model_def: String,
    pub src_name: String,
    pub create_timestamp: i64,
}

impl Message {
    /// Create a new state transition message with a fresh ID.
    pub fn new_transition(
        partition: &Partition, instance: &str, session_id: &str, state_model_def: &str, from: &str, to: &str, src_name: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            msg_type: MessageType::StateTransition,
            partition_name: partition.name(),
            resource_name: partition.resource.clone(),
            instance_name: instance.into(),
            from_state: from.into(),
            to_state: to.into(),
            session_id: session_id.into(),
            state_model_def: state_model_def.into(),
            src_name: src_name.into(),
            create_timestamp: utils::now_millis(),
        }
    }

    /// The partition this message targets, if its name is well formed.
    pub fn partition(&self) -> Option<Partition> {
        Partition::parse(&self.partition_name)
    }
}
