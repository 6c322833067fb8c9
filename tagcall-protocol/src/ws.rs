use serde::{Deserialize, Serialize};

/// Represents a message exchanged with the signaling relay.
///
/// The relay itself never interprets call payloads beyond the routing fields
/// (`target_id`); session descriptions, candidates and the optional
/// `session_ref` interaction reference are opaque pass-through data.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SignalingMessage {
    /// Connect acknowledgment sent by the relay as soon as a connection is
    /// accepted, carrying the ephemeral signaling address assigned to it.
    ///
    /// The id is only valid for the lifetime of the connection and must not
    /// be persisted; it is used as the sender identity in [`SignalingMessage::CallUser`]
    /// and as the routing target for candidates flowing back.
    #[serde(rename_all = "camelCase")]
    Welcome {
        /// Address assigned to this connection.
        id: String,
    },
    /// A call offer sent by the caller to initiate a call.
    ///
    /// The relay forwards the offer to the target as a [`SignalingMessage::CallMade`],
    /// preserving the session description and caller identity.
    #[serde(rename_all = "camelCase")]
    CallUser {
        /// Address of the client being called.
        target_id: String,
        /// Serialized session description containing the caller's offer.
        sdp: String,
        /// The caller's own (ephemeral) address, used by the callee to route
        /// the answer and trickled candidates back.
        caller_id: String,
        /// Display name shown on the callee's incoming-call prompt.
        caller_name: String,
        /// Unique id for this call attempt. All candidate exchange for the
        /// call is scoped by this id rather than by party identity.
        call_id: String,
        /// Opaque reference correlating the call with a prior contact
        /// record. Never interpreted by either client.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_ref: Option<String>,
    },
    /// Incoming-call notification delivered by the relay to the callee.
    #[serde(rename_all = "camelCase")]
    CallMade {
        /// Serialized session description containing the caller's offer.
        sdp: String,
        /// Address of the caller.
        from_id: String,
        /// Display name of the caller.
        caller_name: String,
        /// Unique id of the call attempt, echoed from [`SignalingMessage::CallUser`].
        call_id: String,
    },
    /// Answer sent by the callee after accepting an incoming call,
    /// forwarded by the relay to the caller.
    #[serde(rename_all = "camelCase")]
    CallAccepted {
        /// Serialized session description containing the callee's answer.
        sdp: String,
        /// Unique id of the call attempt being answered.
        call_id: String,
    },
    /// A single trickled network-path candidate, sent in either direction
    /// as soon as it is discovered.
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        /// Address of the other party.
        target_id: String,
        /// Serialized candidate.
        candidate: String,
        /// Id of the call the candidate belongs to. Candidates carrying a
        /// different id than the receiving session are dropped, so two
        /// concurrent calls towards the same address cannot cross-talk.
        call_id: String,
    },
    /// Hangup sent by either party. The relay notifies the remaining party
    /// with a [`SignalingMessage::CallEnded`].
    #[serde(rename_all = "camelCase")]
    EndCall {
        /// Address of the other party.
        target_id: String,
        /// Opaque correlation reference, see [`SignalingMessage::CallUser::session_ref`].
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_ref: Option<String>,
    },
    /// Hangup notification delivered by the relay to the remaining party.
    CallEnded,
}

/// Field-less mirror of the [`SignalingMessage`] variants, used as the key
/// for per-event dispatch slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Welcome,
    CallUser,
    CallMade,
    CallAccepted,
    IceCandidate,
    EndCall,
    CallEnded,
}

impl SignalingMessage {
    /// Returns the [`EventKind`] of this message.
    pub fn kind(&self) -> EventKind {
        match self {
            SignalingMessage::Welcome { .. } => EventKind::Welcome,
            SignalingMessage::CallUser { .. } => EventKind::CallUser,
            SignalingMessage::CallMade { .. } => EventKind::CallMade,
            SignalingMessage::CallAccepted { .. } => EventKind::CallAccepted,
            SignalingMessage::IceCandidate { .. } => EventKind::IceCandidate,
            SignalingMessage::EndCall { .. } => EventKind::EndCall,
            SignalingMessage::CallEnded => EventKind::CallEnded,
        }
    }

    /// Serializes a [`SignalingMessage`] into a JSON string.
    pub fn serialize(message: &Self) -> serde_json::error::Result<String> {
        serde_json::to_string(message)
    }

    /// Deserializes a JSON string into a [`SignalingMessage`].
    pub fn deserialize(message: &str) -> serde_json::error::Result<Self> {
        serde_json::from_str(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn serialize_deserialize_welcome() {
        let message = SignalingMessage::Welcome {
            id: "chan1".to_string(),
        };

        let serialized = SignalingMessage::serialize(&message).unwrap();
        assert_eq!(serialized, "{\"type\":\"welcome\",\"id\":\"chan1\"}");

        let deserialized = SignalingMessage::deserialize(&serialized).unwrap();
        match deserialized {
            SignalingMessage::Welcome { id } => assert_eq!(id, "chan1"),
            _ => panic!("Expected Welcome message"),
        }
    }

    #[test]
    fn serialize_deserialize_call_user() {
        let message = SignalingMessage::CallUser {
            target_id: "owner42".to_string(),
            sdp: "sdp1".to_string(),
            caller_id: "chan1".to_string(),
            caller_name: "Scanner".to_string(),
            call_id: "call1".to_string(),
            session_ref: None,
        };

        let serialized = SignalingMessage::serialize(&message).unwrap();
        assert_eq!(
            serialized,
            "{\"type\":\"callUser\",\"targetId\":\"owner42\",\"sdp\":\"sdp1\",\"callerId\":\"chan1\",\"callerName\":\"Scanner\",\"callId\":\"call1\"}"
        );

        let deserialized = SignalingMessage::deserialize(&serialized).unwrap();
        assert_eq!(deserialized, message);
    }

    #[test]
    fn serialize_deserialize_call_user_with_session_ref() {
        let message = SignalingMessage::CallUser {
            target_id: "owner42".to_string(),
            sdp: "sdp1".to_string(),
            caller_id: "chan1".to_string(),
            caller_name: "Scanner".to_string(),
            call_id: "call1".to_string(),
            session_ref: Some("interaction9".to_string()),
        };

        let serialized = SignalingMessage::serialize(&message).unwrap();
        assert_eq!(
            serialized,
            "{\"type\":\"callUser\",\"targetId\":\"owner42\",\"sdp\":\"sdp1\",\"callerId\":\"chan1\",\"callerName\":\"Scanner\",\"callId\":\"call1\",\"sessionRef\":\"interaction9\"}"
        );

        let deserialized = SignalingMessage::deserialize(&serialized).unwrap();
        match deserialized {
            SignalingMessage::CallUser { session_ref, .. } => {
                assert_eq!(session_ref, Some("interaction9".to_string()));
            }
            _ => panic!("Expected CallUser message"),
        }
    }

    #[test]
    fn serialize_deserialize_call_made() {
        let message = SignalingMessage::CallMade {
            sdp: "sdp1".to_string(),
            from_id: "chan1".to_string(),
            caller_name: "Vehicle Owner".to_string(),
            call_id: "call1".to_string(),
        };

        let serialized = SignalingMessage::serialize(&message).unwrap();
        assert_eq!(
            serialized,
            "{\"type\":\"callMade\",\"sdp\":\"sdp1\",\"fromId\":\"chan1\",\"callerName\":\"Vehicle Owner\",\"callId\":\"call1\"}"
        );

        let deserialized = SignalingMessage::deserialize(&serialized).unwrap();
        assert_eq!(deserialized, message);
    }

    #[test]
    fn serialize_deserialize_call_accepted() {
        let message = SignalingMessage::CallAccepted {
            sdp: "sdp2".to_string(),
            call_id: "call1".to_string(),
        };

        let serialized = SignalingMessage::serialize(&message).unwrap();
        assert_eq!(
            serialized,
            "{\"type\":\"callAccepted\",\"sdp\":\"sdp2\",\"callId\":\"call1\"}"
        );

        let deserialized = SignalingMessage::deserialize(&serialized).unwrap();
        assert_eq!(deserialized, message);
    }

    #[test]
    fn serialize_deserialize_ice_candidate() {
        let message = SignalingMessage::IceCandidate {
            target_id: "owner42".to_string(),
            candidate: "candidate1".to_string(),
            call_id: "call1".to_string(),
        };

        let serialized = SignalingMessage::serialize(&message).unwrap();
        assert_eq!(
            serialized,
            "{\"type\":\"iceCandidate\",\"targetId\":\"owner42\",\"candidate\":\"candidate1\",\"callId\":\"call1\"}"
        );

        let deserialized = SignalingMessage::deserialize(&serialized).unwrap();
        assert_eq!(deserialized, message);
    }

    #[test]
    fn serialize_deserialize_end_call() {
        let message = SignalingMessage::EndCall {
            target_id: "owner42".to_string(),
            session_ref: None,
        };

        let serialized = SignalingMessage::serialize(&message).unwrap();
        assert_eq!(
            serialized,
            "{\"type\":\"endCall\",\"targetId\":\"owner42\"}"
        );

        let deserialized = SignalingMessage::deserialize(&serialized).unwrap();
        assert_eq!(deserialized, message);
    }

    #[test]
    fn serialize_deserialize_call_ended() {
        let message = SignalingMessage::CallEnded;

        let serialized = SignalingMessage::serialize(&message).unwrap();
        assert_eq!(serialized, "{\"type\":\"callEnded\"}");

        let deserialized = SignalingMessage::deserialize(&serialized).unwrap();
        assert!(matches!(deserialized, SignalingMessage::CallEnded));
    }

    #[test]
    fn kind_matches_variant() {
        assert_eq!(
            SignalingMessage::CallEnded.kind(),
            EventKind::CallEnded
        );
        assert_eq!(
            SignalingMessage::Welcome {
                id: "chan1".to_string()
            }
            .kind(),
            EventKind::Welcome
        );
        assert_eq!(
            SignalingMessage::IceCandidate {
                target_id: "owner42".to_string(),
                candidate: "candidate1".to_string(),
                call_id: "call1".to_string(),
            }
            .kind(),
            EventKind::IceCandidate
        );
    }
}
