//! Wire protocol: payload envelope, opcodes, close codes and close policy.

use crate::core::config::ShardConfig;
use crate::traits::GatewayError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Gateway API version negotiated in the connection query string.
pub const API_VERSION: u8 = 10;

/// The `{ op, d, s, t }` envelope every gateway packet uses.
///
/// `s` distinguishes "absent" from the valid sequence number `0`, so it is an
/// `Option` and must never be defaulted on deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn op(op: u8, d: Value) -> Self {
        Self {
            op,
            d,
            s: None,
            t: None,
        }
    }
}

/// Protocol opcodes.
pub mod opcodes {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const PRESENCE_UPDATE: u8 = 3;
    pub const VOICE_STATE_UPDATE: u8 = 4;
    pub const RESUME: u8 = 6;
    pub const RECONNECT: u8 = 7;
    pub const REQUEST_GUILD_MEMBERS: u8 = 8;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
    pub const REQUEST_SOUNDBOARD_SOUNDS: u8 = 31;
}

/// Named dispatch events the transport layer itself reacts to.
pub mod dispatch {
    pub const READY: &str = "READY";
    pub const RESUMED: &str = "RESUMED";
    pub const GUILD_CREATE: &str = "GUILD_CREATE";
    pub const GUILD_MEMBERS_CHUNK: &str = "GUILD_MEMBERS_CHUNK";
}

/// Close codes this library sends when it closes a socket on purpose.
pub mod close_codes {
    /// The caller asked the shard to go offline for good.
    pub const SHUTDOWN: u16 = 3000;
    /// A zombied connection was detected and force-closed.
    pub const ZOMBIE: u16 = 3010;
    /// An old socket was closed to make room for a fresh resume.
    pub const RESUME_SUPERSEDED: u16 = 3024;
    /// The shard belongs to a retired generation after a reshard switch.
    pub const RESHARDED: u16 = 3065;
    /// An open socket was closed ahead of a full re-identify.
    pub const REIDENTIFYING: u16 = 3066;
}

/// Close codes the gateway sends.
pub mod gateway_close {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const UNKNOWN_ERROR: u16 = 4000;
    pub const UNKNOWN_OPCODE: u16 = 4001;
    pub const DECODE_ERROR: u16 = 4002;
    pub const NOT_AUTHENTICATED: u16 = 4003;
    pub const AUTHENTICATION_FAILED: u16 = 4004;
    pub const ALREADY_AUTHENTICATED: u16 = 4005;
    pub const INVALID_SEQ: u16 = 4007;
    pub const RATE_LIMITED: u16 = 4008;
    pub const SESSION_TIMED_OUT: u16 = 4009;
    pub const INVALID_SHARD: u16 = 4010;
    pub const SHARDING_REQUIRED: u16 = 4011;
    pub const INVALID_API_VERSION: u16 = 4012;
    pub const INVALID_INTENTS: u16 = 4013;
    pub const DISALLOWED_INTENTS: u16 = 4014;
}

/// What a shard should do after its socket closed with a given code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePolicy {
    /// Planned local close; settle in `Disconnected` and wait for the caller.
    Settle,
    /// Unrecoverable; settle in `Offline` and surface an error.
    Fatal,
    /// The session is unusable; start over with a fresh identify.
    Reidentify,
    /// Transient; resume, alternating with identify to bound retry loops.
    Resume,
}

/// Map a close code to its recovery policy.
///
/// `going_offline` is set only when the local caller requested a 1000/1001
/// close; it keeps those two codes from triggering an auto-resume.
pub fn classify_close(code: u16, going_offline: bool) -> ClosePolicy {
    match code {
        close_codes::SHUTDOWN
        | close_codes::REIDENTIFYING
        | close_codes::RESHARDED
        | close_codes::RESUME_SUPERSEDED => ClosePolicy::Settle,
        gateway_close::AUTHENTICATION_FAILED
        | gateway_close::INVALID_SHARD
        | gateway_close::SHARDING_REQUIRED
        | gateway_close::INVALID_API_VERSION
        | gateway_close::INVALID_INTENTS
        | gateway_close::DISALLOWED_INTENTS => ClosePolicy::Fatal,
        gateway_close::NOT_AUTHENTICATED
        | gateway_close::INVALID_SEQ
        | gateway_close::SESSION_TIMED_OUT => ClosePolicy::Reidentify,
        gateway_close::NORMAL | gateway_close::GOING_AWAY if going_offline => ClosePolicy::Settle,
        _ => ClosePolicy::Resume,
    }
}

/// Build the error surfaced for a fatal close code.
pub fn fatal_error(code: u16) -> GatewayError {
    match code {
        gateway_close::AUTHENTICATION_FAILED => {
            GatewayError::AuthenticationFailed("the gateway rejected the token".into())
        }
        gateway_close::INVALID_SHARD => {
            GatewayError::InvalidShard("the gateway rejected the shard id".into())
        }
        gateway_close::SHARDING_REQUIRED => GatewayError::ShardingRequired,
        gateway_close::INVALID_API_VERSION => GatewayError::InvalidApiVersion,
        gateway_close::INVALID_INTENTS => GatewayError::Intents("invalid intents".into()),
        gateway_close::DISALLOWED_INTENTS => GatewayError::Intents("disallowed intents".into()),
        other => GatewayError::ConnectionClosed(format!("close code {other}")),
    }
}

/// Session fields carried by the READY dispatch.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyData {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}

/// Build an identify payload for a shard.
pub fn identify_payload(config: &ShardConfig, shard_id: u32, presence: Option<Value>) -> GatewayPayload {
    let mut d = json!({
        "token": config.token,
        "compress": config.payload_compression,
        "properties": config.properties,
        "intents": config.intents,
        "shard": [shard_id, config.total_shards],
    });
    if let Some(presence) = presence {
        d["presence"] = presence;
    }
    GatewayPayload::op(opcodes::IDENTIFY, d)
}

/// Build a resume payload from a stored session.
pub fn resume_payload(token: &str, session_id: &str, seq: Option<u64>) -> GatewayPayload {
    GatewayPayload::op(
        opcodes::RESUME,
        json!({
            "token": token,
            "session_id": session_id,
            "seq": seq,
        }),
    )
}

/// Build a heartbeat carrying the last received sequence number.
pub fn heartbeat_payload(seq: Option<u64>) -> GatewayPayload {
    GatewayPayload::op(opcodes::HEARTBEAT, json!(seq))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_keeps_all_four_fields() {
        let payload = GatewayPayload::op(opcodes::HEARTBEAT, json!(null));
        let text = serde_json::to_string(&payload).unwrap();
        assert_eq!(text, r#"{"op":1,"d":null,"s":null,"t":null}"#);
    }

    #[test]
    fn sequence_zero_survives_the_round_trip() {
        let payload: GatewayPayload = serde_json::from_str(r#"{"op":0,"d":{},"s":0,"t":"X"}"#).unwrap();
        assert_eq!(payload.s, Some(0));
    }

    #[test]
    fn missing_sequence_is_none() {
        let payload: GatewayPayload = serde_json::from_str(r#"{"op":11,"d":null,"s":null,"t":null}"#).unwrap();
        assert_eq!(payload.s, None);
    }

    #[test]
    fn fatal_codes_never_reconnect() {
        for code in [
            gateway_close::AUTHENTICATION_FAILED,
            gateway_close::INVALID_SHARD,
            gateway_close::SHARDING_REQUIRED,
            gateway_close::INVALID_API_VERSION,
            gateway_close::INVALID_INTENTS,
            gateway_close::DISALLOWED_INTENTS,
        ] {
            assert_eq!(classify_close(code, false), ClosePolicy::Fatal, "code {code}");
        }
    }

    #[test]
    fn reidentify_codes_require_a_fresh_session() {
        for code in [
            gateway_close::NOT_AUTHENTICATED,
            gateway_close::INVALID_SEQ,
            gateway_close::SESSION_TIMED_OUT,
        ] {
            assert_eq!(classify_close(code, false), ClosePolicy::Reidentify, "code {code}");
        }
    }

    #[test]
    fn transient_codes_resume() {
        for code in [
            gateway_close::UNKNOWN_ERROR,
            gateway_close::UNKNOWN_OPCODE,
            gateway_close::DECODE_ERROR,
            gateway_close::ALREADY_AUTHENTICATED,
            gateway_close::RATE_LIMITED,
            1006,
            4242,
        ] {
            assert_eq!(classify_close(code, false), ClosePolicy::Resume, "code {code}");
        }
    }

    #[test]
    fn normal_closure_depends_on_intent() {
        assert_eq!(classify_close(gateway_close::NORMAL, false), ClosePolicy::Resume);
        assert_eq!(classify_close(gateway_close::NORMAL, true), ClosePolicy::Settle);
        assert_eq!(classify_close(gateway_close::GOING_AWAY, false), ClosePolicy::Resume);
        assert_eq!(classify_close(gateway_close::GOING_AWAY, true), ClosePolicy::Settle);
    }

    #[test]
    fn planned_codes_settle() {
        for code in [
            close_codes::SHUTDOWN,
            close_codes::REIDENTIFYING,
            close_codes::RESHARDED,
            close_codes::RESUME_SUPERSEDED,
        ] {
            assert_eq!(classify_close(code, false), ClosePolicy::Settle, "code {code}");
        }
    }

    #[test]
    fn resume_payload_shape() {
        let payload = resume_payload("tok", "abc", Some(0));
        assert_eq!(payload.op, opcodes::RESUME);
        assert_eq!(payload.d["session_id"], "abc");
        assert_eq!(payload.d["seq"], 0);
    }
}
