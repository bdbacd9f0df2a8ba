//! # Simulator Interface
//!
//! The driving simulator talks in small text packets. Each packet starts with a two character
//! type prefix:
//!
//! - `40`: the client has connected,
//! - `41`: the client is disconnecting,
//! - `42`: an event, followed by a JSON array `[event_name, data]`.
//!
//! The simulator sends `telemetry` events and expects a `steer` event in return. A `telemetry`
//! event without any data (the simulator sends `null`) means the vehicle is under manual control,
//! in which case the `manual` event is sent back instead.
//!
//! Numbers in telemetry records may be either JSON numbers or numeric strings, the simulator
//! itself uses strings.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Prefix of a connect packet
pub const CONNECT_PREFIX: &str = "40";

/// Prefix of a disconnect packet
pub const DISCONNECT_PREFIX: &str = "41";

/// Prefix of an event packet
pub const EVENT_PREFIX: &str = "42";

/// Event name for inbound telemetry
pub const TELEMETRY_EVENT: &str = "telemetry";

/// Event name for outbound steering commands
pub const STEER_EVENT: &str = "steer";

/// Event name for the manual driving reply
pub const MANUAL_EVENT: &str = "manual";

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A single telemetry record from the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Telemetry {
    /// Cross-track error, the signed lateral distance from the target path.
    #[serde(deserialize_with = "de_num_or_str")]
    pub cte: f64,

    /// Current speed of the vehicle.
    #[serde(deserialize_with = "de_num_or_str")]
    pub speed: f64,

    /// Current steering angle of the vehicle.
    ///
    /// Units: degrees
    #[serde(deserialize_with = "de_num_or_str")]
    pub steering_angle: f64,
}

/// A steering command sent back to the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SteerCmd {
    /// Normalised steering demand in the range [-1, 1].
    pub steering_angle: f64,

    /// Throttle demand, negative values brake.
    pub throttle: f64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// A decoded simulator packet.
#[derive(Debug, Clone, PartialEq)]
pub enum SimMessage {
    /// The client connected
    Connect,

    /// The client is disconnecting
    Disconnect,

    /// A telemetry record
    Telemetry(Telemetry),

    /// A steering command
    Steer(SteerCmd),

    /// Manual driving, either a telemetry event without data or the manual reply
    Manual,

    /// An event this interface doesn't handle, with its name
    Other(String),
}

/// Errors which can occur while decoding a packet.
#[derive(Debug, thiserror::Error)]
pub enum SimDecodeError {
    #[error("The packet is not a recognised simulator packet: {0:?}")]
    UnknownPacket(String),

    #[error("The event packet contains invalid JSON: {0}")]
    InvalidJson(serde_json::Error),

    #[error("The event packet does not start with an event name")]
    MissingEventName,

    #[error("The {0} event has an invalid record: {1}")]
    InvalidRecord(String, serde_json::Error),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl SimMessage {
    /// Decode a packet received from the network.
    pub fn decode(packet: &str) -> Result<Self, SimDecodeError> {
        let packet = packet.trim();

        if packet.starts_with(CONNECT_PREFIX) {
            return Ok(SimMessage::Connect);
        }
        if packet.starts_with(DISCONNECT_PREFIX) {
            return Ok(SimMessage::Disconnect);
        }
        if !packet.starts_with(EVENT_PREFIX) {
            return Err(SimDecodeError::UnknownPacket(packet.into()));
        }

        // An event which carries no data is treated as manual driving
        let body = match event_body(packet) {
            Some(b) => b,
            None => return Ok(SimMessage::Manual),
        };

        let val: Value = serde_json::from_str(body).map_err(SimDecodeError::InvalidJson)?;

        let event = val
            .get(0)
            .and_then(Value::as_str)
            .ok_or(SimDecodeError::MissingEventName)?;
        let data = val.get(1).cloned().unwrap_or(Value::Null);

        match event {
            TELEMETRY_EVENT => serde_json::from_value(data)
                .map(SimMessage::Telemetry)
                .map_err(|e| SimDecodeError::InvalidRecord(event.into(), e)),
            STEER_EVENT => serde_json::from_value(data)
                .map(SimMessage::Steer)
                .map_err(|e| SimDecodeError::InvalidRecord(event.into(), e)),
            MANUAL_EVENT => Ok(SimMessage::Manual),
            other => Ok(SimMessage::Other(other.into())),
        }
    }

    /// Encode this message into a packet which can be sent over the network.
    pub fn encode(&self) -> String {
        match self {
            SimMessage::Connect => CONNECT_PREFIX.into(),
            SimMessage::Disconnect => DISCONNECT_PREFIX.into(),
            SimMessage::Telemetry(t) => event_packet(
                TELEMETRY_EVENT,
                json!({
                    "cte": t.cte.to_string(),
                    "speed": t.speed.to_string(),
                    "steering_angle": t.steering_angle.to_string(),
                }),
            ),
            SimMessage::Steer(cmd) => event_packet(STEER_EVENT, json!(cmd)),
            SimMessage::Manual => event_packet(MANUAL_EVENT, json!({})),
            SimMessage::Other(name) => event_packet(name, json!({})),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Get the JSON array out of an event packet.
///
/// Returns `None` if the packet carries no data, i.e. it contains `null` or has no array.
fn event_body(packet: &str) -> Option<&str> {
    if packet.contains("null") {
        return None;
    }

    let start = packet.find('[')?;
    let end = packet.rfind(']')?;

    if end < start {
        return None;
    }

    Some(&packet[start..=end])
}

fn event_packet(event: &str, data: Value) -> String {
    format!("{}{}", EVENT_PREFIX, json!([event, data]))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrStr {
    Num(f64),
    Str(String),
}

fn de_num_or_str<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| de::Error::custom(format!("{:?} is not a number: {}", s, e))),
    }
}
