//! Wire codec for actions and step frames.
//!
//! Two layers:
//! - [`wire`] / [`decoder`]: length-prefixed envelopes over a byte stream
//! - [`frame`]: the binary step payload (header, image sections, metadata)
//!
//! Actions travel as a JSON object whose keys are the canonical parameter
//! names plus `"action"`. Keys come from a `BTreeMap`, so encoding the same
//! action twice yields identical bytes.

pub mod decoder;
pub mod frame;
pub mod wire;

use std::collections::BTreeMap;

pub use decoder::EnvelopeDecoder;
pub use frame::{
    decode_frame, AgentPose, ArmState, Frame, FrameMetadata, ImageChannel, Modality, ObjectState,
    PixelFormat,
};
pub use wire::{encode_envelope, frame_type, Envelope};

use crate::action::{Action, ParamValue};
use crate::error::{BridgeError, Result};

/// Key carrying the action name inside the JSON object.
const ACTION_KEY: &str = "action";

/// Encodes an action as a complete action envelope.
///
/// # Errors
///
/// Fails only if JSON serialization fails.
pub fn encode_action(action: &Action) -> Result<Vec<u8>> {
    let mut fields = action.params();
    fields.insert(ACTION_KEY, ParamValue::Text(action.name().to_string()));
    let json = serde_json::to_vec(&fields).map_err(|e| BridgeError::Io(e.into()))?;
    Ok(encode_envelope(frame_type::ACTION, &json))
}

/// Decodes an action payload (the simulator side of [`encode_action`]).
///
/// # Errors
///
/// Returns [`BridgeError::MalformedFrame`] if the payload is not a JSON
/// object with a string `"action"` key, and [`BridgeError::InvalidAction`]
/// if the named action rejects its parameters.
pub fn decode_action(payload: &[u8]) -> Result<Action> {
    let mut fields: BTreeMap<String, ParamValue> = serde_json::from_slice(payload)
        .map_err(|e| BridgeError::malformed(format!("action payload: {e}")))?;
    let name = match fields.remove(ACTION_KEY) {
        Some(ParamValue::Text(name)) => name,
        _ => return Err(BridgeError::malformed("action payload has no action name")),
    };
    Action::from_params(&name, &fields)
}

/// Decodes a step envelope into a [`Frame`].
///
/// # Errors
///
/// Returns [`BridgeError::MalformedFrame`] if the envelope is not a step or
/// its payload is malformed.
pub fn decode_step(envelope: &Envelope) -> Result<Frame> {
    if envelope.kind != frame_type::STEP {
        return Err(BridgeError::malformed(format!(
            "expected step envelope, got type 0x{:02x}",
            envelope.kind
        )));
    }
    decode_frame(&envelope.payload)
}
