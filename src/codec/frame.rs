//! Step payload: one simulation step's images and metadata.
//!
//! # Layout
//!
//! All integers are little-endian.
//!
//! ```text
//! [u32 header_len]
//! header (header_len bytes):
//!   [u64 sequence] [u8 success] [u32 error_len] [error: utf-8]
//!   [u8 channel_count]
//!   channel_count × [u8 modality] [u8 format] [u32 width] [u32 height] [u32 byte_len]
//!   [u32 metadata_len]
//! body:
//!   image bytes, one section per channel in declared order
//!   metadata: metadata_len bytes of JSON (empty = all defaults)
//! ```
//!
//! The body must be exactly as long as the header declares. Raw pixel
//! formats must also match `width × height × bytes_per_pixel`.

use std::collections::BTreeMap;
use std::fmt;

use image::{DynamicImage, GenericImageView, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};

use super::wire::{encode_envelope, frame_type, Cursor};
use crate::action::Vec3;
use crate::error::{BridgeError, Result};

/// Which rendered view an image channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Modality {
    /// RGB camera view.
    Color,
    /// Per-pixel distance from the camera.
    Depth,
    /// Per-object instance ids.
    InstanceSegmentation,
    /// Per-class semantic masks.
    ClassSegmentation,
}

impl Modality {
    /// Wire tag.
    pub fn tag(self) -> u8 {
        match self {
            Self::Color => 0,
            Self::Depth => 1,
            Self::InstanceSegmentation => 2,
            Self::ClassSegmentation => 3,
        }
    }

    /// Looks a modality up by wire tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Color),
            1 => Some(Self::Depth),
            2 => Some(Self::InstanceSegmentation),
            3 => Some(Self::ClassSegmentation),
            _ => None,
        }
    }

    /// Modality name used as the channel key.
    pub fn name(self) -> &'static str {
        match self {
            Self::Color => "color",
            Self::Depth => "depth",
            Self::InstanceSegmentation => "instance_segmentation",
            Self::ClassSegmentation => "class_segmentation",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Encoding of an image channel, always taken from the header tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 8-bit RGB.
    Rgb8,
    /// Packed 8-bit RGBA.
    Rgba8,
    /// Little-endian `f32` per pixel.
    DepthF32,
    /// PNG file bytes.
    Png,
    /// JPEG file bytes.
    Jpeg,
}

impl PixelFormat {
    /// Wire tag.
    pub fn tag(self) -> u8 {
        match self {
            Self::Rgb8 => 0,
            Self::Rgba8 => 1,
            Self::DepthF32 => 2,
            Self::Png => 3,
            Self::Jpeg => 4,
        }
    }

    /// Looks a format up by wire tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Rgb8),
            1 => Some(Self::Rgba8),
            2 => Some(Self::DepthF32),
            3 => Some(Self::Png),
            4 => Some(Self::Jpeg),
            _ => None,
        }
    }

    /// Bytes per pixel for raw formats, `None` for compressed ones.
    pub fn bytes_per_pixel(self) -> Option<u64> {
        match self {
            Self::Rgb8 => Some(3),
            Self::Rgba8 | Self::DepthF32 => Some(4),
            Self::Png | Self::Jpeg => None,
        }
    }
}

/// One image channel of a frame.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageChannel {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Encoding of `data`.
    pub format: PixelFormat,
    /// Raw section bytes.
    pub data: Vec<u8>,
}

impl fmt::Debug for ImageChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageChannel")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Agent pose reported by the simulator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentPose {
    /// World position.
    pub position: Vec3,
    /// Euler rotation in degrees.
    pub rotation: Vec3,
    /// Camera pitch in degrees.
    pub camera_horizon: f32,
    /// Standing vs. crouching.
    pub is_standing: bool,
}

/// State of one scene object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectState {
    /// Unique object id, e.g. `Apple|+1.0|+0.9|-0.3`.
    pub object_id: String,
    /// Object class.
    pub object_type: String,
    /// World position.
    pub position: Vec3,
    /// Visible from the agent camera.
    pub visible: bool,
    /// Can be picked up.
    pub pickupable: bool,
    /// Currently held.
    pub is_picked_up: bool,
}

/// Arm state, present for arm agents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArmState {
    /// Ids of objects held by the magnet.
    pub held_objects: Vec<String>,
    /// Magnet sphere centre in world space.
    pub hand_sphere_center: Vec3,
    /// Magnet sphere radius.
    pub hand_sphere_radius: f32,
}

/// Structured metadata section of a frame.
///
/// Keys this crate does not model are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FrameMetadata {
    /// Agent pose after the action.
    pub agent: AgentPose,
    /// Object states.
    pub objects: Vec<ObjectState>,
    /// The last action collided.
    pub collided: bool,
    /// Ids of objects involved in the collision.
    pub collided_objects: Vec<String>,
    /// Wire name of the action this frame answers.
    pub last_action: String,
    /// Simulator-reported success of that action.
    pub last_action_success: bool,
    /// Loaded scene.
    pub scene_name: String,
    /// Arm state, if the agent has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arm: Option<ArmState>,
    /// Unmodelled keys.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One decoded simulation step.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Step counter; 0 for the handshake and for a successful reset.
    pub sequence: u64,
    /// Simulator-reported success of the action.
    pub success: bool,
    /// Simulator error, empty on success.
    pub error: String,
    /// Image channels keyed by modality.
    pub images: BTreeMap<Modality, ImageChannel>,
    /// Metadata record.
    pub metadata: FrameMetadata,
}

impl Frame {
    /// Returns the raw channel for `modality`, if present.
    pub fn image(&self, modality: Modality) -> Option<&ImageChannel> {
        self.images.get(&modality)
    }

    /// Decodes a channel into a pixel image.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::MalformedFrame`] if the channel is absent,
    /// is a depth map (see [`Frame::depth_values`]), or its bytes do not
    /// decode to the declared dimensions.
    pub fn decode_image(&self, modality: Modality) -> Result<DynamicImage> {
        let channel = self
            .image(modality)
            .ok_or_else(|| BridgeError::malformed(format!("frame has no {modality} channel")))?;
        let (w, h) = (channel.width, channel.height);
        let image = match channel.format {
            PixelFormat::Rgb8 => RgbImage::from_raw(w, h, channel.data.clone())
                .map(DynamicImage::ImageRgb8),
            PixelFormat::Rgba8 => RgbaImage::from_raw(w, h, channel.data.clone())
                .map(DynamicImage::ImageRgba8),
            PixelFormat::DepthF32 => {
                return Err(BridgeError::malformed(format!(
                    "{modality} channel holds depth values, not pixels"
                )));
            }
            PixelFormat::Png | PixelFormat::Jpeg => {
                let format = if channel.format == PixelFormat::Png {
                    image::ImageFormat::Png
                } else {
                    image::ImageFormat::Jpeg
                };
                let decoded = image::load_from_memory_with_format(&channel.data, format)
                    .map_err(|e| BridgeError::malformed(format!("{modality} image: {e}")))?;
                if decoded.dimensions() != (w, h) {
                    return Err(BridgeError::malformed(format!(
                        "{modality} image is {:?}, header declares {w}x{h}",
                        decoded.dimensions()
                    )));
                }
                Some(decoded)
            }
        };
        image.ok_or_else(|| BridgeError::malformed(format!("{modality} buffer does not fit {w}x{h}")))
    }

    /// Depth map in meters, row-major, if the frame carries one.
    pub fn depth_values(&self) -> Option<Vec<f32>> {
        let channel = self.image(Modality::Depth)?;
        if channel.format != PixelFormat::DepthF32 {
            return None;
        }
        Some(
            channel
                .data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        )
    }

    /// Encodes the step payload (without envelope).
    ///
    /// # Errors
    ///
    /// Fails only if the metadata cannot be serialized.
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let metadata = serde_json::to_vec(&self.metadata).map_err(|e| BridgeError::Io(e.into()))?;

        let mut header = Vec::with_capacity(32 + self.error.len() + 17 * self.images.len());
        header.extend_from_slice(&self.sequence.to_le_bytes());
        header.push(u8::from(self.success));
        header.extend_from_slice(&(self.error.len() as u32).to_le_bytes());
        header.extend_from_slice(self.error.as_bytes());
        header.push(self.images.len() as u8); // at most one per modality
        for (modality, channel) in &self.images {
            header.push(modality.tag());
            header.push(channel.format.tag());
            header.extend_from_slice(&channel.width.to_le_bytes());
            header.extend_from_slice(&channel.height.to_le_bytes());
            header.extend_from_slice(&(channel.data.len() as u32).to_le_bytes());
        }
        header.extend_from_slice(&(metadata.len() as u32).to_le_bytes());

        let body_len: usize = self.images.values().map(|c| c.data.len()).sum();
        let mut buf = Vec::with_capacity(4 + header.len() + body_len + metadata.len());
        buf.extend_from_slice(&(header.len() as u32).to_le_bytes());
        buf.extend_from_slice(&header);
        for channel in self.images.values() {
            buf.extend_from_slice(&channel.data);
        }
        buf.extend_from_slice(&metadata);
        Ok(buf)
    }

    /// Encodes this frame as a complete step envelope.
    ///
    /// # Errors
    ///
    /// Fails only if the metadata cannot be serialized.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(encode_envelope(frame_type::STEP, &self.encode_payload()?))
    }
}

struct ChannelHeader {
    modality: Modality,
    format: PixelFormat,
    width: u32,
    height: u32,
    byte_len: usize,
}

/// Decodes a step payload into a [`Frame`].
///
/// Nothing is returned unless every section is consistent with the header.
///
/// # Errors
///
/// Returns [`BridgeError::MalformedFrame`] on any short or over-long
/// section, unknown tag, duplicate modality, raw size mismatch, invalid
/// UTF-8 error string, or unparseable metadata.
pub fn decode_frame(payload: &[u8]) -> Result<Frame> {
    let mut outer = Cursor::new(payload);
    let header_len = outer.u32("header length")? as usize;
    let mut h = Cursor::new(outer.take(header_len, "header")?);

    let sequence = h.u64("sequence")?;
    let success = match h.u8("success flag")? {
        0 => false,
        1 => true,
        other => return Err(BridgeError::malformed(format!("success flag is {other}"))),
    };
    let error_len = h.u32("error length")? as usize;
    let error = std::str::from_utf8(h.take(error_len, "error string")?)
        .map_err(|e| BridgeError::malformed(format!("error string: {e}")))?
        .to_string();

    let count = h.u8("channel count")?;
    let mut channels: Vec<ChannelHeader> = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let tag = h.u8("modality")?;
        let modality = Modality::from_tag(tag)
            .ok_or_else(|| BridgeError::malformed(format!("unknown modality tag {tag}")))?;
        let tag = h.u8("format")?;
        let format = PixelFormat::from_tag(tag)
            .ok_or_else(|| BridgeError::malformed(format!("unknown format tag {tag}")))?;
        let width = h.u32("width")?;
        let height = h.u32("height")?;
        let byte_len = h.u32("byte length")?;

        if channels.iter().any(|c| c.modality == modality) {
            return Err(BridgeError::malformed(format!("duplicate {modality} channel")));
        }
        if let Some(bpp) = format.bytes_per_pixel() {
            let expected = u64::from(width) * u64::from(height) * bpp;
            if expected != u64::from(byte_len) {
                return Err(BridgeError::malformed(format!(
                    "{modality} declares {byte_len} bytes for {width}x{height} {format:?}, expected {expected}"
                )));
            }
        }
        channels.push(ChannelHeader {
            modality,
            format,
            width,
            height,
            byte_len: byte_len as usize,
        });
    }
    let metadata_len = h.u32("metadata length")? as usize;
    if h.remaining() != 0 {
        return Err(BridgeError::malformed(format!(
            "{} unparsed header bytes",
            h.remaining()
        )));
    }

    let mut images = BTreeMap::new();
    for c in channels {
        let data = outer.take(c.byte_len, c.modality.name())?;
        images.insert(
            c.modality,
            ImageChannel {
                width: c.width,
                height: c.height,
                format: c.format,
                data: data.to_vec(),
            },
        );
    }
    let metadata_bytes = outer.take(metadata_len, "metadata")?;
    if outer.remaining() != 0 {
        return Err(BridgeError::malformed(format!(
            "{} trailing bytes after metadata",
            outer.remaining()
        )));
    }
    let metadata = if metadata_bytes.is_empty() {
        FrameMetadata::default()
    } else {
        serde_json::from_slice(metadata_bytes)
            .map_err(|e| BridgeError::malformed(format!("metadata: {e}")))?
    };

    if success && !images.contains_key(&Modality::Color) {
        return Err(BridgeError::malformed("successful frame has no color channel"));
    }

    Ok(Frame {
        sequence,
        success,
        error,
        images,
        metadata,
    })
}
