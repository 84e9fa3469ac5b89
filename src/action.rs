//! Typed simulator actions and their parameter contracts.
//!
//! Every command the controller can send is a variant of [`Action`]; the
//! fields a variant carries are its parameters, so a required parameter can
//! never be forgotten at compile time. What the type system cannot express
//! (finite numbers, positive speeds, "ahead or right") is checked by
//! [`Action::validate`], which is pure and runs before anything touches the
//! transport.
//!
//! Actions can also be built from a dynamic name + parameter map with
//! [`Action::from_params`]. That path rejects unknown actions, unknown
//! parameters, missing required parameters and wrongly-typed values, using
//! the per-kind [`ParamSpec`] tables returned by [`ActionKind::spec`].
//!
//! # Wire form
//!
//! [`Action::params`] yields the canonical parameter map: a `BTreeMap`, so
//! keys are always emitted in the same order and identical actions encode to
//! identical bytes. Optional parameters with a fixed default are always
//! present; parameters whose default is session-dependent (`moveMagnitude`
//! falls back to the grid size) are omitted when unset.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// A point or offset in simulator space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    /// X component.
    pub x: f32,
    /// Y component.
    pub y: f32,
    /// Z component.
    pub z: f32,
}

impl Vec3 {
    /// The origin.
    pub const ZERO: Self = Self { x: 0.0, y: 0.0, z: 0.0 };

    /// Creates a vector from its components.
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Reference frame for arm targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CoordinateSpace {
    /// World coordinates.
    World,
    /// Relative to the arm base (default).
    #[default]
    ArmBase,
    /// Relative to the wrist.
    Wrist,
}

impl CoordinateSpace {
    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::World => "world",
            Self::ArmBase => "armBase",
            Self::Wrist => "wrist",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "world" => Some(Self::World),
            "armBase" => Some(Self::ArmBase),
            "wrist" => Some(Self::Wrist),
            _ => None,
        }
    }
}

/// Movement options shared by agent, base and wrist motions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Motion {
    /// Units (or radians) per second.
    pub speed: f32,
    /// Roll back to the starting pose if the motion collides.
    pub return_to_start: bool,
}

impl Default for Motion {
    fn default() -> Self {
        Self {
            speed: 1.0,
            return_to_start: true,
        }
    }
}

/// Movement options for arm targets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArmMotion {
    /// Units per second.
    pub speed: f32,
    /// Roll back to the starting pose if the motion collides.
    pub return_to_start: bool,
    /// Frame the target is expressed in.
    pub coordinate_space: CoordinateSpace,
    /// Clamp the target to the arm's reachable volume.
    pub restrict_movement: bool,
}

impl Default for ArmMotion {
    fn default() -> Self {
        Self {
            speed: 1.0,
            return_to_start: true,
            coordinate_space: CoordinateSpace::ArmBase,
            restrict_movement: false,
        }
    }
}

/// A dynamically-typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Boolean flag.
    Bool(bool),
    /// Numeric value.
    Number(f32),
    /// String value.
    Text(String),
    /// Three-component vector.
    Vector(Vec3),
    /// List of strings.
    List(Vec<String>),
}

impl ParamValue {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Number(_) => "float",
            Self::Text(_) => "string",
            Self::Vector(_) => "vec3",
            Self::List(_) => "string list",
        }
    }
}

/// Declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// `ParamValue::Number`.
    Float,
    /// `ParamValue::Bool`.
    Bool,
    /// `ParamValue::Text`.
    Text,
    /// `ParamValue::Vector`.
    Vector,
    /// `ParamValue::List`.
    TextList,
    /// `ParamValue::Text` naming a [`CoordinateSpace`].
    Space,
}

impl ParamType {
    fn accepts(self, value: &ParamValue) -> bool {
        match (self, value) {
            (Self::Float, ParamValue::Number(_))
            | (Self::Bool, ParamValue::Bool(_))
            | (Self::Text, ParamValue::Text(_))
            | (Self::Vector, ParamValue::Vector(_))
            | (Self::TextList, ParamValue::List(_)) => true,
            (Self::Space, ParamValue::Text(s)) => CoordinateSpace::parse(s).is_some(),
            _ => false,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Text => "string",
            Self::Vector => "vec3",
            Self::TextList => "string list",
            Self::Space => "one of world|armBase|wrist",
        };
        f.write_str(name)
    }
}

/// Default of an optional parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamDefault {
    /// Fixed boolean.
    Bool(bool),
    /// Fixed number.
    Number(f32),
    /// Fixed string.
    Text(&'static str),
    /// Left unset; the simulator resolves it (e.g. from the grid size).
    Simulator(&'static str),
}

impl ParamDefault {
    /// The value filled in when the parameter is absent, `None` if the
    /// simulator decides.
    pub fn value(self) -> Option<ParamValue> {
        match self {
            Self::Bool(b) => Some(ParamValue::Bool(b)),
            Self::Number(n) => Some(ParamValue::Number(n)),
            Self::Text(s) => Some(ParamValue::Text(s.to_string())),
            Self::Simulator(_) => None,
        }
    }
}

impl fmt::Display for ParamDefault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) | Self::Simulator(s) => f.write_str(s),
        }
    }
}

/// Declaration of one parameter of an action kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSpec {
    /// Wire name.
    pub name: &'static str,
    /// Expected value type.
    pub ty: ParamType,
    /// Whether the parameter must be supplied.
    pub required: bool,
    /// Default for optional parameters.
    pub default: Option<ParamDefault>,
    /// Failure message fragment, rendered as `'<name>' <hint>`.
    pub hint: &'static str,
}

impl ParamSpec {
    /// Renders the validation problem for this parameter.
    pub fn problem(&self) -> String {
        format!("'{}' {}", self.name, self.hint)
    }
}

const fn required(name: &'static str, ty: ParamType, hint: &'static str) -> ParamSpec {
    ParamSpec { name, ty, required: true, default: None, hint }
}

const fn optional(
    name: &'static str,
    ty: ParamType,
    default: ParamDefault,
    hint: &'static str,
) -> ParamSpec {
    ParamSpec { name, ty, required: false, default: Some(default), hint }
}

const POSITIVE: &str = "must be a positive number";
const FINITE: &str = "must be a finite number";
const FINITE_VEC3: &str = "must be a finite vec3";
const SPEED: ParamSpec = optional("speed", ParamType::Float, ParamDefault::Number(1.0), POSITIVE);
const RETURN_TO_START: ParamSpec =
    optional("returnToStart", ParamType::Bool, ParamDefault::Bool(true), "must be a bool");

const INITIALIZE_PARAMS: &[ParamSpec] = &[
    optional(
        "gridSize",
        ParamType::Float,
        ParamDefault::Number(crate::constants::DEFAULT_GRID_SIZE),
        POSITIVE,
    ),
    optional(
        "rotateStepDegrees",
        ParamType::Float,
        ParamDefault::Number(crate::constants::DEFAULT_ROTATE_STEP_DEGREES),
        POSITIVE,
    ),
    optional("renderDepthImage", ParamType::Bool, ParamDefault::Bool(false), "must be a bool"),
    optional(
        "renderInstanceSegmentation",
        ParamType::Bool,
        ParamDefault::Bool(false),
        "must be a bool",
    ),
    optional(
        "renderSemanticSegmentation",
        ParamType::Bool,
        ParamDefault::Bool(false),
        "must be a bool",
    ),
];
const RESET_PARAMS: &[ParamSpec] = &[required("scene", ParamType::Text, "must name a scene")];
const MOVE_PARAMS: &[ParamSpec] = &[
    optional("moveMagnitude", ParamType::Float, ParamDefault::Simulator("gridSize"), POSITIVE),
    SPEED,
    RETURN_TO_START,
];
const ROTATE_PARAMS: &[ParamSpec] = &[
    optional("degrees", ParamType::Float, ParamDefault::Simulator("rotateStepDegrees"), FINITE),
    SPEED,
    RETURN_TO_START,
];
const ROTATE_AGENT_PARAMS: &[ParamSpec] = &[
    required("degrees", ParamType::Float, FINITE),
    SPEED,
    RETURN_TO_START,
];
const MOVE_AGENT_PARAMS: &[ParamSpec] = &[
    optional(
        "ahead",
        ParamType::Float,
        ParamDefault::Number(0.0),
        "Must specify ahead or right!",
    ),
    optional("right", ParamType::Float, ParamDefault::Number(0.0), FINITE),
    SPEED,
    RETURN_TO_START,
];
const ARM_TARGET_TAIL: [ParamSpec; 4] = [
    SPEED,
    RETURN_TO_START,
    optional(
        "coordinateSpace",
        ParamType::Space,
        ParamDefault::Text("armBase"),
        "must be world, armBase or wrist",
    ),
    optional("restrictMovement", ParamType::Bool, ParamDefault::Bool(false), "must be a bool"),
];
const MOVE_ARM_PARAMS: &[ParamSpec] = &[
    required("position", ParamType::Vector, FINITE_VEC3),
    ARM_TARGET_TAIL[0],
    ARM_TARGET_TAIL[1],
    ARM_TARGET_TAIL[2],
    ARM_TARGET_TAIL[3],
];
const MOVE_ARM_RELATIVE_PARAMS: &[ParamSpec] = &[
    required("offset", ParamType::Vector, FINITE_VEC3),
    ARM_TARGET_TAIL[0],
    ARM_TARGET_TAIL[1],
    ARM_TARGET_TAIL[2],
    ARM_TARGET_TAIL[3],
];
const MOVE_ARM_BASE_PARAMS: &[ParamSpec] = &[
    required("y", ParamType::Float, "must be within [0, 1]"),
    SPEED,
    RETURN_TO_START,
];
const MOVE_ARM_BASE_STEP_PARAMS: &[ParamSpec] = &[
    required("distance", ParamType::Float, POSITIVE),
    SPEED,
    RETURN_TO_START,
];
const ROTATE_WRIST_PARAMS: &[ParamSpec] = &[
    optional("pitch", ParamType::Float, ParamDefault::Number(0.0), FINITE),
    optional("yaw", ParamType::Float, ParamDefault::Number(0.0), FINITE),
    optional("roll", ParamType::Float, ParamDefault::Number(0.0), FINITE),
    SPEED,
    RETURN_TO_START,
];
const PICKUP_PARAMS: &[ParamSpec] = &[optional(
    "objectIdCandidates",
    ParamType::TextList,
    ParamDefault::Simulator("any object in the magnet sphere"),
    "must list non-empty object ids",
)];
const HAND_SPHERE_PARAMS: &[ParamSpec] =
    &[required("radius", ParamType::Float, "must be within [0.04, 0.5]")];
const MAGNET_PARAMS: &[ParamSpec] = &[optional(
    "visible",
    ParamType::Bool,
    ParamDefault::Simulator("toggle"),
    "must be a bool",
)];

/// Every action kind the simulator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActionKind {
    /// Configure grid size, rotation step and render modalities.
    Initialize,
    /// Load a scene and restart the sequence counter.
    Reset,
    /// Step forward.
    MoveAhead,
    /// Step backward.
    MoveBack,
    /// Strafe left.
    MoveLeft,
    /// Strafe right.
    MoveRight,
    /// Turn counter-clockwise.
    RotateLeft,
    /// Turn clockwise.
    RotateRight,
    /// Turn by an explicit angle.
    RotateAgent,
    /// Move by an explicit ahead/right offset.
    MoveAgent,
    /// Move the hand to a target.
    MoveArm,
    /// Move the hand by an offset.
    MoveArmRelative,
    /// Set the arm base height.
    MoveArmBase,
    /// Raise the arm base.
    MoveArmBaseUp,
    /// Lower the arm base.
    MoveArmBaseDown,
    /// Rotate the wrist.
    RotateWristRelative,
    /// Grab an object with the magnet.
    PickupObject,
    /// Drop held objects.
    ReleaseObject,
    /// Resize the magnet sphere.
    SetHandSphereRadius,
    /// Show or hide the magnet sphere.
    ToggleMagnetVisibility,
    /// Report arm collisions.
    GetMidLevelArmCollisions,
    /// Advance one step without acting.
    Pass,
}

impl ActionKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 22] = [
        Self::Initialize,
        Self::Reset,
        Self::MoveAhead,
        Self::MoveBack,
        Self::MoveLeft,
        Self::MoveRight,
        Self::RotateLeft,
        Self::RotateRight,
        Self::RotateAgent,
        Self::MoveAgent,
        Self::MoveArm,
        Self::MoveArmRelative,
        Self::MoveArmBase,
        Self::MoveArmBaseUp,
        Self::MoveArmBaseDown,
        Self::RotateWristRelative,
        Self::PickupObject,
        Self::ReleaseObject,
        Self::SetHandSphereRadius,
        Self::ToggleMagnetVisibility,
        Self::GetMidLevelArmCollisions,
        Self::Pass,
    ];

    /// Wire name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Initialize => "Initialize",
            Self::Reset => "Reset",
            Self::MoveAhead => "MoveAhead",
            Self::MoveBack => "MoveBack",
            Self::MoveLeft => "MoveLeft",
            Self::MoveRight => "MoveRight",
            Self::RotateLeft => "RotateLeft",
            Self::RotateRight => "RotateRight",
            Self::RotateAgent => "RotateAgent",
            Self::MoveAgent => "MoveAgent",
            Self::MoveArm => "MoveArm",
            Self::MoveArmRelative => "MoveArmRelative",
            Self::MoveArmBase => "MoveArmBase",
            Self::MoveArmBaseUp => "MoveArmBaseUp",
            Self::MoveArmBaseDown => "MoveArmBaseDown",
            Self::RotateWristRelative => "RotateWristRelative",
            Self::PickupObject => "PickupObject",
            Self::ReleaseObject => "ReleaseObject",
            Self::SetHandSphereRadius => "SetHandSphereRadius",
            Self::ToggleMagnetVisibility => "ToggleMagnetVisibility",
            Self::GetMidLevelArmCollisions => "GetMidLevelArmCollisions",
            Self::Pass => "Pass",
        }
    }

    /// Looks a kind up by wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Declared parameters of this kind.
    pub fn spec(self) -> &'static [ParamSpec] {
        match self {
            Self::Initialize => INITIALIZE_PARAMS,
            Self::Reset => RESET_PARAMS,
            Self::MoveAhead | Self::MoveBack | Self::MoveLeft | Self::MoveRight => MOVE_PARAMS,
            Self::RotateLeft | Self::RotateRight => ROTATE_PARAMS,
            Self::RotateAgent => ROTATE_AGENT_PARAMS,
            Self::MoveAgent => MOVE_AGENT_PARAMS,
            Self::MoveArm => MOVE_ARM_PARAMS,
            Self::MoveArmRelative => MOVE_ARM_RELATIVE_PARAMS,
            Self::MoveArmBase => MOVE_ARM_BASE_PARAMS,
            Self::MoveArmBaseUp | Self::MoveArmBaseDown => MOVE_ARM_BASE_STEP_PARAMS,
            Self::RotateWristRelative => ROTATE_WRIST_PARAMS,
            Self::PickupObject => PICKUP_PARAMS,
            Self::SetHandSphereRadius => HAND_SPHERE_PARAMS,
            Self::ToggleMagnetVisibility => MAGNET_PARAMS,
            Self::ReleaseObject | Self::GetMidLevelArmCollisions | Self::Pass => &[],
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One outgoing simulator command.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Configure grid size, rotation step and render modalities.
    Initialize {
        /// Translation step in meters.
        grid_size: f32,
        /// Rotation step in degrees.
        rotate_step_degrees: f32,
        /// Render depth maps.
        render_depth: bool,
        /// Render instance segmentation.
        render_instance_segmentation: bool,
        /// Render semantic class masks.
        render_class_masks: bool,
    },
    /// Load a scene; the reply restarts the sequence counter at 0.
    Reset {
        /// Scene identifier.
        scene: String,
    },
    /// Step forward.
    MoveAhead {
        /// Distance in meters (grid size when unset).
        magnitude: Option<f32>,
        /// Motion options.
        motion: Motion,
    },
    /// Step backward.
    MoveBack {
        /// Distance in meters (grid size when unset).
        magnitude: Option<f32>,
        /// Motion options.
        motion: Motion,
    },
    /// Strafe left.
    MoveLeft {
        /// Distance in meters (grid size when unset).
        magnitude: Option<f32>,
        /// Motion options.
        motion: Motion,
    },
    /// Strafe right.
    MoveRight {
        /// Distance in meters (grid size when unset).
        magnitude: Option<f32>,
        /// Motion options.
        motion: Motion,
    },
    /// Turn counter-clockwise.
    RotateLeft {
        /// Angle in degrees (rotation step when unset).
        degrees: Option<f32>,
        /// Motion options.
        motion: Motion,
    },
    /// Turn clockwise.
    RotateRight {
        /// Angle in degrees (rotation step when unset).
        degrees: Option<f32>,
        /// Motion options.
        motion: Motion,
    },
    /// Turn by an explicit signed angle.
    RotateAgent {
        /// Angle in degrees, positive is clockwise.
        degrees: f32,
        /// Motion options.
        motion: Motion,
    },
    /// Move by an explicit offset in the agent's frame.
    MoveAgent {
        /// Forward component in meters.
        ahead: f32,
        /// Rightward component in meters.
        right: f32,
        /// Motion options.
        motion: Motion,
    },
    /// Move the hand to a target.
    MoveArm {
        /// Target position.
        position: Vec3,
        /// Arm motion options.
        arm: ArmMotion,
    },
    /// Move the hand by an offset.
    MoveArmRelative {
        /// Offset from the current hand position.
        offset: Vec3,
        /// Arm motion options.
        arm: ArmMotion,
    },
    /// Set the arm base height, normalized to `[0, 1]`.
    MoveArmBase {
        /// Normalized height.
        y: f32,
        /// Motion options.
        motion: Motion,
    },
    /// Raise the arm base.
    MoveArmBaseUp {
        /// Distance in meters.
        distance: f32,
        /// Motion options.
        motion: Motion,
    },
    /// Lower the arm base.
    MoveArmBaseDown {
        /// Distance in meters.
        distance: f32,
        /// Motion options.
        motion: Motion,
    },
    /// Rotate the wrist by relative angles.
    RotateWristRelative {
        /// Pitch in degrees.
        pitch: f32,
        /// Yaw in degrees.
        yaw: f32,
        /// Roll in degrees.
        roll: f32,
        /// Motion options.
        motion: Motion,
    },
    /// Grab an object with the magnet.
    PickupObject {
        /// Restrict the pickup to these object ids.
        object_id_candidates: Option<Vec<String>>,
    },
    /// Drop held objects.
    ReleaseObject,
    /// Resize the magnet sphere.
    SetHandSphereRadius {
        /// Radius in meters.
        radius: f32,
    },
    /// Show or hide the magnet sphere.
    ToggleMagnetVisibility {
        /// Explicit visibility, toggles when unset.
        visible: Option<bool>,
    },
    /// Report arm collisions.
    GetMidLevelArmCollisions,
    /// Advance one step without acting.
    Pass,
}

impl Action {
    /// `Reset` to the given scene.
    pub fn reset(scene: impl Into<String>) -> Self {
        Self::Reset { scene: scene.into() }
    }

    /// `MoveAhead` by `magnitude` meters with default motion.
    pub fn move_ahead(magnitude: f32) -> Self {
        Self::MoveAhead {
            magnitude: Some(magnitude),
            motion: Motion::default(),
        }
    }

    /// `RotateRight` by the session's rotation step.
    pub fn rotate_right() -> Self {
        Self::RotateRight {
            degrees: None,
            motion: Motion::default(),
        }
    }

    /// The kind of this action.
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Initialize { .. } => ActionKind::Initialize,
            Self::Reset { .. } => ActionKind::Reset,
            Self::MoveAhead { .. } => ActionKind::MoveAhead,
            Self::MoveBack { .. } => ActionKind::MoveBack,
            Self::MoveLeft { .. } => ActionKind::MoveLeft,
            Self::MoveRight { .. } => ActionKind::MoveRight,
            Self::RotateLeft { .. } => ActionKind::RotateLeft,
            Self::RotateRight { .. } => ActionKind::RotateRight,
            Self::RotateAgent { .. } => ActionKind::RotateAgent,
            Self::MoveAgent { .. } => ActionKind::MoveAgent,
            Self::MoveArm { .. } => ActionKind::MoveArm,
            Self::MoveArmRelative { .. } => ActionKind::MoveArmRelative,
            Self::MoveArmBase { .. } => ActionKind::MoveArmBase,
            Self::MoveArmBaseUp { .. } => ActionKind::MoveArmBaseUp,
            Self::MoveArmBaseDown { .. } => ActionKind::MoveArmBaseDown,
            Self::RotateWristRelative { .. } => ActionKind::RotateWristRelative,
            Self::PickupObject { .. } => ActionKind::PickupObject,
            Self::ReleaseObject => ActionKind::ReleaseObject,
            Self::SetHandSphereRadius { .. } => ActionKind::SetHandSphereRadius,
            Self::ToggleMagnetVisibility { .. } => ActionKind::ToggleMagnetVisibility,
            Self::GetMidLevelArmCollisions => ActionKind::GetMidLevelArmCollisions,
            Self::Pass => ActionKind::Pass,
        }
    }

    /// Wire name of this action.
    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Returns `true` for [`Action::Reset`].
    pub fn is_reset(&self) -> bool {
        matches!(self, Self::Reset { .. })
    }

    /// Canonical parameter map, in stable key order.
    pub fn params(&self) -> BTreeMap<&'static str, ParamValue> {
        let mut p = BTreeMap::new();
        match self {
            Self::Initialize {
                grid_size,
                rotate_step_degrees,
                render_depth,
                render_instance_segmentation,
                render_class_masks,
            } => {
                p.insert("gridSize", ParamValue::Number(*grid_size));
                p.insert("rotateStepDegrees", ParamValue::Number(*rotate_step_degrees));
                p.insert("renderDepthImage", ParamValue::Bool(*render_depth));
                p.insert(
                    "renderInstanceSegmentation",
                    ParamValue::Bool(*render_instance_segmentation),
                );
                p.insert("renderSemanticSegmentation", ParamValue::Bool(*render_class_masks));
            }
            Self::Reset { scene } => {
                p.insert("scene", ParamValue::Text(scene.clone()));
            }
            Self::MoveAhead { magnitude, motion }
            | Self::MoveBack { magnitude, motion }
            | Self::MoveLeft { magnitude, motion }
            | Self::MoveRight { magnitude, motion } => {
                if let Some(m) = magnitude {
                    p.insert("moveMagnitude", ParamValue::Number(*m));
                }
                insert_motion(&mut p, motion);
            }
            Self::RotateLeft { degrees, motion } | Self::RotateRight { degrees, motion } => {
                if let Some(d) = degrees {
                    p.insert("degrees", ParamValue::Number(*d));
                }
                insert_motion(&mut p, motion);
            }
            Self::RotateAgent { degrees, motion } => {
                p.insert("degrees", ParamValue::Number(*degrees));
                insert_motion(&mut p, motion);
            }
            Self::MoveAgent { ahead, right, motion } => {
                p.insert("ahead", ParamValue::Number(*ahead));
                p.insert("right", ParamValue::Number(*right));
                insert_motion(&mut p, motion);
            }
            Self::MoveArm { position, arm } => {
                p.insert("position", ParamValue::Vector(*position));
                insert_arm_motion(&mut p, arm);
            }
            Self::MoveArmRelative { offset, arm } => {
                p.insert("offset", ParamValue::Vector(*offset));
                insert_arm_motion(&mut p, arm);
            }
            Self::MoveArmBase { y, motion } => {
                p.insert("y", ParamValue::Number(*y));
                insert_motion(&mut p, motion);
            }
            Self::MoveArmBaseUp { distance, motion } | Self::MoveArmBaseDown { distance, motion } => {
                p.insert("distance", ParamValue::Number(*distance));
                insert_motion(&mut p, motion);
            }
            Self::RotateWristRelative { pitch, yaw, roll, motion } => {
                p.insert("pitch", ParamValue::Number(*pitch));
                p.insert("yaw", ParamValue::Number(*yaw));
                p.insert("roll", ParamValue::Number(*roll));
                insert_motion(&mut p, motion);
            }
            Self::PickupObject { object_id_candidates } => {
                if let Some(ids) = object_id_candidates {
                    p.insert("objectIdCandidates", ParamValue::List(ids.clone()));
                }
            }
            Self::SetHandSphereRadius { radius } => {
                p.insert("radius", ParamValue::Number(*radius));
            }
            Self::ToggleMagnetVisibility { visible } => {
                if let Some(v) = visible {
                    p.insert("visible", ParamValue::Bool(*v));
                }
            }
            Self::ReleaseObject | Self::GetMidLevelArmCollisions | Self::Pass => {}
        }
        p
    }

    /// Checks parameter values without side effects.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidAction`] listing every offending
    /// parameter.
    pub fn validate(&self) -> Result<()> {
        let mut c = Checks::new(self.kind().spec());
        match self {
            Self::Initialize { grid_size, rotate_step_degrees, .. } => {
                c.positive("gridSize", *grid_size);
                c.positive("rotateStepDegrees", *rotate_step_degrees);
            }
            Self::Reset { scene } => c.check(!scene.trim().is_empty(), "scene"),
            Self::MoveAhead { magnitude, motion }
            | Self::MoveBack { magnitude, motion }
            | Self::MoveLeft { magnitude, motion }
            | Self::MoveRight { magnitude, motion } => {
                if let Some(m) = magnitude {
                    c.positive("moveMagnitude", *m);
                }
                c.motion(motion);
            }
            Self::RotateLeft { degrees, motion } | Self::RotateRight { degrees, motion } => {
                if let Some(d) = degrees {
                    c.finite("degrees", *d);
                }
                c.motion(motion);
            }
            Self::RotateAgent { degrees, motion } => {
                c.finite("degrees", *degrees);
                c.motion(motion);
            }
            Self::MoveAgent { ahead, right, motion } => {
                c.check(ahead.is_finite() && (*ahead != 0.0 || *right != 0.0), "ahead");
                c.finite("right", *right);
                c.motion(motion);
            }
            Self::MoveArm { position, arm } => {
                c.check(position.is_finite(), "position");
                c.positive("speed", arm.speed);
            }
            Self::MoveArmRelative { offset, arm } => {
                c.check(offset.is_finite(), "offset");
                c.positive("speed", arm.speed);
            }
            Self::MoveArmBase { y, motion } => {
                c.check((0.0..=1.0).contains(y), "y");
                c.motion(motion);
            }
            Self::MoveArmBaseUp { distance, motion } | Self::MoveArmBaseDown { distance, motion } => {
                c.positive("distance", *distance);
                c.motion(motion);
            }
            Self::RotateWristRelative { pitch, yaw, roll, motion } => {
                c.finite("pitch", *pitch);
                c.finite("yaw", *yaw);
                c.finite("roll", *roll);
                c.motion(motion);
            }
            Self::PickupObject { object_id_candidates: Some(ids) } => c.check(
                !ids.is_empty() && ids.iter().all(|id| !id.trim().is_empty()),
                "objectIdCandidates",
            ),
            Self::SetHandSphereRadius { radius } => c.check((0.04..=0.5).contains(radius), "radius"),
            Self::PickupObject { object_id_candidates: None }
            | Self::ReleaseObject
            | Self::ToggleMagnetVisibility { .. }
            | Self::GetMidLevelArmCollisions
            | Self::Pass => {}
        }
        c.finish(self.name())
    }

    /// Builds an action from a wire name and a dynamic parameter map.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidAction`] for an unknown action name,
    /// unknown or missing parameters, wrongly-typed values, or values that
    /// fail [`Action::validate`].
    pub fn from_params(name: &str, params: &BTreeMap<String, ParamValue>) -> Result<Self> {
        let Some(kind) = ActionKind::from_name(name) else {
            return Err(BridgeError::invalid(name, "unknown action"));
        };
        let spec = kind.spec();

        let mut problems = Vec::new();
        for key in params.keys() {
            if !spec.iter().any(|p| p.name == key) {
                problems.push(format!("unknown parameter '{key}'"));
            }
        }
        for p in spec {
            match params.get(p.name) {
                Some(value) if !p.ty.accepts(value) => problems.push(format!(
                    "parameter '{}' expects {}, got {}",
                    p.name,
                    p.ty,
                    value.type_name()
                )),
                None if p.required => {
                    problems.push(format!("missing required parameter '{}'", p.name));
                }
                _ => {}
            }
        }
        if !problems.is_empty() {
            return Err(BridgeError::InvalidAction {
                action_name: name.to_string(),
                problems,
            });
        }

        let r = Reader { params, spec };
        let action = match kind {
            ActionKind::Initialize => Self::Initialize {
                grid_size: r.float("gridSize"),
                rotate_step_degrees: r.float("rotateStepDegrees"),
                render_depth: r.flag("renderDepthImage"),
                render_instance_segmentation: r.flag("renderInstanceSegmentation"),
                render_class_masks: r.flag("renderSemanticSegmentation"),
            },
            ActionKind::Reset => Self::Reset { scene: r.text("scene") },
            ActionKind::MoveAhead => Self::MoveAhead { magnitude: r.get_float("moveMagnitude"), motion: r.motion() },
            ActionKind::MoveBack => Self::MoveBack { magnitude: r.get_float("moveMagnitude"), motion: r.motion() },
            ActionKind::MoveLeft => Self::MoveLeft { magnitude: r.get_float("moveMagnitude"), motion: r.motion() },
            ActionKind::MoveRight => Self::MoveRight { magnitude: r.get_float("moveMagnitude"), motion: r.motion() },
            ActionKind::RotateLeft => Self::RotateLeft { degrees: r.get_float("degrees"), motion: r.motion() },
            ActionKind::RotateRight => Self::RotateRight { degrees: r.get_float("degrees"), motion: r.motion() },
            ActionKind::RotateAgent => Self::RotateAgent { degrees: r.float("degrees"), motion: r.motion() },
            ActionKind::MoveAgent => Self::MoveAgent {
                ahead: r.float("ahead"),
                right: r.float("right"),
                motion: r.motion(),
            },
            ActionKind::MoveArm => Self::MoveArm { position: r.vector("position"), arm: r.arm_motion() },
            ActionKind::MoveArmRelative => Self::MoveArmRelative { offset: r.vector("offset"), arm: r.arm_motion() },
            ActionKind::MoveArmBase => Self::MoveArmBase { y: r.float("y"), motion: r.motion() },
            ActionKind::MoveArmBaseUp => Self::MoveArmBaseUp { distance: r.float("distance"), motion: r.motion() },
            ActionKind::MoveArmBaseDown => Self::MoveArmBaseDown { distance: r.float("distance"), motion: r.motion() },
            ActionKind::RotateWristRelative => Self::RotateWristRelative {
                pitch: r.float("pitch"),
                yaw: r.float("yaw"),
                roll: r.float("roll"),
                motion: r.motion(),
            },
            ActionKind::PickupObject => Self::PickupObject {
                object_id_candidates: r.get_list("objectIdCandidates"),
            },
            ActionKind::ReleaseObject => Self::ReleaseObject,
            ActionKind::SetHandSphereRadius => Self::SetHandSphereRadius { radius: r.float("radius") },
            ActionKind::ToggleMagnetVisibility => Self::ToggleMagnetVisibility { visible: r.get_flag("visible") },
            ActionKind::GetMidLevelArmCollisions => Self::GetMidLevelArmCollisions,
            ActionKind::Pass => Self::Pass,
        };
        action.validate()?;
        Ok(action)
    }
}

fn insert_motion(p: &mut BTreeMap<&'static str, ParamValue>, motion: &Motion) {
    p.insert("speed", ParamValue::Number(motion.speed));
    p.insert("returnToStart", ParamValue::Bool(motion.return_to_start));
}

fn insert_arm_motion(p: &mut BTreeMap<&'static str, ParamValue>, arm: &ArmMotion) {
    p.insert("speed", ParamValue::Number(arm.speed));
    p.insert("returnToStart", ParamValue::Bool(arm.return_to_start));
    p.insert(
        "coordinateSpace",
        ParamValue::Text(arm.coordinate_space.as_str().to_string()),
    );
    p.insert("restrictMovement", ParamValue::Bool(arm.restrict_movement));
}

/// Accumulates validation problems for one action, worded from its
/// parameter table.
struct Checks {
    spec: &'static [ParamSpec],
    problems: Vec<String>,
}

impl Checks {
    fn new(spec: &'static [ParamSpec]) -> Self {
        Self { spec, problems: Vec::new() }
    }

    fn check(&mut self, ok: bool, param: &str) {
        if ok {
            return;
        }
        let problem = match self.spec.iter().find(|p| p.name == param) {
            Some(p) => p.problem(),
            None => format!("'{param}' is invalid"),
        };
        self.problems.push(problem);
    }

    fn finite(&mut self, param: &str, value: f32) {
        self.check(value.is_finite(), param);
    }

    fn positive(&mut self, param: &str, value: f32) {
        self.check(value.is_finite() && value > 0.0, param);
    }

    fn motion(&mut self, motion: &Motion) {
        self.positive("speed", motion.speed);
    }

    fn finish(self, action_name: &str) -> Result<()> {
        if self.problems.is_empty() {
            Ok(())
        } else {
            Err(BridgeError::InvalidAction {
                action_name: action_name.to_string(),
                problems: self.problems,
            })
        }
    }
}

/// Typed lookups into an already type-checked parameter map. Absent
/// optional parameters fall back to the table default; `get_*` returns
/// `None` for parameters the simulator resolves itself.
struct Reader<'a> {
    params: &'a BTreeMap<String, ParamValue>,
    spec: &'static [ParamSpec],
}

impl Reader<'_> {
    fn value(&self, key: &str) -> Option<ParamValue> {
        if let Some(v) = self.params.get(key) {
            return Some(v.clone());
        }
        self.spec
            .iter()
            .find(|p| p.name == key)
            .and_then(|p| p.default)
            .and_then(ParamDefault::value)
    }

    fn get_float(&self, key: &str) -> Option<f32> {
        match self.value(key) {
            Some(ParamValue::Number(v)) => Some(v),
            _ => None,
        }
    }

    fn get_flag(&self, key: &str) -> Option<bool> {
        match self.value(key) {
            Some(ParamValue::Bool(v)) => Some(v),
            _ => None,
        }
    }

    fn get_list(&self, key: &str) -> Option<Vec<String>> {
        match self.value(key) {
            Some(ParamValue::List(v)) => Some(v),
            _ => None,
        }
    }

    // Required parameters are present after type checking, so the
    // zero fallbacks below are never observed.
    fn float(&self, key: &str) -> f32 {
        self.get_float(key).unwrap_or_default()
    }

    fn flag(&self, key: &str) -> bool {
        self.get_flag(key).unwrap_or_default()
    }

    fn text(&self, key: &str) -> String {
        match self.value(key) {
            Some(ParamValue::Text(v)) => v,
            _ => String::new(),
        }
    }

    fn vector(&self, key: &str) -> Vec3 {
        match self.value(key) {
            Some(ParamValue::Vector(v)) => v,
            _ => Vec3::ZERO,
        }
    }

    fn motion(&self) -> Motion {
        Motion { speed: self.float("speed"), return_to_start: self.flag("returnToStart") }
    }

    fn arm_motion(&self) -> ArmMotion {
        ArmMotion {
            speed: self.float("speed"),
            return_to_start: self.flag("returnToStart"),
            coordinate_space: CoordinateSpace::parse(&self.text("coordinateSpace")).unwrap_or_default(),
            restrict_movement: self.flag("restrictMovement"),
        }
    }
}
