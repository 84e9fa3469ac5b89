//! Simbridge - host-side controller for an external 3D simulator.
//!
//! This crate launches a simulator binary as a child process, connects to it
//! over a private Unix socket, and drives it one action at a time. Every
//! action is answered by exactly one frame: rendered image channels plus a
//! JSON metadata document describing the agent and the scene.
//!
//! # Architecture
//!
//! - **Controller** - Session state machine, owns one process and one channel
//! - **Transport** - Socket listener, envelope I/O with timeouts and interrupts
//! - **Codec** - Length-prefixed envelopes, action JSON, binary step frames
//! - **Process** - Child spawn, liveness polling, graceful then forced stop
//! - **Action** - Typed action catalogue with local parameter validation
//!
//! # Modules
//!
//! - [`controller`] - `start` / `step` / `reset` / `stop`
//! - [`codec`] - Wire formats
//! - [`transport`] - Socket channel
//! - [`process`] - Process supervisor
//! - [`fetch`] - Locating or downloading simulator builds
//! - [`config`] - Configuration loading/saving

// Library modules
pub mod action;
pub mod codec;
pub mod controller;
pub mod fetch;
pub mod launch;
pub mod process;
pub mod transport;

pub mod config;
pub mod constants;
pub mod env;
pub mod error;

// Re-export commonly used types
pub use action::{Action, ActionKind, ArmMotion, CoordinateSpace, Motion, ParamValue, Vec3};
pub use codec::{AgentPose, Frame, FrameMetadata, ImageChannel, Modality, PixelFormat};
pub use config::{BridgeConfig, Modalities};
pub use error::{BridgeError, Result};
pub use fetch::{BinaryFetcher, HttpBinaryFetcher, LocalBinary, Platform};
pub use process::{ProcessHandle, ProcessStatus, ProcessSupervisor};
pub use transport::{Interrupter, TransportChannel};

// Re-export the controller
pub use controller::{Controller, SessionState, StopHandle};
