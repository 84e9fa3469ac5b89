//! Mock simulator - speaks the simulator side of the socket protocol.
//!
//! Accepts the launch command the controller builds, connects to the given
//! socket, sends a handshake frame and then answers every action with one
//! frame. The agent moves on a flat floor bounded by walls at
//! `±room_half_extent`; moving into a wall is reported as a failed action.
//!
//! Failure injection flags (`--crash-at`, `--hang-at`, ...) count actions
//! from 1 and trigger when that action arrives.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use simbridge::action::{Action, Vec3};
use simbridge::codec::{
    decode_action, encode_envelope, frame_type, AgentPose, ArmState, EnvelopeDecoder, Frame,
    FrameMetadata, ImageChannel, Modality, ObjectState, PixelFormat,
};

/// How long to keep retrying the initial connect.
const CONNECT_RETRY_WINDOW: Duration = Duration::from_secs(5);

/// Agent eye height above the floor.
const AGENT_HEIGHT: f32 = 0.9;

#[derive(Parser, Debug)]
#[command(name = "mock-simulator")]
#[command(about = "Scriptable stand-in for the simulator binary")]
struct Cli {
    /// Unix socket to connect to
    #[arg(long)]
    socket: PathBuf,
    #[arg(long, default_value_t = 300)]
    width: u32,
    #[arg(long, default_value_t = 300)]
    height: u32,
    #[arg(long)]
    headless: bool,
    #[arg(long)]
    render_depth: bool,
    #[arg(long)]
    render_instance_segmentation: bool,
    #[arg(long)]
    render_class_masks: bool,
    /// Translation step used when an action omits its magnitude
    #[arg(long, default_value_t = 0.25)]
    grid_size: f32,
    /// Rotation step used when an action omits its degrees
    #[arg(long, default_value_t = 90.0)]
    rotate_step_degrees: f32,

    /// Scene loaded at startup
    #[arg(long, default_value = "FloorPlan1")]
    scene: String,
    /// Distance from the room centre to each wall
    #[arg(long, default_value_t = 1.0)]
    room_half_extent: f32,
    /// Answer this action with a frame missing one body byte
    #[arg(long)]
    malformed_at: Option<u64>,
    /// Answer this action with a frame carrying the wrong sequence number
    #[arg(long)]
    stray_at: Option<u64>,
    /// Exit without answering this action
    #[arg(long)]
    crash_at: Option<u64>,
    /// Never answer this action
    #[arg(long)]
    hang_at: Option<u64>,
    /// Exit with code 3 before connecting
    #[arg(long)]
    exit_before_connect: bool,
    /// Wait this long before connecting
    #[arg(long, default_value_t = 0)]
    connect_delay_ms: u64,
    /// Wait this long after connecting before sending the handshake
    #[arg(long, default_value_t = 0)]
    handshake_delay_ms: u64,
    /// Wait this long before answering each action
    #[arg(long, default_value_t = 0)]
    step_delay_ms: u64,
    /// Keep running on SIGTERM
    #[arg(long)]
    ignore_sigterm: bool,
}

/// Simulated world state.
struct World {
    scene: String,
    half_extent: f32,
    grid_size: f32,
    rotate_step: f32,
    position: Vec3,
    yaw: f32,
    held: Vec<String>,
    hand: Vec3,
    hand_radius: f32,
    magnet_visible: bool,
    modalities: Vec<Modality>,
    width: u32,
    height: u32,
}

/// Outcome of applying one action.
struct Outcome {
    success: bool,
    error: String,
    collided_with: Vec<String>,
}

impl Outcome {
    fn ok() -> Self {
        Self {
            success: true,
            error: String::new(),
            collided_with: Vec::new(),
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            collided_with: Vec::new(),
        }
    }
}

impl World {
    fn new(cli: &Cli) -> Self {
        let mut modalities = vec![Modality::Color];
        if cli.render_depth {
            modalities.push(Modality::Depth);
        }
        if cli.render_instance_segmentation {
            modalities.push(Modality::InstanceSegmentation);
        }
        if cli.render_class_masks {
            modalities.push(Modality::ClassSegmentation);
        }
        Self {
            scene: cli.scene.clone(),
            half_extent: cli.room_half_extent,
            grid_size: cli.grid_size,
            rotate_step: cli.rotate_step_degrees,
            position: Vec3::new(0.0, AGENT_HEIGHT, 0.0),
            yaw: 0.0,
            held: Vec::new(),
            hand: Vec3::new(0.0, 0.8, 0.5),
            hand_radius: 0.06,
            magnet_visible: true,
            modalities,
            width: cli.width,
            height: cli.height,
        }
    }

    fn objects(&self) -> Vec<ObjectState> {
        [("Apple|+0.50|+0.90|+0.50", "Apple"), ("Mug|-0.50|+0.90|+0.50", "Mug")]
            .into_iter()
            .map(|(id, kind)| ObjectState {
                object_id: id.to_string(),
                object_type: kind.to_string(),
                position: Vec3::new(if kind == "Apple" { 0.5 } else { -0.5 }, 0.9, 0.5),
                visible: true,
                pickupable: true,
                is_picked_up: self.held.iter().any(|h| h == id),
            })
            .collect()
    }

    /// Moves by `ahead`/`right` in the agent frame unless a wall is in the way.
    fn translate(&mut self, ahead: f32, right: f32) -> Outcome {
        let (sin, cos) = self.yaw.to_radians().sin_cos();
        let x = self.position.x + ahead * sin + right * cos;
        let z = self.position.z + ahead * cos - right * sin;
        if x.abs() > self.half_extent || z.abs() > self.half_extent {
            let mut outcome = Outcome::failed("collision");
            outcome.collided_with.push("Wall".to_string());
            return outcome;
        }
        self.position.x = x;
        self.position.z = z;
        Outcome::ok()
    }

    fn rotate(&mut self, degrees: f32) -> Outcome {
        self.yaw = (self.yaw + degrees).rem_euclid(360.0);
        Outcome::ok()
    }

    fn apply(&mut self, action: &Action) -> Outcome {
        match action {
            Action::Initialize {
                grid_size,
                rotate_step_degrees,
                render_depth,
                render_instance_segmentation,
                render_class_masks,
            } => {
                self.grid_size = *grid_size;
                self.rotate_step = *rotate_step_degrees;
                self.modalities = vec![Modality::Color];
                for (on, modality) in [
                    (*render_depth, Modality::Depth),
                    (*render_instance_segmentation, Modality::InstanceSegmentation),
                    (*render_class_masks, Modality::ClassSegmentation),
                ] {
                    if on {
                        self.modalities.push(modality);
                    }
                }
                Outcome::ok()
            }
            Action::Reset { scene } => {
                if scene.starts_with("Missing") {
                    return Outcome::failed(format!("scene not found: {scene}"));
                }
                self.scene.clone_from(scene);
                self.position = Vec3::new(0.0, AGENT_HEIGHT, 0.0);
                self.yaw = 0.0;
                self.held.clear();
                Outcome::ok()
            }
            Action::MoveAhead { magnitude, .. } => {
                self.translate(magnitude.unwrap_or(self.grid_size), 0.0)
            }
            Action::MoveBack { magnitude, .. } => {
                self.translate(-magnitude.unwrap_or(self.grid_size), 0.0)
            }
            Action::MoveLeft { magnitude, .. } => {
                self.translate(0.0, -magnitude.unwrap_or(self.grid_size))
            }
            Action::MoveRight { magnitude, .. } => {
                self.translate(0.0, magnitude.unwrap_or(self.grid_size))
            }
            Action::RotateLeft { degrees, .. } => self.rotate(-degrees.unwrap_or(self.rotate_step)),
            Action::RotateRight { degrees, .. } => self.rotate(degrees.unwrap_or(self.rotate_step)),
            Action::RotateAgent { degrees, .. } => self.rotate(*degrees),
            Action::MoveAgent { ahead, right, .. } => self.translate(*ahead, *right),
            Action::MoveArm { position, .. } => {
                self.hand = *position;
                Outcome::ok()
            }
            Action::MoveArmRelative { offset, .. } => {
                self.hand = Vec3::new(
                    self.hand.x + offset.x,
                    self.hand.y + offset.y,
                    self.hand.z + offset.z,
                );
                Outcome::ok()
            }
            Action::MoveArmBase { y, .. } => {
                self.hand.y = *y;
                Outcome::ok()
            }
            Action::MoveArmBaseUp { distance, .. } => {
                self.hand.y += distance;
                Outcome::ok()
            }
            Action::MoveArmBaseDown { distance, .. } => {
                self.hand.y -= distance;
                Outcome::ok()
            }
            Action::PickupObject {
                object_id_candidates,
            } => {
                if !self.held.is_empty() {
                    return Outcome::failed("already holding an object");
                }
                let target = self.objects().into_iter().find(|o| {
                    object_id_candidates
                        .as_ref()
                        .map_or(true, |ids| ids.contains(&o.object_id))
                });
                match target {
                    Some(object) => {
                        self.held.push(object.object_id);
                        Outcome::ok()
                    }
                    None => Outcome::failed("no pickupable object in range"),
                }
            }
            Action::ReleaseObject => {
                self.held.clear();
                Outcome::ok()
            }
            Action::SetHandSphereRadius { radius } => {
                self.hand_radius = *radius;
                Outcome::ok()
            }
            Action::ToggleMagnetVisibility { visible } => {
                self.magnet_visible = visible.unwrap_or(!self.magnet_visible);
                Outcome::ok()
            }
            Action::RotateWristRelative { .. } | Action::GetMidLevelArmCollisions | Action::Pass => {
                Outcome::ok()
            }
        }
    }

    fn render(&self, modality: Modality) -> ImageChannel {
        let pixels = (self.width * self.height) as usize;
        let (format, data) = match modality {
            Modality::Color => {
                let shade = (self.yaw / 360.0 * 255.0) as u8;
                (PixelFormat::Rgb8, [shade, 128, 255 - shade].repeat(pixels))
            }
            Modality::Depth => {
                let distance = self.half_extent - self.position.z;
                (PixelFormat::DepthF32, distance.to_le_bytes().repeat(pixels))
            }
            Modality::InstanceSegmentation => (PixelFormat::Rgb8, [200, 10, 10].repeat(pixels)),
            Modality::ClassSegmentation => (PixelFormat::Rgb8, [10, 200, 10].repeat(pixels)),
        };
        ImageChannel {
            width: self.width,
            height: self.height,
            format,
            data,
        }
    }

    fn frame(&self, sequence: u64, last_action: &str, outcome: Outcome) -> Frame {
        let images = self
            .modalities
            .iter()
            .map(|&m| (m, self.render(m)))
            .collect::<BTreeMap<_, _>>();
        Frame {
            sequence,
            success: outcome.success,
            error: outcome.error,
            images,
            metadata: FrameMetadata {
                agent: AgentPose {
                    position: self.position,
                    rotation: Vec3::new(0.0, self.yaw, 0.0),
                    camera_horizon: 0.0,
                    is_standing: true,
                },
                objects: self.objects(),
                collided: !outcome.collided_with.is_empty(),
                collided_objects: outcome.collided_with,
                last_action: last_action.to_string(),
                last_action_success: outcome.success,
                scene_name: self.scene.clone(),
                arm: Some(ArmState {
                    held_objects: self.held.clone(),
                    hand_sphere_center: self.hand,
                    hand_sphere_radius: self.hand_radius,
                }),
                extra: BTreeMap::new(),
            },
        }
    }
}

fn connect(path: &Path) -> Result<UnixStream> {
    let deadline = Instant::now() + CONNECT_RETRY_WINDOW;
    loop {
        match UnixStream::connect(path) {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() < deadline => {
                log::debug!("[mock] connect {} failed, retrying: {e}", path.display());
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => return Err(e).with_context(|| format!("connect {}", path.display())),
        }
    }
}

/// Drops the first byte of the body so the sections no longer add up.
fn corrupt(frame: &Frame) -> Result<Vec<u8>> {
    let mut payload = frame.encode_payload()?;
    let header_len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    payload.remove(4 + header_len);
    Ok(encode_envelope(frame_type::STEP, &payload))
}

fn serve(cli: &Cli, mut stream: UnixStream) -> Result<()> {
    let mut world = World::new(cli);
    let mut sequence = 0u64;
    let mut received = 0u64;

    std::thread::sleep(Duration::from_millis(cli.handshake_delay_ms));
    stream.write_all(&world.frame(sequence, "Initialize", Outcome::ok()).encode()?)?;
    log::info!("[mock] handshake sent ({})", world.scene);

    let mut decoder = EnvelopeDecoder::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            log::info!("[mock] controller closed the connection");
            return Ok(());
        }

        for envelope in decoder.feed(&buf[..n])? {
            if envelope.kind != frame_type::ACTION {
                log::warn!("[mock] ignoring envelope type 0x{:02x}", envelope.kind);
                continue;
            }
            received += 1;

            if cli.crash_at == Some(received) {
                log::error!("[mock] crashing on action {received}");
                std::process::exit(70);
            }
            if cli.hang_at == Some(received) {
                log::warn!("[mock] hanging on action {received}");
                loop {
                    std::thread::sleep(Duration::from_secs(60));
                }
            }
            if cli.step_delay_ms > 0 {
                std::thread::sleep(Duration::from_millis(cli.step_delay_ms));
            }

            let (name, outcome, is_reset) = match decode_action(&envelope.payload) {
                Ok(action) => {
                    let outcome = world.apply(&action);
                    (action.name().to_string(), outcome, action.is_reset())
                }
                Err(e) => ("Unknown".to_string(), Outcome::failed(e.to_string()), false),
            };
            sequence = if is_reset && outcome.success { 0 } else { sequence + 1 };
            let frame = world.frame(sequence, &name, outcome);

            let bytes = if cli.malformed_at == Some(received) {
                corrupt(&frame)?
            } else if cli.stray_at == Some(received) {
                Frame {
                    sequence: sequence + 7,
                    ..frame
                }
                .encode()?
            } else {
                frame.encode()?
            };
            stream.write_all(&bytes)?;
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    log::debug!(
        "[mock] {}x{} headless={} socket={}",
        cli.width,
        cli.height,
        cli.headless,
        cli.socket.display()
    );

    if cli.ignore_sigterm {
        use signal_hook::consts::signal::SIGTERM;
        use signal_hook::flag;
        let term = Arc::new(AtomicBool::new(false));
        flag::register(SIGTERM, Arc::clone(&term))?;
        std::thread::spawn(move || loop {
            if term.swap(false, Ordering::Relaxed) {
                log::warn!("[mock] ignoring SIGTERM");
            }
            std::thread::sleep(Duration::from_millis(50));
        });
    }

    if cli.exit_before_connect {
        log::error!("[mock] exiting before connect");
        std::process::exit(3);
    }
    if cli.connect_delay_ms > 0 {
        std::thread::sleep(Duration::from_millis(cli.connect_delay_ms));
    }

    let stream = connect(&cli.socket)?;
    serve(&cli, stream)
}
