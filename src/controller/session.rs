//! I/O side of one session: the transport and the process it talks to.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::action::Action;
use crate::codec::{decode_step, encode_action, Frame};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::launch::LaunchSpec;
use crate::process::{ProcessHandle, ProcessStatus, ProcessSupervisor};
use crate::transport::{socket_path_in, Interrupter, TransportChannel};

/// Generates a unique session id using a monotonic counter + random suffix.
fn generate_session_token() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let rand: u16 = rand::random();
    format!("{seq:x}{rand:04x}")
}

/// One simulator process and the channel connected to it.
#[derive(Debug)]
pub(crate) struct Session {
    id: String,
    transport: TransportChannel,
    process: ProcessHandle,
}

impl Session {
    /// Binds the socket and launches the simulator pointed at it.
    pub(crate) fn launch(
        config: &BridgeConfig,
        binary: PathBuf,
        interrupter: &Interrupter,
        supervisor: &ProcessSupervisor,
    ) -> Result<Self> {
        let token = generate_session_token();
        let socket_path = socket_path_in(
            &config.socket_dir,
            &format!("{}-{token}", std::process::id()),
        )?;
        let mut transport = TransportChannel::bind(socket_path, interrupter.clone())?;

        let spec = LaunchSpec::new(binary, transport.path(), config);
        spec.validate()?;
        let process = supervisor.start(&spec.binary, &spec.args, spec.working_dir.as_deref())?;
        process.register_cleanup(transport.path());
        transport.restrict_peer_group(process.pid());

        Ok(Self {
            id: format!("session:{token}"),
            transport,
            process,
        })
    }

    /// Waits for the simulator to connect and send its handshake frame.
    ///
    /// Everything that goes wrong before a valid sequence-0 frame arrives is
    /// a startup failure, except an explicit stop.
    pub(crate) fn connect(
        &mut self,
        config: &BridgeConfig,
        supervisor: &ProcessSupervisor,
        deadline: Instant,
    ) -> Result<Frame> {
        let process = self.process.clone();
        let budget = deadline.saturating_duration_since(Instant::now());
        self.transport
            .accept_connection(budget, config.accept_backoff(), || {
                match supervisor.poll(&process)? {
                    ProcessStatus::Running => Ok(()),
                    status => Err(BridgeError::ProcessStartup(format!(
                        "simulator {status} before connecting"
                    ))),
                }
            })?;

        let budget = deadline.saturating_duration_since(Instant::now());
        let envelope = self.transport.receive(budget).map_err(|e| match e {
            BridgeError::TransportTimeout(_) => BridgeError::ProcessStartup(format!(
                "no handshake frame within {:?}",
                config.startup_timeout()
            )),
            BridgeError::ProcessStopped(reason) if !self.transport.is_interrupted() => {
                BridgeError::ProcessStartup(format!("simulator left during handshake: {reason}"))
            }
            other => other,
        })?;
        let frame = decode_step(&envelope)?;
        if frame.sequence != 0 {
            return Err(BridgeError::SequenceDesync {
                expected: 0,
                received: frame.sequence,
            });
        }
        log::info!(
            "[session] {} handshake received (scene {:?})",
            self.id,
            frame.metadata.scene_name
        );
        Ok(frame)
    }

    /// Sends one action and waits for the frame that answers it.
    pub(crate) fn round_trip(&mut self, action: &Action, timeout: Duration) -> Result<Frame> {
        let bytes = encode_action(action)?;
        log::debug!("[session] {} -> {} ({} bytes)", self.id, action.name(), bytes.len());
        self.transport.send(&bytes)?;

        let envelope = self.transport.receive(timeout)?;
        let frame = decode_step(&envelope)?;
        log::debug!(
            "[session] {} <- frame {} success={}",
            self.id,
            frame.sequence,
            frame.success
        );
        Ok(frame)
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn socket_path(&self) -> &Path {
        self.transport.path()
    }

    pub(crate) fn process(&self) -> &ProcessHandle {
        &self.process
    }
}
