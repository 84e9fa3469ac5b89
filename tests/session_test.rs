// Integration tests for the controller session lifecycle.
//
// Every test drives the `mock-simulator` binary built alongside this crate:
// a real child process connected over a real Unix socket. Failure modes are
// injected with the mock's `--*-at N` flags, which trigger on the Nth action.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use image::GenericImageView;
use simbridge::{
    Action, BridgeConfig, BridgeError, Controller, LocalBinary, Modalities, Modality, Motion,
    PixelFormat, SessionState,
};
use tempfile::TempDir;

fn mock() -> LocalBinary {
    LocalBinary::new(env!("CARGO_BIN_EXE_mock-simulator"))
}

fn test_config(tmp: &TempDir, extra_args: &[&str]) -> BridgeConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    BridgeConfig {
        socket_dir: tmp.path().to_path_buf(),
        width: 8,
        height: 6,
        startup_timeout_ms: 10_000,
        step_timeout_ms: 5_000,
        stop_grace_period_ms: 500,
        extra_args: extra_args.iter().map(|s| (*s).to_string()).collect(),
        ..BridgeConfig::default()
    }
}

/// Starts a controller against the mock simulator.
fn started(extra_args: &[&str]) -> (TempDir, Controller) {
    let tmp = TempDir::new().unwrap();
    let controller = Controller::new(test_config(&tmp, extra_args)).unwrap();
    controller.start(&mock()).unwrap();
    (tmp, controller)
}

/// Returns true once `pid` no longer names a live or zombie process.
fn pid_gone(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid as i32, 0) == -1 }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    done()
}

// ============================================================================
// Startup
// ============================================================================

#[test]
fn test_start_returns_handshake_frame() {
    let tmp = TempDir::new().unwrap();
    let controller = Controller::new(test_config(&tmp, &[])).unwrap();
    assert_eq!(controller.state(), SessionState::Uninitialized);

    let frame = controller.start(&mock()).unwrap();
    assert_eq!(frame.sequence, 0);
    assert!(frame.success);
    assert_eq!(frame.metadata.scene_name, "FloorPlan1");

    let color = frame.image(Modality::Color).unwrap();
    assert_eq!((color.width, color.height), (8, 6));
    assert_eq!(color.format, PixelFormat::Rgb8);
    assert_eq!(frame.decode_image(Modality::Color).unwrap().dimensions(), (8, 6));

    assert_eq!(controller.state(), SessionState::Ready);
    assert_eq!(controller.last_sequence(), Some(0));
    assert!(controller.pid().is_some());
    assert!(controller.session_id().unwrap().starts_with("session:"));
    let socket = controller.socket_path().unwrap();
    assert!(socket.starts_with(tmp.path()));
    assert!(socket.exists());
}

#[test]
fn test_start_while_ready_is_rejected() {
    let (_tmp, controller) = started(&[]);
    let err = controller.start(&mock()).unwrap_err();
    assert!(matches!(err, BridgeError::ProcessStartup(_)), "{err:?}");
    assert_eq!(controller.state(), SessionState::Ready);
    assert_eq!(controller.step(&Action::Pass).unwrap().sequence, 1);
}

#[test]
fn test_exit_before_connect_is_startup_error() {
    let tmp = TempDir::new().unwrap();
    let controller =
        Controller::new(test_config(&tmp, &["--exit-before-connect"])).unwrap();

    let err = controller.start(&mock()).unwrap_err();
    assert!(matches!(err, BridgeError::ProcessStartup(_)), "{err:?}");
    assert!(err.to_string().contains("exited with code 3"), "{err}");
    assert_eq!(controller.state(), SessionState::Stopped);
    assert!(controller.pid().is_none());
    // Socket file removed with the failed session.
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
}

#[test]
fn test_slow_connect_hits_startup_timeout() {
    let tmp = TempDir::new().unwrap();
    let config = BridgeConfig {
        startup_timeout_ms: 300,
        ..test_config(&tmp, &["--connect-delay-ms", "5000"])
    };
    let controller = Controller::new(config).unwrap();

    let start = Instant::now();
    let err = controller.start(&mock()).unwrap_err();
    assert!(matches!(err, BridgeError::ProcessStartup(_)), "{err:?}");
    assert!(start.elapsed() < Duration::from_secs(3), "took {:?}", start.elapsed());
    assert_eq!(controller.state(), SessionState::Stopped);
}

#[test]
fn test_restart_after_stop_begins_new_session() {
    let (_tmp, controller) = started(&[]);
    controller.step(&Action::Pass).unwrap();
    let first_pid = controller.pid().unwrap();
    let first_id = controller.session_id().unwrap();

    controller.stop().unwrap();
    assert_eq!(controller.state(), SessionState::Stopped);
    assert!(pid_gone(first_pid));

    let frame = controller.start(&mock()).unwrap();
    assert_eq!(frame.sequence, 0);
    assert_eq!(controller.step_count(), 0);
    assert_ne!(controller.pid().unwrap(), first_pid);
    assert_ne!(controller.session_id().unwrap(), first_id);
    assert_eq!(controller.step(&Action::Pass).unwrap().sequence, 1);
}

// ============================================================================
// Stepping
// ============================================================================

#[test]
fn test_sequence_counts_up_from_handshake() {
    let (_tmp, controller) = started(&[]);

    for expected in 1..=3 {
        let frame = controller.step(&Action::move_ahead(0.25)).unwrap();
        assert_eq!(frame.sequence, expected);
        assert!(frame.success, "{}", frame.error);
        assert_eq!(frame.metadata.last_action, "MoveAhead");
    }

    assert_eq!(controller.last_sequence(), Some(3));
    assert_eq!(controller.step_count(), 3);
    let pose = controller.agent_pose().unwrap();
    assert!((pose.position.z - 0.75).abs() < 1e-4, "{pose:?}");
}

#[test]
fn test_configured_steps_apply_to_default_magnitudes() {
    let tmp = TempDir::new().unwrap();
    let config = BridgeConfig {
        grid_size: 0.5,
        rotate_step_degrees: 45.0,
        ..test_config(&tmp, &["--room-half-extent", "5"])
    };
    let controller = Controller::new(config).unwrap();
    controller.start(&mock()).unwrap();

    let frame = controller
        .step(&Action::MoveAhead { magnitude: None, motion: Motion::default() })
        .unwrap();
    assert!(frame.success, "{}", frame.error);
    assert!((frame.metadata.agent.position.z - 0.5).abs() < 1e-4, "{:?}", frame.metadata.agent);

    let frame = controller.step(&Action::rotate_right()).unwrap();
    assert!((frame.metadata.agent.rotation.y - 45.0).abs() < 1e-4, "{:?}", frame.metadata.agent);

    // Explicit magnitudes still win.
    let frame = controller.step(&Action::move_ahead(0.25)).unwrap();
    let pose = frame.metadata.agent;
    let travelled = pose.position.x.hypot(pose.position.z - 0.5);
    assert!((travelled - 0.25).abs() < 1e-4, "{pose:?}");
}

#[test]
fn test_reset_restarts_sequence() {
    let (_tmp, controller) = started(&[]);
    controller.step(&Action::move_ahead(0.25)).unwrap();
    controller.step(&Action::rotate_right()).unwrap();

    let frame = controller.reset("FloorPlan2").unwrap();
    assert_eq!(frame.sequence, 0);
    assert!(frame.success);
    assert_eq!(frame.metadata.scene_name, "FloorPlan2");
    assert_eq!(frame.metadata.agent.position.z, 0.0);

    assert_eq!(controller.step(&Action::Pass).unwrap().sequence, 1);
    assert_eq!(controller.step_count(), 4);
}

#[test]
fn test_blocked_agent_after_reset() {
    let (_tmp, controller) = started(&["--room-half-extent", "0.1"]);

    let frame = controller.reset("SceneA").unwrap();
    assert_eq!((frame.sequence, frame.success), (0, true));

    let frame = controller.step(&Action::move_ahead(0.25)).unwrap();
    assert_eq!(frame.sequence, 1);
    assert!(!frame.success);
    assert_eq!(frame.error, "collision");
    assert_eq!(controller.state(), SessionState::Ready);
}

#[test]
fn test_failed_reset_is_an_ordinary_step() {
    let (_tmp, controller) = started(&[]);
    controller.step(&Action::Pass).unwrap();

    let frame = controller.reset("MissingScene").unwrap();
    assert!(!frame.success);
    assert!(frame.error.contains("scene not found"), "{}", frame.error);
    assert_eq!(frame.sequence, 2);
    assert_eq!(controller.state(), SessionState::Ready);
}

#[test]
fn test_collision_is_a_result_not_an_error() {
    let (_tmp, controller) = started(&[]);
    // Walls at ±1.0; the fifth quarter-meter step goes through one.
    for _ in 0..4 {
        assert!(controller.step(&Action::move_ahead(0.25)).unwrap().success);
    }

    let frame = controller.step(&Action::move_ahead(0.25)).unwrap();
    assert!(!frame.success);
    assert_eq!(frame.error, "collision");
    assert!(frame.metadata.collided);
    assert!(!frame.metadata.last_action_success);
    assert_eq!(frame.sequence, 5);
    assert_eq!(controller.state(), SessionState::Ready);

    let frame = controller.step(&Action::rotate_right()).unwrap();
    assert!(frame.success);
    assert_eq!(frame.sequence, 6);
    assert!((frame.metadata.agent.rotation.y - 90.0).abs() < 1e-4);
}

#[test]
fn test_invalid_action_never_reaches_the_simulator() {
    let (_tmp, controller) = started(&[]);

    let err = controller
        .step(&Action::SetHandSphereRadius { radius: 3.0 })
        .unwrap_err();
    match err {
        BridgeError::InvalidAction {
            action_name,
            problems,
        } => {
            assert_eq!(action_name, "SetHandSphereRadius");
            assert_eq!(problems.len(), 1);
        }
        other => panic!("expected InvalidAction, got {other:?}"),
    }

    assert_eq!(controller.state(), SessionState::Ready);
    assert_eq!(controller.last_sequence(), Some(0));
    assert_eq!(controller.step_count(), 0);
    // Nothing was sent, so the next reply is still frame 1.
    assert_eq!(controller.step(&Action::Pass).unwrap().sequence, 1);
}

#[test]
fn test_arm_actions_update_metadata() {
    let (_tmp, controller) = started(&[]);

    controller
        .step(&Action::SetHandSphereRadius { radius: 0.1 })
        .unwrap();
    let frame = controller
        .step(&Action::PickupObject {
            object_id_candidates: Some(vec!["Mug|-0.50|+0.90|+0.50".to_string()]),
        })
        .unwrap();
    assert!(frame.success, "{}", frame.error);

    let arm = frame.metadata.arm.unwrap();
    assert_eq!(arm.held_objects, vec!["Mug|-0.50|+0.90|+0.50".to_string()]);
    assert!((arm.hand_sphere_radius - 0.1).abs() < 1e-6);
    assert!(frame
        .metadata
        .objects
        .iter()
        .any(|o| o.object_type == "Mug" && o.is_picked_up));

    let frame = controller.step(&Action::PickupObject { object_id_candidates: None }).unwrap();
    assert!(!frame.success);
}

#[test]
fn test_extra_modalities_are_rendered() {
    let tmp = TempDir::new().unwrap();
    let config = BridgeConfig {
        modalities: Modalities {
            depth: true,
            instance_segmentation: true,
            class_masks: false,
        },
        ..test_config(&tmp, &[])
    };
    let controller = Controller::new(config).unwrap();
    let frame = controller.start(&mock()).unwrap();

    assert!(frame.image(Modality::InstanceSegmentation).is_some());
    assert!(frame.image(Modality::ClassSegmentation).is_none());
    let depth = frame.depth_values().unwrap();
    assert_eq!(depth.len(), 48);
    assert!(depth.iter().all(|d| (d - 1.0).abs() < 1e-6));
    assert!(frame.decode_image(Modality::Depth).is_err());
}

// ============================================================================
// Protocol failures
// ============================================================================

#[test]
fn test_malformed_frame_makes_session_unusable() {
    let (_tmp, controller) = started(&["--malformed-at", "2"]);
    controller.step(&Action::Pass).unwrap();

    let err = controller.step(&Action::Pass).unwrap_err();
    assert!(matches!(err, BridgeError::MalformedFrame(_)), "{err:?}");
    assert_eq!(controller.state(), SessionState::Failed);

    let start = Instant::now();
    let err = controller.step(&Action::Pass).unwrap_err();
    assert!(matches!(err, BridgeError::SimulatorNotRunning(_)), "{err:?}");
    assert!(start.elapsed() < Duration::from_secs(1));

    // Recovery is stop + start.
    controller.stop().unwrap();
    assert_eq!(controller.start(&mock()).unwrap().sequence, 0);
    assert_eq!(controller.state(), SessionState::Ready);
}

#[test]
fn test_unexpected_sequence_is_desync() {
    let (_tmp, controller) = started(&["--stray-at", "1"]);

    let err = controller.step(&Action::Pass).unwrap_err();
    match err {
        BridgeError::SequenceDesync { expected, received } => {
            assert_eq!(expected, 1);
            assert_eq!(received, 8);
        }
        other => panic!("expected SequenceDesync, got {other:?}"),
    }
    assert_eq!(controller.state(), SessionState::Failed);
    assert_eq!(controller.last_sequence(), Some(0));
}

#[test]
fn test_silent_simulator_times_out() {
    let tmp = TempDir::new().unwrap();
    let config = BridgeConfig {
        step_timeout_ms: 300,
        ..test_config(&tmp, &["--hang-at", "1"])
    };
    let controller = Controller::new(config).unwrap();
    controller.start(&mock()).unwrap();

    let start = Instant::now();
    let err = controller.step(&Action::Pass).unwrap_err();
    assert!(matches!(err, BridgeError::TransportTimeout(_)), "{err:?}");
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert!(start.elapsed() < Duration::from_secs(3));
    assert_eq!(controller.state(), SessionState::Failed);
}

// ============================================================================
// Process death and stop
// ============================================================================

#[test]
fn test_simulator_exit_mid_step_is_process_stopped() {
    let (_tmp, controller) = started(&["--crash-at", "2"]);
    controller.step(&Action::Pass).unwrap();

    let err = controller.step(&Action::Pass).unwrap_err();
    assert!(matches!(err, BridgeError::ProcessStopped(_)), "{err:?}");
    assert_eq!(controller.state(), SessionState::Failed);
    assert!(wait_until(Duration::from_secs(2), || {
        !controller.process_status().unwrap().unwrap().is_running()
    }));
}

#[test]
fn test_killed_process_fails_pending_step() {
    let (_tmp, controller) = started(&["--hang-at", "1"]);
    let controller = Arc::new(controller);
    let pid = controller.pid().unwrap();

    let stepper = {
        let controller = Arc::clone(&controller);
        thread::spawn(move || controller.step(&Action::Pass))
    };
    thread::sleep(Duration::from_millis(200));
    // SAFETY: pid belongs to the mock simulator this test started.
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }

    let err = stepper.join().unwrap().unwrap_err();
    assert!(matches!(err, BridgeError::ProcessStopped(_)), "{err:?}");
    assert!(wait_until(Duration::from_secs(2), || {
        !controller.process_status().unwrap().unwrap().is_running()
    }));
}

#[test]
fn test_step_after_process_death_is_not_running() {
    let (_tmp, controller) = started(&[]);
    let pid = controller.pid().unwrap();
    // SAFETY: pid belongs to the mock simulator this test started.
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
    assert!(wait_until(Duration::from_secs(2), || {
        !controller.process_status().unwrap().unwrap().is_running()
    }));

    let err = controller.step(&Action::Pass).unwrap_err();
    assert!(matches!(err, BridgeError::SimulatorNotRunning(_)), "{err:?}");
    assert_eq!(controller.state(), SessionState::Failed);
}

#[test]
fn test_stop_from_another_thread_unblocks_step() {
    let tmp = TempDir::new().unwrap();
    let config = BridgeConfig {
        step_timeout_ms: 30_000,
        ..test_config(&tmp, &["--hang-at", "1"])
    };
    let controller = Arc::new(Controller::new(config).unwrap());
    controller.start(&mock()).unwrap();
    let pid = controller.pid().unwrap();
    let handle = controller.stop_handle();

    let start = Instant::now();
    let stepper = {
        let controller = Arc::clone(&controller);
        thread::spawn(move || controller.step(&Action::Pass))
    };
    thread::sleep(Duration::from_millis(200));
    handle.stop().unwrap();

    let err = stepper.join().unwrap().unwrap_err();
    assert!(matches!(err, BridgeError::ProcessStopped(_)), "{err:?}");
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(controller.state(), SessionState::Stopped);
    assert!(controller.pid().is_none());
    assert!(pid_gone(pid));

    // Stopped sessions can be restarted.
    assert_eq!(controller.start(&mock()).unwrap().sequence, 0);
}

#[test]
fn test_stop_during_start_is_process_stopped() {
    // First waits on the connect, then on the handshake.
    for args in [["--connect-delay-ms", "30000"], ["--handshake-delay-ms", "30000"]] {
        let tmp = TempDir::new().unwrap();
        let config = BridgeConfig {
            startup_timeout_ms: 60_000,
            ..test_config(&tmp, &args)
        };
        let controller = Arc::new(Controller::new(config).unwrap());
        let handle = controller.stop_handle();

        let begun = Instant::now();
        let starter = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.start(&mock()))
        };
        assert!(wait_until(Duration::from_secs(5), || {
            controller.state() == SessionState::Starting
        }));
        thread::sleep(Duration::from_millis(300));
        handle.stop().unwrap();

        let err = starter.join().unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::ProcessStopped(_)), "{args:?}: {err:?}");
        assert!(begun.elapsed() < Duration::from_secs(10));
        assert_eq!(controller.state(), SessionState::Stopped);
        assert!(controller.pid().is_none());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0, "{args:?}");
    }
}

#[test]
fn test_stop_escalates_when_sigterm_is_ignored() {
    let tmp = TempDir::new().unwrap();
    let config = BridgeConfig {
        stop_grace_period_ms: 200,
        ..test_config(&tmp, &["--ignore-sigterm"])
    };
    let controller = Controller::new(config).unwrap();
    controller.start(&mock()).unwrap();
    let pid = controller.pid().unwrap();

    let start = Instant::now();
    controller.stop().unwrap();
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert!(pid_gone(pid));
    // Idempotent.
    controller.stop().unwrap();
    assert_eq!(controller.state(), SessionState::Stopped);
}

#[test]
fn test_drop_stops_simulator() {
    let (tmp, controller) = started(&[]);
    let pid = controller.pid().unwrap();
    let socket = controller.socket_path().unwrap();

    drop(controller);
    assert!(pid_gone(pid));
    assert!(!socket.exists());
    drop(tmp);
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_step_is_busy() {
    let (_tmp, controller) = started(&["--step-delay-ms", "500"]);
    let controller = Arc::new(controller);

    let stepper = {
        let controller = Arc::clone(&controller);
        thread::spawn(move || controller.step(&Action::Pass))
    };
    thread::sleep(Duration::from_millis(100));

    let err = controller.step(&Action::Pass).unwrap_err();
    assert!(matches!(err, BridgeError::SessionBusy), "{err:?}");

    let frame = stepper.join().unwrap().unwrap();
    assert_eq!(frame.sequence, 1);
    assert_eq!(controller.last_sequence(), Some(1));
    assert_eq!(controller.step_count(), 1);
    assert_eq!(controller.state(), SessionState::Ready);
}

#[test]
fn test_independent_sessions_run_side_by_side() {
    let workers: Vec<_> = (0..2)
        .map(|_| {
            thread::spawn(|| {
                let (_tmp, controller) = started(&[]);
                for expected in 1..=5 {
                    let frame = controller.step(&Action::rotate_right()).unwrap();
                    assert_eq!(frame.sequence, expected);
                }
                (controller.pid().unwrap(), controller.socket_path().unwrap())
            })
        })
        .collect();

    let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert_ne!(results[0].0, results[1].0);
    assert_ne!(results[0].1, results[1].1);
}
