//! End-to-end tests for the alarm engine behind the command server
//!
//! Runs the real engine task and TCP server on an ephemeral port, fed by
//! the synthetic frame source (no camera hardware), and drives everything
//! through `send_command` exactly as the controller does.
//!
//! Run: `cargo test -p watchpost --test e2e`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use watchpost::capture::{SyntheticControl, SyntheticSource};
use watchpost::engine::{Engine, EngineConfig, EngineHandle};
use watchpost::motion::DetectorConfig;
use watchpost::notify::{Dispatcher, MemorySink, Notification};
use watchpost::recording::{ArtifactConfig, ArtifactStore, RecorderConfig};
use watchpost::server::{send_command, CommandServer};
use watchpost::signal::SilentSignal;
use watchpost::{Resolution, Settings};

// ── Shared helpers ───────────────────────────────────────────────────

const RES: Resolution = Resolution {
    width: 64,
    height: 48,
};

struct System {
    addr: SocketAddr,
    handle: EngineHandle,
    control: SyntheticControl,
    sink: Arc<MemorySink>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    _dir: tempfile::TempDir,
}

impl System {
    async fn send(&self, request: &str) -> String {
        send_command(self.addr, request).await.unwrap()
    }

    async fn wait_for_status(&self, needle: &str) {
        let waited = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if self.send("status").await.contains(needle) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "status never contained {:?}", needle);
    }

    async fn wait_for_notifications(&self, count: usize) -> Vec<Notification> {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let sent = self.sink.sent();
                if sent.len() >= count {
                    return sent;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("notifications not delivered in time")
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        self.tracker.close();
        tokio::time::timeout(Duration::from_secs(10), self.tracker.wait())
            .await
            .expect("tasks did not stop");
    }
}

async fn start_system() -> System {
    let dir = tempfile::tempdir().unwrap();
    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();

    let artifacts = ArtifactStore::new(ArtifactConfig {
        dir: dir.path().join("artifacts"),
        ..Default::default()
    })
    .unwrap();
    let sink = Arc::new(MemorySink::new());
    let dispatcher = Dispatcher::new(sink.clone(), Arc::new(artifacts), tracker.clone());

    let (source, control) = SyntheticSource::new(RES);
    let config = EngineConfig {
        cycle: Duration::from_millis(5),
        detector: DetectorConfig {
            working_width: RES.width,
            ..Default::default()
        },
        recorder: RecorderConfig {
            quiet_window: Duration::from_millis(200),
            ..Default::default()
        },
        ..Default::default()
    };
    let settings = Settings {
        resolution: RES,
        sensitivity: 1000,
        ..Default::default()
    };

    let (engine, handle) = Engine::new(
        config,
        settings,
        source,
        dispatcher,
        Arc::new(SilentSignal::default()),
    );
    tracker.spawn(engine.run(cancel.clone()));

    let server = CommandServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    tracker.spawn(server.run(handle.clone(), cancel.clone(), tracker.clone()));

    System {
        addr,
        handle,
        control,
        sink,
        cancel,
        tracker,
        _dir: dir,
    }
}

fn count<F: Fn(&Notification) -> bool>(sent: &[Notification], f: F) -> usize {
    sent.iter().filter(|n| f(n)).count()
}

// ── Tests ────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn full_alarm_cycle_over_tcp() {
    let sys = start_system().await;

    let status = sys.send("status").await;
    assert!(status.starts_with("System Status:\nCurrent Time: "));
    assert!(status.contains("System is: Disarmed"));
    assert!(status.contains("Manual Override: No"));
    assert!(status.contains("Next Schedule Change: "));

    assert_eq!(sys.send("last").await, "No motion frame available!");

    assert_eq!(sys.send("alarm on").await, "Alarm activated");
    let status = sys.send("status").await;
    assert!(status.contains("System is: Armed"));
    assert!(status.contains("Manual Override: Yes"));

    sys.control.set_motion(true);
    sys.wait_for_status("System is: Triggered").await;
    sys.control.set_motion(false);

    let sent = sys.wait_for_notifications(2).await;
    let Notification::Alert { snapshot, .. } = &sent[0] else {
        panic!("first notification should be the alert: {:?}", sent);
    };
    let Notification::Episode {
        snapshot: episode_snapshot,
        clip,
    } = &sent[1]
    else {
        panic!("second notification should be the episode: {:?}", sent);
    };
    assert_eq!(episode_snapshot.as_ref(), Some(snapshot));
    assert!(snapshot.exists());
    assert_eq!(clip.extension().and_then(|e| e.to_str()), Some("gif"));
    assert!(clip.exists());

    // Still triggered after the scene went quiet
    assert!(sys.send("status").await.contains("System is: Triggered"));

    assert_eq!(sys.send("last").await, "Sending last motion frame");
    let sent = sys.wait_for_notifications(3).await;
    assert_eq!(
        sent[2],
        Notification::LastFrame {
            snapshot: snapshot.clone()
        }
    );

    assert_eq!(sys.send("alarm reset").await, "Alarm reset");
    assert!(sys.send("status").await.contains("System is: Armed"));

    assert_eq!(sys.send("alarm off").await, "Alarm deactivated");
    assert_eq!(sys.send("alarm off").await, "Alarm deactivated");
    assert!(sys.send("status").await.contains("System is: Disarmed"));

    sys.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn retrigger_inside_open_session_dispatches_once() {
    let sys = start_system().await;
    assert_eq!(sys.send("alarm on").await, "Alarm activated");

    sys.control.set_motion(true);
    sys.wait_for_status("System is: Triggered").await;

    // Reset with the scene still moving: the counter climbs again and
    // re-triggers while the first session is still open
    assert_eq!(sys.send("alarm reset").await, "Alarm reset");
    sys.wait_for_status("System is: Triggered").await;

    sys.control.set_motion(false);
    sys.wait_for_notifications(2).await;
    // Give a stray second episode time to show up
    tokio::time::sleep(Duration::from_millis(500)).await;

    let sent = sys.sink.sent();
    assert_eq!(count(&sent, |n| matches!(n, Notification::Alert { .. })), 1);
    assert_eq!(count(&sent, |n| matches!(n, Notification::Episode { .. })), 1);

    sys.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_queries_do_not_mutate_state() {
    let sys = start_system().await;
    assert_eq!(sys.send("alarm on").await, "Alarm activated");

    // One connection at a time flips the alarm while queries hammer it
    let addr = sys.addr;
    let mutator = tokio::spawn(async move {
        for i in 0..20 {
            let (request, expected) = match i % 3 {
                0 => ("alarm off", "Alarm deactivated"),
                1 => ("alarm on", "Alarm activated"),
                _ => ("alarm reset", "Alarm reset"),
            };
            assert_eq!(send_command(addr, request).await.unwrap(), expected);
        }
        // Last applied mutation
        assert_eq!(
            send_command(addr, "alarm off").await.unwrap(),
            "Alarm deactivated"
        );
    });

    let mut queries = Vec::new();
    for i in 0..48 {
        let request = match i % 3 {
            0 => "status",
            1 => "schedule",
            _ => "definitely not a command",
        };
        queries.push(tokio::spawn(async move {
            send_command(addr, request).await.unwrap()
        }));
    }

    for query in queries {
        let response = query.await.unwrap();
        if response.starts_with("System Status:") {
            assert!(
                response.contains("System is: Armed\n")
                    || response.contains("System is: Disarmed\n"),
                "inconsistent state in {:?}",
                response
            );
            assert!(response.contains("Manual Override: Yes"), "{:?}", response);
        } else {
            assert!(
                response == "Schedule Settings:\nArm Time: 21:00\nDisarm Time: 7:00"
                    || response == "Unknown command",
                "unexpected response {:?}",
                response
            );
        }
    }
    mutator.await.unwrap();

    let after = sys.handle.status().await.unwrap();
    assert_eq!(after.alarm.state, watchpost::alarm::AlarmState::Disarmed);
    assert!(after.alarm.manual_override);
    assert_eq!(after.counter, 0);
    assert!(!after.recording);
    assert!(sys.sink.sent().is_empty());

    sys.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn request_split_across_segments_still_arms() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let sys = start_system().await;
    let mut stream = tokio::net::TcpStream::connect(sys.addr).await.unwrap();
    stream.write_all(b"alarm").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    stream.write_all(b" on\n").await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert_eq!(response, "Alarm activated");
    assert!(sys.send("status").await.contains("System is: Armed"));

    sys.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn arming_without_camera_reports_error() {
    let sys = start_system().await;
    sys.control.set_available(false);

    let response = sys.send("alarm on").await;
    assert!(response.starts_with("Error"), "got {:?}", response);

    let status = sys.send("status").await;
    assert!(status.contains("System is: Disarmed"));
    assert!(status.contains("Manual Override: No"));

    // Recovers once frames flow again
    sys.control.set_available(true);
    assert_eq!(sys.send("alarm on").await, "Alarm activated");

    sys.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn commands_are_case_insensitive() {
    let sys = start_system().await;
    assert_eq!(sys.send("  ALARM On\n").await, "Alarm activated");
    assert!(sys.send("Status").await.contains("System is: Armed"));
    sys.shutdown().await;
}
