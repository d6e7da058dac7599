//! Audible alarm signal
//!
//! Started by the engine when the alarm triggers and stopped on reset or
//! disarm. Both calls return immediately: the player is killed without
//! waiting and tokio reaps it in the background.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

pub trait AlarmSignal: Send + Sync {
    fn start(&self);
    fn stop(&self);
    fn is_active(&self) -> bool;
}

/// Signal that only logs
#[derive(Debug, Default)]
pub struct SilentSignal {
    active: AtomicBool,
}

impl AlarmSignal for SilentSignal {
    fn start(&self) {
        if !self.active.swap(true, Ordering::Relaxed) {
            warn!("Alarm signal on");
        }
    }

    fn stop(&self) {
        if self.active.swap(false, Ordering::Relaxed) {
            info!("Alarm signal off");
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }
}

/// Plays a sound file through an external player process.
///
/// Must be started from within a tokio runtime.
pub struct CommandSignal {
    program: String,
    sound: PathBuf,
    child: Mutex<Option<Child>>,
}

impl CommandSignal {
    /// `program` is invoked as `program <sound>`
    pub fn new(program: impl Into<String>, sound: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            sound: sound.into(),
            child: Mutex::new(None),
        }
    }
}

impl AlarmSignal for CommandSignal {
    fn start(&self) {
        let Ok(mut guard) = self.child.lock() else {
            return;
        };

        if let Some(child) = guard.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                debug!("Alarm sound already playing");
                return;
            }
        }

        match Command::new(&self.program)
            .arg(&self.sound)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => {
                warn!(pid = ?child.id(), "Alarm sound started: {:?}", self.sound);
                *guard = Some(child);
            }
            Err(e) => error!("Failed to start {}: {}", self.program, e),
        }
    }

    fn stop(&self) {
        let Ok(mut guard) = self.child.lock() else {
            return;
        };
        if let Some(mut child) = guard.take() {
            if let Err(e) = child.start_kill() {
                debug!("Alarm player already gone: {}", e);
            }
            info!("Alarm sound stopped");
        }
    }

    fn is_active(&self) -> bool {
        self.child
            .lock()
            .ok()
            .map(|mut guard| {
                guard
                    .as_mut()
                    .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
            })
            .unwrap_or(false)
    }
}

impl Drop for CommandSignal {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_signal_tracks_state() {
        let signal = SilentSignal::default();
        assert!(!signal.is_active());
        signal.start();
        signal.start();
        assert!(signal.is_active());
        signal.stop();
        signal.stop();
        assert!(!signal.is_active());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_signal_spawns_and_kills_player() {
        // `sleep 30` stands in for a long sound
        let signal = CommandSignal::new("sleep", "30");
        signal.start();
        assert!(signal.is_active());
        signal.start();

        let started = std::time::Instant::now();
        signal.stop();
        assert!(started.elapsed() < std::time::Duration::from_millis(500));
        assert!(!signal.is_active());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_player_is_not_active() {
        let signal = CommandSignal::new("true", "");
        signal.start();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while signal.is_active() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        signal.stop();
    }

    #[tokio::test]
    async fn missing_player_is_not_fatal() {
        let signal = CommandSignal::new("/nonexistent/watchpost-player", "alarm.wav");
        signal.start();
        assert!(!signal.is_active());
        signal.stop();
    }
}
