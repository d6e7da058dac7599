//! Watchpost daemon
//!
//! Watches a camera, raises the alarm on sustained motion, records the
//! episode, and answers plain-text commands over TCP.
//!
//! ## Usage
//!
//! ```bash
//! # Run against /dev/video* (needs ffmpeg)
//! watchpost
//!
//! # No camera: synthetic frames
//! watchpost --test-source
//!
//! # Post alerts to a webhook, play a sound on trigger
//! WATCHPOST_WEBHOOK_URL=https://example.invalid/hook \
//! WATCHPOST_ALARM_SOUND=./alarm.wav watchpost
//!
//! # Mail finished episodes
//! WATCHPOST_SMTP_HOST=smtp.example.invalid WATCHPOST_SMTP_USER=cam@example.invalid \
//! WATCHPOST_SMTP_PASSWORD=... WATCHPOST_SMTP_TO=me@example.invalid watchpost
//!
//! # Reload settings.json without restarting
//! kill -HUP $(pidof watchpost)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use watchpost::capture::{list_devices, DeviceSource, FrameSource, VideoCaptureConfig};
use watchpost::engine::{Engine, EngineConfig, EngineHandle, Preview};
use watchpost::notify::{
    Dispatcher, EmailConfig, EmailSink, FanoutSink, LogSink, NotificationSink, WebhookConfig,
    WebhookSink,
};
use watchpost::recording::{ArtifactConfig, ArtifactStore};
use watchpost::server::{CommandServer, DEFAULT_ADDR};
use watchpost::signal::{AlarmSignal, CommandSignal, SilentSignal};
use watchpost::{Settings, SettingsStore};

/// How long startup waits for the camera's first frame
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon configuration from environment and flags
struct Config {
    /// Command listener address
    bind: String,
    /// settings.json location
    settings_path: PathBuf,
    /// Where snapshots and clips go
    artifacts_dir: PathBuf,
    /// Webhook for alerts (None = log only)
    webhook_url: Option<String>,
    /// SMTP relay for episode mail (None = no mail)
    email: Option<EmailConfig>,
    /// Sound played on trigger (None = silent)
    alarm_sound: Option<PathBuf>,
    /// Player invoked as `<player> <sound>`
    alarm_player: String,
    /// Capture cycle
    cycle: Duration,
    /// Use generated frames instead of a camera
    test_source: bool,
    /// Never play the alarm sound
    no_siren: bool,
}

impl Config {
    fn from_env() -> Self {
        let args: Vec<String> = std::env::args().collect();

        let bind = std::env::var("WATCHPOST_BIND").unwrap_or_else(|_| DEFAULT_ADDR.to_string());

        let settings_path = std::env::var("WATCHPOST_SETTINGS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./settings.json"));

        let artifacts_dir = std::env::var("WATCHPOST_ARTIFACTS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./recordings"));

        let webhook_url = std::env::var("WATCHPOST_WEBHOOK_URL")
            .ok()
            .filter(|s| !s.is_empty());

        let email = email_from_env();

        let alarm_sound = std::env::var("WATCHPOST_ALARM_SOUND")
            .map(PathBuf::from)
            .ok();

        let alarm_player =
            std::env::var("WATCHPOST_ALARM_PLAYER").unwrap_or_else(|_| "aplay".to_string());

        let cycle_ms: u64 = std::env::var("WATCHPOST_CYCLE_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(30);

        Self {
            bind,
            settings_path,
            artifacts_dir,
            webhook_url,
            email,
            alarm_sound,
            alarm_player,
            cycle: Duration::from_millis(cycle_ms),
            test_source: args.iter().any(|a| a == "--test-source"),
            no_siren: args.iter().any(|a| a == "--no-siren"),
        }
    }
}

/// SMTP settings; enabled when both a host and a recipient are set
fn email_from_env() -> Option<EmailConfig> {
    let var = |name: &str| std::env::var(name).ok().filter(|s| !s.is_empty());

    let host = var("WATCHPOST_SMTP_HOST")?;
    let to: Vec<String> = var("WATCHPOST_SMTP_TO")?
        .split(',')
        .map(|addr| addr.trim().to_string())
        .filter(|addr| !addr.is_empty())
        .collect();
    let username = var("WATCHPOST_SMTP_USER");
    let from = var("WATCHPOST_SMTP_FROM")
        .or_else(|| username.clone())
        .unwrap_or_else(|| "watchpost@localhost".to_string());

    let mut email = EmailConfig::new(host, from, to);
    if let Some(port) = var("WATCHPOST_SMTP_PORT").and_then(|p| p.parse().ok()) {
        email.port = port;
    }
    email.starttls = !matches!(var("WATCHPOST_SMTP_STARTTLS").as_deref(), Some("0" | "false"));
    email.username = username;
    email.password = var("WATCHPOST_SMTP_PASSWORD");
    email.clip_url_base = var("WATCHPOST_CLIP_URL");
    Some(email)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env();

    info!("Watchpost starting");
    info!("  Command listener: {}", config.bind);
    info!("  Settings: {:?}", config.settings_path);
    info!("  Artifacts: {:?}", config.artifacts_dir);
    info!("  Capture cycle: {}ms", config.cycle.as_millis());

    let store = SettingsStore::new(&config.settings_path);
    let mut settings = store.load().context("Failed to load settings")?;
    if !store.exists() {
        store
            .save(&settings)
            .context("Failed to write default settings")?;
    }
    info!(
        resolution = %settings.resolution,
        sensitivity = settings.sensitivity,
        arm = settings.schedule.arm,
        disarm = settings.schedule.disarm,
        "Settings loaded"
    );

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let artifacts = ArtifactStore::new(ArtifactConfig {
        dir: config.artifacts_dir.clone(),
        ..Default::default()
    })
    .context("Failed to prepare artifact directory")?;
    let dispatcher = Dispatcher::new(build_sink(&config)?, Arc::new(artifacts), tracker.clone());
    let signal = build_signal(&config);

    let server = CommandServer::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind command listener on {}", config.bind))?;

    let source = open_source(&config, &mut settings).await?;

    let engine_config = EngineConfig {
        cycle: config.cycle,
        ..Default::default()
    };
    let (engine, handle) = Engine::new(engine_config, settings, source, dispatcher, signal);

    tracker.spawn(engine.run(cancel.clone()));
    tracker.spawn(server.run(handle.clone(), cancel.clone(), tracker.clone()));
    tracker.spawn(log_previews(handle.subscribe_preview(), cancel.clone()));

    run(handle, store, config, cancel, tracker).await
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("watchpost=info".parse().unwrap()),
        )
        .init();
}

fn build_sink(config: &Config) -> Result<Arc<dyn NotificationSink>> {
    let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(LogSink)];

    match &config.webhook_url {
        Some(url) => {
            let webhook =
                WebhookSink::new(WebhookConfig::new(url)).context("Failed to build webhook client")?;
            sinks.push(Arc::new(webhook));
        }
        None => info!("  Webhook: disabled (set WATCHPOST_WEBHOOK_URL to enable)"),
    }

    match &config.email {
        Some(email) => {
            let sink = EmailSink::new(email.clone()).context("Failed to configure email")?;
            sinks.push(Arc::new(sink));
        }
        None => info!("  Email: disabled (set WATCHPOST_SMTP_HOST and WATCHPOST_SMTP_TO to enable)"),
    }

    Ok(Arc::new(FanoutSink::new(sinks)))
}

fn build_signal(config: &Config) -> Arc<dyn AlarmSignal> {
    match (&config.alarm_sound, config.no_siren) {
        (Some(sound), false) => {
            info!("  Alarm sound: {:?} via {}", sound, config.alarm_player);
            Arc::new(CommandSignal::new(config.alarm_player.clone(), sound.clone()))
        }
        (_, true) => {
            info!("  Alarm sound: disabled (--no-siren)");
            Arc::new(SilentSignal::default())
        }
        (None, false) => {
            info!("  Alarm sound: none (set WATCHPOST_ALARM_SOUND to enable)");
            Arc::new(SilentSignal::default())
        }
    }
}

/// Open the configured camera, falling back to the first one present.
///
/// Fails when there is no camera at all or it produces no frame in time.
async fn open_source(config: &Config, settings: &mut Settings) -> Result<Box<dyn FrameSource>> {
    if config.test_source {
        let (source, _control) = watchpost::capture::SyntheticSource::new(settings.resolution);
        info!("Using synthetic frame source ({})", settings.resolution);
        return Ok(Box::new(source));
    }

    let devices = list_devices();
    let Some(&first) = devices.first() else {
        bail!("No capture device found (checked /dev/video0-9)");
    };

    if !devices.contains(&settings.camera_index) {
        warn!(
            configured = settings.camera_index,
            using = first,
            "Configured camera not present, falling back"
        );
        settings.camera_index = first;
    }

    let source = open_device(settings).await?;
    Ok(Box::new(source))
}

async fn open_device(settings: &Settings) -> Result<DeviceSource> {
    let mut source = DeviceSource::open(VideoCaptureConfig::for_device(
        settings.camera_index,
        settings.resolution,
    ))
    .context("Failed to start camera capture")?;

    source
        .wait_for_first_frame(FIRST_FRAME_TIMEOUT)
        .await
        .with_context(|| format!("Camera {} produced no frames", settings.camera_index))?;

    info!("Camera ready: {}", source.describe());
    Ok(source)
}

/// Log motion regions (the headless stand-in for a display)
async fn log_previews(mut preview: watch::Receiver<Option<Arc<Preview>>>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = preview.changed() => {
                if changed.is_err() {
                    break;
                }
                let latest = preview.borrow_and_update().clone();
                if let Some(p) = latest.filter(|p| p.motion && !p.regions.is_empty()) {
                    debug!(
                        score = p.score.unwrap_or(0),
                        regions = ?p.regions,
                        state = %p.state,
                        "Motion regions"
                    );
                }
            }
        }
    }
}

/// Re-read settings.json and push it into the running engine
async fn reload_settings(handle: &EngineHandle, store: &SettingsStore, config: &Config) {
    let mut settings = match store.load() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Settings reload failed, keeping current settings: {}", e);
            return;
        }
    };

    let current = match handle.settings().await {
        Ok(current) => current,
        Err(e) => {
            error!("Engine unavailable during reload: {}", e);
            return;
        }
    };

    let capture_changed = settings.resolution != current.resolution
        || settings.camera_index != current.camera_index;

    if capture_changed {
        if let Err(e) = switch_source(handle, &settings, &current, config).await {
            error!("Camera change failed: {:#}", e);
            settings.resolution = current.resolution;
            settings.camera_index = current.camera_index;
        }
    }

    // A new resolution without a new sensitivity gets the default for its size
    if settings.resolution != current.resolution && settings.sensitivity == current.sensitivity {
        let resolution = settings.resolution;
        settings.set_resolution(resolution);
        info!(sensitivity = settings.sensitivity, "Sensitivity reset for {}", resolution);
    }

    if let Err(e) = handle.apply_settings(settings).await {
        error!("Failed to apply settings: {}", e);
    }
}

/// Install a source for `next`, reopening `current` if that fails
async fn switch_source(
    handle: &EngineHandle,
    next: &Settings,
    current: &Settings,
    config: &Config,
) -> Result<()> {
    if config.test_source {
        let (source, _control) = watchpost::capture::SyntheticSource::new(next.resolution);
        handle.replace_source(source).await?;
        return Ok(());
    }

    // ffmpeg cannot open a device the running capture still holds
    let same_device = next.camera_index == current.camera_index;
    if same_device {
        handle.release_source().await?;
    }

    match open_device(next).await {
        Ok(source) => {
            handle.replace_source(source).await?;
            Ok(())
        }
        Err(e) if same_device => {
            warn!("Reopening camera with previous settings");
            let previous = open_device(current)
                .await
                .context("Failed to reopen camera with previous settings")?;
            handle.replace_source(previous).await?;
            Err(e)
        }
        Err(e) => Err(e),
    }
}

/// Wait for shutdown, reloading settings on SIGHUP
async fn run(
    handle: EngineHandle,
    store: SettingsStore,
    config: Config,
    cancel: CancellationToken,
    tracker: TaskTracker,
) -> Result<()> {
    tracker.close();
    let mut reloads = Reloads::install()?;

    info!("Watchpost running, send commands to {}", config.bind);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                cancel.cancel();
                break;
            }
            _ = reloads.next() => {
                info!("Reloading settings from {:?}", store.path());
                reload_settings(&handle, &store, &config).await;
            }
        }
    }

    drop(handle);
    if tokio::time::timeout(Duration::from_secs(5), tracker.wait())
        .await
        .is_err()
    {
        warn!("Shutdown timed out after 5s, abandoning pending notifications");
    }
    Ok(())
}

/// SIGHUP stream (never fires off unix)
struct Reloads {
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
}

impl Reloads {
    #[cfg(unix)]
    fn install() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        let hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
        Ok(Self { hangup })
    }

    #[cfg(not(unix))]
    fn install() -> Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn next(&mut self) {
        if self.hangup.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }

    #[cfg(not(unix))]
    async fn next(&mut self) {
        std::future::pending::<()>().await;
    }
}
