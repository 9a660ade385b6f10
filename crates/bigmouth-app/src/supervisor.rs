//! Supervision: spawns the pipeline tasks, restarts the ones that die while
//! the session is still live, serializes out-of-band announcements, reacts
//! to the inactivity timeout, drives torso transitions, and owns the
//! idempotent shutdown sequence.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bigmouth_motion::{
    Actuator, MouthConfig, MouthController, MouthDrive, MouthDriveConfig, TorsoConfig,
    TorsoDriver, TorsoState,
};
use bigmouth_sonic::{
    playback_queue, AudioChunk, PlaybackConsumer, QueueDepth, Role, SessionEvent, SonicSession,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::AudioBackend;
use crate::pipeline::{
    run_capture, run_idle_wag, run_inactivity_monitor, run_mouth, run_playback, ActivitySignals,
    CaptureConfig, PlaybackConfig,
};

/// Depth of the playback → mouth hand-off channel. One chunk in flight plus
/// one queued bounds how far actuation may lag playback.
const MOUTH_CHANNEL_CAPACITY: usize = 1;

/// How long a cancelled task gets to run its cleanup before being aborted.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// A supervised task: name, cancellation signal, liveness.
pub struct TaskHandle {
    name: &'static str,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub fn spawn<F, Fut>(name: &'static str, parent: &CancellationToken, task: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let cancel = parent.child_token();
        let join = tokio::spawn(task(cancel.clone()));
        Self { name, cancel, join }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request cancellation without waiting.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait for cleanup, aborting only if the grace period runs
    /// out. Cancellation is not fire-and-forget: tasks close blocks and
    /// release devices on their way down.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if tokio::time::timeout(STOP_GRACE, &mut self.join).await.is_err() {
            warn!(task = self.name, "task ignored cancellation; aborting");
            self.join.abort();
        }
    }
}

/// Everything actuation-related the supervisor needs at construction time.
pub struct MotionParts {
    pub mouth_actuator: Arc<dyn Actuator>,
    pub torso_actuator: Arc<dyn Actuator>,
    pub mouth: MouthConfig,
    pub mouth_drive: MouthDriveConfig,
    pub torso: TorsoConfig,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub tick: Duration,
    pub inactivity_timeout: Duration,
    /// Announced once at startup, if set.
    pub greeting: Option<String>,
    /// Announced when the inactivity timeout fires.
    pub goodbye: String,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            inactivity_timeout: Duration::from_secs(30),
            greeting: None,
            goodbye: "Nobody has spoken for a while. Say a short, friendly goodbye and go quiet."
                .to_string(),
            capture: CaptureConfig::default(),
            playback: PlaybackConfig::default(),
        }
    }
}

/// Hand for enqueueing out-of-band announcements. One pending slot: the
/// supervisor drains at most one per tick and newer requests replace older
/// unsent ones.
#[derive(Clone)]
pub struct Announcer(Arc<StdMutex<Option<String>>>);

impl Announcer {
    pub fn announce(&self, text: impl Into<String>) {
        *self.0.lock().unwrap() = Some(text.into());
    }
}

pub struct Supervisor {
    session: Arc<SonicSession>,
    backend: Arc<dyn AudioBackend>,
    config: SupervisorConfig,

    signals: Arc<ActivitySignals>,
    torso: Arc<TorsoDriver>,
    mouth_controller: Arc<StdMutex<MouthController>>,
    mouth_drive: Arc<Mutex<MouthDrive>>,

    queue: Arc<Mutex<PlaybackConsumer>>,
    queue_depth: QueueDepth,
    producer: Option<bigmouth_sonic::PlaybackProducer>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    events_tx: Option<mpsc::UnboundedSender<SessionEvent>>,

    mouth_tx: mpsc::Sender<AudioChunk>,
    mouth_rx: Arc<Mutex<mpsc::Receiver<AudioChunk>>>,

    announcement: Arc<StdMutex<Option<String>>>,

    // Task handles; replaced in place on restart.
    receive: Option<TaskHandle>,
    capture: Option<TaskHandle>,
    playback: Option<TaskHandle>,
    mouth: Option<TaskHandle>,
    idle_wag: Option<TaskHandle>,
    inactivity: Option<TaskHandle>,

    root: CancellationToken,
    last_chunk_seen: Option<Instant>,
    torso_was: TorsoState,
    shutdown_done: bool,
}

impl Supervisor {
    pub fn new(
        session: Arc<SonicSession>,
        backend: Arc<dyn AudioBackend>,
        config: SupervisorConfig,
        motion: MotionParts,
    ) -> Self {
        let (producer, consumer) = playback_queue();
        let queue_depth = producer.depth();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (mouth_tx, mouth_rx) = mpsc::channel(MOUTH_CHANNEL_CAPACITY);

        Self {
            session,
            backend,
            config,
            signals: Arc::new(ActivitySignals::new()),
            torso: Arc::new(TorsoDriver::new(motion.torso_actuator, motion.torso)),
            mouth_controller: Arc::new(StdMutex::new(MouthController::new(motion.mouth))),
            mouth_drive: Arc::new(Mutex::new(MouthDrive::new(
                motion.mouth_actuator,
                motion.mouth_drive,
            ))),
            queue: Arc::new(Mutex::new(consumer)),
            queue_depth,
            producer: Some(producer),
            events_rx,
            events_tx: Some(events_tx),
            mouth_tx,
            mouth_rx: Arc::new(Mutex::new(mouth_rx)),
            announcement: Arc::new(StdMutex::new(None)),
            receive: None,
            capture: None,
            playback: None,
            mouth: None,
            idle_wag: None,
            inactivity: None,
            root: CancellationToken::new(),
            last_chunk_seen: None,
            torso_was: TorsoState::Rest,
            shutdown_done: false,
        }
    }

    pub fn announcer(&self) -> Announcer {
        Announcer(Arc::clone(&self.announcement))
    }

    /// Run until the shutdown token fires or the session dies, then execute
    /// the shutdown sequence. The sequence also runs if the loop exits for
    /// any other reason; it is idempotent.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let (expired_tx, mut expired_rx) = mpsc::channel(1);
        self.spawn_all(expired_tx);

        if let Some(greeting) = self.config.greeting.clone() {
            self.announcer().announce(greeting);
        }

        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested");
                    break;
                }
                _ = interval.tick() => {
                    if !self.session.is_active() {
                        warn!("session no longer active; beginning shutdown");
                        break;
                    }
                    self.tick(&mut expired_rx).await;
                }
            }
        }

        self.shutdown_all().await;
    }

    fn spawn_all(&mut self, expired_tx: mpsc::Sender<()>) {
        let producer = self
            .producer
            .take()
            .expect("supervisor can only be started once");
        let events_tx = self.events_tx.take().expect("events channel already taken");

        self.receive = Some(TaskHandle::spawn("receive", &self.root, {
            let session = Arc::clone(&self.session);
            move |cancel| async move {
                session.run_receive_loop(producer, events_tx, cancel).await;
            }
        }));
        self.capture = Some(self.spawn_capture());
        self.playback = Some(self.spawn_playback());
        self.mouth = Some(self.spawn_mouth());
        self.idle_wag = Some(TaskHandle::spawn("idle-wag", &self.root, {
            let torso = Arc::clone(&self.torso);
            let signals = Arc::clone(&self.signals);
            move |cancel| run_idle_wag(torso, signals, cancel)
        }));
        self.inactivity = Some(TaskHandle::spawn("inactivity", &self.root, {
            let signals = Arc::clone(&self.signals);
            let timeout = self.config.inactivity_timeout;
            move |cancel| run_inactivity_monitor(signals, timeout, expired_tx, cancel)
        }));
    }

    fn spawn_capture(&self) -> TaskHandle {
        TaskHandle::spawn("capture", &self.root, {
            let session = Arc::clone(&self.session);
            let backend = Arc::clone(&self.backend);
            let config = self.config.capture.clone();
            move |cancel| run_capture(session, backend, config, cancel)
        })
    }

    fn spawn_playback(&self) -> TaskHandle {
        TaskHandle::spawn("playback", &self.root, {
            let queue = Arc::clone(&self.queue);
            let backend = Arc::clone(&self.backend);
            let config = self.config.playback.clone();
            let mouth_tx = self.mouth_tx.clone();
            let signals = Arc::clone(&self.signals);
            move |cancel| run_playback(queue, backend, config, mouth_tx, signals, cancel)
        })
    }

    fn spawn_mouth(&self) -> TaskHandle {
        TaskHandle::spawn("mouth", &self.root, {
            let chunks = Arc::clone(&self.mouth_rx);
            let controller = Arc::clone(&self.mouth_controller);
            let drive = Arc::clone(&self.mouth_drive);
            move |cancel| run_mouth(chunks, controller, drive, cancel)
        })
    }

    async fn tick(&mut self, expired_rx: &mut mpsc::Receiver<()>) {
        self.restart_dead_tasks();
        self.drain_transcripts();
        self.drain_announcement().await;
        if expired_rx.try_recv().is_ok() {
            self.on_inactivity();
        }
        self.drive_torso();
    }

    /// Restart unexpectedly-dead pipeline tasks, at most once per tick each.
    fn restart_dead_tasks(&mut self) {
        if self.signals.capture_active()
            && self.capture.as_ref().is_some_and(TaskHandle::is_finished)
        {
            warn!("capture task ended unexpectedly; restarting");
            self.capture = Some(self.spawn_capture());
        }
        if self.playback.as_ref().is_some_and(TaskHandle::is_finished) {
            warn!("playback task ended unexpectedly; restarting");
            self.playback = Some(self.spawn_playback());
        }
        if self.mouth.as_ref().is_some_and(TaskHandle::is_finished) {
            warn!("mouth worker ended unexpectedly; restarting");
            self.mouth = Some(self.spawn_mouth());
        }
    }

    fn drain_transcripts(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.signals.note_activity();
            match event {
                SessionEvent::UserText(text) => info!(text = %text, "user"),
                SessionEvent::AssistantText { text, speculative } => {
                    if speculative {
                        debug!(text = %text, "assistant (preview)");
                    } else {
                        info!(text = %text, "assistant");
                    }
                }
            }
        }
    }

    /// Send at most one pending out-of-band announcement per tick, without
    /// touching the audio content lifecycle.
    async fn drain_announcement(&mut self) {
        let pending = self.announcement.lock().unwrap().take();
        if let Some(text) = pending {
            debug!("sending announcement");
            if let Err(e) = self.session.send_text_turn(Role::User, &text).await {
                warn!(error = %e, "announcement failed");
            }
        }
    }

    /// Inactivity expiry is a scripted transition: stop listening, ask the
    /// model to say goodbye. Playback stays up so the goodbye is heard.
    fn on_inactivity(&mut self) {
        info!("deactivating capture after inactivity");
        self.signals.set_capture_active(false);
        if let Some(capture) = &self.capture {
            capture.cancel();
        }
        self.announcement
            .lock()
            .unwrap()
            .replace(self.config.goodbye.clone());
    }

    fn drive_torso(&mut self) {
        let now = Instant::now();
        if let Some(last_chunk) = self.signals.last_chunk() {
            if self.last_chunk_seen != Some(last_chunk) {
                self.last_chunk_seen = Some(last_chunk);
                self.torso.note_audio(now);
            }
        }
        self.torso.tick(now, self.queue_depth.is_empty());

        // The assistant utterance is over once the torso starts returning;
        // reset the amplitude window so turns do not bleed together.
        let state = self.torso.state();
        if state == TorsoState::Returning && self.torso_was == TorsoState::Active {
            self.mouth_controller.lock().unwrap().reset();
        }
        self.torso_was = state;
    }

    /// Shutdown sequence: close the engine, cancel and await every task,
    /// zero both actuators. Runs once no matter how often it is reached.
    async fn shutdown_all(&mut self) {
        if self.shutdown_done {
            return;
        }
        self.shutdown_done = true;
        info!("shutting down");

        if let Err(e) = self.session.close().await {
            warn!(error = %e, "session close reported an error");
        }
        for handle in [
            self.capture.take(),
            self.playback.take(),
            self.mouth.take(),
            self.receive.take(),
            self.idle_wag.take(),
            self.inactivity.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.stop().await;
        }
        self.mouth_drive.lock().await.stop();
        self.torso.stop();
        info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{InputHandle, OutputHandle};
    use crate::error::AppError;
    use bigmouth_motion::NullActuator;
    use bigmouth_sonic::transport::split_stream;
    use bigmouth_sonic::{EventSource, SessionConfig};

    struct ScriptedBackend {
        inputs: StdMutex<Vec<InputHandle>>,
        outputs: StdMutex<Vec<(u32, OutputHandle)>>,
    }

    impl ScriptedBackend {
        fn new() -> Self {
            Self {
                inputs: StdMutex::new(Vec::new()),
                outputs: StdMutex::new(Vec::new()),
            }
        }
    }

    impl AudioBackend for ScriptedBackend {
        fn open_input(
            &self,
            _sample_rate: u32,
            _frame_size: usize,
            _device_index: Option<usize>,
        ) -> Result<InputHandle, AppError> {
            let mut inputs = self.inputs.lock().unwrap();
            if inputs.is_empty() {
                Err(AppError::AudioDevice("no scripted input left".to_string()))
            } else {
                Ok(inputs.remove(0))
            }
        }

        fn open_output(
            &self,
            sample_rate: u32,
            _device_index: Option<usize>,
        ) -> Result<OutputHandle, AppError> {
            let mut outputs = self.outputs.lock().unwrap();
            match outputs.iter().position(|(rate, _)| *rate == sample_rate) {
                Some(pos) => Ok(outputs.remove(pos).1),
                None => Err(AppError::AudioDevice("no scripted output".to_string())),
            }
        }
    }

    fn motion_parts() -> MotionParts {
        MotionParts {
            mouth_actuator: Arc::new(NullActuator),
            torso_actuator: Arc::new(NullActuator),
            mouth: MouthConfig::default(),
            mouth_drive: MouthDriveConfig::default(),
            torso: TorsoConfig::default(),
        }
    }

    async fn drain_prelude(source: &mut Box<dyn EventSource>) {
        for _ in 0..5 {
            source.next_event().await.unwrap().unwrap();
        }
    }

    fn event_name(bytes: &[u8]) -> String {
        let v: serde_json::Value = serde_json::from_slice(bytes).unwrap();
        v["event"]
            .as_object()
            .unwrap()
            .keys()
            .next()
            .unwrap()
            .to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_restarts_dead_capture_and_shuts_down_cleanly() {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let (sink, source) = split_stream(client);
        let session = Arc::new(SonicSession::from_parts(
            sink,
            source,
            SessionConfig::default(),
        ));
        session.open_session().await.unwrap();
        let (_peer_sink, mut peer_source) = split_stream(server);
        drain_prelude(&mut peer_source).await;

        let backend = Arc::new(ScriptedBackend::new());
        // First capture device dies immediately (closed channel); the
        // supervisor must restart capture with the second one.
        let (dead_tx, dead_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        drop(dead_tx);
        let (_live_tx, live_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        backend
            .inputs
            .lock()
            .unwrap()
            .extend([InputHandle::from_channel(dead_rx), InputHandle::from_channel(live_rx)]);
        let (out_tx, _out_rx) = mpsc::channel(64);
        backend
            .outputs
            .lock()
            .unwrap()
            .push((24_000, OutputHandle::from_channel(out_tx, 24_000)));

        let supervisor = Supervisor::new(
            Arc::clone(&session),
            backend,
            SupervisorConfig::default(),
            motion_parts(),
        );
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(supervisor.run(shutdown.clone()));

        // First capture: open + immediate close when the device dies.
        assert_eq!(event_name(&peer_source.next_event().await.unwrap().unwrap()), "contentStart");
        assert_eq!(event_name(&peer_source.next_event().await.unwrap().unwrap()), "contentEnd");
        // Restarted capture opens a fresh block.
        assert_eq!(event_name(&peer_source.next_event().await.unwrap().unwrap()), "contentStart");

        shutdown.cancel();
        run.await.unwrap();

        // Shutdown closed the open block and ended prompt and session.
        assert_eq!(event_name(&peer_source.next_event().await.unwrap().unwrap()), "promptEnd");
        assert_eq!(event_name(&peer_source.next_event().await.unwrap().unwrap()), "sessionEnd");
        assert!(!session.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn inactivity_deactivates_capture_and_sends_goodbye() {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let (sink, source) = split_stream(client);
        let session = Arc::new(SonicSession::from_parts(
            sink,
            source,
            SessionConfig::default(),
        ));
        session.open_session().await.unwrap();
        let (_peer_sink, mut peer_source) = split_stream(server);
        drain_prelude(&mut peer_source).await;

        let backend = Arc::new(ScriptedBackend::new());
        let (_live_tx, live_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        backend
            .inputs
            .lock()
            .unwrap()
            .push(InputHandle::from_channel(live_rx));
        let (out_tx, _out_rx) = mpsc::channel(64);
        backend
            .outputs
            .lock()
            .unwrap()
            .push((24_000, OutputHandle::from_channel(out_tx, 24_000)));

        let config = SupervisorConfig {
            inactivity_timeout: Duration::from_secs(5),
            ..SupervisorConfig::default()
        };
        let supervisor = Supervisor::new(Arc::clone(&session), backend, config, motion_parts());
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(supervisor.run(shutdown.clone()));

        // Capture opens its block.
        assert_eq!(event_name(&peer_source.next_event().await.unwrap().unwrap()), "contentStart");
        // After the timeout: the cancelled capture closes its block, then
        // the goodbye announcement goes out as a full text turn.
        assert_eq!(event_name(&peer_source.next_event().await.unwrap().unwrap()), "contentEnd");
        let bytes = peer_source.next_event().await.unwrap().unwrap();
        assert_eq!(event_name(&bytes), "contentStart");
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["event"]["contentStart"]["type"], "TEXT");
        assert_eq!(v["event"]["contentStart"]["role"], "USER");
        let bytes = peer_source.next_event().await.unwrap().unwrap();
        assert_eq!(event_name(&bytes), "textInput");
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(v["event"]["textInput"]["content"]
            .as_str()
            .unwrap()
            .contains("goodbye"));
        assert_eq!(event_name(&peer_source.next_event().await.unwrap().unwrap()), "contentEnd");

        shutdown.cancel();
        run.await.unwrap();
    }
}
