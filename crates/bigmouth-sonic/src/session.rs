//! Bidirectional session engine.
//!
//! Owns the event stream for one conversation: serializes outbound
//! session/prompt/content lifecycle events and demultiplexes inbound events
//! into a text stream (final and speculative transcripts) and the playback
//! queue. The engine never restarts itself; when the transport dies the
//! receive loop terminates and the supervisor decides what happens next.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::error::{SonicError, SonicResult};
use crate::events::{
    self, AudioInputConfiguration, AudioOutputConfiguration, ContentKind, InboundEnvelope,
    InferenceConfiguration, OutboundEvent, Role, TextInputConfiguration, TextOutputConfiguration,
};
use crate::queue::PlaybackProducer;
use crate::transport::{Connector, EventSink, EventSource};

/// Canonical microphone rate accepted by the model.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Canonical rate of synthesized speech coming back.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Session parameters: inference knobs plus the declared audio formats.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_tokens: u32,
    pub top_p: f64,
    pub temperature: f64,
    pub voice_id: String,
    pub system_prompt: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            top_p: 0.9,
            temperature: 0.7,
            voice_id: "matthew".to_string(),
            system_prompt: "You are a friendly robot assistant. Keep your responses short \
                            and natural, generally two or three sentences. You are speaking \
                            out loud, so be conversational."
                .to_string(),
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
        }
    }
}

/// Lifecycle of one session. Transitions are one-way except `Streaming`,
/// which is re-entered for every user utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    SessionOpen,
    PromptOpen,
    SystemPromptDelivered,
    Streaming,
    Closing,
    Closed,
}

/// Demultiplexed text output from the receive loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Transcription of the user's speech.
    UserText(String),
    /// Assistant text; `speculative` marks a streaming draft that has not
    /// been finalized and must stay distinguishable from final output.
    AssistantText { text: String, speculative: bool },
}

struct ProtocolState {
    state: SessionState,
    /// Name of the currently open USER/AUDIO content block, if any.
    audio_content: Option<String>,
}

/// One bidirectional streaming conversation.
pub struct SonicSession {
    config: SessionConfig,
    prompt_name: String,
    sink: Mutex<Box<dyn EventSink>>,
    source: StdMutex<Option<Box<dyn EventSource>>>,
    protocol: StdMutex<ProtocolState>,
    active: AtomicBool,
}

impl SonicSession {
    /// Establish the transport and wrap it in a fresh session. Connection
    /// failures are fatal and propagate to the caller; there is no retry.
    pub async fn connect(connector: &dyn Connector, config: SessionConfig) -> SonicResult<Self> {
        let (sink, source) = connector.connect().await?;
        info!("transport connected");
        Ok(Self::from_parts(sink, source, config))
    }

    /// Build a session from pre-established transport halves.
    pub fn from_parts(
        sink: Box<dyn EventSink>,
        source: Box<dyn EventSource>,
        config: SessionConfig,
    ) -> Self {
        Self {
            config,
            prompt_name: Uuid::new_v4().to_string(),
            sink: Mutex::new(sink),
            source: StdMutex::new(Some(source)),
            protocol: StdMutex::new(ProtocolState {
                state: SessionState::Connected,
                audio_content: None,
            }),
            active: AtomicBool::new(true),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        self.protocol.lock().unwrap().state
    }

    fn set_state(&self, state: SessionState) {
        self.protocol.lock().unwrap().state = state;
    }

    async fn send_event(&self, event: &OutboundEvent) -> SonicResult<()> {
        let payload = events::encode(event)?;
        self.sink.lock().await.send(&payload).await
    }

    /// Initialize the session: inference configuration, prompt declaration
    /// (text plus fixed-format audio output), then the system instruction as
    /// a complete SYSTEM/TEXT content block.
    pub async fn open_session(&self) -> SonicResult<()> {
        if self.state() != SessionState::Connected {
            return Err(SonicError::Protocol(format!(
                "open_session requires a freshly connected transport (state: {:?})",
                self.state()
            )));
        }

        info!(voice = %self.config.voice_id, "starting speech session");
        self.send_event(&OutboundEvent::SessionStart {
            inference_configuration: InferenceConfiguration {
                max_tokens: self.config.max_tokens,
                top_p: self.config.top_p,
                temperature: self.config.temperature,
            },
        })
        .await?;
        self.set_state(SessionState::SessionOpen);

        self.send_event(&OutboundEvent::PromptStart {
            prompt_name: self.prompt_name.clone(),
            text_output_configuration: TextOutputConfiguration::plain(),
            audio_output_configuration: AudioOutputConfiguration::lpcm(
                self.config.output_sample_rate,
                &self.config.voice_id,
            ),
        })
        .await?;
        self.set_state(SessionState::PromptOpen);

        let system_prompt = self.config.system_prompt.clone();
        self.send_text_block(Role::System, &system_prompt).await?;
        self.set_state(SessionState::SystemPromptDelivered);
        info!("speech session started");
        Ok(())
    }

    /// Open the USER/AUDIO content block for one utterance. At most one
    /// audio block may be open at a time; a second open before the prior
    /// close is a protocol violation.
    pub async fn open_audio_input(&self) -> SonicResult<()> {
        let content_name = Uuid::new_v4().to_string();
        {
            let mut p = self.protocol.lock().unwrap();
            if !matches!(
                p.state,
                SessionState::SystemPromptDelivered | SessionState::Streaming
            ) {
                return Err(SonicError::Protocol(format!(
                    "audio input requires an initialized session (state: {:?})",
                    p.state
                )));
            }
            if p.audio_content.is_some() {
                return Err(SonicError::Protocol(
                    "audio input content block already open".to_string(),
                ));
            }
            p.audio_content = Some(content_name.clone());
            p.state = SessionState::Streaming;
        }

        let result = self
            .send_event(&OutboundEvent::ContentStart {
                prompt_name: self.prompt_name.clone(),
                content_name: content_name.clone(),
                kind: ContentKind::Audio,
                interactive: true,
                role: Role::User,
                text_input_configuration: None,
                audio_input_configuration: Some(AudioInputConfiguration::lpcm(
                    self.config.input_sample_rate,
                )),
            })
            .await;
        if let Err(e) = result {
            self.protocol.lock().unwrap().audio_content = None;
            return Err(e);
        }
        debug!(content = %content_name, "audio input block opened");
        Ok(())
    }

    /// Forward one microphone frame. Silently dropped when the session is
    /// no longer active or no audio block is open; capture must never feel
    /// backpressure from a dying session.
    pub async fn send_audio_frame(&self, pcm: &[u8]) -> SonicResult<()> {
        if !self.is_active() {
            return Ok(());
        }
        let Some(content_name) = self.protocol.lock().unwrap().audio_content.clone() else {
            trace!("audio frame dropped: no open audio content block");
            return Ok(());
        };
        self.send_event(&OutboundEvent::AudioInput {
            prompt_name: self.prompt_name.clone(),
            content_name,
            content: events::encode_audio_payload(pcm),
        })
        .await
    }

    /// Close the open audio block, ending the current utterance. Idempotent:
    /// calling without an open block is a no-op.
    pub async fn close_audio_input(&self) -> SonicResult<()> {
        let Some(content_name) = self.protocol.lock().unwrap().audio_content.take() else {
            return Ok(());
        };
        self.send_event(&OutboundEvent::ContentEnd {
            prompt_name: self.prompt_name.clone(),
            content_name: content_name.clone(),
        })
        .await?;
        debug!(content = %content_name, "audio input block closed");
        Ok(())
    }

    /// Send a complete out-of-band text turn (start, payload, end) without
    /// disturbing the audio content lifecycle.
    pub async fn send_text_turn(&self, role: Role, text: &str) -> SonicResult<()> {
        if !matches!(
            self.state(),
            SessionState::SystemPromptDelivered | SessionState::Streaming
        ) {
            return Err(SonicError::Protocol(format!(
                "text turn requires an initialized session (state: {:?})",
                self.state()
            )));
        }
        self.send_text_block(role, text).await
    }

    async fn send_text_block(&self, role: Role, text: &str) -> SonicResult<()> {
        let content_name = Uuid::new_v4().to_string();
        self.send_event(&OutboundEvent::ContentStart {
            prompt_name: self.prompt_name.clone(),
            content_name: content_name.clone(),
            kind: ContentKind::Text,
            interactive: false,
            role,
            text_input_configuration: Some(TextInputConfiguration::plain()),
            audio_input_configuration: None,
        })
        .await?;
        self.send_event(&OutboundEvent::TextInput {
            prompt_name: self.prompt_name.clone(),
            content_name: content_name.clone(),
            content: text.to_string(),
        })
        .await?;
        self.send_event(&OutboundEvent::ContentEnd {
            prompt_name: self.prompt_name.clone(),
            content_name,
        })
        .await?;
        Ok(())
    }

    /// Run the inbound dispatch loop until the session goes inactive, the
    /// peer closes the stream, or the token is cancelled. Decoded audio goes
    /// to the playback queue; text goes out on the event channel.
    pub async fn run_receive_loop(
        &self,
        audio: PlaybackProducer,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
        cancel: CancellationToken,
    ) {
        let mut source = match self.source.lock().unwrap().take() {
            Some(s) => s,
            None => {
                warn!("receive loop already consumed the event source");
                return;
            }
        };

        let mut current_role: Option<Role> = None;
        let mut speculative = false;
        info!("receive loop started");

        while self.is_active() {
            let raw = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("receive loop cancelled");
                    break;
                }
                r = source.next_event() => r,
            };
            match raw {
                Ok(Some(bytes)) => {
                    let envelope: InboundEnvelope = match serde_json::from_slice(&bytes) {
                        Ok(env) => env,
                        Err(e) => {
                            warn!(error = %e, "skipping malformed inbound event");
                            continue;
                        }
                    };
                    let Some(body) = envelope.event else { continue };

                    if let Some(cs) = body.content_start {
                        current_role = Some(cs.role);
                        speculative = cs.is_speculative();
                    }
                    if let Some(text) = body.text_output {
                        match current_role {
                            Some(Role::User) => {
                                let _ = events_tx.send(SessionEvent::UserText(text.content));
                            }
                            Some(Role::Assistant) => {
                                let _ = events_tx.send(SessionEvent::AssistantText {
                                    text: text.content,
                                    speculative,
                                });
                            }
                            _ => {}
                        }
                    }
                    if let Some(out) = body.audio_output {
                        match out.decode() {
                            Ok(pcm) => {
                                if !audio.push(pcm) {
                                    debug!("playback queue gone; dropping audio");
                                }
                            }
                            Err(e) => warn!(error = %e, "skipping undecodable audio payload"),
                        }
                    }
                }
                Ok(None) => {
                    info!("peer closed the event stream");
                    self.active.store(false, Ordering::SeqCst);
                    break;
                }
                Err(e) => {
                    error!(error = %e, "transport error in receive loop");
                    self.active.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
        debug!("receive loop ended");
    }

    /// End the session: prompt-end, session-end, transport shutdown.
    /// Idempotent. Teardown failures are suppressed once the session is
    /// already inactive (the stream is expected to be half-dead by then) and
    /// reported only when the session was still live.
    pub async fn close(&self) -> SonicResult<()> {
        {
            let mut p = self.protocol.lock().unwrap();
            if matches!(p.state, SessionState::Closing | SessionState::Closed) {
                return Ok(());
            }
            p.state = SessionState::Closing;
        }
        let was_active = self.active.swap(false, Ordering::SeqCst);
        info!("closing speech session");

        let result = self.close_inner().await;
        self.set_state(SessionState::Closed);
        match result {
            Ok(()) => Ok(()),
            Err(e) if was_active => Err(e),
            Err(e) => {
                debug!(error = %e, "suppressed teardown error on inactive session");
                Ok(())
            }
        }
    }

    async fn close_inner(&self) -> SonicResult<()> {
        self.send_event(&OutboundEvent::PromptEnd {
            prompt_name: self.prompt_name.clone(),
        })
        .await?;
        self.send_event(&OutboundEvent::SessionEnd {}).await?;
        self.sink.lock().await.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::playback_queue;
    use crate::transport::split_stream;
    use std::sync::Arc;

    struct Peer {
        sink: Box<dyn EventSink>,
        source: Box<dyn EventSource>,
    }

    impl Peer {
        async fn next_json(&mut self) -> Option<serde_json::Value> {
            let bytes = self.source.next_event().await.unwrap()?;
            Some(serde_json::from_slice(&bytes).unwrap())
        }

        async fn expect_event(&mut self, name: &str) -> serde_json::Value {
            let v = self.next_json().await.expect("stream closed early");
            let event = v["event"].as_object().unwrap();
            assert_eq!(event.len(), 1, "one event per envelope");
            assert!(
                event.contains_key(name),
                "expected {name}, got {:?}",
                event.keys().collect::<Vec<_>>()
            );
            v["event"][name].clone()
        }
    }

    fn harness() -> (Arc<SonicSession>, Peer) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (sink, source) = split_stream(client);
        let session = Arc::new(SonicSession::from_parts(
            sink,
            source,
            SessionConfig::default(),
        ));
        let (peer_sink, peer_source) = split_stream(server);
        (
            session,
            Peer {
                sink: peer_sink,
                source: peer_source,
            },
        )
    }

    #[tokio::test]
    async fn open_session_emits_prelude_in_order() {
        let (session, mut peer) = harness();
        session.open_session().await.unwrap();
        assert_eq!(session.state(), SessionState::SystemPromptDelivered);

        let start = peer.expect_event("sessionStart").await;
        assert_eq!(start["inferenceConfiguration"]["maxTokens"], 1024);

        let prompt = peer.expect_event("promptStart").await;
        let prompt_name = prompt["promptName"].as_str().unwrap().to_string();
        assert_eq!(prompt["audioOutputConfiguration"]["sampleRateHertz"], 24_000);

        let cs = peer.expect_event("contentStart").await;
        assert_eq!(cs["promptName"], prompt_name.as_str());
        assert_eq!(cs["type"], "TEXT");
        assert_eq!(cs["role"], "SYSTEM");
        assert_eq!(cs["interactive"], false);
        let content_name = cs["contentName"].as_str().unwrap().to_string();

        let text = peer.expect_event("textInput").await;
        assert_eq!(text["contentName"], content_name.as_str());
        assert!(text["content"].as_str().unwrap().contains("robot"));

        let end = peer.expect_event("contentEnd").await;
        assert_eq!(end["contentName"], content_name.as_str());
    }

    #[tokio::test]
    async fn audio_block_lifecycle_start_payload_end() {
        let (session, mut peer) = harness();
        session.open_session().await.unwrap();
        for _ in 0..5 {
            peer.next_json().await.unwrap();
        }

        session.open_audio_input().await.unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
        session.send_audio_frame(&[1, 2, 3, 4]).await.unwrap();
        session.close_audio_input().await.unwrap();

        let cs = peer.expect_event("contentStart").await;
        assert_eq!(cs["type"], "AUDIO");
        assert_eq!(cs["role"], "USER");
        assert_eq!(cs["interactive"], true);
        assert_eq!(cs["audioInputConfiguration"]["sampleRateHertz"], 16_000);
        let first_block = cs["contentName"].as_str().unwrap().to_string();

        let frame = peer.expect_event("audioInput").await;
        assert_eq!(frame["contentName"], first_block.as_str());
        assert_eq!(frame["content"], events::encode_audio_payload(&[1, 2, 3, 4]));

        let end = peer.expect_event("contentEnd").await;
        assert_eq!(end["contentName"], first_block.as_str());

        // A new utterance gets a fresh content id.
        session.open_audio_input().await.unwrap();
        let cs = peer.expect_event("contentStart").await;
        assert_ne!(cs["contentName"].as_str().unwrap(), first_block.as_str());
    }

    #[tokio::test]
    async fn double_open_audio_input_is_a_protocol_violation() {
        let (session, mut peer) = harness();
        session.open_session().await.unwrap();
        session.open_audio_input().await.unwrap();

        let err = session.open_audio_input().await.unwrap_err();
        assert!(matches!(err, SonicError::Protocol(_)));

        // The violating call must not have emitted anything: the next events
        // on the wire are the prelude plus exactly one contentStart.
        for _ in 0..5 {
            peer.next_json().await.unwrap();
        }
        peer.expect_event("contentStart").await;
        session.close_audio_input().await.unwrap();
        peer.expect_event("contentEnd").await;
    }

    #[tokio::test]
    async fn frames_after_close_are_silently_dropped() {
        let (session, mut peer) = harness();
        session.open_session().await.unwrap();
        session.close().await.unwrap();

        session.send_audio_frame(&[9, 9]).await.unwrap();

        for _ in 0..5 {
            peer.next_json().await.unwrap();
        }
        peer.expect_event("promptEnd").await;
        peer.expect_event("sessionEnd").await;
        // Transport shut down: nothing further, in particular no audioInput.
        assert!(peer.next_json().await.is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (session, _peer) = harness();
        session.open_session().await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn receive_loop_demultiplexes_and_survives_noise() {
        let (session, mut peer) = harness();
        let (producer, mut consumer) = playback_queue();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let looper = {
            let session = Arc::clone(&session);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                session.run_receive_loop(producer, events_tx, cancel).await;
            })
        };

        peer.sink
            .send(br#"{"event":{"contentStart":{"role":"ASSISTANT","additionalModelFields":"{\"generationStage\":\"SPECULATIVE\"}"}}}"#)
            .await
            .unwrap();
        peer.sink
            .send(br#"{"event":{"textOutput":{"content":"Hello there"}}}"#)
            .await
            .unwrap();
        let audio_payload = events::encode_audio_payload(&[1, 2, 3, 4]);
        peer.sink
            .send(format!(r#"{{"event":{{"audioOutput":{{"content":"{audio_payload}"}}}}}}"#).as_bytes())
            .await
            .unwrap();
        peer.sink.send(b"this is not json").await.unwrap();
        peer.sink
            .send(br#"{"event":{"usageEvent":{"totalTokens":3}}}"#)
            .await
            .unwrap();
        peer.sink
            .send(br#"{"event":{"contentStart":{"role":"USER"}}}"#)
            .await
            .unwrap();
        peer.sink
            .send(br#"{"event":{"textOutput":{"content":"hi fish"}}}"#)
            .await
            .unwrap();
        let tail_payload = events::encode_audio_payload(&[5, 6]);
        peer.sink
            .send(format!(r#"{{"event":{{"audioOutput":{{"content":"{tail_payload}"}}}}}}"#).as_bytes())
            .await
            .unwrap();
        peer.sink.shutdown().await.unwrap();

        looper.await.unwrap();
        assert!(!session.is_active());

        assert_eq!(
            events_rx.recv().await.unwrap(),
            SessionEvent::AssistantText {
                text: "Hello there".to_string(),
                speculative: true,
            }
        );
        assert_eq!(
            events_rx.recv().await.unwrap(),
            SessionEvent::UserText("hi fish".to_string())
        );

        let first = consumer.pop().await.unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(first.pcm, vec![1, 2, 3, 4]);
        let second = consumer.pop().await.unwrap();
        assert_eq!(second.seq, 1);
        assert_eq!(second.pcm, vec![5, 6]);
    }

    #[tokio::test]
    async fn receive_loop_stops_on_cancel() {
        let (session, _peer) = harness();
        let (producer, _consumer) = playback_queue();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let looper = {
            let session = Arc::clone(&session);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                session.run_receive_loop(producer, events_tx, cancel).await;
            })
        };
        cancel.cancel();
        looper.await.unwrap();
        // Cancellation is not a transport failure; the session stays active
        // so the supervisor can decide what to do.
        assert!(session.is_active());
    }
}
