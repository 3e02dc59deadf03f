//! テスト用のモックデバイスとモック接続

use crate::capture::{CaptureDevice, FrameSink};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::playback::{PlaybackDevice, SlotId};
use crate::transport::{InboundEvent, OutboundEvent, Transport, TransportLink};
use crate::types::{AudioFrame, EncodedChunk, PLAYBACK_SAMPLE_RATE};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

fn lock<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// モック間で共有する呼び出し記録
#[derive(Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<&'static str>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: &'static str) {
        lock(&self.calls).push(call);
    }

    /// 記録された呼び出し（呼ばれた順）
    pub fn calls(&self) -> Vec<&'static str> {
        lock(&self.calls).clone()
    }
}

/// 24kHzで `len` サンプルの一定振幅チャンク
pub fn tone_chunk(len: usize) -> EncodedChunk {
    EncodedChunk::from_frame(&AudioFrame::new(vec![0.1; len], PLAYBACK_SAMPLE_RATE))
}

// ---- capture ----

#[derive(Default)]
struct CaptureState {
    sink: Option<FrameSink>,
    started: bool,
    stop_count: usize,
}

pub struct MockCapture {
    state: Arc<Mutex<CaptureState>>,
    fail_on_start: bool,
    fail_on_stop: bool,
    log: CallLog,
}

/// テストからサンプルを流し込むためのハンドル
#[derive(Clone)]
pub struct MockCaptureHandle {
    state: Arc<Mutex<CaptureState>>,
}

impl MockCapture {
    pub fn new() -> (Self, MockCaptureHandle) {
        Self::build(false, false)
    }

    /// 開始時に `DeviceUnavailable` を返すデバイス
    pub fn failing() -> (Self, MockCaptureHandle) {
        Self::build(true, false)
    }

    /// 停止時にエラーを返すデバイス
    pub fn failing_stop() -> (Self, MockCaptureHandle) {
        Self::build(false, true)
    }

    fn build(fail_on_start: bool, fail_on_stop: bool) -> (Self, MockCaptureHandle) {
        let state = Arc::new(Mutex::new(CaptureState::default()));
        let handle = MockCaptureHandle {
            state: Arc::clone(&state),
        };
        (
            Self {
                state,
                fail_on_start,
                fail_on_stop,
                log: CallLog::new(),
            },
            handle,
        )
    }

    pub fn logging_to(mut self, log: &CallLog) -> Self {
        self.log = log.clone();
        self
    }
}

impl CaptureDevice for MockCapture {
    fn start(&mut self, sink: FrameSink) -> Result<()> {
        if self.fail_on_start {
            return Err(SessionError::device("mock: microphone permission denied"));
        }
        let mut state = lock(&self.state);
        state.sink = Some(sink);
        state.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.log.record("capture.stop");
        let mut state = lock(&self.state);
        state.started = false;
        state.stop_count += 1;
        if self.fail_on_stop {
            return Err(SessionError::device("mock: microphone vanished"));
        }
        Ok(())
    }
}

impl MockCaptureHandle {
    /// デバイスコールバックのふりをしてサンプルを書き込む
    pub fn push(&self, samples: &[f32]) -> bool {
        let sink = lock(&self.state).sink.clone();
        match sink {
            Some(sink) => sink.push_samples(samples),
            None => false,
        }
    }

    pub fn is_started(&self) -> bool {
        lock(&self.state).started
    }

    pub fn stop_count(&self) -> usize {
        lock(&self.state).stop_count
    }
}

// ---- playback ----

/// モックに予約されたバッファ
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduledBuffer {
    pub slot: SlotId,
    pub samples: usize,
    pub start_at: f64,
}

#[derive(Default)]
struct PlaybackState {
    now: f64,
    scheduled: Vec<ScheduledBuffer>,
    stopped_slots: Vec<SlotId>,
    completions: Option<mpsc::UnboundedSender<SlotId>>,
    stopped: bool,
}

pub struct MockPlayback {
    state: Arc<Mutex<PlaybackState>>,
    fail_on_start: bool,
    fail_on_stop: bool,
    log: CallLog,
}

/// クロックを手で進め、完了通知を送るためのハンドル
#[derive(Clone)]
pub struct MockPlaybackHandle {
    state: Arc<Mutex<PlaybackState>>,
}

impl MockPlayback {
    pub fn new() -> (Self, MockPlaybackHandle) {
        Self::build(false, false)
    }

    /// 開始時に `DeviceUnavailable` を返すデバイス
    pub fn failing() -> (Self, MockPlaybackHandle) {
        Self::build(true, false)
    }

    /// 停止時にエラーを返すデバイス
    pub fn failing_stop() -> (Self, MockPlaybackHandle) {
        Self::build(false, true)
    }

    fn build(fail_on_start: bool, fail_on_stop: bool) -> (Self, MockPlaybackHandle) {
        let state = Arc::new(Mutex::new(PlaybackState::default()));
        let handle = MockPlaybackHandle {
            state: Arc::clone(&state),
        };
        (
            Self {
                state,
                fail_on_start,
                fail_on_stop,
                log: CallLog::new(),
            },
            handle,
        )
    }

    pub fn logging_to(mut self, log: &CallLog) -> Self {
        self.log = log.clone();
        self
    }
}

impl PlaybackDevice for MockPlayback {
    fn start(&mut self, completions: mpsc::UnboundedSender<SlotId>) -> Result<()> {
        if self.fail_on_start {
            return Err(SessionError::device("mock: no output device"));
        }
        lock(&self.state).completions = Some(completions);
        Ok(())
    }

    fn schedule_buffer(&mut self, slot: SlotId, samples: Vec<f32>, start_at: f64) -> Result<()> {
        lock(&self.state).scheduled.push(ScheduledBuffer {
            slot,
            samples: samples.len(),
            start_at,
        });
        Ok(())
    }

    fn stop_slot(&mut self, slot: SlotId) {
        lock(&self.state).stopped_slots.push(slot);
    }

    fn current_time(&self) -> f64 {
        lock(&self.state).now
    }

    fn stop(&mut self) -> Result<()> {
        self.log.record("playback.stop");
        let mut state = lock(&self.state);
        state.stopped = true;
        state.completions = None;
        if self.fail_on_stop {
            return Err(SessionError::device("mock: output device vanished"));
        }
        Ok(())
    }
}

impl MockPlaybackHandle {
    pub fn set_time(&self, now: f64) {
        lock(&self.state).now = now;
    }

    pub fn scheduled(&self) -> Vec<ScheduledBuffer> {
        lock(&self.state).scheduled.clone()
    }

    /// 止められたスロット（止められた順）
    pub fn stopped_slots(&self) -> Vec<SlotId> {
        lock(&self.state).stopped_slots.clone()
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.state).stopped
    }

    /// スロットの再生完了を通知する
    pub fn finish(&self, slot: SlotId) {
        if let Some(completions) = lock(&self.state).completions.as_ref() {
            let _ = completions.send(slot);
        }
    }
}

// ---- transport ----

enum ConnectBehavior {
    Succeed,
    Fail(SessionError),
    Hang,
}

#[derive(Default)]
struct TransportState {
    connects: usize,
    closes: usize,
    config: Option<SessionConfig>,
}

pub struct MockTransport {
    behavior: ConnectBehavior,
    link: Option<TransportLink>,
    state: Arc<Mutex<TransportState>>,
    log: CallLog,
}

/// リモート側を演じるハンドル
pub struct MockTransportHandle {
    inbound: mpsc::Sender<InboundEvent>,
    outbound: mpsc::Receiver<OutboundEvent>,
    state: Arc<Mutex<TransportState>>,
}

impl MockTransport {
    pub fn new() -> (Self, MockTransportHandle) {
        Self::build(ConnectBehavior::Succeed, 64)
    }

    /// 送信キューの容量を指定する
    pub fn with_outbound_capacity(capacity: usize) -> (Self, MockTransportHandle) {
        Self::build(ConnectBehavior::Succeed, capacity)
    }

    /// ハンドシェイクが `error` で失敗する
    pub fn failing(error: SessionError) -> (Self, MockTransportHandle) {
        Self::build(ConnectBehavior::Fail(error), 64)
    }

    /// ハンドシェイクが終わらない
    pub fn hanging() -> (Self, MockTransportHandle) {
        Self::build(ConnectBehavior::Hang, 64)
    }

    fn build(behavior: ConnectBehavior, capacity: usize) -> (Self, MockTransportHandle) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let state = Arc::new(Mutex::new(TransportState::default()));

        let transport = Self {
            behavior,
            link: Some(TransportLink {
                outbound: outbound_tx,
                inbound: inbound_rx,
            }),
            state: Arc::clone(&state),
            log: CallLog::new(),
        };
        let handle = MockTransportHandle {
            inbound: inbound_tx,
            outbound: outbound_rx,
            state,
        };
        (transport, handle)
    }

    pub fn logging_to(mut self, log: &CallLog) -> Self {
        self.log = log.clone();
        self
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self, config: &SessionConfig) -> Result<TransportLink> {
        {
            let mut state = lock(&self.state);
            state.connects += 1;
            state.config = Some(config.clone());
        }

        match std::mem::replace(&mut self.behavior, ConnectBehavior::Succeed) {
            ConnectBehavior::Succeed => self
                .link
                .take()
                .ok_or_else(|| SessionError::fatal("mock: already connected")),
            ConnectBehavior::Fail(error) => Err(error),
            ConnectBehavior::Hang => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.log.record("transport.close");
        lock(&self.state).closes += 1;
        Ok(())
    }
}

impl MockTransportHandle {
    /// リモートからイベントを送る
    pub async fn send(&self, event: InboundEvent) {
        let _ = self.inbound.send(event).await;
    }

    /// セッションが送った次のイベント
    pub async fn next_outbound(&mut self) -> Option<OutboundEvent> {
        self.outbound.recv().await
    }

    /// 既に届いている送信イベントをすべて取り出す
    pub fn drain_outbound(&mut self) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.outbound.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.state).connects
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).closes
    }

    pub fn connected_config(&self) -> Option<SessionConfig> {
        lock(&self.state).config.clone()
    }
}
