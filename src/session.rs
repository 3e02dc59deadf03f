//! 会話セッション
//!
//! セッションの可変状態はすべて1つのタスクが所有する。キャプチャのコールバック、
//! 受信ストリーム、再生完了通知、利用者からのコマンドはそれぞれ独立に動き、
//! このタスクの `select!` で1つずつ直列に処理される。
//!
//! ```text
//! [CaptureDevice] → FrameSink ──notify──┐
//! [Transport]     → inbound  ───────────┤
//! [PlaybackDevice]→ completions ────────┼──→ [SessionTask] ──→ watch (状態/字幕/文字起こし/レベル)
//! [LiveSession]   → commands ───────────┘          │
//!                                                  └──→ outbound / PlaybackScheduler
//! ```

use crate::capture::{CaptureDevice, CapturePipeline};
use crate::config::{Config, SessionConfig};
use crate::error::SessionError;
use crate::playback::{PlaybackDevice, PlaybackScheduler, SlotId, SlotOutcome};
use crate::transcript::TranscriptAggregator;
use crate::transport::{classify_close, InboundEvent, OutboundEvent, Transport, TransportLink};
use crate::types::{Direction, SessionStatus, Transcript, TranscriptLine};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// 接続を閉じるときに待つ上限
const TRANSPORT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// リモートの正常切断後、残りの音声に上乗せして待つ時間
const PLAYBACK_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// リモートの正常切断後に再生完了を待つ上限
const MAX_PLAYBACK_DRAIN: Duration = Duration::from_secs(30);

/// 追記のみの文字起こし。書くのはセッションタスクだけ
type SharedTranscript = Arc<RwLock<Transcript>>;

fn read_transcript(transcript: &SharedTranscript) -> RwLockReadGuard<'_, Transcript> {
    match transcript.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_transcript(transcript: &SharedTranscript) -> RwLockWriteGuard<'_, Transcript> {
    match transcript.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// デバイスの開始・停止のようにスレッドを待つ処理を実行する
///
/// マルチスレッドランタイムでは `block_in_place` でワーカーを明け渡す。
fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(f),
        _ => f(),
    }
}

/// セッションに渡すデバイスと接続
pub struct SessionParts {
    pub transport: Box<dyn Transport>,
    pub capture: Box<dyn CaptureDevice>,
    pub playback: Box<dyn PlaybackDevice>,
}

/// 方向ごとのライブ字幕（未確定の発話）
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Captions {
    pub caller: String,
    pub remote: String,
}

/// セッションの公開状態を購読するためのハンドル
#[derive(Clone)]
pub struct SessionObserver {
    status: watch::Receiver<SessionStatus>,
    captions: watch::Receiver<Captions>,
    transcript: SharedTranscript,
    transcript_len: watch::Receiver<usize>,
    level: watch::Receiver<f32>,
}

impl SessionObserver {
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn captions(&self) -> Captions {
        self.captions.borrow().clone()
    }

    /// 文字起こし全体のコピー
    pub fn transcript(&self) -> Transcript {
        read_transcript(&self.transcript).clone()
    }

    /// 確定行数
    pub fn transcript_len(&self) -> usize {
        *self.transcript_len.borrow()
    }

    /// `start` 行目以降の確定行
    pub fn lines_since(&self, start: usize) -> Vec<TranscriptLine> {
        read_transcript(&self.transcript)
            .lines()
            .iter()
            .skip(start)
            .cloned()
            .collect()
    }

    /// 確定行数が `len` 以上になるまで待つ
    ///
    /// セッションタスクが既に終わっている場合は最後の行数を返す。
    pub async fn wait_for_lines(&mut self, len: usize) -> usize {
        if let Ok(current) = self.transcript_len.wait_for(|n| *n >= len).await {
            return *current;
        }
        let current = *self.transcript_len.borrow();
        current
    }

    /// 入力レベル (0~100)
    pub fn level(&self) -> f32 {
        *self.level.borrow()
    }

    /// 状態が条件を満たすまで待つ
    ///
    /// セッションタスクが既に終わっている場合は最後の状態を返す。
    pub async fn wait_for_status(
        &mut self,
        condition: impl FnMut(&SessionStatus) -> bool,
    ) -> SessionStatus {
        if let Ok(status) = self.status.wait_for(condition).await {
            return status.clone();
        }
        let status = self.status.borrow().clone();
        status
    }

    /// 状態が変化するまで待つ
    ///
    /// # Returns
    /// セッションタスクが終了していれば `false`
    pub async fn changed(&mut self) -> bool {
        self.status.changed().await.is_ok()
    }
}

struct Publishers {
    status: watch::Sender<SessionStatus>,
    captions: watch::Sender<Captions>,
    transcript_len: watch::Sender<usize>,
    level: watch::Sender<f32>,
}

enum Command {
    Close,
}

enum CloseState {
    Running(JoinHandle<Transcript>),
    Finished(Transcript),
}

/// 実行中の会話セッション
///
/// # Examples
///
/// ```no_run
/// # use live_voice::config::Config;
/// # use live_voice::session::{LiveSession, SessionParts};
/// # async fn run(parts: SessionParts) {
/// let session = LiveSession::open(&Config::default(), parts);
/// let transcript = session.close().await;
/// println!("{} 行", transcript.len());
/// # }
/// ```
pub struct LiveSession {
    commands: mpsc::UnboundedSender<Command>,
    observer: SessionObserver,
    state: Mutex<CloseState>,
}

impl LiveSession {
    /// セッションを開始する
    ///
    /// 接続は裏で行われ、戻った時点の状態は `Connecting`。
    /// tokioランタイム内で呼ぶこと。
    pub fn open(config: &Config, parts: SessionParts) -> Self {
        let (status_tx, status_rx) = watch::channel(SessionStatus::Connecting);
        let (captions_tx, captions_rx) = watch::channel(Captions::default());
        let (transcript_len_tx, transcript_len_rx) = watch::channel(0_usize);
        let transcript: SharedTranscript = Arc::new(RwLock::new(Transcript::new()));
        let (level_tx, level_rx) = watch::channel(0.0_f32);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let task = SessionTask {
            config: config.session.clone(),
            transport: parts.transport,
            capture: CapturePipeline::new(
                parts.capture,
                &config.capture,
                config.audio.frame_size,
                config.audio.capture_sample_rate,
            ),
            scheduler: PlaybackScheduler::new(parts.playback, config.audio.playback_sample_rate),
            aggregator: TranscriptAggregator::new(),
            transcript: Arc::clone(&transcript),
            publish: Publishers {
                status: status_tx,
                captions: captions_tx,
                transcript_len: transcript_len_tx,
                level: level_tx,
            },
            commands: command_rx,
        };

        log::info!(
            "セッションを開始します (mode={:?}, persona={})",
            config.session.mode,
            config.session.persona
        );
        let handle = tokio::spawn(task.run());

        Self {
            commands: command_tx,
            observer: SessionObserver {
                status: status_rx,
                captions: captions_rx,
                transcript,
                transcript_len: transcript_len_rx,
                level: level_rx,
            },
            state: Mutex::new(CloseState::Running(handle)),
        }
    }

    pub fn observer(&self) -> SessionObserver {
        self.observer.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.observer.status()
    }

    /// セッションを終了して文字起こしを返す
    ///
    /// 何度呼んでもよく、2回目以降は同じ文字起こしを返す。
    /// 接続中に呼んだ場合はハンドシェイクを中止する。
    /// 既にエラーで終わっている場合、状態は `Errored` のまま変わらない。
    pub async fn close(&self) -> Transcript {
        let mut state = self.state.lock().await;

        let handle = match &mut *state {
            CloseState::Finished(transcript) => return transcript.clone(),
            CloseState::Running(handle) => handle,
        };

        if self.commands.send(Command::Close).is_err() {
            log::debug!("セッションタスクは既に終了しています");
        }

        // 待機中にキャンセルされてもハンドルは残るので、次の close で待ち直せる
        let transcript = match handle.await {
            Ok(transcript) => transcript,
            Err(e) => {
                log::error!("セッションタスクが異常終了しました: {}", e);
                self.observer.transcript()
            }
        };

        *state = CloseState::Finished(transcript.clone());
        transcript
    }
}

/// セッションが終わった理由
enum Ending {
    /// 利用者による終了、またはリモートの正常切断
    Closed,
    Failed(SessionError),
}

enum LoopEvent {
    Command(Option<Command>),
    Inbound(Option<InboundEvent>),
    SlotFinished(SlotId),
    FramesReady,
}

struct SessionTask {
    config: SessionConfig,
    transport: Box<dyn Transport>,
    capture: CapturePipeline,
    scheduler: PlaybackScheduler,
    aggregator: TranscriptAggregator,
    transcript: SharedTranscript,
    publish: Publishers,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl SessionTask {
    async fn run(mut self) -> Transcript {
        let ending = self.drive().await;
        self.teardown(ending).await;
        let transcript = read_transcript(&self.transcript).clone();
        transcript
    }

    async fn drive(&mut self) -> Ending {
        let link = tokio::select! {
            result = self.transport.connect(&self.config) => match result {
                Ok(link) => link,
                Err(e) => return Ending::Failed(e),
            },
            _ = self.commands.recv() => {
                log::info!("接続中に終了が要求されました");
                return Ending::Closed;
            }
        };
        log::info!("リモートに接続しました (model={})", self.config.model);

        let TransportLink {
            outbound,
            mut inbound,
        } = link;

        let mut completions = match run_blocking(|| self.scheduler.start()) {
            Ok(rx) => rx,
            Err(e) => return Ending::Failed(e),
        };
        if let Err(e) = run_blocking(|| self.capture.start()) {
            return Ending::Failed(e);
        }
        let frames_ready = self.capture.frames_ready();
        self.set_status(SessionStatus::Listening);

        loop {
            let event = tokio::select! {
                command = self.commands.recv() => LoopEvent::Command(command),
                event = inbound.recv() => LoopEvent::Inbound(event),
                Some(slot) = completions.recv() => LoopEvent::SlotFinished(slot),
                _ = frames_ready.notified() => LoopEvent::FramesReady,
            };

            let ending = match event {
                LoopEvent::Command(Some(Command::Close)) | LoopEvent::Command(None) => {
                    Some(Ending::Closed)
                }
                LoopEvent::Inbound(Some(event)) => {
                    self.handle_inbound(event, &mut completions).await
                }
                LoopEvent::Inbound(None) => Some(Ending::Failed(SessionError::fatal(
                    "受信ストリームが切断されました",
                ))),
                LoopEvent::SlotFinished(slot) => {
                    self.handle_slot_finished(slot);
                    None
                }
                LoopEvent::FramesReady => self.send_frames(&outbound),
            };

            if let Some(ending) = ending {
                return ending;
            }
        }
    }

    async fn handle_inbound(
        &mut self,
        event: InboundEvent,
        completions: &mut mpsc::UnboundedReceiver<SlotId>,
    ) -> Option<Ending> {
        match event {
            InboundEvent::AudioChunk(chunk) => match self.scheduler.enqueue(&chunk) {
                Ok(Some(_)) => {
                    if self.current_status() == SessionStatus::Listening {
                        self.set_status(SessionStatus::Speaking);
                    }
                }
                Ok(None) => {}
                Err(SessionError::MalformedAudio { message }) => {
                    log::warn!("不正な音声チャンクを破棄しました: {}", message);
                }
                Err(e) => return Some(Ending::Failed(e)),
            },
            InboundEvent::TranscriptToken(token) => {
                self.aggregator.append_token(token.direction, &token.text);
                self.publish_captions();
            }
            InboundEvent::TurnComplete => {
                let (lines, total) = {
                    let mut transcript = write_transcript(&self.transcript);
                    let lines = self.aggregator.on_turn_complete(&mut transcript);
                    (lines, transcript.len())
                };
                for line in &lines {
                    log::info!("[{:?}] {}", line.direction, line.text);
                }
                if !lines.is_empty() {
                    self.publish.transcript_len.send_replace(total);
                }
                self.publish_captions();
            }
            InboundEvent::Interrupted => {
                self.scheduler.interrupt();
                self.aggregator.on_interrupted();
                self.publish_captions();
                if self.current_status() == SessionStatus::Speaking {
                    self.set_status(SessionStatus::Listening);
                }
            }
            InboundEvent::Error(failure) => return Some(Ending::Failed(failure.into())),
            InboundEvent::Closed { code, reason } => {
                return Some(match classify_close(code, &reason) {
                    None => {
                        log::info!("リモートが接続を正常に閉じました");
                        self.finish_playback(completions).await;
                        Ending::Closed
                    }
                    Some(error) => Ending::Failed(error),
                });
            }
        }
        None
    }

    /// 予約済みの音声を最後まで鳴らす
    ///
    /// 残り時間に猶予を足した時間だけ待ち、利用者が終了を要求したらすぐ戻る。
    async fn finish_playback(&mut self, completions: &mut mpsc::UnboundedReceiver<SlotId>) {
        if self.scheduler.is_idle() {
            return;
        }

        let wait = Duration::try_from_secs_f64(self.scheduler.remaining_secs())
            .unwrap_or(MAX_PLAYBACK_DRAIN)
            .saturating_add(PLAYBACK_DRAIN_GRACE)
            .min(MAX_PLAYBACK_DRAIN);
        log::info!("残りの音声を再生してから終了します (最大 {:.1}秒)", wait.as_secs_f64());

        let drained = tokio::time::timeout(wait, async {
            loop {
                let event = tokio::select! {
                    Some(slot) = completions.recv() => LoopEvent::SlotFinished(slot),
                    command = self.commands.recv() => LoopEvent::Command(command),
                };

                if let LoopEvent::SlotFinished(slot) = event {
                    self.handle_slot_finished(slot);
                    if self.scheduler.is_idle() {
                        return;
                    }
                } else {
                    log::info!("再生の完了待ちを中止しました");
                    return;
                }
            }
        })
        .await;

        if drained.is_err() {
            log::warn!("再生の完了を待ちきれませんでした");
        }
    }

    fn handle_slot_finished(&mut self, slot: SlotId) {
        if self.scheduler.on_slot_finished(slot) == SlotOutcome::Drained
            && self.current_status() == SessionStatus::Speaking
        {
            self.set_status(SessionStatus::Listening);
        }
    }

    fn send_frames(&mut self, outbound: &mpsc::Sender<OutboundEvent>) -> Option<Ending> {
        let frames = self.capture.take_frames();
        let mut level = None;

        for frame in &frames {
            let captured = self.capture.process(frame);
            level = Some(captured.level);

            match outbound.try_send(OutboundEvent::Audio(captured.chunk)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    log::warn!("送信キューが満杯のためフレームを破棄しました");
                }
                Err(TrySendError::Closed(_)) => {
                    return Some(Ending::Failed(SessionError::fatal(
                        "送信チャンネルが閉じられました",
                    )));
                }
            }
        }

        if let Some(level) = level {
            self.publish.level.send_replace(level);
        }
        None
    }

    /// 後片付け
    ///
    /// 各手順は前の手順が失敗しても必ず実行する。
    async fn teardown(&mut self, ending: Ending) {
        match &ending {
            Ending::Failed(error) => {
                log::error!("セッションがエラーで終了しました: {}", error);
                self.set_status(SessionStatus::Errored(error.failure_cause()));
            }
            Ending::Closed => log::info!("セッションを終了します"),
        }

        if let Err(e) = run_blocking(|| self.capture.stop()) {
            log::error!("キャプチャの停止に失敗: {}", e);
        }
        if let Err(e) = run_blocking(|| self.scheduler.shutdown()) {
            log::error!("再生の停止に失敗: {}", e);
        }
        match tokio::time::timeout(TRANSPORT_CLOSE_TIMEOUT, self.transport.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("接続のクローズに失敗: {}", e),
            Err(_) => log::error!("接続のクローズがタイムアウトしました"),
        }

        self.aggregator.on_interrupted();
        self.publish_captions();
        self.publish.level.send_replace(0.0);

        if let Ending::Closed = ending {
            self.set_status(SessionStatus::Closed);
        }
        log::info!(
            "セッションを終了しました (文字起こし {} 行)",
            read_transcript(&self.transcript).len()
        );
    }

    fn current_status(&self) -> SessionStatus {
        self.publish.status.borrow().clone()
    }

    /// 状態を更新する。終了状態からは変えない
    fn set_status(&self, next: SessionStatus) {
        let changed = self.publish.status.send_if_modified(|status| {
            if status.is_terminal() || *status == next {
                return false;
            }
            *status = next.clone();
            true
        });
        if changed {
            log::info!("状態: {}", next.label());
        }
    }

    fn publish_captions(&self) {
        self.publish.captions.send_replace(Captions {
            caller: self.aggregator.pending(Direction::Caller).to_string(),
            remote: self.aggregator.pending(Direction::Remote).to_string(),
        });
    }
}
