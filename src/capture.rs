//! キャプチャパイプライン
//!
//! デバイスのコールバックは [`FrameSink`] にサンプルを書き込むだけで、
//! エンコードと送信はセッションタスク側で行う。これによりキャプチャの
//! クロックが送信処理で止まることはない。

use crate::buffer::FrameBacklog;
use crate::config::CaptureConfig;
use crate::error::Result;
use crate::types::{AudioFrame, EncodedChunk};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// 入力デバイスの抽象
///
/// 実デバイス（cpal）とテスト用モックを差し替えられるようにする。
pub trait CaptureDevice: Send {
    /// キャプチャを開始し、取得したサンプルを `sink` に渡し続ける
    fn start(&mut self, sink: FrameSink) -> Result<()>;

    /// キャプチャを停止してデバイスを解放
    fn stop(&mut self) -> Result<()>;
}

struct SinkState {
    /// フレームサイズに満たない端数
    staging: Vec<f32>,
    backlog: FrameBacklog,
}

struct SinkShared {
    open: AtomicBool,
    frame_size: usize,
    sample_rate: u32,
    state: Mutex<SinkState>,
    ready: Arc<Notify>,
}

/// デバイスコールバックからのサンプル受け口
///
/// 任意長のサンプル列を固定長フレームに切り出し、バックログに積む。
/// クローズ後の書き込みは何もしない。
#[derive(Clone)]
pub struct FrameSink {
    shared: Arc<SinkShared>,
}

impl FrameSink {
    fn new(frame_size: usize, sample_rate: u32, backlog: FrameBacklog) -> Self {
        Self {
            shared: Arc::new(SinkShared {
                open: AtomicBool::new(false),
                frame_size: frame_size.max(1),
                sample_rate,
                state: Mutex::new(SinkState {
                    staging: Vec::with_capacity(frame_size),
                    backlog,
                }),
                ready: Arc::new(Notify::new()),
            }),
        }
    }

    /// サンプルを書き込む
    ///
    /// # Returns
    /// 受け付けた場合は `true`、クローズ済みなら `false`
    pub fn push_samples(&self, samples: &[f32]) -> bool {
        if !self.is_open() {
            return false;
        }

        let frame_size = self.shared.frame_size;
        let mut completed = 0;
        {
            let mut state = self.lock_state();
            state.staging.extend_from_slice(samples);

            while state.staging.len() >= frame_size {
                let rest = state.staging.split_off(frame_size);
                let full = std::mem::replace(&mut state.staging, rest);
                let dropped = state
                    .backlog
                    .push(AudioFrame::new(full, self.shared.sample_rate));
                if dropped > 0 {
                    log::warn!("送信が追いつかないためフレームを {} 件破棄しました", dropped);
                }
                completed += 1;
            }
        }

        if completed > 0 {
            self.shared.ready.notify_one();
        }
        true
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    fn open(&self) {
        self.shared.open.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        self.shared.open.store(false, Ordering::SeqCst);
        let mut state = self.lock_state();
        state.staging.clear();
        state.backlog.clear();
    }

    fn take_frames(&self) -> Vec<AudioFrame> {
        self.lock_state().backlog.drain()
    }

    fn lock_state(&self) -> MutexGuard<'_, SinkState> {
        // コールバック内でパニックしてもキャプチャは続けたいので毒化は無視する
        match self.shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// 送信準備ができたフレーム
#[derive(Clone, Debug)]
pub struct CapturedFrame {
    /// 入力レベル (0~100)
    pub level: f32,
    pub chunk: EncodedChunk,
}

/// RMS（二乗平均平方根）を計算
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// 表示用の入力レベル (0~100)
///
/// UI表示専用で正確さの保証はない。
pub fn input_level(samples: &[f32], gain: f32) -> f32 {
    (rms(samples) * gain).clamp(0.0, 100.0)
}

/// マイク入力をエンコード済みチャンクの列に変換するパイプライン
///
/// セッション中は入力デバイスを専有し、停止時に解放する。
pub struct CapturePipeline {
    device: Box<dyn CaptureDevice>,
    sink: FrameSink,
    level_gain: f32,
    running: bool,
}

impl CapturePipeline {
    pub fn new(
        device: Box<dyn CaptureDevice>,
        config: &CaptureConfig,
        frame_size: usize,
        sample_rate: u32,
    ) -> Self {
        Self {
            device,
            sink: FrameSink::new(frame_size, sample_rate, FrameBacklog::new(config)),
            level_gain: config.level_gain,
            running: false,
        }
    }

    /// キャプチャを開始
    ///
    /// # Errors
    ///
    /// デバイスを確保できない場合 `DeviceUnavailable` を返す。
    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }

        self.sink.open();
        if let Err(e) = self.device.start(self.sink.clone()) {
            self.sink.close();
            return Err(e);
        }
        self.running = true;

        log::info!("キャプチャを開始しました");
        Ok(())
    }

    /// フレームが揃ったことを知らせる通知
    pub fn frames_ready(&self) -> Arc<Notify> {
        Arc::clone(&self.sink.shared.ready)
    }

    /// 溜まっているフレームを古い順に取り出す
    pub fn take_frames(&self) -> Vec<AudioFrame> {
        self.sink.take_frames()
    }

    /// フレームのレベルを計算してエンコード
    pub fn process(&self, frame: &AudioFrame) -> CapturedFrame {
        CapturedFrame {
            level: input_level(&frame.samples, self.level_gain),
            chunk: EncodedChunk::from_frame(frame),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// キャプチャを停止してデバイスを解放
    ///
    /// 何度呼んでもよい。受け口を先に閉じるので、停止後に届いた
    /// コールバックは無視される。
    pub fn stop(&mut self) -> Result<()> {
        self.sink.close();
        if !self.running {
            return Ok(());
        }
        self.running = false;

        self.device.stop()?;
        log::info!("キャプチャを停止しました");
        Ok(())
    }
}
