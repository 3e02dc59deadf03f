//! 再生スケジューラ
//!
//! 受信した合成音声チャンクを、隙間も重なりもなく順番に再生する。
//!
//! # クロック
//!
//! `clock` は「次に再生を開始できる時刻」を表す。新しいスロットは
//! `max(clock, デバイス現在時刻)` に開始し、その後 `clock` をスロットの長さ
//! だけ進める。これによりスロットが重なることも、デバイスの現在時刻より
//! 前に開始することもない。割り込み時のみ `clock` を現在時刻に戻す。

use crate::error::{Result, SessionError};
use crate::types::EncodedChunk;
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::mpsc;

/// 再生スロットの識別子
///
/// セッション内で単調増加し、再利用されない。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u64);

impl SlotId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// 出力デバイスの抽象
///
/// 時刻はすべてデバイスの再生クロック上の秒で表す。
pub trait PlaybackDevice: Send {
    /// 出力を開始する。再生し終えたスロットは `completions` に通知する
    fn start(&mut self, completions: mpsc::UnboundedSender<SlotId>) -> Result<()>;

    /// `start_at` からサンプルを再生するよう予約
    fn schedule_buffer(&mut self, slot: SlotId, samples: Vec<f32>, start_at: f64) -> Result<()>;

    /// 予約済みまたは再生中のスロットを即座に止める
    fn stop_slot(&mut self, slot: SlotId);

    /// デバイスの現在時刻（秒）
    fn current_time(&self) -> f64;

    /// 出力を停止してデバイスを解放
    fn stop(&mut self) -> Result<()>;
}

/// スケジュール済みのスロット
#[derive(Clone, Debug, PartialEq)]
pub struct PlaybackSlot {
    pub id: SlotId,
    /// 開始時刻（秒）
    pub start_at: f64,
    /// 長さ（秒）
    pub duration: f64,
}

impl PlaybackSlot {
    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }
}

/// 再生完了通知の処理結果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotOutcome {
    /// 最後のスロットが終わり、再生中のものがなくなった
    Drained,
    /// まだ再生中のスロットがある
    StillPlaying,
    /// 割り込みなどで既に外されたスロット（何もしない）
    Stale,
}

/// 再生スケジューラ
///
/// セッション中は出力デバイスとそのクロックを専有する。
pub struct PlaybackScheduler {
    device: Box<dyn PlaybackDevice>,
    sample_rate: u32,
    clock: f64,
    active: BTreeMap<SlotId, PlaybackSlot>,
    next_slot: u64,
    started: bool,
    shut_down: bool,
}

impl PlaybackScheduler {
    pub fn new(device: Box<dyn PlaybackDevice>, sample_rate: u32) -> Self {
        Self {
            device,
            sample_rate,
            clock: 0.0,
            active: BTreeMap::new(),
            next_slot: 0,
            started: false,
            shut_down: false,
        }
    }

    /// 出力デバイスを開始
    ///
    /// # Returns
    /// 再生完了通知の受信チャンネル
    ///
    /// # Errors
    ///
    /// デバイスを確保できない場合 `DeviceUnavailable` を返す。
    pub fn start(&mut self) -> Result<mpsc::UnboundedReceiver<SlotId>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.device.start(tx)?;
        self.started = true;
        self.clock = self.device.current_time();

        log::info!("再生デバイスを開始しました ({}Hz)", self.sample_rate);
        Ok(rx)
    }

    /// チャンクをデコードして次の空き時刻に予約
    ///
    /// # Returns
    /// 予約したスロット。停止済みまたは空のチャンクなら `None`
    ///
    /// # Errors
    ///
    /// - チャンクが不正な場合 `MalformedAudio`（チャンクを捨てて継続してよい）
    /// - デバイスが予約を受け付けない場合 `DeviceUnavailable`
    pub fn enqueue(&mut self, chunk: &EncodedChunk) -> Result<Option<PlaybackSlot>> {
        if self.shut_down || !self.started {
            log::debug!("再生停止中のためチャンクを無視しました");
            return Ok(None);
        }

        let frame = chunk.decode()?;
        if frame.sample_rate != self.sample_rate {
            return Err(SessionError::malformed(format!(
                "サンプルレートが一致しません: {}Hz (期待値 {}Hz)",
                frame.sample_rate, self.sample_rate
            )));
        }
        if frame.is_empty() {
            return Ok(None);
        }

        let duration = frame.duration_secs();
        let now = self.device.current_time();
        let start_at = self.clock.max(now);

        let id = SlotId(self.next_slot);
        self.next_slot += 1;

        self.device.schedule_buffer(id, frame.samples, start_at)?;
        self.clock = start_at + duration;

        let slot = PlaybackSlot {
            id,
            start_at,
            duration,
        };
        self.active.insert(id, slot.clone());

        log::debug!(
            "{} を予約: 開始 {:.3}s, 長さ {:.3}s",
            id,
            start_at,
            duration
        );
        Ok(Some(slot))
    }

    /// 再生完了通知を処理
    pub fn on_slot_finished(&mut self, id: SlotId) -> SlotOutcome {
        if self.active.remove(&id).is_none() {
            // 割り込み後に届いた完了通知
            log::debug!("{} の完了通知を無視しました（既に停止済み）", id);
            return SlotOutcome::Stale;
        }

        if self.active.is_empty() {
            SlotOutcome::Drained
        } else {
            SlotOutcome::StillPlaying
        }
    }

    /// 再生中・予約済みのスロットをすべて止める
    ///
    /// # Returns
    /// 止めたスロット数
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.active.len();
        for id in self.active.keys() {
            self.device.stop_slot(*id);
        }
        self.active.clear();
        self.clock = self.device.current_time();

        if stopped > 0 {
            log::info!("割り込みにより {} 件の再生を停止しました", stopped);
        }
        stopped
    }

    /// 再生をすべて止めてデバイスを解放
    ///
    /// 以降の `enqueue` は何もしない。何度呼んでもよい。
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.interrupt();
        self.shut_down = true;

        if self.started {
            self.started = false;
            self.device.stop()?;
            log::info!("再生デバイスを停止しました");
        }
        Ok(())
    }

    /// 再生中のスロットがないかどうか
    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn active_slots(&self) -> Vec<PlaybackSlot> {
        self.active.values().cloned().collect()
    }

    /// 次に再生を開始できる時刻（秒）
    pub fn clock(&self) -> f64 {
        self.clock
    }

    /// 予約済みの音声を鳴らし終えるまでの残り時間（秒）
    pub fn remaining_secs(&self) -> f64 {
        if self.active.is_empty() {
            return 0.0;
        }
        (self.clock - self.device.current_time()).max(0.0)
    }
}
