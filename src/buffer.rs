use crate::config::CaptureConfig;
use crate::types::{AudioFrame, DropPolicy};
use std::collections::VecDeque;

/// 送信待ちフレームのバックログ
///
/// 送信側が追いつかない場合に備えて少数のフレームを保持する。
/// 容量を超えた分はドロップポリシーに従って破棄する（キャプチャ音声は再送不要）。
pub struct FrameBacklog {
    capacity_frames: usize,
    drop_policy: DropPolicy,
    frames: VecDeque<AudioFrame>,
    dropped_frames: u64,
}

impl FrameBacklog {
    pub fn new(config: &CaptureConfig) -> Self {
        Self::with_capacity(config.backlog_frames, config.drop_policy)
    }

    pub fn with_capacity(capacity_frames: usize, drop_policy: DropPolicy) -> Self {
        // 容量0だと何も送れないため最低1フレームは保持する
        let capacity_frames = capacity_frames.max(1);
        Self {
            capacity_frames,
            drop_policy,
            frames: VecDeque::with_capacity(capacity_frames),
            dropped_frames: 0,
        }
    }

    /// フレームを追加
    ///
    /// # Returns
    /// 今回破棄したフレーム数
    pub fn push(&mut self, frame: AudioFrame) -> usize {
        let mut dropped = 0;

        if self.frames.len() >= self.capacity_frames {
            match self.drop_policy {
                DropPolicy::DropOldest => {
                    self.frames.pop_front();
                    dropped += 1;
                }
                DropPolicy::DropNewest => {
                    self.dropped_frames += 1;
                    return 1;
                }
            }
        }

        self.frames.push_back(frame);
        self.dropped_frames += dropped as u64;
        dropped
    }

    /// 先頭のフレームを取り出す
    pub fn pop(&mut self) -> Option<AudioFrame> {
        self.frames.pop_front()
    }

    /// 全フレームを古い順に取り出す
    pub fn drain(&mut self) -> Vec<AudioFrame> {
        self.frames.drain(..).collect()
    }

    /// 保持しているフレーム数
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// バックログが空かどうか
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// これまでに破棄したフレーム数
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// バックログをクリア
    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
