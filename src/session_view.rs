use crate::session::{Captions, SessionObserver};
use crate::types::{SessionStatus, TranscriptLine};
use std::collections::VecDeque;
use std::time::Instant;

/// 画面表示用のセッション状態のスナップショット
#[derive(Clone, Debug)]
pub struct SessionView {
    /// セッション状態
    pub status: SessionStatus,
    /// 入力レベル (0~100)
    pub level: f32,
    /// ライブ字幕
    pub captions: Captions,
    /// 最新の確定行（古い順、最大 `history_limit` 件）
    pub recent: VecDeque<TranscriptLine>,
    history_limit: usize,
    seen_lines: usize,
    status_since: Instant,
}

impl SessionView {
    pub fn new(history_limit: usize) -> Self {
        Self {
            status: SessionStatus::Connecting,
            level: 0.0,
            captions: Captions::default(),
            recent: VecDeque::new(),
            history_limit: history_limit.max(1),
            seen_lines: 0,
            status_since: Instant::now(),
        }
    }

    /// 購読中のセッションから最新の状態を取り込む
    ///
    /// 文字起こしは追記のみなので、前回以降の行だけをコピーする。
    pub fn refresh(&mut self, observer: &SessionObserver) {
        let new_lines = if observer.transcript_len() > self.seen_lines {
            observer.lines_since(self.seen_lines)
        } else {
            Vec::new()
        };
        self.apply(
            observer.status(),
            observer.level(),
            observer.captions(),
            new_lines,
        );
    }

    fn apply(
        &mut self,
        status: SessionStatus,
        level: f32,
        captions: Captions,
        new_lines: Vec<TranscriptLine>,
    ) {
        if status != self.status {
            self.status = status;
            self.status_since = Instant::now();
        }
        self.level = level;
        self.captions = captions;

        self.seen_lines += new_lines.len();
        self.recent.extend(new_lines);

        while self.recent.len() > self.history_limit {
            self.recent.pop_front();
        }
    }

    /// 現在の状態になってからの経過時間（秒）
    pub fn status_duration_secs(&self) -> f64 {
        self.status_since.elapsed().as_secs_f64()
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }
}
