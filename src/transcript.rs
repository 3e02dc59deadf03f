//! ターン単位の文字起こし集約

use crate::types::{Direction, Transcript, TranscriptLine};

/// 文字起こし断片から発話を組み立てる
///
/// 断片のストリームには行の区切りがないため、ターン完了の通知で
/// 方向ごとの未確定バッファを確定行にする。
///
/// # Examples
///
/// ```
/// # use live_voice::transcript::TranscriptAggregator;
/// # use live_voice::types::{Direction, Transcript};
/// let mut aggregator = TranscriptAggregator::new();
/// let mut transcript = Transcript::new();
///
/// aggregator.append_token(Direction::Remote, "Good ");
/// aggregator.append_token(Direction::Caller, "I think");
/// aggregator.append_token(Direction::Remote, "point");
/// aggregator.on_turn_complete(&mut transcript);
///
/// assert_eq!(transcript.lines()[0].text, "I think");
/// assert_eq!(transcript.lines()[1].text, "Good point");
/// ```
#[derive(Debug, Default)]
pub struct TranscriptAggregator {
    caller: String,
    remote: String,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 断片を方向ごとの未確定バッファに追加
    pub fn append_token(&mut self, direction: Direction, text: &str) {
        self.pending_mut(direction).push_str(text);
    }

    /// 未確定バッファ（ライブ字幕用）
    pub fn pending(&self, direction: Direction) -> &str {
        match direction {
            Direction::Caller => &self.caller,
            Direction::Remote => &self.remote,
        }
    }

    /// ターン完了: 空でないバッファを確定行にする
    ///
    /// 利用者側を先に、リモート側を後に追記する。両方空なら何もしない。
    ///
    /// # Returns
    /// 今回追記した行
    pub fn on_turn_complete(&mut self, transcript: &mut Transcript) -> Vec<TranscriptLine> {
        let mut finalized = Vec::new();

        for direction in [Direction::Caller, Direction::Remote] {
            let text = std::mem::take(self.pending_mut(direction));
            if text.is_empty() {
                continue;
            }
            finalized.push(transcript.append(direction, text).clone());
        }

        finalized
    }

    /// 割り込み: 未確定バッファを確定せずに捨てる
    pub fn on_interrupted(&mut self) {
        if !self.caller.is_empty() || !self.remote.is_empty() {
            log::debug!(
                "割り込みにより未確定の発話を破棄しました (caller={}文字, remote={}文字)",
                self.caller.chars().count(),
                self.remote.chars().count()
            );
        }
        self.caller.clear();
        self.remote.clear();
    }

    fn pending_mut(&mut self, direction: Direction) -> &mut String {
        match direction {
            Direction::Caller => &mut self.caller,
            Direction::Remote => &mut self.remote,
        }
    }
}
