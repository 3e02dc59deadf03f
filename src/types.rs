use crate::error::Result;
use crate::pcm;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// マイク入力のサンプリングレート (Hz)
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// 合成音声再生のサンプリングレート (Hz)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// キャプチャ1フレームあたりのサンプル数（16kHzで約256ms）
pub const DEFAULT_FRAME_SIZE: usize = 4096;

/// 正常終了を表すクローズコード
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// オーディオフレーム
///
/// モノラルの正規化済みサンプル (-1.0 ~ 1.0) のまとまり。
/// キャプチャデバイスから生成されるか、受信チャンクをデコードして生成され、
/// エンコードまたは再生スケジュールで一度だけ消費される。
///
/// # Examples
///
/// ```
/// # use live_voice::types::AudioFrame;
/// let frame = AudioFrame::new(vec![0.0; 1600], 16000);
/// assert_eq!(frame.duration_secs(), 0.1);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct AudioFrame {
    /// 正規化済みサンプル
    pub samples: Vec<f32>,

    /// サンプリングレート (Hz)
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// フレームの長さ（秒）
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// 転送用にエンコードされた音声チャンク
///
/// 16ビットLE PCMをbase64テキストにしたものと、サンプリングレートのタグを持つ。
/// 生成後は変更できない。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedChunk {
    data: String,
    sample_rate: u32,
}

impl EncodedChunk {
    /// 転送テキストとレートから作成（受信側）
    pub fn new(data: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            data: data.into(),
            sample_rate,
        }
    }

    /// フレームをエンコードして作成（送信側）
    pub fn from_frame(frame: &AudioFrame) -> Self {
        let bytes = pcm::encode(&frame.samples);
        Self {
            data: pcm::to_transport_text(&bytes),
            sample_rate: frame.sample_rate,
        }
    }

    /// フレームにデコード
    ///
    /// # Errors
    ///
    /// base64として不正、またはバイト長が奇数の場合 `MalformedAudio` を返す。
    pub fn decode(&self) -> Result<AudioFrame> {
        let bytes = pcm::from_transport_text(&self.data)?;
        let samples = pcm::decode(&bytes)?;
        Ok(AudioFrame::new(samples, self.sample_rate))
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// MIMEタイプ表記（例: `audio/pcm;rate=16000`）
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// 発話の方向
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// 利用者（マイク側）
    Caller,
    /// リモート側（合成音声）
    Remote,
}

/// ターン内で逐次届く文字起こし断片
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranscriptToken {
    pub direction: Direction,
    pub text: String,
}

impl TranscriptToken {
    pub fn new(direction: Direction, text: impl Into<String>) -> Self {
        Self {
            direction,
            text: text.into(),
        }
    }
}

/// 確定した文字起こし行
///
/// # JSON出力例
///
/// ```json
/// {
///   "direction": "caller",
///   "text": "I think so",
///   "sequence": 0,
///   "recorded_at": "2025-01-02T14:30:15.234Z"
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TranscriptLine {
    pub direction: Direction,
    pub text: String,

    /// セッション内の通し番号（0始まり）
    pub sequence: u64,

    /// 確定した時刻
    pub recorded_at: DateTime<Utc>,
}

/// セッションの文字起こし（追記のみ）
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Transcript {
    lines: Vec<TranscriptLine>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// 行を追記して、追記した行を返す
    pub(crate) fn append(&mut self, direction: Direction, text: String) -> &TranscriptLine {
        let line = TranscriptLine {
            direction,
            text,
            sequence: self.lines.len() as u64,
            recorded_at: Utc::now(),
        };
        self.lines.push(line);
        &self.lines[self.lines.len() - 1]
    }

    pub fn lines(&self) -> &[TranscriptLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// 指定方向の最新行
    pub fn last_of(&self, direction: Direction) -> Option<&TranscriptLine> {
        self.lines.iter().rev().find(|l| l.direction == direction)
    }
}

/// バッファオーバーフロー時のドロップポリシー
///
/// キャプチャのバックログが容量を超えた場合にどのフレームを破棄するかを指定する。
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// 最古のフレームから破棄
    ///
    /// リアルタイム送信では通常これを使用する
    DropOldest,

    /// 到着したフレームを破棄
    DropNewest,
}

/// エラー状態の原因
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailureCause {
    /// 再試行を案内してよいかどうか
    pub retriable: bool,

    /// 利用者向けの説明
    pub message: String,
}

/// セッション状態
///
/// 常にいずれか1つの状態にある。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// 接続ハンドシェイク中
    Connecting,
    /// マイク送信中、再生なし
    Listening,
    /// 合成音声を再生中
    Speaking,
    /// 利用者による終了
    Closed,
    /// エラー終了
    Errored(FailureCause),
}

impl SessionStatus {
    /// 終了状態かどうか
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Closed | SessionStatus::Errored(_))
    }

    /// 表示用ラベル
    pub fn label(&self) -> &'static str {
        match self {
            SessionStatus::Connecting => "接続中",
            SessionStatus::Listening => "聞き取り中",
            SessionStatus::Speaking => "発話中",
            SessionStatus::Closed => "終了",
            SessionStatus::Errored(_) => "エラー",
        }
    }
}
