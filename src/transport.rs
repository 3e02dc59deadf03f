use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::types::{EncodedChunk, TranscriptToken, NORMAL_CLOSE_CODE};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// リモートから届くイベント
///
/// ワイヤ形式のメッセージはこの閉じた列挙型に変換してからセッションに渡す。
#[derive(Clone, Debug, PartialEq)]
pub enum InboundEvent {
    /// 合成音声のチャンク
    AudioChunk(EncodedChunk),
    /// 文字起こし断片
    TranscriptToken(TranscriptToken),
    /// ターン完了
    TurnComplete,
    /// リモートが発話を中断した（割り込み）
    Interrupted,
    /// 転送エラー
    Error(TransportFailure),
    /// 接続が閉じられた
    Closed { code: u16, reason: String },
}

/// 転送層で起きた失敗
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportFailure {
    pub retriable: bool,
    pub message: String,
}

impl TransportFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            retriable: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retriable: false,
            message: message.into(),
        }
    }
}

impl From<TransportFailure> for SessionError {
    fn from(failure: TransportFailure) -> Self {
        if failure.retriable {
            SessionError::transient(failure.message)
        } else {
            SessionError::fatal(failure.message)
        }
    }
}

/// リモートへ送るイベント
#[derive(Clone, Debug, PartialEq)]
pub enum OutboundEvent {
    /// マイク音声のチャンク
    Audio(EncodedChunk),
}

/// 接続済みのリンク
///
/// 送信側は有界チャンネルで、詰まった場合の扱いは呼び出し側が決める。
pub struct TransportLink {
    pub outbound: mpsc::Sender<OutboundEvent>,
    pub inbound: mpsc::Receiver<InboundEvent>,
}

/// リモート音声サービスへの接続の共通トレイト
#[async_trait]
pub trait Transport: Send {
    /// ハンドシェイクを行い、送受信チャンネルを返す
    ///
    /// # Errors
    ///
    /// - レート制限や一時的な混雑は `TransportTransient`
    /// - 認証や設定の誤りは `TransportFatal`
    async fn connect(&mut self, config: &SessionConfig) -> Result<TransportLink>;

    /// 接続を閉じる。未接続なら何もしない
    async fn close(&mut self) -> Result<()>;
}

/// クローズコードと理由から失敗を分類する
///
/// 正常終了 (1000) は `None`。サーバー側の一時的な障害を示すコードや、
/// 理由にレート制限・クォータ超過が書かれている場合は再試行可能とみなす。
pub fn classify_close(code: u16, reason: &str) -> Option<SessionError> {
    if code == NORMAL_CLOSE_CODE {
        return None;
    }

    let message = if reason.is_empty() {
        format!("接続が予期せず閉じられました (code={})", code)
    } else {
        format!("接続が予期せず閉じられました (code={}): {}", code, reason)
    };

    let lowered = reason.to_ascii_lowercase();
    let transient_reason = ["rate", "quota", "resource_exhausted", "unavailable", "overloaded"]
        .iter()
        .any(|keyword| lowered.contains(keyword));

    // 1011: サーバー内部エラー, 1012: 再起動, 1013: 後で再試行
    if matches!(code, 1011..=1013) || transient_reason {
        Some(SessionError::transient(message))
    } else {
        Some(SessionError::fatal(message))
    }
}

/// ハンドシェイクで返ったHTTPステータスから失敗を分類する
///
/// 401/403 は認証・権限の誤りなので再試行しても回復しない。
/// 429 とサーバー側の一時障害 (5xx) は再試行可能とみなす。
pub fn classify_http_status(status: u16, body: &str) -> SessionError {
    let body: String = body.trim().chars().take(200).collect();
    let message = if body.is_empty() {
        format!("ハンドシェイクが拒否されました (HTTP {})", status)
    } else {
        format!("ハンドシェイクが拒否されました (HTTP {}): {}", status, body)
    };

    match status {
        408 | 429 | 500..=599 => SessionError::transient(message),
        _ => SessionError::fatal(message),
    }
}
