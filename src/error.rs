//! セッションのエラー型

use crate::types::FailureCause;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    /// 音声チャンクを解釈できない（チャンクを破棄して継続）
    #[error("音声データが不正です: {message}")]
    MalformedAudio { message: String },

    /// 入出力デバイスを確保できない（セッションは継続不可）
    #[error("オーディオデバイスを利用できません: {message}")]
    DeviceUnavailable { message: String },

    /// レート制限や一時的な混雑（再試行を案内してよい）
    #[error("サービスが一時的に利用できません: {message}")]
    TransportTransient { message: String },

    /// 認証失敗や異常切断（再試行しても回復しない）
    #[error("接続エラー: {message}")]
    TransportFatal { message: String },
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    pub fn malformed(message: impl Into<String>) -> Self {
        SessionError::MalformedAudio {
            message: message.into(),
        }
    }

    pub fn device(message: impl Into<String>) -> Self {
        SessionError::DeviceUnavailable {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        SessionError::TransportTransient {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        SessionError::TransportFatal {
            message: message.into(),
        }
    }

    /// 利用者に再試行を案内してよいかどうか
    pub fn is_retriable(&self) -> bool {
        matches!(self, SessionError::TransportTransient { .. })
    }

    /// セッション状態に載せる原因
    pub fn failure_cause(&self) -> FailureCause {
        FailureCause {
            retriable: self.is_retriable(),
            message: self.to_string(),
        }
    }
}
