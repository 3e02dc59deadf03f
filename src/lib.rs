//! live-voice - 会話練習のためのリアルタイム双方向音声セッション
//!
//! マイク音声をリモートの音声サービスにストリーミングしながら、返ってくる
//! 合成音声を途切れなく再生し、双方の発話を文字起こしとして記録する。
//!
//! # 主な機能
//!
//! - **キャプチャ**: マイク入力を固定長フレームに切り出し、16kHz PCM としてエンコード
//! - **再生スケジューラ**: 受信チャンクを隙間なく順番に再生、割り込み時は即座に停止
//! - **文字起こし**: 逐次届く断片をターン単位の確定行にまとめる
//! - **セッション状態**: 接続中 / 聞き取り中 / 発話中 / 終了 / エラー を購読可能な形で公開
//! - **Live API 接続**: WebSocket でリモートの音声サービスと双方向にストリーミング
//! - **再生接続**: 記録したサーバーメッセージを流してオフラインで動作確認
//!
//! # アーキテクチャ
//!
//! ```text
//! [Mic] → [CpalCapture] → [CapturePipeline] ──outbound──→ [Transport]
//!                                 │                            │
//!                                 └────→ [SessionTask] ←─inbound┘
//!                                          │        │
//!                          [TranscriptAggregator]  [PlaybackScheduler] → [CpalPlayback] → [Speaker]
//!                                          │
//!                                  [SessionObserver] → [TUI] / JSON出力
//! ```
//!
//! # 使用例
//!
//! ```no_run
//! use live_voice::config::Config;
//!
//! // 設定ファイルを読み込み
//! let config = Config::load_or_default("config.toml").unwrap();
//!
//! // またはデフォルト設定を生成
//! Config::write_default("config.toml").unwrap();
//! ```

pub mod audio_input;
pub mod audio_output;
pub mod buffer;
pub mod capture;
pub mod config;
pub mod error;
pub mod live;
pub mod pcm;
pub mod playback;
pub mod replay;
pub mod session;
pub mod session_view;
pub mod transcript;
pub mod transport;
pub mod tui;
pub mod types;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;
