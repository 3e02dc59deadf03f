use crate::types::{DropPolicy, CAPTURE_SAMPLE_RATE, DEFAULT_FRAME_SIZE, PLAYBACK_SAMPLE_RATE};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// オーディオ入出力設定
///
/// # デフォルト値
///
/// - `input_device` / `output_device`: "default" (システムのデフォルトデバイス)
/// - `capture_sample_rate`: 16000 Hz
/// - `playback_sample_rate`: 24000 Hz
/// - `frame_size`: 4096 サンプル (約256ms)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    #[serde(default = "default_device_id")]
    pub input_device: String,
    #[serde(default = "default_device_id")]
    pub output_device: String,
    #[serde(default = "default_capture_sample_rate")]
    pub capture_sample_rate: u32,
    #[serde(default = "default_playback_sample_rate")]
    pub playback_sample_rate: u32,
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
}

/// キャプチャ設定
///
/// # デフォルト値
///
/// - `backlog_frames`: 8 フレーム
/// - `drop_policy`: DropOldest
/// - `level_gain`: 500.0 (RMS → 0~100 表示の倍率)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    #[serde(default = "default_backlog_frames")]
    pub backlog_frames: usize,
    #[serde(default = "default_drop_policy")]
    pub drop_policy: DropPolicy,
    #[serde(default = "default_level_gain")]
    pub level_gain: f32,
}

/// セッションのモード
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// 練習モード（その場で訂正する）
    Practice,
    /// 模擬試験モード（訂正しない）
    Exam,
}

/// セッション設定
///
/// ハンドシェイクでそのまま送られる。コアでは解釈しない。
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_voice_name")]
    pub voice_name: String,
    #[serde(default = "default_persona")]
    pub persona: String,
    #[serde(default = "default_mode")]
    pub mode: SessionMode,
    #[serde(default = "default_proficiency")]
    pub proficiency: String,
    #[serde(default = "default_goals")]
    pub goals: Vec<String>,
    #[serde(default = "default_candidate_name")]
    pub candidate_name: String,
}

/// Live API への接続設定
///
/// # デフォルト値
///
/// - `endpoint`: Live API の BidiGenerateContent エンドポイント
/// - `api_key`: "" (空なら `api_key_env` の環境変数を使う)
/// - `api_key_env`: "API_KEY"
/// - `handshake_timeout_secs`: 15 秒
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

impl ConnectionConfig {
    /// APIキーを設定ファイル、環境変数の順に探す
    pub fn resolve_api_key(&self) -> Option<String> {
        if !self.api_key.trim().is_empty() {
            return Some(self.api_key.trim().to_string());
        }
        std::env::var(&self.api_key_env)
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
    }
}

/// 出力設定
///
/// # デフォルト値
///
/// - `log_level`: "info"
/// - `transcript_history`: 10 行
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_transcript_history")]
    pub transcript_history: usize,
}

// Default functions
fn default_device_id() -> String {
    "default".to_string()
}

fn default_capture_sample_rate() -> u32 {
    CAPTURE_SAMPLE_RATE
}

fn default_playback_sample_rate() -> u32 {
    PLAYBACK_SAMPLE_RATE
}

fn default_frame_size() -> usize {
    DEFAULT_FRAME_SIZE
}

fn default_backlog_frames() -> usize {
    8 // 約2秒分
}

fn default_drop_policy() -> DropPolicy {
    DropPolicy::DropOldest
}

fn default_level_gain() -> f32 {
    500.0
}

fn default_model() -> String {
    "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string()
}

fn default_voice_name() -> String {
    "Kore".to_string()
}

fn default_persona() -> String {
    "Examiner Sarah".to_string()
}

fn default_mode() -> SessionMode {
    SessionMode::Practice
}

fn default_proficiency() -> String {
    "Band 5.5 - 6.5".to_string()
}

fn default_goals() -> Vec<String> {
    vec!["Part 1: General Questions".to_string()]
}

fn default_candidate_name() -> String {
    "Candidate".to_string()
}

fn default_endpoint() -> String {
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string()
}

fn default_api_key_env() -> String {
    "API_KEY".to_string()
}

fn default_handshake_timeout_secs() -> u64 {
    15
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_transcript_history() -> usize {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            capture: CaptureConfig::default(),
            session: SessionConfig::default(),
            output: OutputConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: default_device_id(),
            output_device: default_device_id(),
            capture_sample_rate: default_capture_sample_rate(),
            playback_sample_rate: default_playback_sample_rate(),
            frame_size: default_frame_size(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backlog_frames: default_backlog_frames(),
            drop_policy: default_drop_policy(),
            level_gain: default_level_gain(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            voice_name: default_voice_name(),
            persona: default_persona(),
            mode: default_mode(),
            proficiency: default_proficiency(),
            goals: default_goals(),
            candidate_name: default_candidate_name(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: String::new(),
            api_key_env: default_api_key_env(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            transcript_history: default_transcript_history(),
        }
    }
}

impl Config {
    /// 設定ファイルから読み込み
    ///
    /// TOML形式の設定ファイルをパースしてConfig構造体を生成する。
    ///
    /// # Errors
    ///
    /// ファイルの読み込みまたはパースに失敗した場合にエラーを返す。
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use live_voice::config::Config;
    /// let config = Config::from_file("config.toml").unwrap();
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("設定ファイルの読み込みに失敗: {:?}", path.as_ref()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "設定ファイルのパースに失敗")?;
        Ok(config)
    }

    /// デフォルト設定をファイルに書き出し
    ///
    /// 既存のファイルは上書きされる。
    ///
    /// # Errors
    ///
    /// ファイルの書き込みに失敗した場合にエラーを返す。
    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<()> {
        let config = Config::default();
        let content =
            toml::to_string_pretty(&config).with_context(|| "設定のシリアライズに失敗")?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("設定ファイルの書き込みに失敗: {:?}", path.as_ref()))?;
        Ok(())
    }

    /// 設定ファイルがあれば読み込み、なければデフォルトを使用
    ///
    /// # Errors
    ///
    /// ファイルが存在するがパースに失敗した場合にエラーを返す。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            log::warn!(
                "設定ファイルが見つかりません。デフォルト設定を使用します: {:?}",
                path.as_ref()
            );
            Ok(Config::default())
        }
    }
}
