//! Live API のJSONメッセージとイベント型の相互変換
//!
//! 受信メッセージは [`parse_server_message`] で閉じたイベント列に変換する。
//! 知らない形のメッセージは黙って捨てずに [`WireError::Unrecognized`] として報告する。

use crate::config::{SessionConfig, SessionMode};
use crate::transport::InboundEvent;
use crate::types::{Direction, EncodedChunk, TranscriptToken, PLAYBACK_SAMPLE_RATE};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("JSONのパースに失敗: {0}")]
    Json(#[from] serde_json::Error),

    #[error("未知のメッセージ形式: {0}")]
    Unrecognized(String),
}

/// 受信メッセージの解釈結果
#[derive(Clone, Debug, PartialEq)]
pub enum ParsedMessage {
    /// ハンドシェイク完了
    SetupComplete,
    /// 発生順のイベント列（空の場合もある）
    Events(Vec<InboundEvent>),
    /// サーバーがまもなく接続を閉じる
    GoAway { time_left: Option<String> },
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<Value>,
    server_content: Option<ServerContent>,
    go_away: Option<GoAway>,
    usage_metadata: Option<Value>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
}

#[derive(Deserialize, Debug)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    data: String,
}

#[derive(Deserialize, Debug)]
struct Transcription {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    time_left: Option<String>,
}

/// サーバーメッセージをイベント列に変換
///
/// 1メッセージ内のイベントは
/// 利用者側の文字起こし → リモート側の文字起こし → 音声 → 割り込み → ターン完了
/// の順に並べる。ターン完了は常に最後になる。
///
/// # Errors
///
/// JSONとして不正な場合 `Json`、既知のフィールドを1つも含まない場合 `Unrecognized`。
pub fn parse_server_message(text: &str) -> Result<ParsedMessage, WireError> {
    let message: ServerMessage = serde_json::from_str(text)?;

    if message.setup_complete.is_some() {
        return Ok(ParsedMessage::SetupComplete);
    }
    if let Some(go_away) = message.go_away {
        return Ok(ParsedMessage::GoAway {
            time_left: go_away.time_left,
        });
    }

    let Some(content) = message.server_content else {
        if message.usage_metadata.is_some() {
            return Ok(ParsedMessage::Events(Vec::new()));
        }
        return Err(WireError::Unrecognized(summarize(text)));
    };

    let mut events = Vec::new();

    if let Some(input) = content.input_transcription {
        if !input.text.is_empty() {
            events.push(InboundEvent::TranscriptToken(TranscriptToken::new(
                Direction::Caller,
                input.text,
            )));
        }
    }
    if let Some(output) = content.output_transcription {
        if !output.text.is_empty() {
            events.push(InboundEvent::TranscriptToken(TranscriptToken::new(
                Direction::Remote,
                output.text,
            )));
        }
    }

    if let Some(turn) = content.model_turn {
        for part in turn.parts {
            let Some(inline) = part.inline_data else {
                continue;
            };
            if !inline.mime_type.is_empty() && !inline.mime_type.starts_with("audio/") {
                log::warn!("音声以外のインラインデータを無視しました: {}", inline.mime_type);
                continue;
            }
            let rate = rate_from_mime(&inline.mime_type).unwrap_or(PLAYBACK_SAMPLE_RATE);
            events.push(InboundEvent::AudioChunk(EncodedChunk::new(inline.data, rate)));
        }
    }

    if content.interrupted {
        events.push(InboundEvent::Interrupted);
    }
    if content.turn_complete {
        events.push(InboundEvent::TurnComplete);
    }

    Ok(ParsedMessage::Events(events))
}

/// MIMEタイプの `rate=` パラメータを読む（例: `audio/pcm;rate=24000`）
pub fn rate_from_mime(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}

fn summarize(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(80) {
        Some((index, _)) => format!("{}...", &trimmed[..index]),
        None => trimmed.to_string(),
    }
}

const BASE_PROMPT: &str = "You are a speaking examiner running a live spoken English session. \
Assess the candidate on fluency and coherence, lexical resource, grammatical range and accuracy, \
and pronunciation. Keep the conversation moving the way a real speaking test does, \
and keep each of your turns short so the candidate does most of the talking.";

fn mode_instruction(mode: SessionMode) -> &'static str {
    match mode {
        SessionMode::Practice => {
            "Mode: practice. Act as a supportive coach. When the candidate makes a mistake, \
correct it briefly right away. Short tips and encouragement are welcome."
        }
        SessionMode::Exam => {
            "Mode: mock exam. Act as a strict examiner. Do not correct mistakes or give tips \
during the session, and do not break character."
        }
    }
}

/// セッション設定からシステム指示文を組み立てる
pub fn system_instruction(config: &SessionConfig) -> String {
    let goals = if config.goals.is_empty() {
        "General speaking practice".to_string()
    } else {
        config.goals.join(", ")
    };

    format!(
        "{}\nRole: {}\n{}\nCandidate: {}\nTarget level: {}\nGoals: {}",
        BASE_PROMPT,
        config.persona,
        mode_instruction(config.mode),
        config.candidate_name,
        config.proficiency,
        goals
    )
}

/// ハンドシェイクで最初に送るセットアップメッセージ
pub fn setup_message(config: &SessionConfig) -> Value {
    json!({
        "setup": {
            "model": config.model,
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": { "voiceName": config.voice_name }
                    }
                }
            },
            "systemInstruction": {
                "parts": [{ "text": system_instruction(config) }]
            },
            "inputAudioTranscription": {},
            "outputAudioTranscription": {}
        }
    })
}

/// マイク音声チャンクの送信メッセージ
pub fn realtime_input_message(chunk: &EncodedChunk) -> Value {
    json!({
        "realtimeInput": {
            "mediaChunks": [{
                "mimeType": chunk.mime_type(),
                "data": chunk.data()
            }]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AudioFrame, CAPTURE_SAMPLE_RATE};

    fn events(text: &str) -> Vec<InboundEvent> {
        match parse_server_message(text).unwrap() {
            ParsedMessage::Events(events) => events,
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_setup_complete() {
        assert_eq!(
            parse_server_message(r#"{"setupComplete":{}}"#).unwrap(),
            ParsedMessage::SetupComplete
        );
    }

    #[test]
    fn test_transcriptions_in_caller_then_remote_order() {
        let events = events(
            r#"{"serverContent":{
                "outputTranscription":{"text":"Good point"},
                "inputTranscription":{"text":"I think"}
            }}"#,
        );
        assert_eq!(
            events,
            vec![
                InboundEvent::TranscriptToken(TranscriptToken::new(Direction::Caller, "I think")),
                InboundEvent::TranscriptToken(TranscriptToken::new(Direction::Remote, "Good point")),
            ]
        );
    }

    #[test]
    fn test_model_turn_audio_with_rate() {
        let events = events(
            r#"{"serverContent":{"modelTurn":{"parts":[
                {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAAA"}},
                {"inlineData":{"mimeType":"audio/pcm","data":"AQAB"}}
            ]}}}"#,
        );
        assert_eq!(
            events,
            vec![
                InboundEvent::AudioChunk(EncodedChunk::new("AAAA", 24000)),
                InboundEvent::AudioChunk(EncodedChunk::new("AQAB", PLAYBACK_SAMPLE_RATE)),
            ]
        );
    }

    #[test]
    fn test_turn_complete_is_last() {
        let events = events(
            r#"{"serverContent":{
                "turnComplete":true,
                "outputTranscription":{"text":"Thanks."},
                "modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAAA"}}]}
            }}"#,
        );
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], InboundEvent::TranscriptToken(_)));
        assert!(matches!(events[1], InboundEvent::AudioChunk(_)));
        assert_eq!(events[2], InboundEvent::TurnComplete);
    }

    #[test]
    fn test_interrupted() {
        assert_eq!(
            events(r#"{"serverContent":{"interrupted":true}}"#),
            vec![InboundEvent::Interrupted]
        );
    }

    #[test]
    fn test_usage_metadata_only_is_empty() {
        assert!(events(r#"{"usageMetadata":{"totalTokenCount":12}}"#).is_empty());
    }

    #[test]
    fn test_go_away() {
        assert_eq!(
            parse_server_message(r#"{"goAway":{"timeLeft":"10s"}}"#).unwrap(),
            ParsedMessage::GoAway {
                time_left: Some("10s".to_string())
            }
        );
    }

    #[test]
    fn test_unrecognized_and_invalid() {
        assert!(matches!(
            parse_server_message(r#"{"somethingNew":{"x":1}}"#),
            Err(WireError::Unrecognized(_))
        ));
        assert!(matches!(
            parse_server_message("not json"),
            Err(WireError::Json(_))
        ));
    }

    #[test]
    fn test_rate_from_mime() {
        assert_eq!(rate_from_mime("audio/pcm;rate=16000"), Some(16000));
        assert_eq!(rate_from_mime("audio/pcm; rate=24000"), Some(24000));
        assert_eq!(rate_from_mime("audio/pcm"), None);
        assert_eq!(rate_from_mime("audio/pcm;rate=abc"), None);
    }

    #[test]
    fn test_setup_message_carries_session_config() {
        let mut config = SessionConfig::default();
        config.mode = SessionMode::Exam;
        config.candidate_name = "Aiko".to_string();

        let message = setup_message(&config);
        let setup = &message["setup"];
        assert_eq!(setup["model"], config.model.as_str());
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Kore"
        );
        assert!(setup["inputAudioTranscription"].is_object());
        assert!(setup["outputAudioTranscription"].is_object());

        let instruction = setup["systemInstruction"]["parts"][0]["text"].as_str().unwrap();
        assert!(instruction.contains("Candidate: Aiko"));
        assert!(instruction.contains("mock exam"));
        assert!(instruction.contains("Part 1: General Questions"));
    }

    #[test]
    fn test_realtime_input_message() {
        let chunk = EncodedChunk::from_frame(&AudioFrame::new(vec![0.0; 4], CAPTURE_SAMPLE_RATE));
        let message = realtime_input_message(&chunk);
        let media = &message["realtimeInput"]["mediaChunks"][0];
        assert_eq!(media["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(media["data"], chunk.data());
    }
}
