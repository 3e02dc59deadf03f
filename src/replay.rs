use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::transport::{InboundEvent, OutboundEvent, Transport, TransportLink};
use crate::types::NORMAL_CLOSE_CODE;
use crate::wire::{self, ParsedMessage};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const CHANNEL_CAPACITY: usize = 64;

/// 記録したサーバーメッセージを再生する接続
///
/// 1行に1メッセージのJSONファイル（JSON Lines）を読み、Live API と同じ
/// パーサーを通してイベントとして流す。送られてきたマイク音声は数えるだけで捨てる。
/// 最初のメッセージは `setupComplete` でなければならない。
///
/// デバイスの動作確認やオフラインでの再現に使う。
pub struct ReplayTransport {
    path: PathBuf,
    pacing: Duration,
    close_at_end: bool,
    sent_chunks: Arc<AtomicUsize>,
    tasks: Vec<JoinHandle<()>>,
}

impl ReplayTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pacing: Duration::from_millis(200),
            close_at_end: true,
            sent_chunks: Arc::new(AtomicUsize::new(0)),
            tasks: Vec::new(),
        }
    }

    /// メッセージ間の待ち時間
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    /// 最後まで再生したら正常切断 (1000) を送るかどうか
    pub fn close_at_end(mut self, close_at_end: bool) -> Self {
        self.close_at_end = close_at_end;
        self
    }

    /// これまでに受け取ったマイク音声のチャンク数
    pub fn sent_chunks(&self) -> usize {
        self.sent_chunks.load(Ordering::Relaxed)
    }

    async fn load_events(&self) -> Result<Vec<InboundEvent>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SessionError::fatal(format!("再生ファイルを読み込めません: {:?}: {}", self.path, e))
        })?;

        let mut lines = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty());

        match lines.next().map(|(_, line)| wire::parse_server_message(line)) {
            Some(Ok(ParsedMessage::SetupComplete)) => {}
            _ => {
                return Err(SessionError::fatal(
                    "再生ファイルの先頭が setupComplete ではありません",
                ))
            }
        }

        let mut events = Vec::new();
        for (index, line) in lines {
            match wire::parse_server_message(line) {
                Ok(ParsedMessage::Events(parsed)) => events.extend(parsed),
                Ok(ParsedMessage::GoAway { time_left }) => {
                    log::info!("goAway を受信しました (残り {:?})", time_left);
                }
                Ok(ParsedMessage::SetupComplete) => {
                    log::warn!("{}行目: 重複した setupComplete を無視しました", index + 1);
                }
                Err(e) => log::warn!("{}行目: {}", index + 1, e),
            }
        }
        Ok(events)
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for ReplayTransport {
    async fn connect(&mut self, config: &SessionConfig) -> Result<TransportLink> {
        self.abort_tasks();
        log::info!(
            "再生接続を開始します (persona={}, mode={:?})",
            config.persona,
            config.mode
        );

        let events = self.load_events().await?;
        log::info!(
            "再生ファイルを読み込みました: {:?} ({} イベント)",
            self.path,
            events.len()
        );

        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound_tx, mut outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let pacing = self.pacing;
        let close_at_end = self.close_at_end;
        self.tasks.push(tokio::spawn(async move {
            for event in events {
                if !pacing.is_zero() {
                    tokio::time::sleep(pacing).await;
                }
                if inbound_tx.send(event).await.is_err() {
                    return;
                }
            }
            if close_at_end {
                let _ = inbound_tx
                    .send(InboundEvent::Closed {
                        code: NORMAL_CLOSE_CODE,
                        reason: "replay finished".to_string(),
                    })
                    .await;
            } else {
                // 受信側が閉じるまで接続を保つ
                inbound_tx.closed().await;
            }
        }));

        let sent_chunks = Arc::clone(&self.sent_chunks);
        self.tasks.push(tokio::spawn(async move {
            while let Some(OutboundEvent::Audio(chunk)) = outbound_rx.recv().await {
                let count = sent_chunks.fetch_add(1, Ordering::Relaxed) + 1;
                if count % 50 == 0 {
                    log::debug!("マイク音声 {} チャンク受信 ({})", count, chunk.mime_type());
                }
            }
        }));

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }

    async fn close(&mut self) -> Result<()> {
        if self.tasks.is_empty() {
            return Ok(());
        }
        self.abort_tasks();
        log::info!(
            "再生接続を閉じました (受信したマイク音声: {} チャンク)",
            self.sent_chunks()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AudioFrame, Direction, EncodedChunk, TranscriptToken};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn replay_file(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_replays_events_in_order_then_closes() {
        let file = replay_file(&[
            r#"{"setupComplete":{}}"#,
            r#"{"serverContent":{"inputTranscription":{"text":"Hello"}}}"#,
            "",
            r#"{"serverContent":{"outputTranscription":{"text":"Hi"},"turnComplete":true}}"#,
        ]);

        let mut transport = ReplayTransport::new(file.path()).with_pacing(Duration::ZERO);
        let mut link = transport.connect(&SessionConfig::default()).await.unwrap();

        let mut received = Vec::new();
        while let Some(event) = link.inbound.recv().await {
            let done = matches!(event, InboundEvent::Closed { .. });
            received.push(event);
            if done {
                break;
            }
        }

        assert_eq!(
            received,
            vec![
                InboundEvent::TranscriptToken(TranscriptToken::new(Direction::Caller, "Hello")),
                InboundEvent::TranscriptToken(TranscriptToken::new(Direction::Remote, "Hi")),
                InboundEvent::TurnComplete,
                InboundEvent::Closed {
                    code: 1000,
                    reason: "replay finished".to_string()
                },
            ]
        );
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unrecognized_lines_are_skipped() {
        let file = replay_file(&[
            r#"{"setupComplete":{}}"#,
            r#"{"toolCallCancellation":{"ids":["1"]}}"#,
            r#"{"serverContent":{"interrupted":true}}"#,
        ]);

        let mut transport = ReplayTransport::new(file.path()).with_pacing(Duration::ZERO);
        let mut link = transport.connect(&SessionConfig::default()).await.unwrap();

        assert_eq!(link.inbound.recv().await, Some(InboundEvent::Interrupted));
        assert!(matches!(
            link.inbound.recv().await,
            Some(InboundEvent::Closed { code: 1000, .. })
        ));
    }

    #[tokio::test]
    async fn test_counts_outbound_audio() {
        let file = replay_file(&[r#"{"setupComplete":{}}"#]);
        let mut transport = ReplayTransport::new(file.path())
            .with_pacing(Duration::ZERO)
            .close_at_end(false);
        let link = transport.connect(&SessionConfig::default()).await.unwrap();

        let chunk = EncodedChunk::from_frame(&AudioFrame::new(vec![0.0; 16], 16000));
        for _ in 0..3 {
            link.outbound.send(OutboundEvent::Audio(chunk.clone())).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while transport.sent_chunks() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_fatal() {
        let mut transport = ReplayTransport::new("/nonexistent/replay.jsonl");
        let result = transport.connect(&SessionConfig::default()).await;
        assert!(matches!(result, Err(SessionError::TransportFatal { .. })));
    }

    #[tokio::test]
    async fn test_missing_setup_complete_is_fatal() {
        let file = replay_file(&[r#"{"serverContent":{"turnComplete":true}}"#]);
        let mut transport = ReplayTransport::new(file.path());
        let result = transport.connect(&SessionConfig::default()).await;
        assert!(matches!(result, Err(SessionError::TransportFatal { .. })));
    }
}
