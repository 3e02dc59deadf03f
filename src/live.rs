//! Live API へのWebSocket接続
//!
//! ハンドシェイクで `setup` を送り、`setupComplete` を受け取ってから
//! 送受信タスクを起動する。受信タスクはサーバーメッセージを [`wire`] で
//! イベント列に変換して流し、送信タスクはマイク音声を `realtimeInput` として送る。

use crate::config::{ConnectionConfig, SessionConfig};
use crate::error::{Result, SessionError};
use crate::transport::{
    classify_close, classify_http_status, InboundEvent, OutboundEvent, Transport,
    TransportFailure, TransportLink,
};
use crate::wire::{self, ParsedMessage};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type LiveSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CHANNEL_CAPACITY: usize = 64;

/// クローズフレームにステータスがなかった
const NO_STATUS_CODE: u16 = 1005;

/// クローズフレームなしで切断された
const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Live API への接続
pub struct LiveTransport {
    endpoint: String,
    api_key: String,
    handshake_timeout: Duration,
    shutdown: Option<oneshot::Sender<()>>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl LiveTransport {
    pub fn new(connection: &ConnectionConfig, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: connection.endpoint.clone(),
            api_key: api_key.into(),
            handshake_timeout: Duration::from_secs(connection.handshake_timeout_secs.max(1)),
            shutdown: None,
            writer: None,
            reader: None,
        }
    }

    /// `setupComplete` を待つ上限
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    fn request_url(&self) -> String {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.endpoint, separator, self.api_key)
    }

    fn is_connected(&self) -> bool {
        self.writer.is_some() || self.reader.is_some()
    }
}

#[async_trait]
impl Transport for LiveTransport {
    async fn connect(&mut self, config: &SessionConfig) -> Result<TransportLink> {
        if self.is_connected() {
            self.close().await?;
        }

        // URLにはAPIキーが入るのでログにはエンドポイントだけ出す
        log::info!("Live API に接続します: {}", self.endpoint);
        let (socket, _response) = connect_async(self.request_url())
            .await
            .map_err(classify_ws_error)?;
        let (mut sink, mut stream) = socket.split();

        sink.send(Message::Text(wire::setup_message(config).to_string()))
            .await
            .map_err(classify_ws_error)?;

        match tokio::time::timeout(self.handshake_timeout, await_setup_complete(&mut stream)).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(SessionError::transient(format!(
                    "ハンドシェイクが {} 秒以内に完了しませんでした",
                    self.handshake_timeout.as_secs_f64()
                )))
            }
        }
        log::info!("セットアップが完了しました");

        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        self.reader = Some(tokio::spawn(read_loop(stream, inbound_tx)));
        self.writer = Some(tokio::spawn(write_loop(sink, outbound_rx, shutdown_rx)));
        self.shutdown = Some(shutdown_tx);

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }

    async fn close(&mut self) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }

        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.await {
                log::error!("送信タスクが異常終了しました: {}", e);
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }

        log::info!("Live API との接続を閉じました");
        Ok(())
    }
}

/// 受信フレームの中身
enum Frame {
    Json(String),
    Closed { code: u16, reason: String },
    Skip,
}

fn decode_frame(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Json(text),
        // Live API はJSONをバイナリフレームで送ってくることがある
        Message::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Frame::Json(text),
            Err(_) => {
                log::warn!("UTF-8でないバイナリフレームを無視しました");
                Frame::Skip
            }
        },
        Message::Close(Some(frame)) => Frame::Closed {
            code: u16::from(frame.code),
            reason: frame.reason.into_owned(),
        },
        Message::Close(None) => Frame::Closed {
            code: NO_STATUS_CODE,
            reason: String::new(),
        },
        _ => Frame::Skip,
    }
}

fn classify_ws_error(error: WsError) -> SessionError {
    match error {
        WsError::Http(response) => {
            let body = response
                .body()
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default();
            classify_http_status(response.status().as_u16(), &body)
        }
        WsError::Url(e) => SessionError::fatal(format!("接続先URLが不正です: {}", e)),
        other => SessionError::transient(format!("接続に失敗しました: {}", other)),
    }
}

async fn await_setup_complete(stream: &mut SplitStream<LiveSocket>) -> Result<()> {
    while let Some(message) = stream.next().await {
        let message = message.map_err(classify_ws_error)?;
        match decode_frame(message) {
            Frame::Json(text) => match wire::parse_server_message(&text) {
                Ok(ParsedMessage::SetupComplete) => return Ok(()),
                Ok(other) => log::debug!("セットアップ完了前のメッセージを無視しました: {:?}", other),
                Err(e) => log::warn!("セットアップ応答を解釈できません: {}", e),
            },
            Frame::Closed { code, reason } => {
                return Err(classify_close(code, &reason).unwrap_or_else(|| {
                    SessionError::fatal("セットアップ完了前に接続が閉じられました")
                }))
            }
            Frame::Skip => {}
        }
    }
    Err(SessionError::transient("セットアップ完了前に接続が切断されました"))
}

async fn read_loop(mut stream: SplitStream<LiveSocket>, inbound: mpsc::Sender<InboundEvent>) {
    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                log::error!("受信に失敗しました: {}", e);
                let _ = inbound
                    .send(InboundEvent::Error(TransportFailure::transient(format!(
                        "受信に失敗しました: {}",
                        e
                    ))))
                    .await;
                return;
            }
        };

        match decode_frame(message) {
            Frame::Json(text) => match wire::parse_server_message(&text) {
                Ok(ParsedMessage::Events(events)) => {
                    for event in events {
                        if inbound.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(ParsedMessage::GoAway { time_left }) => {
                    log::warn!("サーバーがまもなく接続を閉じます (残り {:?})", time_left);
                }
                Ok(ParsedMessage::SetupComplete) => {
                    log::warn!("重複した setupComplete を無視しました");
                }
                Err(e) => log::warn!("受信メッセージを解釈できません: {}", e),
            },
            Frame::Closed { code, reason } => {
                log::info!("サーバーが接続を閉じました (code={}, reason={})", code, reason);
                let _ = inbound.send(InboundEvent::Closed { code, reason }).await;
                return;
            }
            Frame::Skip => {}
        }
    }

    let _ = inbound
        .send(InboundEvent::Closed {
            code: ABNORMAL_CLOSE_CODE,
            reason: "クローズフレームなしで切断されました".to_string(),
        })
        .await;
}

async fn write_loop(
    mut sink: SplitSink<LiveSocket, Message>,
    mut outbound: mpsc::Receiver<OutboundEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = outbound.recv() => match event {
                Some(OutboundEvent::Audio(chunk)) => {
                    let message = wire::realtime_input_message(&chunk).to_string();
                    if let Err(e) = sink.send(Message::Text(message)).await {
                        log::error!("音声の送信に失敗しました: {}", e);
                        return;
                    }
                }
                None => break,
            },
            _ = &mut shutdown => break,
        }
    }

    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        log::debug!("クローズフレームを送れませんでした: {}", e);
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AudioFrame, Direction, EncodedChunk, TranscriptToken};
    use serde_json::Value;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    const WAIT: Duration = Duration::from_secs(2);

    async fn local_endpoint() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}/live", listener.local_addr().unwrap());
        (listener, endpoint)
    }

    fn transport(endpoint: &str) -> LiveTransport {
        let connection = ConnectionConfig {
            endpoint: endpoint.to_string(),
            ..ConnectionConfig::default()
        };
        LiveTransport::new(&connection, "test-key").with_handshake_timeout(WAIT)
    }

    /// WebSocketへの昇格を断るだけのHTTPサーバー
    async fn rejecting_endpoint(status_line: &'static str) -> String {
        let (listener, endpoint) = local_endpoint().await;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                status_line
            );
            stream.write_all(response.as_bytes()).await.unwrap();
        });
        endpoint
    }

    async fn next_event(link: &mut TransportLink) -> InboundEvent {
        tokio::time::timeout(WAIT, link.inbound.recv())
            .await
            .expect("inbound wait timed out")
            .expect("inbound closed")
    }

    #[test]
    fn test_request_url_appends_key() {
        let connection = ConnectionConfig {
            endpoint: "wss://example.com/ws".to_string(),
            ..ConnectionConfig::default()
        };
        assert_eq!(
            LiveTransport::new(&connection, "abc").request_url(),
            "wss://example.com/ws?key=abc"
        );

        let connection = ConnectionConfig {
            endpoint: "wss://example.com/ws?alt=json".to_string(),
            ..ConnectionConfig::default()
        };
        assert_eq!(
            LiveTransport::new(&connection, "abc").request_url(),
            "wss://example.com/ws?alt=json&key=abc"
        );
    }

    #[tokio::test]
    async fn test_setup_then_audio_and_events() {
        let (listener, endpoint) = local_endpoint().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = accept_async(stream).await.unwrap();

            let setup = socket.next().await.unwrap().unwrap();
            let setup: Value = serde_json::from_str(setup.to_text().unwrap()).unwrap();
            assert_eq!(setup["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
            socket
                .send(Message::binary(br#"{"setupComplete":{}}"#.to_vec()))
                .await
                .unwrap();

            let audio = socket.next().await.unwrap().unwrap();
            let audio: Value = serde_json::from_str(audio.to_text().unwrap()).unwrap();
            assert_eq!(
                audio["realtimeInput"]["mediaChunks"][0]["mimeType"],
                "audio/pcm;rate=16000"
            );

            socket
                .send(Message::text(
                    r#"{"serverContent":{"outputTranscription":{"text":"Hello"},"turnComplete":true}}"#,
                ))
                .await
                .unwrap();
            socket
                .close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "bye".into(),
                }))
                .await
                .unwrap();
        });

        let mut transport = transport(&endpoint);
        let mut link = transport.connect(&SessionConfig::default()).await.unwrap();

        let chunk = EncodedChunk::from_frame(&AudioFrame::new(vec![0.0; 16], 16000));
        link.outbound.send(OutboundEvent::Audio(chunk)).await.unwrap();

        assert_eq!(
            next_event(&mut link).await,
            InboundEvent::TranscriptToken(TranscriptToken::new(Direction::Remote, "Hello"))
        );
        assert_eq!(next_event(&mut link).await, InboundEvent::TurnComplete);
        assert_eq!(
            next_event(&mut link).await,
            InboundEvent::Closed {
                code: 1000,
                reason: "bye".to_string()
            }
        );

        server.await.unwrap();
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unauthorized_handshake_is_fatal() {
        for status_line in ["401 Unauthorized", "403 Forbidden"] {
            let endpoint = rejecting_endpoint(status_line).await;
            let result = transport(&endpoint).connect(&SessionConfig::default()).await;
            assert!(
                matches!(result, Err(SessionError::TransportFatal { .. })),
                "{} should be fatal",
                status_line
            );
        }
    }

    #[tokio::test]
    async fn test_rate_limited_handshake_is_retriable() {
        for status_line in ["429 Too Many Requests", "503 Service Unavailable"] {
            let endpoint = rejecting_endpoint(status_line).await;
            let result = transport(&endpoint).connect(&SessionConfig::default()).await;
            assert!(
                matches!(result, Err(SessionError::TransportTransient { .. })),
                "{} should be retriable",
                status_line
            );
        }
    }

    #[tokio::test]
    async fn test_close_during_setup_is_classified() {
        let (listener, endpoint) = local_endpoint().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = accept_async(stream).await.unwrap();
            let _setup = socket.next().await;
            let _ = socket
                .close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: "API key not valid".into(),
                }))
                .await;
        });

        let result = transport(&endpoint).connect(&SessionConfig::default()).await;
        assert!(matches!(result, Err(SessionError::TransportFatal { .. })));
    }

    #[tokio::test]
    async fn test_missing_setup_complete_times_out() {
        let (listener, endpoint) = local_endpoint().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = accept_async(stream).await.unwrap();
            // 応答せずに保持する
            let _setup = socket.next().await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let result = transport(&endpoint)
            .with_handshake_timeout(Duration::from_millis(100))
            .connect(&SessionConfig::default())
            .await;
        assert!(matches!(result, Err(SessionError::TransportTransient { .. })));
        server.abort();
    }

    #[tokio::test]
    async fn test_close_without_connect_is_noop() {
        let mut transport = transport("ws://127.0.0.1:9/live");
        transport.close().await.unwrap();
    }
}
