use anyhow::{Context, Result};
use env_logger::Env;
use live_voice::audio_input::CpalCapture;
use live_voice::audio_output::CpalPlayback;
use live_voice::config::Config;
use live_voice::live::LiveTransport;
use live_voice::replay::ReplayTransport;
use live_voice::session::{LiveSession, SessionParts};
use live_voice::transport::Transport;
use live_voice::tui::TuiApp;
use live_voice::types::SessionStatus;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

fn usage() -> &'static str {
    "使い方:
  live-voice [config.toml] [--tui]
  live-voice [config.toml] --replay FILE [--tui]
  live-voice --show-interfaces
  live-voice --generate-config [PATH]"
}

/// `--flag VALUE` の値を取り出す
fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|index| args.get(index + 1))
        .map(String::as_str)
}

#[tokio::main]
async fn main() -> Result<()> {
    // コマンドライン引数をパース
    let args: Vec<String> = std::env::args().collect();

    // デバイス一覧表示モード
    if args.len() > 1 && args[1] == "--show-interfaces" {
        CpalCapture::list_devices()?;
        CpalPlayback::list_devices()?;
        return Ok(());
    }

    // 設定ファイル生成モード
    if args.len() > 1 && args[1] == "--generate-config" {
        let config_path = if args.len() > 2 {
            args[2].as_str()
        } else {
            "config.toml"
        };
        Config::write_default(config_path)?;
        println!("設定ファイルを生成しました: {}", config_path);
        return Ok(());
    }

    // 設定ファイルのパス
    let config_path = if args.len() > 1 && !args[1].starts_with("--") {
        args[1].as_str()
    } else {
        "config.toml"
    };
    let use_tui = args.iter().any(|arg| arg == "--tui");

    let config_exists = std::path::Path::new(config_path).exists();
    let config = if config_exists {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    // ロガーを初期化（ログレベルは設定ファイルから。TUI表示中は RUST_LOG 指定時のみ出力）
    let default_filter = if use_tui {
        "off"
    } else {
        config.output.log_level.as_str()
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter))
        .format_timestamp(None)
        .init();

    if !config_exists {
        log::warn!("設定ファイルが見つかりません。デフォルト設定を使用します: {}", config_path);
    }

    if args.iter().any(|arg| arg == "--replay") && flag_value(&args, "--replay").is_none() {
        eprintln!("{}", usage());
        anyhow::bail!("再生ファイルが指定されていません (--replay FILE)");
    }

    // 接続先: 再生ファイル指定があればオフライン再生、なければ Live API
    let transport: Box<dyn Transport> = match flag_value(&args, "--replay") {
        Some(replay_path) => {
            log::info!("再生ファイルを使用します: {}", replay_path);
            Box::new(ReplayTransport::new(replay_path).close_at_end(!use_tui))
        }
        None => {
            let api_key = config.connection.resolve_api_key().with_context(|| {
                format!(
                    "APIキーが見つかりません。設定ファイルの connection.api_key か環境変数 {} を設定してください",
                    config.connection.api_key_env
                )
            })?;
            Box::new(LiveTransport::new(&config.connection, api_key))
        }
    };

    log::info!("live-voice を起動します");
    // connection には APIキーが入るので出さない
    log::info!(
        "設定: audio={:?}, capture={:?}, session={:?}",
        config.audio,
        config.capture,
        config.session
    );

    // Ctrl+C ハンドラを設定
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    ctrlc::set_handler(move || {
        log::info!("停止シグナルを受信しました...");
        running_clone.store(false, Ordering::SeqCst);
    })
    .context("Ctrl+C ハンドラの設定に失敗")?;

    let session = LiveSession::open(
        &config,
        SessionParts {
            transport,
            capture: Box::new(CpalCapture::new(&config.audio)),
            playback: Box::new(CpalPlayback::new(&config.audio)),
        },
    );

    if use_tui {
        let mut app = TuiApp::new(
            session.observer(),
            running.clone(),
            config.output.transcript_history,
            config.session.persona.clone(),
        );
        app.run().await.context("TUIの実行に失敗")?;
    } else {
        log::info!("セッションを実行中 (Ctrl+C で終了)");
        let mut observer = session.observer();
        while running.load(Ordering::SeqCst) && !observer.status().is_terminal() {
            tokio::select! {
                alive = observer.changed() => {
                    if !alive {
                        break;
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {
                    // タイムアウト: ループを継続して running をチェック
                }
            }
        }
    }

    // クリーンアップ
    log::info!("停止処理を開始します...");
    let transcript = session.close().await;

    // JSON形式で出力
    for line in transcript.lines() {
        println!(
            "{}",
            serde_json::to_string(line).context("文字起こしのシリアライズに失敗")?
        );
    }

    if let SessionStatus::Errored(cause) = session.status() {
        if cause.retriable {
            anyhow::bail!("{} (しばらく待ってから再試行してください)", cause.message);
        }
        anyhow::bail!("{}", cause.message);
    }

    log::info!("live-voice を終了しました");
    Ok(())
}
