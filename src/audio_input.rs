use crate::capture::{CaptureDevice, FrameSink};
use crate::config::AudioConfig;
use crate::error::{Result, SessionError};
use anyhow::Context;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SizedSample};
use crossbeam_channel::{bounded, Sender};
use regex_lite::Regex;
use std::thread::JoinHandle;
use std::time::Duration;

/// 会話の入力に使うべきでない仮想デバイス（システム音声のループバックなど）
const EXCLUDED_DEVICES: &str = "ZoomAudioDevice|Microsoft Teams|Background Music|BlackHole|Loopback";

/// ストリーム起動を待つ上限
const START_TIMEOUT: Duration = Duration::from_secs(5);

/// cpal のストリームを保持する専用スレッド
///
/// cpal のストリームはスレッド間で移動できないため、スレッド内で
/// デバイスを開いてストリームを保持し、停止の合図で破棄する。
pub(crate) struct StreamWorker {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

impl StreamWorker {
    /// スレッドを起動し、`open` がストリームを開くまで待つ
    pub(crate) fn spawn<F>(name: &str, open: F) -> Result<Self>
    where
        F: FnOnce() -> anyhow::Result<cpal::Stream> + Send + 'static,
    {
        let (ready_tx, ready_rx) = bounded::<std::result::Result<(), String>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match open() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("{:#}", e)));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // 停止の合図（または送信側の破棄）まで保持する
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| SessionError::device(format!("{} スレッドを起動できません: {}", name, e)))?;

        match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(())) => Ok(Self { stop_tx, thread }),
            Ok(Err(message)) => {
                let _ = thread.join();
                Err(SessionError::device(message))
            }
            Err(_) => {
                let _ = stop_tx.send(());
                Err(SessionError::device(format!(
                    "{} の起動がタイムアウトしました",
                    name
                )))
            }
        }
    }

    /// ストリームを破棄してスレッドの終了を待つ
    pub(crate) fn stop(self) -> Result<()> {
        let _ = self.stop_tx.send(());
        self.thread
            .join()
            .map_err(|_| SessionError::device("ストリームのスレッドが異常終了しました"))
    }
}

/// cpal によるマイク入力
pub struct CpalCapture {
    device_name: String,
    sample_rate: u32,
    worker: Option<StreamWorker>,
}

impl CpalCapture {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.input_device.clone(),
            sample_rate: config.capture_sample_rate,
            worker: None,
        }
    }

    /// デバイス一覧を表示
    pub fn list_devices() -> anyhow::Result<()> {
        println!("利用可能な入力デバイス:");
        println!();

        for (idx, device) in input_devices()?.into_iter().enumerate() {
            let name = device.name()?;
            println!("  [{}] {}", idx, name);

            device.supported_input_configs()?.for_each(|config_range| {
                println!(
                    "      フォーマット: {:?}, {}-{}Hz, {}ch",
                    config_range.sample_format(),
                    config_range.min_sample_rate().0,
                    config_range.max_sample_rate().0,
                    config_range.channels()
                );
            });
            println!();
        }

        Ok(())
    }
}

impl CaptureDevice for CpalCapture {
    fn start(&mut self, sink: FrameSink) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let device_name = self.device_name.clone();
        let sample_rate = self.sample_rate;
        let worker = StreamWorker::spawn("capture-stream", move || {
            open_stream(&device_name, sample_rate, sink)
        })?;
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker.stop()?;
        log::info!("音声入力ストリームを停止しました");
        Ok(())
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("{}", e);
        }
    }
}

fn open_stream(device_name: &str, sample_rate: u32, sink: FrameSink) -> anyhow::Result<cpal::Stream> {
    let device = select_device(device_name)?;
    log::info!("入力デバイス: {:?}", device.name());

    let default_config = device
        .default_input_config()
        .context("デフォルト入力設定が取得できません")?;

    log::info!(
        "デバイス設定: {:?}, {}Hz, {}ch",
        default_config.sample_format(),
        default_config.sample_rate().0,
        default_config.channels()
    );

    // チャンネル数はデバイスに合わせ、コールバック内でモノラルにまとめる
    let stream_config = cpal::StreamConfig {
        channels: default_config.channels(),
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = match default_config.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, sink)?,
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, sink)?,
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, sink)?,
        cpal::SampleFormat::I32 => build_stream::<i32>(&device, &stream_config, sink)?,
        format => anyhow::bail!("サポートされていないサンプルフォーマット: {:?}", format),
    };

    stream.play().context("ストリームの再生開始に失敗")?;
    log::info!("音声入力ストリームを開始しました ({}Hz)", sample_rate);

    Ok(stream)
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sink: FrameSink,
) -> anyhow::Result<cpal::Stream>
where
    T: SizedSample + Sample + Send + 'static,
    <T as Sample>::Float: Into<f32>,
{
    let channels = config.channels.max(1) as usize;
    let mut mono = Vec::new();

    let data_callback = move |data: &[T], _info: &cpal::InputCallbackInfo| {
        mono.clear();
        mono.extend(data.chunks(channels).map(|frame| {
            let sum: f32 = frame
                .iter()
                .map(|&sample| sample.to_float_sample().into())
                .sum();
            sum / frame.len() as f32
        }));

        // クローズ後のコールバックは受け口側で無視される
        sink.push_samples(&mono);
    };

    let error_callback = move |err| {
        log::error!("ストリームエラー: {}", err);
    };

    device
        .build_input_stream(config, data_callback, error_callback, None)
        .context("入力ストリームの構築に失敗")
}

fn select_device(device_name: &str) -> anyhow::Result<cpal::Device> {
    let host = cpal::default_host();
    if device_name == "default" {
        return host
            .default_input_device()
            .context("デフォルト入力デバイスが見つかりません");
    }

    input_devices()?
        .into_iter()
        .find(|d| d.name().ok().as_deref() == Some(device_name))
        .with_context(|| format!("デバイスが見つかりません: {}", device_name))
}

/// 仮想デバイスを除外した入力デバイス一覧
fn input_devices() -> anyhow::Result<Vec<cpal::Device>> {
    let host = cpal::default_host();
    let excluded = Regex::new(EXCLUDED_DEVICES).context("除外パターンが不正です")?;

    let devices = host
        .input_devices()
        .context("入力デバイスを列挙できません")?
        .filter(|device| match device.name() {
            Ok(name) => !excluded.is_match(&name),
            Err(_) => true,
        })
        .collect();
    Ok(devices)
}
