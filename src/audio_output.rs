use crate::audio_input::StreamWorker;
use crate::config::AudioConfig;
use crate::error::Result;
use crate::playback::{PlaybackDevice, SlotId};
use anyhow::Context;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

struct MixerSlot {
    /// 開始位置（再生クロック上のフレーム番号）
    start: u64,
    samples: Vec<f32>,
}

impl MixerSlot {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

/// 出力コールバックと共有するスロット表
///
/// クロックは出力したフレーム数で進む。予約されたスロットを
/// 開始位置に合わせて重ね合わせ、鳴り終えたものを表から外す。
struct Mixer {
    sample_rate: u32,
    position: u64,
    slots: BTreeMap<SlotId, MixerSlot>,
    completions: Option<mpsc::UnboundedSender<SlotId>>,
}

impl Mixer {
    fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            position: 0,
            slots: BTreeMap::new(),
            completions: None,
        }
    }

    fn current_time(&self) -> f64 {
        self.position as f64 / self.sample_rate as f64
    }

    fn schedule(&mut self, slot: SlotId, samples: Vec<f32>, start_at: f64) {
        let start = (start_at.max(0.0) * self.sample_rate as f64).round() as u64;
        // 過去の時刻は鳴らせないので現在位置から
        let start = start.max(self.position);
        self.slots.insert(slot, MixerSlot { start, samples });
    }

    fn stop_slot(&mut self, slot: SlotId) -> bool {
        self.slots.remove(&slot).is_some()
    }

    /// `out` をモノラルで埋めてクロックを進める
    ///
    /// # Returns
    /// このバッファで鳴り終えたスロット
    fn render(&mut self, out: &mut [f32]) -> Vec<SlotId> {
        out.fill(0.0);
        let begin = self.position;
        let end = begin + out.len() as u64;

        let mut finished = Vec::new();
        for (id, slot) in &self.slots {
            let from = slot.start.max(begin);
            let to = slot.end().min(end);
            for t in from..to {
                out[(t - begin) as usize] += slot.samples[(t - slot.start) as usize];
            }
            if slot.end() <= end {
                finished.push(*id);
            }
        }

        for id in &finished {
            self.slots.remove(id);
        }
        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
        self.position = end;
        finished
    }

    fn notify(&self, finished: &[SlotId]) {
        if let Some(completions) = &self.completions {
            for id in finished {
                let _ = completions.send(*id);
            }
        }
    }
}

fn lock_mixer(mixer: &Mutex<Mixer>) -> MutexGuard<'_, Mixer> {
    match mixer.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// cpal による合成音声の出力
pub struct CpalPlayback {
    device_name: String,
    sample_rate: u32,
    mixer: Arc<Mutex<Mixer>>,
    worker: Option<StreamWorker>,
}

impl CpalPlayback {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.output_device.clone(),
            sample_rate: config.playback_sample_rate,
            mixer: Arc::new(Mutex::new(Mixer::new(config.playback_sample_rate))),
            worker: None,
        }
    }

    /// デバイス一覧を表示
    pub fn list_devices() -> anyhow::Result<()> {
        let host = cpal::default_host();
        println!("=== 利用可能な出力デバイス ===");

        let default_name = host.default_output_device().and_then(|d| d.name().ok());
        for (idx, device) in host.output_devices()?.enumerate() {
            let name = device.name()?;
            let marker = if default_name.as_deref() == Some(name.as_str()) {
                " (デフォルト)"
            } else {
                ""
            };
            println!("{}. {}{}", idx, name, marker);

            if let Ok(config) = device.default_output_config() {
                println!(
                    "   サンプルレート: {} Hz, チャンネル数: {}",
                    config.sample_rate().0,
                    config.channels()
                );
            }
        }

        Ok(())
    }
}

impl PlaybackDevice for CpalPlayback {
    fn start(&mut self, completions: mpsc::UnboundedSender<SlotId>) -> Result<()> {
        lock_mixer(&self.mixer).completions = Some(completions);
        if self.worker.is_some() {
            return Ok(());
        }

        let device_name = self.device_name.clone();
        let sample_rate = self.sample_rate;
        let mixer = Arc::clone(&self.mixer);
        let worker = StreamWorker::spawn("playback-stream", move || {
            open_stream(&device_name, sample_rate, mixer)
        })?;
        self.worker = Some(worker);
        Ok(())
    }

    fn schedule_buffer(&mut self, slot: SlotId, samples: Vec<f32>, start_at: f64) -> Result<()> {
        lock_mixer(&self.mixer).schedule(slot, samples, start_at);
        Ok(())
    }

    fn stop_slot(&mut self, slot: SlotId) {
        lock_mixer(&self.mixer).stop_slot(slot);
    }

    fn current_time(&self) -> f64 {
        lock_mixer(&self.mixer).current_time()
    }

    fn stop(&mut self) -> Result<()> {
        {
            let mut mixer = lock_mixer(&self.mixer);
            mixer.slots.clear();
            mixer.completions = None;
        }

        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker.stop()?;
        log::info!("出力ストリームを停止しました");
        Ok(())
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("{}", e);
        }
    }
}

fn open_stream(device_name: &str, sample_rate: u32, mixer: Arc<Mutex<Mixer>>) -> anyhow::Result<Stream> {
    let host = cpal::default_host();

    let device = if device_name == "default" {
        host.default_output_device()
            .context("デフォルト出力デバイスが見つかりません")?
    } else {
        host.output_devices()?
            .find(|d| d.name().map(|n| n == device_name).unwrap_or(false))
            .with_context(|| format!("出力デバイス '{}' が見つかりません", device_name))?
    };
    log::info!("出力デバイス: {}", device.name()?);

    let default_config = device
        .default_output_config()
        .context("デフォルト出力設定が取得できません")?;

    log::info!(
        "出力デバイス設定: {:?}, {}Hz, {}ch",
        default_config.sample_format(),
        default_config.sample_rate().0,
        default_config.channels()
    );

    let config = StreamConfig {
        channels: default_config.channels(),
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = match default_config.sample_format() {
        SampleFormat::F32 => build_stream::<f32>(&device, config, mixer)?,
        SampleFormat::I16 => build_stream::<i16>(&device, config, mixer)?,
        SampleFormat::U16 => build_stream::<u16>(&device, config, mixer)?,
        format => anyhow::bail!("サポートされていないサンプルフォーマット: {:?}", format),
    };

    stream.play().context("ストリームの再生開始に失敗")?;
    log::info!("出力ストリームを開始しました ({}Hz)", sample_rate);

    Ok(stream)
}

fn build_stream<T>(device: &Device, config: StreamConfig, mixer: Arc<Mutex<Mixer>>) -> anyhow::Result<Stream>
where
    T: SizedSample + Sample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    let mut mono = Vec::new();

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                mono.resize(data.len() / channels, 0.0);
                {
                    let mut mixer = lock_mixer(&mixer);
                    let finished = mixer.render(&mut mono);
                    mixer.notify(&finished);
                }

                for (frame, value) in data.chunks_mut(channels).zip(mono.iter()) {
                    for sample in frame.iter_mut() {
                        *sample = T::from_sample(*value);
                    }
                }
            },
            move |err| {
                log::error!("出力ストリームエラー: {}", err);
            },
            None,
        )
        .context("出力ストリームの構築に失敗")?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(n: u64) -> SlotId {
        SlotId::new(n)
    }

    #[test]
    fn test_render_plays_slots_back_to_back() {
        let mut mixer = Mixer::new(4);
        mixer.schedule(slot(0), vec![0.1, 0.1], 0.0);
        mixer.schedule(slot(1), vec![0.2, 0.2, 0.2], 0.5);

        let mut out = vec![0.0; 4];
        let finished = mixer.render(&mut out);
        assert_eq!(out, vec![0.1, 0.1, 0.2, 0.2]);
        assert_eq!(finished, vec![slot(0)]);
        assert_eq!(mixer.current_time(), 1.0);

        let finished = mixer.render(&mut out);
        assert_eq!(out, vec![0.2, 0.0, 0.0, 0.0]);
        assert_eq!(finished, vec![slot(1)]);
        assert!(mixer.slots.is_empty());
    }

    #[test]
    fn test_slot_in_the_past_starts_now() {
        let mut mixer = Mixer::new(4);
        let mut out = vec![0.0; 4];
        mixer.render(&mut out);

        mixer.schedule(slot(0), vec![0.5], 0.0);
        mixer.render(&mut out);
        assert_eq!(out[0], 0.5);
    }

    #[test]
    fn test_stopped_slot_is_silent_and_not_reported() {
        let mut mixer = Mixer::new(4);
        mixer.schedule(slot(0), vec![0.3; 8], 0.0);

        let mut out = vec![0.0; 4];
        mixer.render(&mut out);
        assert!(mixer.stop_slot(slot(0)));
        assert!(!mixer.stop_slot(slot(0)));

        let finished = mixer.render(&mut out);
        assert!(finished.is_empty());
        assert_eq!(out, vec![0.0; 4]);
    }

    #[test]
    fn test_notify_sends_completions() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(4);
        mixer.completions = Some(tx);
        mixer.schedule(slot(7), vec![0.1], 0.0);

        let mut out = vec![0.0; 2];
        let finished = mixer.render(&mut out);
        mixer.notify(&finished);
        assert_eq!(rx.try_recv().unwrap(), slot(7));
    }

    #[test]
    fn test_mixed_output_is_clamped() {
        let mut mixer = Mixer::new(4);
        mixer.schedule(slot(0), vec![0.8], 0.0);
        mixer.schedule(slot(1), vec![0.8], 0.0);

        let mut out = vec![0.0; 1];
        mixer.render(&mut out);
        assert_eq!(out[0], 1.0);
    }
}
