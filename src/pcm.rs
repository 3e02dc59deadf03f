//! PCM変換
//!
//! 16ビットLE PCMのバイト列と正規化サンプル (-1.0 ~ 1.0) の相互変換、
//! およびバイト列と転送用テキスト (base64) の相互変換。状態は持たない。

use crate::error::{Result, SessionError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// 正規化の基準値
const I16_SCALE: f32 = 32768.0;

/// バイト列を正規化サンプルにデコード
///
/// # Errors
///
/// バイト長が2の倍数でない場合 `MalformedAudio` を返す。
///
/// # Examples
///
/// ```
/// # use live_voice::pcm;
/// let samples = pcm::decode(&[0x00, 0x40, 0x00, 0xC0]).unwrap();
/// assert_eq!(samples, vec![0.5, -0.5]);
/// ```
pub fn decode(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(SessionError::malformed(format!(
            "バイト長が2の倍数ではありません: {}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / I16_SCALE)
        .collect())
}

/// 正規化サンプルをバイト列にエンコード
///
/// 範囲外の値は -1.0 ~ 1.0 にクランプしてから整数化する（ラップアラウンド防止）。
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // f32 → i16 の `as` は飽和変換なので 1.0 は 32767 になる
        let value = (sample.clamp(-1.0, 1.0) * I16_SCALE) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// バイト列を転送用テキストに変換
pub fn to_transport_text(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// 転送用テキストをバイト列に戻す
///
/// # Errors
///
/// base64として解釈できない場合 `MalformedAudio` を返す。
pub fn from_transport_text(text: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(text.trim())
        .map_err(|e| SessionError::malformed(format!("base64デコード失敗: {}", e)))
}
