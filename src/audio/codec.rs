//! Sample-Konvertierung und Wire-Formate
//!
//! - PCM16 little-endian <-> f32 (AI-Agent Uplink/Downlink)
//! - Base64 für eingebettete Audio-Payloads
//! - Lineares Resampling zwischen Kontext- und Geräte-Raten
//! - G.711 µ-law für den WebRTC-Audiotrack (PCMU)

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

// ============================================================================
// PCM16
// ============================================================================

/// f32-Samples als PCM16 little-endian Bytes
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&f32_to_i16(*sample).to_le_bytes());
    }
    out
}

/// PCM16 little-endian Bytes als f32-Samples
///
/// Ein überzähliges letztes Byte wird ignoriert.
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

fn f32_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * 32767.0) as i16
}

// ============================================================================
// BASE64
// ============================================================================

pub fn encode_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_base64(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(encoded)
}

// ============================================================================
// RESAMPLING
// ============================================================================

/// Einfaches Linear-Resampling eines Blocks
pub fn resample_linear(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || data.is_empty() {
        return data.to_vec();
    }

    let ratio = target_rate as f64 / source_rate as f64;
    let new_len = (data.len() as f64 * ratio).round() as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f64 / ratio;
            let idx = src_idx as usize;
            let frac = (src_idx - idx as f64) as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

/// Mischt interleaved Mehrkanal-Samples zu Mono
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

// ============================================================================
// G.711 µ-LAW
// ============================================================================

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

/// Kodiert ein 16-bit Sample nach G.711 µ-law
pub fn ulaw_encode(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };
    if pcm > ULAW_CLIP {
        pcm = ULAW_CLIP;
    }
    pcm += ULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (pcm & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) as i32 | mantissa) as u8
}

/// Dekodiert ein G.711 µ-law Byte
pub fn ulaw_decode(byte: u8) -> i16 {
    let u = !byte;
    let sign = u & 0x80;
    let exponent = ((u >> 4) & 0x07) as i32;
    let mantissa = (u & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// f32-Block nach µ-law
pub fn encode_ulaw_frame(samples: &[f32]) -> Vec<u8> {
    samples.iter().map(|s| ulaw_encode(f32_to_i16(*s))).collect()
}

/// µ-law Payload nach f32
pub fn decode_ulaw_frame(payload: &[u8]) -> Vec<f32> {
    payload
        .iter()
        .map(|b| ulaw_decode(*b) as f32 / 32768.0)
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm16_little_endian_layout() {
        let bytes = f32_to_pcm16(&[1.0, -1.0, 0.0]);
        assert_eq!(bytes, vec![0xFF, 0x7F, 0x01, 0x80, 0x00, 0x00]);
    }

    #[test]
    fn test_pcm16_clamps_out_of_range() {
        let bytes = f32_to_pcm16(&[4.0]);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), i16::MAX);
    }

    #[test]
    fn test_pcm16_ignores_trailing_byte() {
        let samples = pcm16_to_f32(&[0x00, 0x40, 0x12]);
        assert_eq!(samples, vec![0.5]);
    }

    #[test]
    fn test_base64_decodes_pcm_payload() {
        let encoded = encode_base64(&f32_to_pcm16(&[0.25, -0.25]));
        let decoded = pcm16_to_f32(&decode_base64(&encoded).unwrap());
        assert!((decoded[0] - 0.25).abs() < 1e-3);
        assert!((decoded[1] + 0.25).abs() < 1e-3);
    }

    #[test]
    fn test_resample_length() {
        let data = vec![0.0f32; 4800];
        assert_eq!(resample_linear(&data, 48000, 16000).len(), 1600);
        assert_eq!(resample_linear(&data, 24000, 48000).len(), 9600);
        assert_eq!(resample_linear(&data, 16000, 16000).len(), 4800);
    }

    #[test]
    fn test_resample_interpolates() {
        let out = resample_linear(&[0.0, 1.0], 1, 2);
        assert_eq!(out, vec![0.0, 0.5, 1.0, 1.0]);
    }

    #[test]
    fn test_downmix_stereo() {
        assert_eq!(downmix(&[1.0, 0.0, 0.5, 0.5], 2), vec![0.5, 0.5]);
    }

    #[test]
    fn test_ulaw_known_values() {
        assert_eq!(ulaw_encode(0), 0xFF);
        assert_eq!(ulaw_decode(0xFF), 0);
        assert_eq!(ulaw_encode(i16::MAX), 0x80);
        assert_eq!(ulaw_encode(i16::MIN), 0x00);
    }

    #[test]
    fn test_ulaw_error_is_bounded() {
        for sample in [-30000i16, -1000, -10, 10, 1000, 30000] {
            let decoded = ulaw_decode(ulaw_encode(sample));
            let error = (decoded as i32 - sample as i32).abs();
            // Logarithmische Quantisierung: Fehler wächst mit der Amplitude
            assert!(error <= (sample as i32).abs() / 16 + 8, "{sample} -> {decoded}");
        }
    }
}
