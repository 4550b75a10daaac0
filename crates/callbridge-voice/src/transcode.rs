//! Conversion between the carrier's µ-law wire format and the linear PCM
//! that recognition and synthesis providers speak.
//!
//! Everything here is a pure function of the input bytes and the declared
//! formats. Callers on the media hot path use [`Transcoder`], which turns
//! failures into dropped frames instead of errors so a bad frame can never
//! stall the wire clock.

use crate::error::VoiceError;
use callbridge_types::{AudioEncoding, AudioFormat, AudioFrame, CARRIER_FRAME_MS};
use tracing::warn;

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32_635;

/// Expands one G.711 µ-law byte to a 16-bit linear sample.
pub fn mulaw_to_linear(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = (byte >> 4) & 0x07;
    let mantissa = i32::from(byte & 0x0f);
    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Compresses a 16-bit linear sample to one G.711 µ-law byte.
pub fn linear_to_mulaw(sample: i16) -> u8 {
    let mut magnitude = i32::from(sample);
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0x00
    };
    magnitude = magnitude.min(MULAW_CLIP) + MULAW_BIAS;

    // magnitude >> 7 lies in 1..=255, so the exponent is its bit length - 1.
    let exponent = 31 - ((magnitude >> 7) as u32).leading_zeros();
    let mantissa = (magnitude >> (exponent + 3)) & 0x0f;
    !(sign | ((exponent as i32) << 4) | mantissa) as u8
}

/// Decodes a frame into mono 16-bit samples.
pub fn decode_samples(frame: &AudioFrame) -> Result<Vec<i16>, VoiceError> {
    let format = frame.format;
    format.validate()?;
    let width = format.frame_width();
    if frame.data.len() % width != 0 {
        return Err(VoiceError::Transcode(format!(
            "{} bytes is not a whole number of {}-byte samples ({})",
            frame.data.len(),
            width,
            format
        )));
    }

    let interleaved: Vec<i16> = match format.encoding {
        AudioEncoding::Mulaw => frame.data.iter().copied().map(mulaw_to_linear).collect(),
        AudioEncoding::Pcm16 => frame
            .data
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect(),
    };

    if format.channels == 1 {
        return Ok(interleaved);
    }
    let channels = usize::from(format.channels);
    Ok(interleaved
        .chunks_exact(channels)
        .map(|group| {
            let sum: i32 = group.iter().map(|&s| i32::from(s)).sum();
            (sum / channels as i32) as i16
        })
        .collect())
}

/// Encodes mono samples into `format`.
pub fn encode_samples(samples: &[i16], format: AudioFormat) -> Result<Vec<u8>, VoiceError> {
    format.validate()?;
    let channels = usize::from(format.channels);
    let mut out = Vec::with_capacity(samples.len() * format.frame_width());
    for &sample in samples {
        for _ in 0..channels {
            match format.encoding {
                AudioEncoding::Mulaw => out.push(linear_to_mulaw(sample)),
                AudioEncoding::Pcm16 => out.extend_from_slice(&sample.to_le_bytes()),
            }
        }
    }
    Ok(out)
}

/// Linear-interpolation resampler.
///
/// The output length is `round(len * to / from)`, so a round trip between
/// two rates preserves duration.
pub fn resample(samples: &[i16], from: u32, to: u32) -> Vec<i16> {
    if from == to || samples.is_empty() || from == 0 || to == 0 {
        return samples.to_vec();
    }

    let out_len = ((samples.len() as u64 * u64::from(to) + u64::from(from) / 2) / u64::from(from))
        as usize;
    let step = f64::from(from) / f64::from(to);
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let position = i as f64 * step;
            let index = (position.floor() as usize).min(last);
            let next = (index + 1).min(last);
            let frac = position - index as f64;
            let a = f64::from(samples[index]);
            let b = f64::from(samples[next]);
            (a + (b - a) * frac).round() as i16
        })
        .collect()
}

/// Converts a frame to `target`, keeping its sequence number.
pub fn transcode(frame: &AudioFrame, target: AudioFormat) -> Result<AudioFrame, VoiceError> {
    if frame.format == target {
        return Ok(frame.clone());
    }
    let samples = decode_samples(frame)?;
    let samples = resample(&samples, frame.format.sample_rate, target.sample_rate);
    let data = encode_samples(&samples, target)?;
    Ok(AudioFrame::new(data, target, frame.sequence))
}

/// Converts frames between the carrier format and the recognizer format.
#[derive(Debug, Clone, Copy)]
pub struct Transcoder {
    carrier: AudioFormat,
    recognition: AudioFormat,
}

impl Transcoder {
    pub fn new(carrier: AudioFormat, recognition: AudioFormat) -> Self {
        Self {
            carrier,
            recognition,
        }
    }

    pub fn carrier_format(&self) -> AudioFormat {
        self.carrier
    }

    pub fn recognition_format(&self) -> AudioFormat {
        self.recognition
    }

    /// Returns `None` (and logs) when the frame cannot be converted.
    pub fn to_recognition_format(&self, frame: &AudioFrame) -> Option<AudioFrame> {
        self.convert(frame, self.recognition)
    }

    /// Returns `None` (and logs) when the frame cannot be converted.
    pub fn to_carrier_format(&self, frame: &AudioFrame) -> Option<AudioFrame> {
        self.convert(frame, self.carrier)
    }

    fn convert(&self, frame: &AudioFrame, target: AudioFormat) -> Option<AudioFrame> {
        match transcode(frame, target) {
            Ok(converted) => Some(converted),
            Err(e) => {
                warn!(
                    sequence = frame.sequence,
                    source = %frame.format,
                    target = %target,
                    "dropping audio frame: {}",
                    e
                );
                None
            }
        }
    }
}

/// Resampler that carries its fractional read position across chunks.
///
/// Chunked input resampled with [`resample`] drifts because every chunk is
/// rounded on its own; this one interpolates across chunk boundaries.
#[derive(Debug)]
struct StreamResampler {
    step: f64,
    position: f64,
    history: Vec<i16>,
}

impl StreamResampler {
    fn new(from: u32, to: u32) -> Self {
        Self {
            step: f64::from(from) / f64::from(to),
            position: 0.0,
            history: Vec::new(),
        }
    }

    fn process(&mut self, input: &[i16]) -> Vec<i16> {
        if self.step == 1.0 {
            return input.to_vec();
        }
        self.history.extend_from_slice(input);

        let mut out = Vec::with_capacity((input.len() as f64 / self.step) as usize + 1);
        while (self.position.floor() as usize) + 1 < self.history.len() {
            out.push(self.sample_at(self.position));
            self.position += self.step;
        }

        let consumed = (self.position.floor() as usize).min(self.history.len());
        self.history.drain(..consumed);
        self.position -= consumed as f64;
        out
    }

    fn finish(&mut self) -> Vec<i16> {
        let mut out = Vec::new();
        while (self.position.floor() as usize) < self.history.len() {
            out.push(self.sample_at(self.position));
            self.position += self.step;
        }
        self.history.clear();
        out
    }

    fn sample_at(&self, position: f64) -> i16 {
        let last = self.history.len() - 1;
        let index = (position.floor() as usize).min(last);
        let next = (index + 1).min(last);
        let frac = position - index as f64;
        let a = f64::from(self.history[index]);
        let b = f64::from(self.history[next]);
        (a + (b - a) * frac).round() as i16
    }
}

/// Re-frames arbitrarily sized provider audio into fixed carrier frames.
///
/// Input chunks may split samples; bytes are held back until a whole sample
/// is available. Output frames are exactly [`CARRIER_FRAME_MS`] long except
/// for the last one returned by [`FrameAssembler::finish`].
#[derive(Debug)]
pub struct FrameAssembler {
    source: AudioFormat,
    target: AudioFormat,
    frame_bytes: usize,
    resampler: StreamResampler,
    pending_source: Vec<u8>,
    pending_target: Vec<u8>,
    sequence: u64,
}

impl FrameAssembler {
    pub fn new(source: AudioFormat, target: AudioFormat) -> Result<Self, VoiceError> {
        source.validate()?;
        target.validate()?;
        Ok(Self {
            source,
            target,
            frame_bytes: target.bytes_for_millis(CARRIER_FRAME_MS).max(1),
            resampler: StreamResampler::new(source.sample_rate, target.sample_rate),
            pending_source: Vec::new(),
            pending_target: Vec::new(),
            sequence: 0,
        })
    }

    pub fn source_format(&self) -> AudioFormat {
        self.source
    }

    /// Feeds provider bytes and returns every complete carrier frame.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<AudioFrame> {
        self.pending_source.extend_from_slice(chunk);
        let width = self.source.frame_width();
        let aligned = self.pending_source.len() - self.pending_source.len() % width;
        if aligned > 0 {
            let bytes: Vec<u8> = self.pending_source.drain(..aligned).collect();
            let frame = AudioFrame::new(bytes, self.source, self.sequence);
            match decode_samples(&frame) {
                Ok(samples) => {
                    let resampled = self.resampler.process(&samples);
                    self.encode_pending(&resampled);
                }
                Err(e) => warn!(source = %self.source, "dropping synthesized audio: {}", e),
            }
        }
        self.drain_frames()
    }

    /// Flushes everything still buffered. The last frame may be short.
    pub fn finish(mut self) -> Vec<AudioFrame> {
        let tail = self.resampler.finish();
        self.encode_pending(&tail);
        let mut frames = self.drain_frames();
        if !self.pending_target.is_empty() {
            let data = std::mem::take(&mut self.pending_target);
            frames.push(self.next_frame(data));
        }
        frames
    }

    fn encode_pending(&mut self, samples: &[i16]) {
        match encode_samples(samples, self.target) {
            Ok(bytes) => self.pending_target.extend_from_slice(&bytes),
            Err(e) => warn!(target = %self.target, "dropping synthesized audio: {}", e),
        }
    }

    fn drain_frames(&mut self) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        while self.pending_target.len() >= self.frame_bytes {
            let data: Vec<u8> = self.pending_target.drain(..self.frame_bytes).collect();
            frames.push(self.next_frame(data));
        }
        frames
    }

    fn next_frame(&mut self, data: Vec<u8>) -> AudioFrame {
        let frame = AudioFrame::new(data, self.target, self.sequence);
        self.sequence += 1;
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len: usize, amplitude: f64, rate: u32) -> Vec<i16> {
        (0..len)
            .map(|i| {
                let t = i as f64 / f64::from(rate);
                (amplitude * (2.0 * std::f64::consts::PI * 440.0 * t).sin()) as i16
            })
            .collect()
    }

    #[test]
    fn mulaw_silence_and_extremes() {
        assert_eq!(linear_to_mulaw(0), 0xff);
        assert_eq!(mulaw_to_linear(0xff), 0);
        assert_eq!(mulaw_to_linear(0x7f), 0);
        assert_eq!(mulaw_to_linear(linear_to_mulaw(i16::MAX)), 32_124);
        assert_eq!(mulaw_to_linear(linear_to_mulaw(i16::MIN)), -32_124);
    }

    #[test]
    fn mulaw_quantization_error_is_bounded() {
        for sample in (-32_000i16..32_000).step_by(97) {
            let restored = mulaw_to_linear(linear_to_mulaw(sample));
            let error = (i32::from(sample) - i32::from(restored)).abs();
            let tolerance = (i32::from(sample).abs() / 16).max(8);
            assert!(
                error <= tolerance,
                "sample {} restored as {} (error {})",
                sample,
                restored,
                error
            );
        }
    }

    #[test]
    fn every_mulaw_byte_is_stable_after_one_pass() {
        for byte in 0u8..=255 {
            let once = linear_to_mulaw(mulaw_to_linear(byte));
            let twice = linear_to_mulaw(mulaw_to_linear(once));
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn resample_preserves_duration() {
        let input = tone(160, 8_000.0, 8_000);
        let up = resample(&input, 8_000, 16_000);
        assert_eq!(up.len(), 320);
        let down = resample(&up, 16_000, 8_000);
        assert_eq!(down, input);

        let odd = resample(&tone(441, 1_000.0, 22_050), 22_050, 8_000);
        assert_eq!(odd.len(), 160);
    }

    #[test]
    fn carrier_round_trip_keeps_duration_and_amplitude() {
        let pcm = tone(160, 12_000.0, 8_000);
        let carrier = AudioFrame::new(
            encode_samples(&pcm, AudioFormat::carrier()).unwrap(),
            AudioFormat::carrier(),
            7,
        );
        let transcoder = Transcoder::new(AudioFormat::carrier(), AudioFormat::pcm16(16_000));

        let recognition = transcoder.to_recognition_format(&carrier).unwrap();
        assert_eq!(recognition.data.len(), 640);
        assert_eq!(recognition.sequence, 7);

        let back = transcoder.to_carrier_format(&recognition).unwrap();
        assert_eq!(back.duration_micros(), carrier.duration_micros());
        for (a, b) in carrier.data.iter().zip(&back.data) {
            let diff = (i32::from(mulaw_to_linear(*a)) - i32::from(mulaw_to_linear(*b))).abs();
            assert!(diff <= 1_024, "amplitude drifted by {}", diff);
        }
    }

    #[test]
    fn malformed_frame_is_dropped() {
        let transcoder = Transcoder::new(AudioFormat::carrier(), AudioFormat::pcm16(16_000));
        let odd = AudioFrame::new(vec![1, 2, 3], AudioFormat::pcm16(16_000), 0);
        assert!(transcoder.to_carrier_format(&odd).is_none());

        let no_rate = AudioFrame::new(vec![0xff; 10], AudioFormat::pcm16(0), 0);
        assert!(transcoder.to_carrier_format(&no_rate).is_none());
    }

    #[test]
    fn stereo_is_downmixed() {
        let frame = AudioFrame::new(
            [100i16, 300, -50, -150]
                .iter()
                .flat_map(|s| s.to_le_bytes())
                .collect(),
            AudioFormat::new(AudioEncoding::Pcm16, 8_000, 2),
            0,
        );
        assert_eq!(decode_samples(&frame).unwrap(), vec![200, -100]);
    }

    #[test]
    fn assembler_emits_fixed_frames_across_split_samples() {
        let pcm: Vec<u8> = tone(16_000, 6_000.0, 16_000)
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let mut assembler =
            FrameAssembler::new(AudioFormat::pcm16(16_000), AudioFormat::carrier()).unwrap();

        let mut frames = Vec::new();
        // Odd chunk sizes split samples across pushes.
        for chunk in pcm.chunks(333) {
            frames.extend(assembler.push(chunk));
        }
        frames.extend(assembler.finish());

        let total: usize = frames.iter().map(|f| f.data.len()).sum();
        assert!((7_990..=8_010).contains(&total), "got {} bytes", total);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.sequence, i as u64);
            if i + 1 < frames.len() {
                assert_eq!(frame.data.len(), 160);
            }
        }
    }
}
