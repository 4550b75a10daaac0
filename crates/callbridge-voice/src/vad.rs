//! Energy-based voice activity detection and utterance endpointing.
//!
//! Batch recognizers need to be told where an utterance ends. The
//! [`Endpointer`] watches 20 ms windows of PCM, opens a segment once speech
//! has lasted `min_speech_ms`, and closes it after `min_silence_ms` of
//! silence (or when the segment reaches `max_utterance_ms`).

use tracing::trace;

/// Tuning knobs for [`Endpointer`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadConfig {
    /// RMS energy (0.0 - 1.0) above which a window counts as speech.
    pub threshold: f32,
    pub min_speech_ms: u32,
    pub min_silence_ms: u32,
    pub max_utterance_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.02,
            min_speech_ms: 60,
            min_silence_ms: 700,
            max_utterance_ms: 15_000,
        }
    }
}

/// Result of classifying one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadResult {
    Speech,
    Silence,
}

/// Voice activity detector with hysteresis.
#[derive(Debug)]
pub struct VoiceActivityDetector {
    threshold: f32,
    min_speech_samples: usize,
    min_silence_samples: usize,
    current_state: VadResult,
    state_counter: usize,
    energy_avg: f32,
}

/// Smoothing factor for the running energy average.
const ENERGY_ALPHA: f32 = 0.01;

impl VoiceActivityDetector {
    pub fn new(config: &VadConfig, sample_rate: u32) -> Self {
        Self {
            threshold: config.threshold,
            min_speech_samples: samples_for(config.min_speech_ms, sample_rate),
            min_silence_samples: samples_for(config.min_silence_ms, sample_rate),
            current_state: VadResult::Silence,
            state_counter: 0,
            energy_avg: 0.0,
        }
    }

    pub fn process(&mut self, samples: &[i16]) -> VadResult {
        let energy = rms(samples);
        self.energy_avg = ENERGY_ALPHA * energy + (1.0 - ENERGY_ALPHA) * self.energy_avg;

        let is_speech =
            energy > self.threshold || (self.energy_avg > 0.001 && energy > self.energy_avg * 2.0);

        match (self.current_state, is_speech) {
            (VadResult::Silence, true) => {
                self.state_counter += samples.len();
                if self.state_counter >= self.min_speech_samples {
                    self.current_state = VadResult::Speech;
                    self.state_counter = 0;
                    trace!("VAD: Silence -> Speech (energy: {:.4})", energy);
                }
            }
            (VadResult::Silence, false) => self.state_counter = 0,
            (VadResult::Speech, false) => {
                self.state_counter += samples.len();
                if self.state_counter >= self.min_silence_samples {
                    self.current_state = VadResult::Silence;
                    self.state_counter = 0;
                    trace!("VAD: Speech -> Silence (energy: {:.4})", energy);
                }
            }
            (VadResult::Speech, true) => self.state_counter = 0,
        }

        self.current_state
    }

    pub fn is_speech(&self) -> bool {
        self.current_state == VadResult::Speech
    }

    pub fn reset(&mut self) {
        self.current_state = VadResult::Silence;
        self.state_counter = 0;
        self.energy_avg = 0.0;
    }
}

/// Accumulates PCM and hands back complete utterances.
#[derive(Debug)]
pub struct Endpointer {
    vad: VoiceActivityDetector,
    window: usize,
    max_samples: usize,
    pending: Vec<i16>,
    segment: Vec<i16>,
    heard_audio: bool,
}

impl Endpointer {
    pub fn new(config: &VadConfig, sample_rate: u32) -> Self {
        Self {
            vad: VoiceActivityDetector::new(config, sample_rate),
            window: (sample_rate as usize / 50).max(1),
            max_samples: samples_for(config.max_utterance_ms, sample_rate),
            pending: Vec::new(),
            segment: Vec::new(),
            heard_audio: false,
        }
    }

    /// True once any audio has been pushed.
    pub fn heard_audio(&self) -> bool {
        self.heard_audio
    }

    /// True while a segment is being collected.
    pub fn in_speech(&self) -> bool {
        !self.segment.is_empty()
    }

    /// Feeds samples; returns the finished utterance, if one just ended.
    pub fn push(&mut self, samples: &[i16]) -> Option<Vec<i16>> {
        self.heard_audio = true;
        self.pending.extend_from_slice(samples);

        while self.pending.len() >= self.window {
            let window: Vec<i16> = self.pending.drain(..self.window).collect();
            let was_speech = self.vad.is_speech();
            let state = self.vad.process(&window);

            if state == VadResult::Speech || !self.segment.is_empty() {
                self.segment.extend_from_slice(&window);
            }

            let ended = was_speech && state == VadResult::Silence;
            if ended || self.segment.len() >= self.max_samples {
                self.vad.reset();
                self.pending.clear();
                return Some(std::mem::take(&mut self.segment));
            }
        }
        None
    }

    /// Returns whatever speech is buffered, e.g. when the input ends.
    pub fn flush(&mut self) -> Option<Vec<i16>> {
        if self.segment.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.segment))
        }
    }
}

fn samples_for(ms: u32, sample_rate: u32) -> usize {
    (u64::from(ms) * u64::from(sample_rate) / 1000) as usize
}

fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples
        .iter()
        .map(|&s| {
            let x = f32::from(s) / 32_768.0;
            x * x
        })
        .sum();
    (sum / samples.len() as f32).sqrt()
}
