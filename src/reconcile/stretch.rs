//! Pitch-preserving time stretching (WSOLA).
//!
//! Overlap-adds Hann-windowed input segments at a fixed output hop and picks
//! each segment within a small tolerance of its nominal position so that it
//! best continues the previously copied one. Pure arithmetic over the input
//! samples, so the same input and target always give the same output.

use crate::audio::PcmAudio;

/// Analysis window length in milliseconds
const WINDOW_MS: u32 = 30;
/// Search only every n-th sample when correlating candidates
const CORRELATION_STEP: usize = 4;

fn hann(len: usize) -> Vec<f32> {
    (0..len)
        .map(|n| 0.5 - 0.5 * (std::f32::consts::TAU * n as f32 / len as f32).cos())
        .collect()
}

fn sample_at(samples: &[f32], index: usize) -> f32 {
    samples.get(index).copied().unwrap_or(0.0)
}

fn correlation(samples: &[f32], a: usize, b: usize, len: usize) -> f32 {
    (0..len)
        .step_by(CORRELATION_STEP)
        .map(|n| sample_at(samples, a + n) * sample_at(samples, b + n))
        .sum()
}

/// Length change by linear interpolation for clips shorter than one window.
fn interpolate_to(audio: &PcmAudio, target_frames: usize) -> PcmAudio {
    let len = audio.samples.len();
    if target_frames == 0 || len == 0 {
        return PcmAudio::new(vec![0.0; target_frames], audio.sample_rate);
    }
    let step = len as f64 / target_frames as f64;
    let samples = (0..target_frames)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(len - 1);
            let next = (idx + 1).min(len - 1);
            let frac = (pos - idx as f64) as f32;
            audio.samples[idx] * (1.0 - frac) + audio.samples[next] * frac
        })
        .collect();
    PcmAudio::new(samples, audio.sample_rate)
}

/// Stretch or compress `audio` to exactly `target_frames` samples.
pub fn time_stretch(audio: &PcmAudio, target_frames: usize) -> PcmAudio {
    let input = &audio.samples;
    let len = input.len();
    if target_frames == len {
        return audio.clone();
    }

    let window_len = ((audio.sample_rate * WINDOW_MS / 1000) as usize).max(4) & !1;
    if len < window_len * 2 || target_frames < window_len {
        return interpolate_to(audio, target_frames);
    }

    let hop = window_len / 2;
    let tolerance = window_len / 4;
    let window = hann(window_len);
    let speed = len as f64 / target_frames as f64;
    let max_start = len - window_len;

    let mut output = vec![0.0f32; target_frames + window_len];
    let mut norm = vec![0.0f32; target_frames + window_len];
    let mut previous: Option<usize> = None;
    let mut out_pos = 0usize;

    while out_pos < target_frames {
        let nominal = ((out_pos as f64 * speed).round() as usize).min(max_start);

        let chosen = match previous {
            None => nominal,
            Some(prev) => {
                let natural = prev + hop;
                let low = nominal.saturating_sub(tolerance);
                let high = (nominal + tolerance).min(max_start);
                let mut best = nominal;
                let mut best_score = f32::NEG_INFINITY;
                for candidate in low..=high {
                    let score = correlation(input, candidate, natural, window_len);
                    if score > best_score {
                        best_score = score;
                        best = candidate;
                    }
                }
                best
            }
        };

        for n in 0..window_len {
            output[out_pos + n] += window[n] * input[chosen + n];
            norm[out_pos + n] += window[n];
        }

        previous = Some(chosen);
        out_pos += hop;
    }

    output.truncate(target_frames);
    for (sample, weight) in output.iter_mut().zip(norm) {
        if weight > 1e-3 {
            *sample /= weight;
        }
    }

    PcmAudio::new(output, audio.sample_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(frequency: f32, frames: usize, sample_rate: u32) -> PcmAudio {
        let samples = (0..frames)
            .map(|i| 0.5 * (std::f32::consts::TAU * frequency * i as f32 / sample_rate as f32).sin())
            .collect();
        PcmAudio::new(samples, sample_rate)
    }

    fn crossings_per_second(audio: &PcmAudio) -> f32 {
        let crossings = audio
            .samples
            .windows(2)
            .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
            .count();
        crossings as f32 / (audio.frames() as f32 / audio.sample_rate as f32)
    }

    #[test]
    fn test_output_has_exact_length() {
        let audio = sine(220.0, 36_000, 8000);
        assert_eq!(time_stretch(&audio, 24_000).frames(), 24_000);
        assert_eq!(time_stretch(&audio, 40_000).frames(), 40_000);
        assert_eq!(time_stretch(&audio, 36_000), audio);
    }

    #[test]
    fn test_compression_preserves_pitch() {
        let audio = sine(200.0, 24_000, 8000);
        let compressed = time_stretch(&audio, 16_000);

        let before = crossings_per_second(&audio);
        let after = crossings_per_second(&compressed);
        assert!(
            (after - before).abs() / before < 0.1,
            "pitch drifted: {} -> {} crossings/s",
            before,
            after
        );
    }

    #[test]
    fn test_stretch_is_deterministic() {
        let audio = sine(310.0, 20_000, 16_000);
        let a = time_stretch(&audio, 13_333);
        let b = time_stretch(&audio, 13_333);
        assert_eq!(a.samples, b.samples);
    }

    #[test]
    fn test_short_and_empty_clips() {
        let short = PcmAudio::new(vec![0.1; 50], 16_000);
        assert_eq!(time_stretch(&short, 30).frames(), 30);

        let empty = PcmAudio::new(Vec::new(), 16_000);
        assert_eq!(time_stretch(&empty, 10).frames(), 10);
        assert_eq!(time_stretch(&empty, 0).frames(), 0);
    }
}
