//! Frequency-domain level meter for the output graph
//!
//! Mirrors a browser analyser node: the most recent `FFT_SIZE` output samples
//! are windowed, transformed, smoothed over time and mapped to byte
//! magnitudes between `MIN_DECIBELS` and `MAX_DECIBELS`. The meter level is
//! the mean byte magnitude divided by the largest possible one.

use std::f64::consts::PI;

/// Transform size (number of time-domain samples analysed)
pub const FFT_SIZE: usize = 256;

/// Number of frequency bins produced per analysis
pub const BIN_COUNT: usize = FFT_SIZE / 2;

/// Time smoothing between successive analyses
const SMOOTHING: f64 = 0.8;

/// Magnitude mapped to byte 0
const MIN_DECIBELS: f64 = -100.0;

/// Magnitude mapped to byte 255
const MAX_DECIBELS: f64 = -30.0;

/// Rolling analyser over the rendered output
#[derive(Debug, Clone)]
pub struct Analyzer {
    ring: Vec<f32>,
    write_pos: usize,
    smoothed: Vec<f64>,
    window: Vec<f64>,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer {
    /// Create an analyser primed with silence
    #[must_use]
    pub fn new() -> Self {
        Self {
            ring: vec![0.0; FFT_SIZE],
            write_pos: 0,
            smoothed: vec![0.0; BIN_COUNT],
            window: blackman(FFT_SIZE),
        }
    }

    /// Feed one rendered output sample
    pub fn push(&mut self, sample: f32) {
        self.ring[self.write_pos] = sample;
        self.write_pos = (self.write_pos + 1) % FFT_SIZE;
    }

    /// Byte magnitudes per frequency bin for the current window
    pub fn byte_frequency_data(&mut self) -> [u8; BIN_COUNT] {
        let mut real = vec![0.0f64; FFT_SIZE];
        let mut imag = vec![0.0f64; FFT_SIZE];

        // Oldest sample first
        for (i, slot) in real.iter_mut().enumerate() {
            let sample = self.ring[(self.write_pos + i) % FFT_SIZE];
            *slot = f64::from(sample) * self.window[i];
        }

        fft(&mut real, &mut imag);

        let mut out = [0u8; BIN_COUNT];
        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / FFT_SIZE as f64;
        for (bin, byte) in out.iter_mut().enumerate() {
            let magnitude = real[bin].hypot(imag[bin]) * scale;
            let smoothed = SMOOTHING.mul_add(self.smoothed[bin], (1.0 - SMOOTHING) * magnitude);
            self.smoothed[bin] = smoothed;

            let db = if smoothed > 0.0 {
                20.0 * smoothed.log10()
            } else {
                f64::NEG_INFINITY
            };
            let normalized = (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                *byte = (normalized * 255.0).clamp(0.0, 255.0) as u8;
            }
        }

        out
    }

    /// Normalized level in [0, 1]: mean bin magnitude over the maximum
    pub fn level(&mut self) -> f32 {
        let data = self.byte_frequency_data();
        let sum: u32 = data.iter().map(|&b| u32::from(b)).sum();
        #[allow(clippy::cast_precision_loss)]
        let level = sum as f32 / (BIN_COUNT as f32 * 255.0);
        level
    }

    /// Forget history (used when the graph is torn down)
    pub fn reset(&mut self) {
        self.ring.fill(0.0);
        self.smoothed.fill(0.0);
        self.write_pos = 0;
    }
}

fn blackman(n: usize) -> Vec<f64> {
    let alpha: f64 = 0.16;
    let a0 = 0.5 * (1.0 - alpha);
    let a1: f64 = 0.5;
    let a2 = 0.5 * alpha;
    #[allow(clippy::cast_precision_loss)]
    (0..n)
        .map(|i| {
            let x = i as f64 / n as f64;
            a2.mul_add((4.0 * PI * x).cos(), a1.mul_add(-(2.0 * PI * x).cos(), a0))
        })
        .collect()
}

/// In-place radix-2 Cooley-Tukey FFT; `real` and `imag` share a power-of-two length
fn fft(real: &mut [f64], imag: &mut [f64]) {
    let n = real.len();
    if n <= 1 {
        return;
    }

    // Bit-reversal permutation
    let mut j = 0usize;
    for i in 0..n - 1 {
        if i < j {
            real.swap(i, j);
            imag.swap(i, j);
        }
        let mut k = n >> 1;
        while k <= j {
            j -= k;
            k >>= 1;
        }
        j += k;
    }

    let mut size = 2;
    while size <= n {
        let half = size >> 1;
        #[allow(clippy::cast_precision_loss)]
        let angle = -2.0 * PI / size as f64;
        let (w_i, w_r) = angle.sin_cos();

        let mut start = 0;
        while start < n {
            let (mut t_r, mut t_i) = (1.0, 0.0);
            for k in 0..half {
                let u = start + k;
                let v = u + half;

                let tmp_r = t_r * real[v] - t_i * imag[v];
                let tmp_i = t_r * imag[v] + t_i * real[v];

                real[v] = real[u] - tmp_r;
                imag[v] = imag[u] - tmp_i;
                real[u] += tmp_r;
                imag[u] += tmp_i;

                let next_r = t_r * w_r - t_i * w_i;
                t_i = t_r * w_i + t_i * w_r;
                t_r = next_r;
            }
            start += size;
        }
        size <<= 1;
    }
}
