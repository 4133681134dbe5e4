//! Streaming EBU R128 / ITU-R BS.1770 loudness meter.
//!
//! A [`Meter`] owns one stream's K-weighting filter state and block-energy
//! history. It is fed interleaved PCM via [`Meter::add_frames`] and queried
//! for momentary, short-term, integrated loudness and loudness range.

use crate::error::{Error, Result};

const ABS_GATE_LUFS: f64 = -70.0;
const REL_GATE_OFFSET_LU: f64 = -10.0;
const LRA_REL_OFFSET_LU: f64 = -20.0;
const LRA_LOW_TRIM: f64 = 0.10;
const LRA_HIGH_TRIM: f64 = 0.05;

const MOMENTARY_BLOCKS: usize = 4; // 400ms / 100ms
const SHORTTERM_BLOCKS: usize = 30; // 3000ms / 100ms

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Unused,
    Left,
    Right,
    Center,
    LeftSurround,
    RightSurround,
}

impl ChannelRole {
    fn default_for_index(index: usize) -> Self {
        match index {
            0 => Self::Left,
            1 => Self::Right,
            2 => Self::Center,
            3 => Self::Unused,
            4 => Self::LeftSurround,
            5 => Self::RightSurround,
            _ => Self::Unused,
        }
    }

    fn weight(self) -> f64 {
        match self {
            Self::LeftSurround | Self::RightSurround => 1.4125375446227544, // +1.5 dB
            Self::Unused => 0.0,
            _ => 1.0,
        }
    }
}

/// The mode lattice from the spec: S implies M, I implies M, LRA implies S and I.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mode(u8);

impl Mode {
    pub const M: Mode = Mode(1);
    pub const S: Mode = Mode(1 << 1);
    pub const I: Mode = Mode(1 << 2);
    pub const LRA: Mode = Mode(1 << 3);

    pub fn normalize(self) -> Self {
        let mut bits = self.0;
        if bits & Self::LRA.0 != 0 {
            bits |= Self::S.0 | Self::I.0;
        }
        if bits & Self::S.0 != 0 {
            bits |= Self::M.0;
        }
        if bits & Self::I.0 != 0 {
            bits |= Self::M.0;
        }
        Mode(bits)
    }

    pub fn contains(self, other: Mode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Mode {
    type Output = Mode;
    fn bitor(self, rhs: Mode) -> Mode {
        Mode(self.0 | rhs.0)
    }
}

/// Direct-form-II-transposed biquad section.
#[derive(Clone, Copy)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    z1: f64,
    z2: f64,
}

impl Biquad {
    fn new(b0: f64, b1: f64, b2: f64, a1: f64, a2: f64) -> Self {
        Self { b0, b1, b2, a1, a2, z1: 0.0, z2: 0.0 }
    }

    #[inline]
    fn process(&mut self, x: f64) -> f64 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }
}

/// Per-channel high-shelf + high-pass cascade per BS.1770.
struct KWeighting {
    shelf: Vec<Biquad>,
    hp: Vec<Biquad>,
}

impl KWeighting {
    fn new(sample_rate: f64, channels: usize) -> Self {
        // High-shelf ("pre-filter"), canonical libebur128/BS.1770 parameters.
        let f0 = 1681.974450955533;
        let g_db = 3.999843853973347;
        let q = 0.7071752369554196;

        let k = (std::f64::consts::PI * f0 / sample_rate).tan();
        let vh = 10.0_f64.powf(g_db / 20.0);
        let vb = vh.powf(0.4996667741545416);

        let a0 = 1.0 + k / q + k * k;
        let b0 = (vh + vb * k / q + k * k) / a0;
        let b1 = 2.0 * (k * k - vh) / a0;
        let b2 = (vh - vb * k / q + k * k) / a0;
        let a1 = 2.0 * (k * k - 1.0) / a0;
        let a2 = (1.0 - k / q + k * k) / a0;
        let shelf_proto = Biquad::new(b0, b1, b2, a1, a2);

        // High-pass ("RLB"), corner ~38 Hz.
        let f0_hp = 38.13547087602444;
        let q_hp = 0.5003270373238773;
        let k_hp = (std::f64::consts::PI * f0_hp / sample_rate).tan();
        let a0_hp = 1.0 + k_hp / q_hp + k_hp * k_hp;
        let a1_hp = 2.0 * (k_hp * k_hp - 1.0) / a0_hp;
        let a2_hp = (1.0 - k_hp / q_hp + k_hp * k_hp) / a0_hp;
        let hp_proto = Biquad::new(1.0, -2.0, 1.0, a1_hp, a2_hp);

        Self {
            shelf: vec![shelf_proto; channels],
            hp: vec![hp_proto; channels],
        }
    }

    #[inline]
    fn process(&mut self, channel: usize, x: f64) -> f64 {
        let y = self.shelf[channel].process(x);
        self.hp[channel].process(y)
    }
}

/// A normalized PCM sample; integer formats are divided by their max positive magnitude.
pub trait Sample: Copy {
    fn to_f64(self) -> f64;
}

impl Sample for i16 {
    fn to_f64(self) -> f64 {
        self as f64 / i16::MAX as f64
    }
}

impl Sample for i32 {
    fn to_f64(self) -> f64 {
        self as f64 / i32::MAX as f64
    }
}

impl Sample for f32 {
    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Sample for f64 {
    fn to_f64(self) -> f64 {
        self
    }
}

/// Per-stream loudness measurement state. One instance per track, owned by a
/// single worker for the life of that track (see spec §5).
pub struct Meter {
    channels: usize,
    sample_rate: u32,
    samples_in_100ms: usize,
    modes: Mode,
    roles: Vec<ChannelRole>,
    filters: KWeighting,
    peaks: Vec<f64>,
    block_accum: f64,
    block_count: usize,
    /// raw, non-overlapping per-100ms weighted mean-square energy, append-only
    mini_block_energies: Vec<f64>,
    /// energy of the trailing 400ms window, sampled every 100ms (75% overlap);
    /// this is the block list gating/momentary loudness operate on
    block_energies: Vec<f64>,
    /// energy of the trailing 3s window, sampled every 100ms, only populated
    /// when S or LRA is enabled
    short_term_energies: Vec<f64>,
}

impl Meter {
    pub fn new(channels: u32, sample_rate: u32, modes: Mode) -> Result<Self> {
        if channels == 0 || channels >= 64 {
            return Err(Error::UnsupportedChannelCount(channels));
        }
        if sample_rate == 0 || sample_rate % 10 != 0 {
            return Err(Error::InvalidSampleRate(sample_rate));
        }
        let channels = channels as usize;
        let samples_in_100ms = (sample_rate / 10) as usize;
        let roles = (0..channels).map(ChannelRole::default_for_index).collect();
        Ok(Self {
            channels,
            sample_rate,
            samples_in_100ms,
            modes: modes.normalize(),
            roles,
            filters: KWeighting::new(sample_rate as f64, channels),
            peaks: vec![0.0; channels],
            block_accum: 0.0,
            block_count: 0,
            mini_block_energies: Vec::new(),
            block_energies: Vec::new(),
            short_term_energies: Vec::new(),
        })
    }

    pub fn set_channel(&mut self, index: usize, role: ChannelRole) {
        if let Some(slot) = self.roles.get_mut(index) {
            *slot = role;
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn add_frames<S: Sample>(&mut self, buf: &[S]) {
        debug_assert_eq!(buf.len() % self.channels, 0);
        for frame in buf.chunks_exact(self.channels) {
            self.add_frame(frame);
        }
    }

    fn add_frame<S: Sample>(&mut self, frame: &[S]) {
        let mut frame_energy = 0.0;
        for (ch, &s) in frame.iter().enumerate() {
            let x = s.to_f64();
            let abs = x.abs();
            if abs > self.peaks[ch] {
                self.peaks[ch] = abs;
            }
            let weight = self.roles[ch].weight();
            if weight == 0.0 {
                continue;
            }
            let y = self.filters.process(ch, x);
            frame_energy += weight * y * y;
        }
        self.block_accum += frame_energy;
        self.block_count += 1;
        if self.block_count == self.samples_in_100ms {
            self.finish_block();
        }
    }

    fn finish_block(&mut self) {
        let mini_energy = self.block_accum / self.samples_in_100ms as f64;
        self.mini_block_energies.push(mini_energy);
        self.block_accum = 0.0;
        self.block_count = 0;

        // 400ms trailing window over the last 4 mini-blocks, emitted every
        // 100ms (75% overlap) -- this is the block the spec's gating/momentary
        // loudness operate on, not the raw 100ms mini-block itself.
        let momentary_start = self.mini_block_energies.len().saturating_sub(MOMENTARY_BLOCKS);
        self.block_energies.push(mean(&self.mini_block_energies[momentary_start..]));

        if self.modes.contains(Mode::S) || self.modes.contains(Mode::LRA) {
            let tail_start = self.mini_block_energies.len().saturating_sub(SHORTTERM_BLOCKS);
            let tail = &self.mini_block_energies[tail_start..];
            let st_energy = mean(tail);
            self.short_term_energies.push(st_energy);
        }
    }

    /// Sample peak observed so far, per channel.
    pub fn sample_peak(&self, channel: usize) -> f64 {
        self.peaks[channel]
    }

    pub fn max_sample_peak(&self) -> f64 {
        self.peaks.iter().copied().fold(0.0, f64::max)
    }

    pub fn loudness_momentary(&self) -> f64 {
        match self.block_energies.last() {
            Some(&e) => energy_to_lufs(e),
            None => f64::NAN,
        }
    }

    pub fn loudness_shortterm(&self) -> f64 {
        match self.short_term_energies.last() {
            Some(&e) => energy_to_lufs(e),
            None => f64::NAN,
        }
    }

    pub fn loudness_global(&self) -> f64 {
        gated_loudness(&self.block_energies)
    }

    pub fn loudness_range(&self) -> f64 {
        loudness_range_from(&self.short_term_energies)
    }

    pub fn block_energies(&self) -> &[f64] {
        &self.block_energies
    }

    pub fn short_term_energies(&self) -> &[f64] {
        &self.short_term_energies
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub(crate) fn energy_to_lufs(energy: f64) -> f64 {
    -0.691 + 10.0 * energy.log10()
}

fn threshold_energy(lufs: f64) -> f64 {
    10.0_f64.powf((lufs + 0.691) / 10.0)
}

fn gated_loudness(blocks: &[f64]) -> f64 {
    if blocks.is_empty() {
        return f64::NAN;
    }
    let abs_gate = threshold_energy(ABS_GATE_LUFS);
    let gated: Vec<f64> = blocks.iter().copied().filter(|&e| e >= abs_gate).collect();
    if gated.is_empty() {
        return f64::NAN;
    }
    let ungated_mean = mean(&gated);
    let ungated_lufs = energy_to_lufs(ungated_mean);
    let rel_gate = threshold_energy(ungated_lufs + REL_GATE_OFFSET_LU);
    let finale: Vec<f64> = gated.iter().copied().filter(|&e| e >= rel_gate).collect();
    if finale.is_empty() {
        return ungated_lufs;
    }
    energy_to_lufs(mean(&finale))
}

/// Combines block lists from multiple meters (e.g. an album's tracks) before
/// applying the two-gate rule, per spec §4.2/§4.1.
pub fn loudness_global_multiple<'a, I>(meters: I) -> f64
where
    I: IntoIterator<Item = &'a Meter>,
{
    let mut all = Vec::new();
    for m in meters {
        all.extend_from_slice(&m.block_energies);
    }
    gated_loudness(&all)
}

pub fn loudness_range_multiple<'a, I>(meters: I) -> f64
where
    I: IntoIterator<Item = &'a Meter>,
{
    let mut all = Vec::new();
    for m in meters {
        all.extend_from_slice(&m.short_term_energies);
    }
    loudness_range_from(&all)
}

fn loudness_range_from(short_term: &[f64]) -> f64 {
    if short_term.is_empty() {
        return 0.0;
    }
    let abs_gate = threshold_energy(ABS_GATE_LUFS);
    let survivors: Vec<f64> = short_term.iter().copied().filter(|&e| e >= abs_gate).collect();
    if survivors.len() < 2 {
        return 0.0;
    }
    let rel_threshold_lufs = energy_to_lufs(mean(&survivors)) + LRA_REL_OFFSET_LU;
    let rel_gate = threshold_energy(rel_threshold_lufs);
    let mut vals: Vec<f64> = survivors
        .iter()
        .copied()
        .filter(|&e| e >= rel_gate)
        .map(energy_to_lufs)
        .collect();
    if vals.len() < 2 {
        return 0.0;
    }
    vals.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = vals.len();
    let low = (n as f64 * LRA_LOW_TRIM).floor() as usize;
    let high = ((n as f64 * (1.0 - LRA_HIGH_TRIM)).ceil() as usize).min(n);
    if high <= low + 1 {
        return 0.0;
    }
    vals[high - 1] - vals[low]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_frames(n: usize, channels: usize, amplitude: f64, sample_rate: u32, freq: f64) -> Vec<f64> {
        let mut out = Vec::with_capacity(n * channels);
        for i in 0..n {
            let t = i as f64 / sample_rate as f64;
            let s = amplitude * (2.0 * std::f64::consts::PI * freq * t).sin();
            for _ in 0..channels {
                out.push(s);
            }
        }
        out
    }

    #[test]
    fn silence_is_nan_global() {
        let mut m = Meter::new(2, 48000, Mode::I).unwrap();
        let silence = vec![0.0f64; 48000 * 4 * 2];
        m.add_frames(&silence);
        assert!(m.loudness_global().is_nan());
    }

    #[test]
    fn rejects_bad_sample_rate() {
        assert!(Meter::new(2, 48001, Mode::I).is_err());
    }

    #[test]
    fn rejects_too_many_channels() {
        assert!(Meter::new(64, 48000, Mode::I).is_err());
    }

    #[test]
    fn stereo_sine_loudness_near_minus_3_lufs() {
        // -3.01 LUFS is the textbook result for a full-scale (amplitude 1.0)
        // 1kHz sine on both channels after K-weighting settles; here we use
        // 0.5 amplitude which shifts the result down ~6 dB from that anchor.
        let mut m = Meter::new(2, 48000, Mode::I | Mode::LRA).unwrap();
        let frames = sine_frames(48000 * 10, 2, 0.5, 48000, 1000.0);
        m.add_frames(&frames);
        let loudness = m.loudness_global();
        assert!(loudness.is_finite());
        assert!((loudness - (-9.0)).abs() < 3.0, "loudness={loudness}");
    }

    #[test]
    fn block_count_matches_duration() {
        let mut m = Meter::new(1, 48000, Mode::M).unwrap();
        let frames = vec![0.1f64; 48000 * 2];
        m.add_frames(&frames);
        assert_eq!(m.block_energies().len(), 20);
    }

    #[test]
    fn mode_lattice_normalizes() {
        let m = Mode::LRA.normalize();
        assert!(m.contains(Mode::S));
        assert!(m.contains(Mode::I));
        assert!(m.contains(Mode::M));
    }

    #[test]
    fn peak_tracks_maximum_absolute_sample() {
        let mut m = Meter::new(1, 48000, Mode::M).unwrap();
        m.add_frames(&[0.2f64, -0.8, 0.5]);
        assert_eq!(m.max_sample_peak(), 0.8);
    }
}
