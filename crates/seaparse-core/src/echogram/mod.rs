//! Echogram assembly.
//!
//! Acoustic particles are accumulated into time buckets (one UTC day by
//! default) per frequency. Each bucket is a depth x time-slot grid of sums
//! and counts, so pings sharing a slot average out. Finalising a time range
//! produces one [`EchogramMatrix`] per frequency and clears only the slots it
//! emitted, so a day may be finalised piecewise.
//!
//! Amplitudes are stored unclamped; the contrast window computed here is
//! only applied by renderers.

pub mod render;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::particle::Particle;
use crate::schema::{CompiledInstrument, ConfigError, EchogramSettings, FrequencySource};
use crate::timestamp::Timestamp;

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    pub fn duration_s(&self) -> f64 {
        (self.end.ntp_seconds() - self.start.ntp_seconds()).max(0.0)
    }

    fn overlaps(&self, start_s: f64, end_s: f64) -> bool {
        start_s < self.end.ntp_seconds() && end_s > self.start.ntp_seconds()
    }
}

/// Display bounds for one frequency, from its value percentiles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContrastWindow {
    pub low: f64,
    pub high: f64,
}

/// Depth x time amplitudes for one frequency.
///
/// Row 0 holds the last depth bin; columns advance in time.
#[derive(Debug, Clone, PartialEq)]
pub struct EchogramMatrix {
    pub frequency_id: u32,
    pub range: TimeRange,
    pub resolution_s: f64,
    /// Physical depth of the first and last configured bin.
    pub depth_range: (f64, f64),
    rows: usize,
    columns: usize,
    cells: Vec<Option<f64>>,
    pub window: Option<ContrastWindow>,
}

impl EchogramMatrix {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Mean amplitude of a cell, `None` where nothing was recorded.
    pub fn get(&self, row: usize, column: usize) -> Option<f64> {
        if row >= self.rows || column >= self.columns {
            return None;
        }
        self.cells[row * self.columns + column]
    }

    /// Cell value clamped into the contrast window and scaled to `0..=1`.
    pub fn normalized(&self, row: usize, column: usize) -> Option<f64> {
        let value = self.get(row, column)?;
        let window = self.window?;
        let span = window.high - window.low;
        if span <= 0.0 {
            return Some(0.0);
        }
        Some(((value - window.low) / span).clamp(0.0, 1.0))
    }

    pub fn has_data(&self) -> bool {
        self.cells.iter().any(Option::is_some)
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    sums: Vec<f64>,
    counts: Vec<u32>,
}

impl Bucket {
    fn new(cells: usize) -> Self {
        Self {
            sums: vec![0.0; cells],
            counts: vec![0; cells],
        }
    }
}

/// Accumulates acoustic particles for one instrument.
#[derive(Debug, Clone)]
pub struct EchogramAssembler {
    instrument_id: String,
    settings: EchogramSettings,
    buckets: BTreeMap<(i64, u32), Bucket>,
    rejected: usize,
}

impl EchogramAssembler {
    /// # Errors
    /// Returns `ConfigError::InvalidEchogram` when the instrument has no
    /// echogram settings.
    pub fn new(instrument: &CompiledInstrument) -> Result<Self, ConfigError> {
        let settings = instrument
            .echogram
            .clone()
            .ok_or_else(|| ConfigError::InvalidEchogram {
                instrument: instrument.id.clone(),
                message: "no echogram settings".to_string(),
            })?;
        Ok(Self {
            instrument_id: instrument.id.clone(),
            settings,
            buckets: BTreeMap::new(),
            rejected: 0,
        })
    }

    pub fn instrument_id(&self) -> &str {
        &self.instrument_id
    }

    pub fn settings(&self) -> &EchogramSettings {
        &self.settings
    }

    /// Particles ignored for lack of a preferred timestamp.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    pub fn pending_buckets(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_index(&self, ts: Timestamp) -> i64 {
        (ts.ntp_seconds() / self.settings.bucket_s).floor() as i64
    }

    fn bucket_start_s(&self, index: i64) -> f64 {
        index as f64 * self.settings.bucket_s
    }

    /// Add one particle; returns the number of cells updated.
    pub fn ingest(&mut self, particle: &Particle) -> usize {
        let Some(ts) = particle.preferred_timestamp else {
            self.rejected += 1;
            return 0;
        };
        let index = self.bucket_index(ts);
        let slots = self.settings.slots_per_bucket();
        let offset_s = ts.ntp_seconds() - self.bucket_start_s(index);
        let slot = ((offset_s / self.settings.resolution_s).floor() as usize).min(slots - 1);
        let bins = self.settings.depth_bins;

        let mut updated = 0;
        for channel in &self.settings.channels {
            let frequency = match &channel.frequency {
                FrequencySource::Fixed(freq) => Some(*freq),
                FrequencySource::Field(field) => particle
                    .fields
                    .get(field)
                    .and_then(|value| value.as_i64())
                    .and_then(|freq| u32::try_from(freq).ok()),
            };
            let amplitudes = particle
                .fields
                .get(&channel.amplitude_field)
                .and_then(|value| value.as_array());
            let (Some(frequency), Some(amplitudes)) = (frequency, amplitudes) else {
                debug!(
                    provenance = %particle.provenance_id,
                    field = %channel.amplitude_field,
                    "channel missing from particle"
                );
                continue;
            };

            let bucket = self
                .buckets
                .entry((index, frequency))
                .or_insert_with(|| Bucket::new(slots * bins));
            for (depth, &value) in amplitudes.iter().take(bins).enumerate() {
                if value.is_nan() {
                    continue;
                }
                let cell = slot * bins + depth;
                bucket.sums[cell] += value;
                bucket.counts[cell] += 1;
                updated += 1;
            }
        }
        updated
    }

    /// Build one matrix per frequency over `range`.
    ///
    /// Slots emitted into a matrix are cleared from their bucket; a bucket is
    /// released once `range` covers it entirely or none of its cells hold
    /// data any more. Pings outside `range` stay pending.
    pub fn finalize(&mut self, range: TimeRange) -> Vec<EchogramMatrix> {
        let resolution = self.settings.resolution_s;
        let rows = self.settings.depth_bins;
        let columns = (range.duration_s() / resolution).ceil() as usize;
        let bucket_s = self.settings.bucket_s;

        let overlapping: Vec<(i64, u32)> = self
            .buckets
            .keys()
            .filter(|(index, _)| {
                let start = *index as f64 * bucket_s;
                range.overlaps(start, start + bucket_s)
            })
            .copied()
            .collect();

        let mut frequencies: BTreeSet<u32> = self.settings.frequencies.iter().copied().collect();
        frequencies.extend(overlapping.iter().map(|(_, freq)| *freq));

        let mut matrices = Vec::with_capacity(frequencies.len());
        for frequency in frequencies {
            let mut cells = vec![None; rows * columns];
            for key in overlapping.iter().filter(|(_, freq)| *freq == frequency) {
                let bucket_start = self.bucket_start_s(key.0);
                let Some(bucket) = self.buckets.get_mut(key) else {
                    continue;
                };
                for cell in 0..bucket.counts.len() {
                    let slot = cell / rows;
                    let depth = cell % rows;
                    let slot_time = bucket_start + slot as f64 * resolution;
                    let column = (slot_time - range.start.ntp_seconds()) / resolution;
                    if column < 0.0 || column >= columns as f64 {
                        continue;
                    }
                    let count = std::mem::take(&mut bucket.counts[cell]);
                    let sum = std::mem::take(&mut bucket.sums[cell]);
                    if count == 0 {
                        continue;
                    }
                    let row = rows - 1 - depth;
                    cells[row * columns + column.floor() as usize] = Some(sum / f64::from(count));
                }
            }
            let window = contrast_window(
                &cells,
                self.settings.lower_percentile,
                self.settings.upper_percentile,
            );
            matrices.push(EchogramMatrix {
                frequency_id: frequency,
                range,
                resolution_s: resolution,
                depth_range: self.settings.depth_range,
                rows,
                columns,
                cells,
                window,
            });
        }

        for key in overlapping {
            let start = self.bucket_start_s(key.0);
            let covered = range.start.ntp_seconds() <= start
                && range.end.ntp_seconds() >= start + bucket_s;
            let drained = self
                .buckets
                .get(&key)
                .is_none_or(|bucket| bucket.counts.iter().all(|&count| count == 0));
            if covered || drained {
                self.buckets.remove(&key);
            }
        }
        matrices
    }

    /// Finalise every bucket that ends at or before `watermark`, one range
    /// per bucket, oldest first.
    pub fn drain_completed(&mut self, watermark: Timestamp) -> Vec<EchogramMatrix> {
        let bucket_s = self.settings.bucket_s;
        let completed: BTreeSet<i64> = self
            .buckets
            .keys()
            .map(|(index, _)| *index)
            .filter(|index| (*index as f64 + 1.0) * bucket_s <= watermark.ntp_seconds())
            .collect();

        let mut out = Vec::new();
        for index in completed {
            let start = self.bucket_start_s(index);
            let range = TimeRange::new(
                Timestamp::from_ntp_seconds(start),
                Timestamp::from_ntp_seconds(start + bucket_s),
            );
            out.extend(self.finalize(range));
        }
        out
    }

    /// Ranges of every bucket still held, oldest first.
    pub fn pending_ranges(&self) -> Vec<TimeRange> {
        let indices: BTreeSet<i64> = self.buckets.keys().map(|(index, _)| *index).collect();
        indices
            .into_iter()
            .map(|index| {
                let start = self.bucket_start_s(index);
                TimeRange::new(
                    Timestamp::from_ntp_seconds(start),
                    Timestamp::from_ntp_seconds(start + self.settings.bucket_s),
                )
            })
            .collect()
    }
}

/// Percentile with linear interpolation between closest ranks.
///
/// `sorted` must be non-empty and ascending.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    let rank = (pct / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    sorted[lower] + (sorted[upper] - sorted[lower]) * (rank - lower as f64)
}

fn contrast_window(cells: &[Option<f64>], low_pct: f64, high_pct: f64) -> Option<ContrastWindow> {
    let mut values: Vec<f64> = cells.iter().flatten().copied().collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    Some(ContrastWindow {
        low: percentile(&values, low_pct),
        high: percentile(&values, high_pct),
    })
}

#[cfg(test)]
mod tests {
    use super::percentile;

    #[test]
    fn percentile_interpolates_between_ranks() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 50.0), 3.0);
        assert_eq!(percentile(&values, 100.0), 5.0);
        assert!((percentile(&values, 5.0) - 1.2).abs() < 1e-12);
        assert!((percentile(&values, 95.0) - 4.8).abs() < 1e-12);
    }

    #[test]
    fn percentile_of_single_value() {
        assert_eq!(percentile(&[7.5], 95.0), 7.5);
    }
}
