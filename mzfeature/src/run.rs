//! The in-memory model of a single LC-MS run.
//!
//! Raw file parsing is not handled here: callers hand the constructor an
//! ordered sequence of already-centroided scans. The run then maintains the
//! per-scan peak lists, a global m/z-sorted peak index shared read-only by
//! the row-parallel matrix build, and the per-scan noise levels used for
//! seed signal-to-noise filtering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use mzpeaks::prelude::*;
use mzpeaks::{CentroidPeak, IndexType, MZPeakSetType, MZ};

/// A run-global peak identifier. Peaks are stored in per-scan sets, but the
/// identifier is unique across the whole run and is what matrix cells,
/// envelopes and registry back-references hold on to.
pub type PeakId = u32;

/// Scan-level metadata for one spectrum in the run.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LcMsScan {
    pub scan_number: u32,
    pub elution_time: f64,
    pub ms_level: u8,
}

impl LcMsScan {
    pub fn new(scan_number: u32, elution_time: f64, ms_level: u8) -> Self {
        Self {
            scan_number,
            elution_time,
            ms_level,
        }
    }
}

/// A centroided MS1 peak with its owning scan column and an active flag.
///
/// The active flag is only ever cleared during the sequential overlap
/// resolution phase, after the owning feature has been finalized as a
/// winner. The atomic lets the flag be read safely from row-parallel
/// workers without any locking.
#[derive(Debug)]
pub struct LcMsPeak {
    pub mz: f64,
    pub intensity: f32,
    pub scan_column: u32,
    index: IndexType,
    id: PeakId,
    active: AtomicBool,
}

impl LcMsPeak {
    pub fn new(mz: f64, intensity: f32, scan_column: u32, id: PeakId) -> Self {
        Self {
            mz,
            intensity,
            scan_column,
            index: 0,
            id,
            active: AtomicBool::new(true),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> PeakId {
        self.id
    }

    #[inline(always)]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Relaxed)
    }

    pub fn reactivate(&self) {
        self.active.store(true, Ordering::Relaxed)
    }
}

impl Clone for LcMsPeak {
    fn clone(&self) -> Self {
        Self {
            mz: self.mz,
            intensity: self.intensity,
            scan_column: self.scan_column,
            index: self.index,
            id: self.id,
            active: AtomicBool::new(self.is_active()),
        }
    }
}

impl PartialEq for LcMsPeak {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && (self.mz - other.mz).abs() < 1e-9
            && (self.intensity - other.intensity).abs() < 1e-6
    }
}

impl PartialOrd for LcMsPeak {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(
            self.mz
                .total_cmp(&other.mz)
                .then_with(|| self.intensity.total_cmp(&other.intensity)),
        )
    }
}

impl CoordinateLike<MZ> for LcMsPeak {
    #[inline(always)]
    fn coordinate(&self) -> f64 {
        self.mz
    }
}

impl IndexedCoordinate<MZ> for LcMsPeak {
    #[inline(always)]
    fn get_index(&self) -> IndexType {
        self.index
    }

    fn set_index(&mut self, index: IndexType) {
        self.index = index
    }
}

impl IntensityMeasurement for LcMsPeak {
    #[inline(always)]
    fn intensity(&self) -> f32 {
        self.intensity
    }
}

/// One LC-MS run: ordered scans, per-MS1-column peak sets, and a global
/// m/z-sorted peak index. Read-only after construction aside from peak
/// active flags.
#[derive(Debug, Clone)]
pub struct LcMsRun {
    scans: Vec<LcMsScan>,
    ms1_scans: Vec<LcMsScan>,
    peak_sets: Vec<MZPeakSetType<LcMsPeak>>,
    peak_offsets: Vec<PeakId>,
    by_mz: Vec<(f64, PeakId)>,
    noise: Vec<f32>,
    scan_number_to_column: HashMap<u32, usize>,
    mz_bounds: (f64, f64),
    elution_span: (f64, f64),
}

impl LcMsRun {
    /// Build a run from an ordered sequence of scans. Peaks attached to
    /// non-MS1 scans are ignored; the scans themselves are retained for
    /// navigation.
    pub fn new(scans: impl IntoIterator<Item = (LcMsScan, Vec<CentroidPeak>)>) -> Self {
        let mut all_scans = Vec::new();
        let mut ms1_scans = Vec::new();
        let mut peak_sets = Vec::new();
        let mut peak_offsets = vec![0u32];
        let mut by_mz: Vec<(f64, PeakId)> = Vec::new();
        let mut noise = Vec::new();
        let mut scan_number_to_column = HashMap::new();

        let mut next_id: PeakId = 0;
        for (scan, mut peaks) in scans {
            all_scans.push(scan);
            if scan.ms_level != 1 {
                continue;
            }
            let column = ms1_scans.len();
            scan_number_to_column.insert(scan.scan_number, column);
            ms1_scans.push(scan);

            peaks.sort_by(|a, b| a.mz.total_cmp(&b.mz));
            let mut indexed = Vec::with_capacity(peaks.len());
            for p in peaks {
                let peak = LcMsPeak::new(p.mz, p.intensity, column as u32, next_id);
                by_mz.push((p.mz, next_id));
                indexed.push(peak);
                next_id += 1;
            }
            noise.push(median_intensity(&indexed));
            peak_sets.push(indexed.into_iter().collect::<MZPeakSetType<LcMsPeak>>());
            peak_offsets.push(next_id);
        }

        by_mz.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));

        let mz_bounds = match (by_mz.first(), by_mz.last()) {
            (Some(lo), Some(hi)) => (lo.0, hi.0),
            _ => (0.0, 0.0),
        };
        let elution_span = match (ms1_scans.first(), ms1_scans.last()) {
            (Some(a), Some(b)) => (a.elution_time, b.elution_time),
            _ => (0.0, 0.0),
        };

        Self {
            scans: all_scans,
            ms1_scans,
            peak_sets,
            peak_offsets,
            by_mz,
            noise,
            scan_number_to_column,
            mz_bounds,
            elution_span,
        }
    }

    /// Convenience constructor for runs containing only MS1 scans.
    pub fn from_ms1_scans(scans: impl IntoIterator<Item = (u32, f64, Vec<CentroidPeak>)>) -> Self {
        Self::new(
            scans
                .into_iter()
                .map(|(number, time, peaks)| (LcMsScan::new(number, time, 1), peaks)),
        )
    }

    /// Override the instrument m/z bounds. The default is the observed
    /// data range, which underestimates the detectable charge range on
    /// sparse runs.
    pub fn with_mz_bounds(mut self, lo: f64, hi: f64) -> Self {
        self.mz_bounds = (lo, hi);
        self
    }

    /// The number of MS1 scan columns.
    pub fn n_columns(&self) -> usize {
        self.ms1_scans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ms1_scans.is_empty()
    }

    pub fn n_peaks(&self) -> usize {
        self.by_mz.len()
    }

    pub fn ms1_scans(&self) -> &[LcMsScan] {
        &self.ms1_scans
    }

    pub fn scan_number_of(&self, column: usize) -> u32 {
        self.ms1_scans[column].scan_number
    }

    pub fn column_of(&self, scan_number: u32) -> Option<usize> {
        self.scan_number_to_column.get(&scan_number).copied()
    }

    /// The MS1 column whose scan number is closest to `scan_number`,
    /// whether or not that exact scan exists (or is MS1).
    pub fn column_near(&self, scan_number: u32) -> Option<usize> {
        if self.ms1_scans.is_empty() {
            return None;
        }
        let i = self
            .ms1_scans
            .partition_point(|s| s.scan_number < scan_number);
        if i == 0 {
            return Some(0);
        }
        if i >= self.ms1_scans.len() {
            return Some(self.ms1_scans.len() - 1);
        }
        let below = scan_number - self.ms1_scans[i - 1].scan_number;
        let above = self.ms1_scans[i].scan_number - scan_number;
        Some(if below <= above { i - 1 } else { i })
    }

    pub fn elution_time_of(&self, column: usize) -> f64 {
        self.ms1_scans[column].elution_time
    }

    pub fn elution_time_of_scan(&self, scan_number: u32) -> Option<f64> {
        self.column_of(scan_number).map(|c| self.elution_time_of(c))
    }

    pub fn elution_span(&self) -> (f64, f64) {
        self.elution_span
    }

    /// Normalized elution time of an absolute elution time.
    pub fn net_of(&self, elution_time: f64) -> f64 {
        let (t0, t1) = self.elution_span;
        let span = t1 - t0;
        if span <= 0.0 {
            0.0
        } else {
            (elution_time - t0) / span
        }
    }

    /// Map a normalized elution time back onto the run's time axis.
    pub fn time_of_net(&self, net: f64) -> f64 {
        let (t0, t1) = self.elution_span;
        t0 + net * (t1 - t0)
    }

    pub fn mz_bounds(&self) -> (f64, f64) {
        self.mz_bounds
    }

    /// Median peak intensity of an MS1 column, used as the local noise level.
    pub fn noise_of(&self, column: usize) -> f32 {
        self.noise[column]
    }

    pub fn peaks_of(&self, column: usize) -> &MZPeakSetType<LcMsPeak> {
        &self.peak_sets[column]
    }

    pub fn peak(&self, id: PeakId) -> &LcMsPeak {
        let column = self.peak_offsets.partition_point(|&off| off <= id) - 1;
        let local = (id - self.peak_offsets[column]) as usize;
        &self.peak_sets[column][local]
    }

    pub fn deactivate_peak(&self, id: PeakId) {
        self.peak(id).deactivate()
    }

    /// All peak ids across the run with m/z in `[lo, hi]`, ordered by m/z.
    pub fn peaks_between(&self, lo: f64, hi: f64) -> impl Iterator<Item = PeakId> + '_ {
        let a = self.by_mz.partition_point(|&(mz, _)| mz < lo);
        let b = self.by_mz.partition_point(|&(mz, _)| mz <= hi);
        self.by_mz[a..b].iter().map(|&(_, id)| id)
    }

    /// The preceding scan at the requested MS level, if any.
    pub fn prev_scan_number(&self, scan_number: u32, ms_level: u8) -> Option<u32> {
        self.scans
            .iter()
            .rev()
            .find(|s| s.scan_number < scan_number && s.ms_level == ms_level)
            .map(|s| s.scan_number)
    }

    /// The following scan at the requested MS level, if any.
    pub fn next_scan_number(&self, scan_number: u32, ms_level: u8) -> Option<u32> {
        self.scans
            .iter()
            .find(|s| s.scan_number > scan_number && s.ms_level == ms_level)
            .map(|s| s.scan_number)
    }
}

fn median_intensity(peaks: &[LcMsPeak]) -> f32 {
    if peaks.is_empty() {
        return 0.0;
    }
    let mut intensities: Vec<f32> = peaks.iter().map(|p| p.intensity).collect();
    intensities.sort_by(|a, b| a.total_cmp(b));
    intensities[intensities.len() / 2]
}

#[cfg(test)]
mod test {
    use super::*;

    fn make_run() -> LcMsRun {
        LcMsRun::new(vec![
            (
                LcMsScan::new(10, 0.5, 1),
                vec![
                    CentroidPeak::new(500.0, 100.0, 0),
                    CentroidPeak::new(600.0, 50.0, 0),
                    CentroidPeak::new(400.0, 10.0, 0),
                ],
            ),
            (LcMsScan::new(11, 0.55, 2), vec![]),
            (
                LcMsScan::new(12, 0.6, 1),
                vec![
                    CentroidPeak::new(500.001, 120.0, 0),
                    CentroidPeak::new(700.0, 5.0, 0),
                ],
            ),
        ])
    }

    #[test]
    fn test_columns_and_navigation() {
        let run = make_run();
        assert_eq!(run.n_columns(), 2);
        assert_eq!(run.scan_number_of(0), 10);
        assert_eq!(run.scan_number_of(1), 12);
        assert_eq!(run.column_of(12), Some(1));
        assert_eq!(run.column_of(11), None);
        assert_eq!(run.column_near(11), Some(0));
        assert_eq!(run.column_near(55), Some(1));
        assert_eq!(run.prev_scan_number(12, 1), Some(10));
        assert_eq!(run.next_scan_number(10, 2), Some(11));
        assert_eq!(run.next_scan_number(12, 1), None);
    }

    #[test]
    fn test_global_index_sorted() {
        let run = make_run();
        assert_eq!(run.n_peaks(), 5);
        let ids: Vec<_> = run.peaks_between(499.0, 501.0).collect();
        assert_eq!(ids.len(), 2);
        let mzs: Vec<_> = ids.iter().map(|&id| run.peak(id).mz).collect();
        assert!(mzs.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(run.peaks_between(1000.0, 2000.0).count(), 0);
    }

    #[test]
    fn test_peak_lookup_roundtrip() {
        let run = make_run();
        for (_, id) in run.by_mz.iter() {
            assert_eq!(run.peak(*id).id(), *id);
        }
    }

    #[test]
    fn test_active_flags() {
        let run = make_run();
        let id = run.peaks_between(499.0, 501.0).next().unwrap();
        assert!(run.peak(id).is_active());
        run.deactivate_peak(id);
        assert!(!run.peak(id).is_active());
        run.peak(id).reactivate();
        assert!(run.peak(id).is_active());
    }

    #[test]
    fn test_net_conversion() {
        let run = make_run();
        assert_eq!(run.elution_span(), (0.5, 0.6));
        assert!((run.net_of(0.55) - 0.5).abs() < 1e-9);
        assert!((run.time_of_net(0.5) - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_noise_is_median() {
        let run = make_run();
        assert_eq!(run.noise_of(0), 50.0);
    }
}
