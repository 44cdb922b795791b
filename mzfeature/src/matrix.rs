//! The charge×scan isotope-envelope search matrix.
//!
//! For one candidate monoisotopic mass the matrix holds, per detectable
//! charge row and scan column, the best-matching peak per theoretical
//! isotope slot. Rows are filled in parallel with row-exclusive scratch;
//! the seed-consumption phase that turns matrix evidence into feature
//! clusters is strictly sequential because each seed depends on the
//! checked-out state left behind by the ones before it.

use std::collections::VecDeque;
use std::sync::Arc;

use itertools::Itertools;
use mzpeaks::{PeakCollection, Tolerance};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, trace};

use crate::binning::MassBinning;
use crate::cluster::{
    envelope_is_significant, ChargeParity, FeatureCluster, ObservedEnvelope, ScoringContext,
};
use crate::envelope::{
    isclose, mz_to_mass, tolerance_width, EnvelopeProvider, TheoreticalEnvelope, NEUTRON_SHIFT,
    PROTON,
};
use crate::likelihood::LikelihoodScorer;
use crate::run::{LcMsRun, PeakId};
use crate::stats::smooth_moving_average;

/// Growth never strays further than this many scan columns from an
/// accepted cell in one step
const GROWTH_SCAN_RADIUS: usize = 2;

/// A cell this well matched joins a growing region on its own merits,
/// whether or not it improves the summed envelope
const VERY_GOOD_DIVERGENCE: f64 = 0.04;
const VERY_GOOD_CORRELATION: f64 = 0.90;

/// Search configuration for the matrix
#[derive(Debug, Clone)]
pub struct MatrixParams {
    pub tolerance: Tolerance,
    /// The overall charge search space; the per-mass detectable range is
    /// clipped to this
    pub charge_bounds: (i32, i32),
    /// Cap on the number of charge rows examined for any one mass
    pub max_charge_rows: usize,
    /// Significance level for the rank-sum/Poisson seed validation
    pub seed_significance: f64,
    /// Seed anchor peaks must exceed the scan noise level by this factor
    pub snr_floor: f32,
    /// Half-width of the moving-average kernel applied to XICs
    pub smoothing_half_width: usize,
    /// Consecutive poor columns tolerated while extending a row window
    pub max_gap_columns: usize,
    /// Worker threads for the row-parallel phases; 0 means all cores
    pub max_threads: usize,
}

impl Default for MatrixParams {
    fn default() -> Self {
        Self {
            tolerance: Tolerance::PPM(10.0),
            charge_bounds: (1, 60),
            max_charge_rows: 35,
            seed_significance: 0.01,
            snr_floor: 3.0,
            smoothing_half_width: 1,
            max_gap_columns: 2,
            max_threads: 0,
        }
    }
}

/// Minimum matched isotope slots for a cell to be usable, by mass
pub(crate) fn minimum_isotope_count(mass: f64) -> usize {
    if mass < 2_000.0 {
        2
    } else if mass < 5_000.0 {
        3
    } else if mass < 10_000.0 {
        4
    } else if mass < 25_000.0 {
        5
    } else {
        6
    }
}

fn seed_divergence_bar(mass: f64) -> f64 {
    if mass < 2_000.0 {
        0.12
    } else if mass < 5_000.0 {
        0.15
    } else if mass < 10_000.0 {
        0.20
    } else if mass < 25_000.0 {
        0.25
    } else {
        0.30
    }
}

fn seed_correlation_bar(mass: f64) -> f64 {
    if mass < 2_000.0 {
        0.75
    } else if mass < 5_000.0 {
        0.70
    } else if mass < 10_000.0 {
        0.60
    } else if mass < 25_000.0 {
        0.50
    } else {
        0.40
    }
}

fn divergence_bar(mass: f64) -> f64 {
    if mass < 2_000.0 {
        0.25
    } else if mass < 5_000.0 {
        0.30
    } else if mass < 10_000.0 {
        0.35
    } else if mass < 25_000.0 {
        0.40
    } else {
        0.50
    }
}

fn correlation_bar(mass: f64) -> f64 {
    if mass < 2_000.0 {
        0.60
    } else if mass < 5_000.0 {
        0.50
    } else if mass < 10_000.0 {
        0.40
    } else if mass < 25_000.0 {
        0.30
    } else {
        0.20
    }
}

fn charge_neighbor_radius(charge: i32) -> usize {
    1 + (charge / 10).max(0) as usize
}

/// Cell lifecycle: empty scratch, live evidence, or claimed by an emitted
/// cluster. Claims only ever happen during the sequential seed phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum CellStatus {
    #[default]
    Empty,
    Live,
    Claimed,
}

/// Per-(charge, scan) scratch state
#[derive(Debug, Clone)]
pub(crate) struct MatrixCell {
    peaks: Vec<Option<PeakId>>,
    /// Positive iff the most-abundant-isotope anchor peak was found
    accurate_mass: f64,
    divergence: f64,
    correlation: f64,
    peak_count: usize,
    status: CellStatus,
}

impl Default for MatrixCell {
    fn default() -> Self {
        Self {
            peaks: Vec::new(),
            accurate_mass: 0.0,
            divergence: f64::INFINITY,
            correlation: 0.0,
            peak_count: 0,
            status: CellStatus::Empty,
        }
    }
}

impl MatrixCell {
    /// Live evidence, available for seeding
    fn exists(&self) -> bool {
        self.status == CellStatus::Live
    }

    /// Live or already claimed: still real evidence for refinement reads
    fn is_present(&self) -> bool {
        self.status != CellStatus::Empty
    }

    fn is_claimed(&self) -> bool {
        self.status == CellStatus::Claimed
    }

    fn claim(&mut self) {
        if self.status == CellStatus::Live {
            self.status = CellStatus::Claimed;
        }
    }

    fn invalidate(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug)]
struct ChargeRow {
    charge: i32,
    cells: Vec<MatrixCell>,
}

/// A matrix cell whose match quality can anchor a new cluster search
#[derive(Debug, Clone, Copy)]
pub struct SeedCell {
    pub row: usize,
    pub column: usize,
    pub divergence: f64,
}

#[derive(Debug, Clone, Copy)]
struct RoughRegion {
    min_row: usize,
    max_row: usize,
    min_column: usize,
    max_column: usize,
}

#[derive(Debug, Clone)]
struct RowWindow {
    row: usize,
    start: usize,
    end: usize,
    intensity: f64,
    divergence: f64,
    correlation: f64,
}

/// The isotope-envelope evidence matrix for one run
pub struct FeatureMatrix<P: EnvelopeProvider> {
    run: Arc<LcMsRun>,
    provider: P,
    params: MatrixParams,
    binning: MassBinning,
    likelihood: Option<LikelihoodScorer>,
    pool: ThreadPool,
    target: Option<Arc<TheoreticalEnvelope>>,
    min_charge: i32,
    rows: Vec<ChargeRow>,
    seeds: Vec<SeedCell>,
}

impl<P: EnvelopeProvider> FeatureMatrix<P> {
    pub fn new(run: Arc<LcMsRun>, provider: P, params: MatrixParams) -> Self {
        let pool = ThreadPoolBuilder::new()
            .num_threads(params.max_threads)
            .build()
            .unwrap();
        Self {
            run,
            provider,
            params,
            binning: MassBinning::default(),
            likelihood: None,
            pool,
            target: None,
            min_charge: 0,
            rows: Vec::new(),
            seeds: Vec::new(),
        }
    }

    pub fn with_likelihood(mut self, scorer: LikelihoodScorer) -> Self {
        self.likelihood = Some(scorer);
        self
    }

    pub fn with_binning(mut self, binning: MassBinning) -> Self {
        self.binning = binning;
        self
    }

    pub fn run(&self) -> &Arc<LcMsRun> {
        &self.run
    }

    pub fn params(&self) -> &MatrixParams {
        &self.params
    }

    pub fn binning(&self) -> &MassBinning {
        &self.binning
    }

    pub fn likelihood(&self) -> Option<&LikelihoodScorer> {
        self.likelihood.as_ref()
    }

    /// The current seed list, best evidence first
    pub fn seeds(&self) -> &[SeedCell] {
        &self.seeds
    }

    /// The charge range detectable for `mass` within the instrument's m/z
    /// bounds, clipped to the configured charge search space and row cap
    fn detectable_charge_range(&self, mass: f64) -> Option<(i32, i32)> {
        let (lo_mz, hi_mz) = self.run.mz_bounds();
        if hi_mz <= lo_mz || hi_mz <= PROTON {
            return None;
        }
        let (bound_lo, bound_hi) = self.params.charge_bounds;
        let zmin = ((mass / (hi_mz - PROTON)).ceil() as i32).max(bound_lo).max(1);
        let zmax = if lo_mz > PROTON {
            ((mass / (lo_mz - PROTON)).floor() as i32).min(bound_hi)
        } else {
            bound_hi
        };
        if zmax < zmin {
            return None;
        }
        let zmax = zmax.min(zmin + self.params.max_charge_rows as i32 - 1);
        Some((zmin, zmax))
    }

    /// Populate the matrix for a candidate mass. Idempotent for a given
    /// mass; switching masses rebuilds everything, including claims.
    pub fn build_matrix(&mut self, mass: f64) {
        if let Some(target) = &self.target {
            if isclose(target.monoisotopic_mass, mass, 1e-6) {
                return;
            }
        }
        self.rows.clear();
        self.seeds.clear();
        self.min_charge = 0;

        let envelope = Arc::new(self.provider.envelope_of(mass));
        self.target = Some(envelope.clone());
        if envelope.is_empty() {
            return;
        }

        let Some((zmin, zmax)) = self.detectable_charge_range(mass) else {
            debug!("no detectable charge state for mass {mass:0.3}");
            return;
        };
        self.min_charge = zmin;

        let ncols = self.run.n_columns();
        let mut rows: Vec<ChargeRow> = (zmin..=zmax)
            .map(|charge| ChargeRow {
                charge,
                cells: vec![MatrixCell::default(); ncols],
            })
            .collect();

        let run = self.run.clone();
        let params = self.params.clone();
        let env = envelope.clone();
        self.pool.install(|| {
            rows.par_iter_mut()
                .for_each(|row| build_charge_row(&run, &env, &params, row));
        });

        let seed_div = seed_divergence_bar(mass);
        let seed_corr = seed_correlation_bar(mass);
        let mut seeds = Vec::new();
        for (ri, row) in rows.iter().enumerate() {
            for (ci, cell) in row.cells.iter().enumerate() {
                if !cell.exists()
                    || cell.divergence > seed_div
                    || cell.correlation < seed_corr
                {
                    continue;
                }
                let Some(anchor) = cell.peaks.get(envelope.most_abundant).copied().flatten()
                else {
                    continue;
                };
                let noise = run.noise_of(ci);
                if noise > 0.0 && run.peak(anchor).intensity / noise < self.params.snr_floor {
                    continue;
                }
                seeds.push(SeedCell {
                    row: ri,
                    column: ci,
                    divergence: cell.divergence,
                });
            }
        }
        seeds.sort_unstable_by(|a, b| a.divergence.total_cmp(&b.divergence));

        debug!(
            "matrix for {mass:0.3} Da: {} rows x {ncols} columns, {} seeds",
            rows.len(),
            seeds.len()
        );
        self.rows = rows;
        self.seeds = seeds;
    }

    /// Autonomous discovery for one mass bin: validate seeds best-first,
    /// grow regions, refine, and claim what was spanned. Expected-negative
    /// outcomes return an empty list.
    pub fn find_features(&mut self, mass_bin: usize) -> Vec<FeatureCluster> {
        let mass = self.binning.mass_of(mass_bin);
        self.build_matrix(mass);
        if self.rows.len() < 2 || self.run.n_columns() == 0 {
            return Vec::new();
        }

        let seeds = self.seeds.clone();
        let mut clusters = Vec::new();
        for seed in seeds {
            if self.rows[seed.row].cells[seed.column].is_claimed() {
                continue;
            }
            if !self.seed_is_significant(&seed) || !self.charge_is_plausible(&seed) {
                self.rows[seed.row].cells[seed.column].claim();
                continue;
            }
            let Some(region) = self.grow_region(&seed) else {
                self.rows[seed.row].cells[seed.column].claim();
                continue;
            };

            let refined = self.refine_feature(region.min_column, region.max_column);
            let accepted = refined.filter(|cluster| match &self.likelihood {
                Some(scorer) => scorer.test_score(cluster.score),
                None => true,
            });

            self.claim_span(
                (region.min_row, region.max_row),
                (region.min_column, region.max_column),
            );
            match accepted {
                Some(cluster) => {
                    let row_lo = self.row_of_charge(cluster.min_charge);
                    let row_hi = self.row_of_charge(cluster.max_charge);
                    let col_lo = self.run.column_near(cluster.min_scan).unwrap_or(0);
                    let col_hi = self
                        .run
                        .column_near(cluster.max_scan)
                        .unwrap_or(self.run.n_columns() - 1);
                    self.claim_span((row_lo, row_hi), (col_lo, col_hi));
                    clusters.push(cluster);
                }
                None => {
                    trace!(
                        "region at rows {}-{} columns {}-{} did not refine into a feature",
                        region.min_row,
                        region.max_row,
                        region.min_column,
                        region.max_column
                    );
                }
            }
        }
        debug!(
            "mass bin {mass_bin} ({mass:0.3} Da): {} features",
            clusters.len()
        );
        clusters
    }

    /// Refine an externally supplied seed region into a scored cluster.
    /// Used for gap filling and for re-deriving boundaries after growth;
    /// does not claim any cells.
    pub fn get_feature(
        &mut self,
        target_mass: f64,
        target_charge: i32,
        min_scan: u32,
        max_scan: u32,
    ) -> Option<FeatureCluster> {
        self.build_matrix(target_mass);
        if self.rows.len() < 2 || self.run.n_columns() == 0 {
            return None;
        }
        let col_lo = self.run.column_near(min_scan.min(max_scan))?;
        let col_hi = self.run.column_near(min_scan.max(max_scan))?;
        trace!(
            "refining {target_mass:0.3} Da at charge {target_charge} over columns {col_lo}-{col_hi}"
        );
        self.refine_feature(col_lo, col_hi)
    }

    /// Denovo abundance collection straight from the raw peak lists,
    /// ignoring matrix state: used when re-quantifying an aligned feature
    /// in a run that never detected it. Falls back to summing whatever
    /// raw signal sits in the anchor-isotope windows when no envelope
    /// assembles.
    pub fn collect_abundance(
        &mut self,
        mass: f64,
        charge_range: (i32, i32),
        column_range: (usize, usize),
    ) -> f64 {
        let envelope = self.provider.envelope_of(mass);
        let ncols = self.run.n_columns();
        if envelope.is_empty() || ncols == 0 {
            return 0.0;
        }
        let col_lo = column_range.0.min(column_range.1).min(ncols - 1);
        let col_hi = column_range.0.max(column_range.1).min(ncols - 1);
        let charge_lo = charge_range.0.min(charge_range.1).max(1);
        let charge_hi = charge_range.0.max(charge_range.1).max(1);
        let min_count = minimum_isotope_count(mass);

        let mut total = 0.0f64;
        for charge in charge_lo..=charge_hi {
            let anchor_mz = envelope.isotope_mz(charge, envelope.most_abundant);
            let width = tolerance_width(self.params.tolerance, anchor_mz);
            for column in col_lo..=col_hi {
                let scan_peaks = self.run.peaks_of(column);
                let hits = scan_peaks.between(
                    anchor_mz - width,
                    anchor_mz + width,
                    Tolerance::Da(0.001),
                );
                let Some(anchor) = hits
                    .iter()
                    .filter(|p| p.is_active())
                    .max_by(|a, b| a.intensity.total_cmp(&b.intensity))
                else {
                    continue;
                };
                let (_, intensities, peak_count) = match_envelope_slots(
                    &self.run,
                    &envelope,
                    &self.params,
                    charge,
                    column,
                    anchor.id(),
                );
                if peak_count >= min_count {
                    total += intensities.iter().map(|&v| v as f64).sum::<f64>();
                }
            }
        }
        if total > 0.0 {
            return total;
        }

        // noise-only fallback
        let mut noise_total = 0.0f64;
        for charge in charge_lo..=charge_hi {
            let anchor_mz = envelope.isotope_mz(charge, envelope.most_abundant);
            let width = tolerance_width(self.params.tolerance, anchor_mz);
            for column in col_lo..=col_hi {
                let hits = self.run.peaks_of(column).between(
                    anchor_mz - width,
                    anchor_mz + width,
                    Tolerance::Da(0.001),
                );
                noise_total += hits
                    .iter()
                    .filter(|p| p.is_active())
                    .map(|p| p.intensity as f64)
                    .sum::<f64>();
            }
        }
        noise_total
    }

    /// Recompute a cluster's envelope abundances and scores against the
    /// currently active peaks, returning the refreshed likelihood score.
    /// Used by the overlap resolver after a winner deactivates shared
    /// evidence.
    pub fn rescore(&mut self, cluster: &mut FeatureCluster) -> f64 {
        self.build_matrix(cluster.representative_mass);
        let Some(envelope) = self.target.clone() else {
            return 0.0;
        };
        for observed in cluster.envelopes.iter_mut() {
            observed.refresh_abundance(&self.run);
        }
        let ctx = ScoringContext {
            run: self.run.as_ref(),
            envelope: envelope.as_ref(),
            tolerance: self.params.tolerance,
            significance: self.params.seed_significance,
        };
        cluster.update_score(&ctx, true);
        cluster.score = match &self.likelihood {
            Some(scorer) => scorer.score(cluster.representative_mass, &cluster.scores),
            None => cluster.scores.parities[0]
                .summed_correlation
                .max(cluster.scores.parities[1].summed_correlation),
        };
        cluster.score
    }

    fn row_of_charge(&self, charge: i32) -> usize {
        ((charge - self.min_charge).max(0) as usize).min(self.rows.len().saturating_sub(1))
    }

    fn claim_span(&mut self, rows: (usize, usize), columns: (usize, usize)) {
        let row_hi = rows.1.min(self.rows.len().saturating_sub(1));
        for row in &mut self.rows[rows.0..=row_hi] {
            let col_hi = columns.1.min(row.cells.len().saturating_sub(1));
            for cell in &mut row.cells[columns.0..=col_hi] {
                cell.claim();
            }
        }
    }

    /// Rank-sum plus Poisson validation of a seed against its local m/z
    /// neighborhood
    fn seed_is_significant(&self, seed: &SeedCell) -> bool {
        let Some(envelope) = &self.target else {
            return false;
        };
        let row = &self.rows[seed.row];
        let cell = &row.cells[seed.column];
        let observed = ObservedEnvelope::new(
            cell.accurate_mass,
            row.charge,
            seed.column,
            cell.peaks.clone(),
            self.run.as_ref(),
        );
        let intensities = observed.intensities(self.run.as_ref());
        let ctx = ScoringContext {
            run: self.run.as_ref(),
            envelope: envelope.as_ref(),
            tolerance: self.params.tolerance,
            significance: self.params.seed_significance,
        };
        envelope_is_significant(&observed, &intensities, &ctx)
    }

    /// Reject a seed when its local neighborhood shows stronger periodic
    /// spacing consistent with a different charge state than claimed
    fn charge_is_plausible(&self, seed: &SeedCell) -> bool {
        let Some(envelope) = &self.target else {
            return false;
        };
        let row = &self.rows[seed.row];
        let charge = row.charge;
        let cell = &row.cells[seed.column];
        let Some(anchor_id) = cell.peaks.get(envelope.most_abundant).copied().flatten() else {
            return false;
        };
        let anchor = self.run.peak(anchor_id);
        let half_span = envelope.len() as f64 * NEUTRON_SHIFT / charge as f64;
        let floor = anchor.intensity * 0.1;
        let local: Vec<f64> = self
            .run
            .peaks_of(seed.column)
            .between(
                anchor.mz - half_span,
                anchor.mz + half_span,
                Tolerance::Da(0.001),
            )
            .iter()
            .filter(|p| p.is_active() && p.intensity >= floor)
            .map(|p| p.mz)
            .collect();
        let gap_tolerance = 2.0 * tolerance_width(self.params.tolerance, anchor.mz);
        let cutoff = (local.len() / 2).max(10);
        for candidate in (2 * charge - 1)..=(5 * charge + 1) {
            if candidate <= 0 || candidate == charge {
                continue;
            }
            let spacing = NEUTRON_SHIFT / candidate as f64;
            let matches = local
                .iter()
                .copied()
                .tuple_combinations::<(f64, f64)>()
                .filter(|(a, b)| ((b - a).abs() - spacing).abs() <= gap_tolerance)
                .count();
            if matches >= cutoff {
                trace!(
                    "seed at charge {charge} shows {matches} gaps matching charge {candidate}"
                );
                return false;
            }
        }
        true
    }

    /// Breadth-first region growth from a validated seed. Accepted cells
    /// are claimed immediately so later seeds cannot re-use them.
    fn grow_region(&mut self, seed: &SeedCell) -> Option<RoughRegion> {
        let envelope = self.target.clone()?;
        let run = self.run.clone();
        let mass = envelope.monoisotopic_mass;
        let nslots = envelope.len();
        let nrows = self.rows.len();
        let ncols = run.n_columns();

        let seed_cell = &self.rows[seed.row].cells[seed.column];
        let seed_mass = seed_cell.accurate_mass;
        let mass_window = tolerance_width(self.params.tolerance, seed_mass);
        let mut summed = cell_intensities(&run, seed_cell, nslots);
        let mut divergence = envelope.divergence(&summed);
        let mut correlation = envelope.correlation(&summed);

        self.rows[seed.row].cells[seed.column].claim();
        let mut queue = VecDeque::from(vec![(seed.row, seed.column)]);
        let (mut min_row, mut max_row) = (seed.row, seed.row);
        let (mut min_col, mut max_col) = (seed.column, seed.column);

        while let Some((r, c)) = queue.pop_front() {
            let radius = charge_neighbor_radius(self.rows[r].charge);
            let row_lo = r.saturating_sub(radius);
            let row_hi = (r + radius).min(nrows - 1);
            let col_lo = c.saturating_sub(GROWTH_SCAN_RADIUS);
            let col_hi = (c + GROWTH_SCAN_RADIUS).min(ncols.saturating_sub(1));
            for nr in row_lo..=row_hi {
                for nc in col_lo..=col_hi {
                    if nr == r && nc == c {
                        continue;
                    }
                    let cell = &self.rows[nr].cells[nc];
                    if !cell.exists() {
                        continue;
                    }
                    if (cell.accurate_mass - seed_mass).abs() > mass_window {
                        continue;
                    }
                    let very_good = cell.divergence <= VERY_GOOD_DIVERGENCE
                        || cell.correlation >= VERY_GOOD_CORRELATION;
                    let mut candidate = summed.clone();
                    for (acc, v) in candidate.iter_mut().zip(cell_intensities(&run, cell, nslots))
                    {
                        *acc += v;
                    }
                    let cand_div = envelope.divergence(&candidate);
                    let cand_corr = envelope.correlation(&candidate);
                    if very_good || cand_div < divergence || cand_corr > correlation {
                        summed = candidate;
                        divergence = cand_div;
                        correlation = cand_corr;
                        self.rows[nr].cells[nc].claim();
                        min_row = min_row.min(nr);
                        max_row = max_row.max(nr);
                        min_col = min_col.min(nc);
                        max_col = max_col.max(nc);
                        queue.push_back((nr, nc));
                    }
                }
            }
        }

        if divergence <= divergence_bar(mass) || correlation >= correlation_bar(mass) {
            trace!(
                "grew region rows {min_row}-{max_row} columns {min_col}-{max_col} \
                 (divergence {divergence:0.4}, correlation {correlation:0.4})"
            );
            Some(RoughRegion {
                min_row,
                max_row,
                min_column: min_col,
                max_column: max_col,
            })
        } else {
            None
        }
    }

    /// Boundary search plus collection: derives the working charge range
    /// from overlapping per-row windows, locates the apex on the smoothed
    /// two-parity XIC, expands elution boundaries by exponential decay,
    /// and assembles the scored cluster.
    fn refine_feature(&self, col_lo: usize, col_hi: usize) -> Option<FeatureCluster> {
        let envelope = self.target.clone()?;
        let run = self.run.clone();
        let mass = envelope.monoisotopic_mass;
        if self.rows.len() < 2 || run.n_columns() == 0 {
            return None;
        }

        let params = self.params.clone();
        let rows = &self.rows;
        let windows: Vec<Option<RowWindow>> = self.pool.install(|| {
            rows.par_iter()
                .enumerate()
                .map(|(index, row)| row_window(&run, &envelope, &params, index, row, col_lo, col_hi))
                .collect()
        });

        let best = windows
            .iter()
            .flatten()
            .max_by(|a, b| a.intensity.total_cmp(&b.intensity))?
            .clone();
        if best.intensity <= 0.0 {
            return None;
        }

        let div_bar = divergence_bar(mass);
        let corr_bar = correlation_bar(mass);
        let working: Vec<&RowWindow> = windows
            .iter()
            .flatten()
            .filter(|w| {
                w.start <= best.end
                    && w.end >= best.start
                    && (w.divergence <= div_bar || w.correlation >= corr_bar)
            })
            .collect();
        if working.is_empty() {
            return None;
        }
        let min_row = working.iter().map(|w| w.row).min()?;
        let max_row = working.iter().map(|w| w.row).max()?;

        // best row per charge parity drives the apex chromatogram
        let best_parity_row = |parity: ChargeParity| -> Option<usize> {
            working
                .iter()
                .filter(|w| ChargeParity::of(rows[w.row].charge) == parity)
                .max_by(|a, b| a.intensity.total_cmp(&b.intensity))
                .map(|w| w.row)
        };
        let chosen: Vec<usize> = ChargeParity::BOTH
            .into_iter()
            .filter_map(best_parity_row)
            .collect();

        let ncols = run.n_columns();
        let mut xic = vec![0.0f32; ncols];
        for &ri in chosen.iter() {
            for (ci, cell) in rows[ri].cells.iter().enumerate() {
                if cell.is_present() {
                    xic[ci] += cell_intensity_total(&run, cell);
                }
            }
        }
        let xic = smooth_moving_average(&xic, params.smoothing_half_width);

        let apex = (best.start..=best.end).max_by(|&a, &b| xic[a].total_cmp(&xic[b]))?;
        if xic[apex] <= 0.0 {
            return None;
        }
        let (left, right) = expand_elution_boundaries(&xic, apex);

        let mut envelopes = Vec::new();
        for row in rows[min_row..=max_row].iter() {
            for ci in left..=right {
                let cell = &row.cells[ci];
                if !cell.is_present() {
                    continue;
                }
                envelopes.push(ObservedEnvelope::new(
                    cell.accurate_mass,
                    row.charge,
                    ci,
                    cell.peaks.clone(),
                    run.as_ref(),
                ));
            }
        }
        if envelopes.is_empty() {
            return None;
        }

        let rep = envelopes
            .iter()
            .max_by(|a, b| a.abundance.total_cmp(&b.abundance))?
            .clone();
        let rep_scan = run.scan_number_of(rep.scan_column);
        let rep_time = run.elution_time_of(rep.scan_column);
        let mut cluster = FeatureCluster::from_extents(
            rep.mass,
            (rep.charge, rep.charge),
            (rep_scan, rep_scan),
            (rep_time, rep_time),
        );
        cluster.representative_charge = rep.charge;
        cluster.representative_scan = rep_scan;
        cluster.representative_mz = rep
            .peaks
            .get(envelope.most_abundant)
            .copied()
            .flatten()
            .map(|id| run.peak(id).mz)
            .unwrap_or_else(|| envelope.isotope_mz(rep.charge, envelope.most_abundant));
        cluster.relative_intensities = envelope.intensities.clone();
        cluster.add_envelopes(envelopes, run.as_ref());

        let ctx = ScoringContext {
            run: run.as_ref(),
            envelope: envelope.as_ref(),
            tolerance: params.tolerance,
            significance: params.seed_significance,
        };
        cluster.update_score(&ctx, true);
        cluster.abundance = xic_area(&run, &xic, left, right);
        cluster.score = match &self.likelihood {
            Some(scorer) => scorer.score(cluster.representative_mass, &cluster.scores),
            None => cluster.scores.parities[0]
                .summed_correlation
                .max(cluster.scores.parities[1].summed_correlation),
        };
        trace!(
            "refined {mass:0.3} Da into charges {}-{} scans {}-{} (score {:0.3})",
            cluster.min_charge,
            cluster.max_charge,
            cluster.min_scan,
            cluster.max_scan,
            cluster.score
        );
        Some(cluster)
    }
}

/// Fill one charge row of the matrix. Each candidate anchor peak proposes
/// an envelope; when a cell already holds one, the candidate with the
/// lower divergence wins. Cells below the mass-dependent minimum isotope
/// count are invalidated.
fn build_charge_row(
    run: &LcMsRun,
    envelope: &TheoreticalEnvelope,
    params: &MatrixParams,
    row: &mut ChargeRow,
) {
    let charge = row.charge;
    let anchor_slot = envelope.most_abundant;
    let anchor_mz = envelope.isotope_mz(charge, anchor_slot);
    let width = tolerance_width(params.tolerance, anchor_mz);

    let anchor_ids: Vec<PeakId> = run
        .peaks_between(anchor_mz - width, anchor_mz + width)
        .collect();
    for anchor_id in anchor_ids {
        let anchor = run.peak(anchor_id);
        if !anchor.is_active() {
            continue;
        }
        let column = anchor.scan_column as usize;
        let (slots, intensities, peak_count) =
            match_envelope_slots(run, envelope, params, charge, column, anchor_id);
        let divergence = envelope.divergence(&intensities);
        let cell = &mut row.cells[column];
        if !cell.is_present() || divergence < cell.divergence {
            *cell = MatrixCell {
                peaks: slots,
                accurate_mass: mz_to_mass(anchor.mz, charge)
                    - anchor_slot as f64 * NEUTRON_SHIFT,
                divergence,
                correlation: envelope.correlation(&intensities),
                peak_count,
                status: CellStatus::Live,
            };
        }
    }

    let min_count = minimum_isotope_count(envelope.monoisotopic_mass);
    for cell in row.cells.iter_mut() {
        if cell.is_present() && cell.peak_count < min_count {
            cell.invalidate();
        }
    }
}

/// Match the dependent isotope slots around an anchor peak, in ranked
/// order, each within tolerance of the expected spacing from the anchor
fn match_envelope_slots(
    run: &LcMsRun,
    envelope: &TheoreticalEnvelope,
    params: &MatrixParams,
    charge: i32,
    column: usize,
    anchor_id: PeakId,
) -> (Vec<Option<PeakId>>, Vec<f32>, usize) {
    let nslots = envelope.len();
    let anchor_slot = envelope.most_abundant;
    let anchor = run.peak(anchor_id);
    let spacing = NEUTRON_SHIFT / charge as f64;
    let scan_peaks = run.peaks_of(column);

    let mut slots: Vec<Option<PeakId>> = vec![None; nslots];
    let mut intensities = vec![0.0f32; nslots];
    slots[anchor_slot] = Some(anchor_id);
    intensities[anchor_slot] = anchor.intensity;
    let mut peak_count = 1usize;

    for &slot in envelope.ranked.iter() {
        if slot == anchor_slot {
            continue;
        }
        let expected = anchor.mz + (slot as f64 - anchor_slot as f64) * spacing;
        let width = tolerance_width(params.tolerance, expected);
        let hits = scan_peaks.between(expected - width, expected + width, Tolerance::Da(0.001));
        let best = hits
            .iter()
            .filter(|p| p.is_active())
            .max_by(|a, b| a.intensity.total_cmp(&b.intensity));
        if let Some(peak) = best {
            slots[slot] = Some(peak.id());
            intensities[slot] = peak.intensity;
            peak_count += 1;
        }
    }
    (slots, intensities, peak_count)
}

fn cell_intensities(run: &LcMsRun, cell: &MatrixCell, nslots: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; nslots];
    for (slot, peak) in cell.peaks.iter().enumerate() {
        if let Some(id) = peak {
            let p = run.peak(*id);
            if p.is_active() {
                out[slot] = p.intensity;
            }
        }
    }
    out
}

fn cell_intensity_total(run: &LcMsRun, cell: &MatrixCell) -> f32 {
    cell.peaks
        .iter()
        .flatten()
        .map(|&id| {
            let p = run.peak(id);
            if p.is_active() {
                p.intensity
            } else {
                0.0
            }
        })
        .sum()
}

/// A locally best scan window for one charge row: extend outward from the
/// best-matched column, tolerating short runs of poor columns
fn row_window(
    run: &LcMsRun,
    envelope: &TheoreticalEnvelope,
    params: &MatrixParams,
    index: usize,
    row: &ChargeRow,
    col_lo: usize,
    col_hi: usize,
) -> Option<RowWindow> {
    let mass = envelope.monoisotopic_mass;
    let div_bar = divergence_bar(mass);
    let corr_bar = correlation_bar(mass);
    let good = |cell: &MatrixCell| {
        cell.is_present() && (cell.divergence <= div_bar || cell.correlation >= corr_bar)
    };

    let ncols = row.cells.len();
    if ncols == 0 {
        return None;
    }
    let col_hi = col_hi.min(ncols - 1);
    let col_lo = col_lo.min(col_hi);

    let seed = (col_lo..=col_hi)
        .filter(|&c| good(&row.cells[c]))
        .min_by(|&a, &b| row.cells[a].divergence.total_cmp(&row.cells[b].divergence))?;

    let mut start = seed;
    let mut gap = 0;
    let mut c = seed;
    while c > 0 {
        c -= 1;
        if good(&row.cells[c]) {
            start = c;
            gap = 0;
        } else {
            gap += 1;
            if gap > params.max_gap_columns {
                break;
            }
        }
    }
    let mut end = seed;
    gap = 0;
    c = seed;
    while c + 1 < ncols {
        c += 1;
        if good(&row.cells[c]) {
            end = c;
            gap = 0;
        } else {
            gap += 1;
            if gap > params.max_gap_columns {
                break;
            }
        }
    }

    let mut intensity = 0.0f64;
    let mut divergence = f64::INFINITY;
    let mut correlation = 0.0f64;
    for cell in &row.cells[start..=end] {
        if cell.is_present() {
            intensity += cell_intensity_total(run, cell) as f64;
            divergence = divergence.min(cell.divergence);
            correlation = correlation.max(cell.correlation);
        }
    }
    Some(RowWindow {
        row: index,
        start,
        end,
        intensity,
        divergence,
        correlation,
    })
}

/// Expand elution boundaries outward from the apex: free expansion above
/// the one-sigma cut (`apex / e`), then further extension only while the
/// trace keeps falling toward a short look-ahead window. Approximates a
/// Gaussian cutoff without assuming a parametric peak shape.
fn expand_elution_boundaries(xic: &[f32], apex: usize) -> (usize, usize) {
    let cutoff = xic[apex] * (-1.0f32).exp();

    let mut left = apex;
    while left > 0 {
        let next = xic[left - 1];
        if next <= 0.0 {
            break;
        }
        if next >= cutoff {
            left -= 1;
            continue;
        }
        let j = left - 1;
        let ahead = &xic[j.saturating_sub(2)..j];
        let floor = if ahead.is_empty() {
            f32::NEG_INFINITY
        } else {
            ahead.iter().copied().fold(f32::INFINITY, f32::min)
        };
        if next < xic[left] && floor < next {
            left -= 1;
        } else {
            break;
        }
    }

    let mut right = apex;
    while right + 1 < xic.len() {
        let next = xic[right + 1];
        if next <= 0.0 {
            break;
        }
        if next >= cutoff {
            right += 1;
            continue;
        }
        let j = right + 1;
        let ahead = &xic[(j + 1).min(xic.len())..(j + 3).min(xic.len())];
        let floor = if ahead.is_empty() {
            f32::NEG_INFINITY
        } else {
            ahead.iter().copied().fold(f32::INFINITY, f32::min)
        };
        if next < xic[right] && floor < next {
            right += 1;
        } else {
            break;
        }
    }

    (left, right)
}

/// Area under the smoothed chromatogram between the elution boundaries
fn xic_area(run: &LcMsRun, xic: &[f32], left: usize, right: usize) -> f64 {
    if left >= right {
        return xic[left] as f64;
    }
    let mut area = 0.0f64;
    for c in left..right {
        let dt = run.elution_time_of(c + 1) - run.elution_time_of(c);
        area += 0.5 * (xic[c] + xic[c + 1]) as f64 * dt;
    }
    area
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::envelope::CachingAveragineProvider;
    use crate::run::LcMsScan;
    use mzpeaks::CentroidPeak;

    const N_COLUMNS: usize = 15;

    /// A synthetic run holding one gaussian-eluting species at the given
    /// charges, plus a flat noise floor. Only the top `slots` isotope
    /// positions (by theoretical abundance) receive peaks.
    fn synthetic_run(
        mass: f64,
        charges: &[i32],
        apex_intensity: f32,
        slots: usize,
    ) -> Arc<LcMsRun> {
        let mut provider = CachingAveragineProvider::peptide();
        let envelope = provider.envelope_of(mass);
        let apex = N_COLUMNS as f64 / 2.0;
        let scans = (0..N_COLUMNS).map(|col| {
            let scale = (-((col as f64 - apex) / 2.5).powi(2)).exp() as f32;
            let mut peaks = Vec::new();
            for &z in charges {
                for &slot in envelope.ranked.iter().take(slots) {
                    let intensity = envelope.intensities[slot] as f32 * apex_intensity * scale;
                    if intensity > 1.0 {
                        peaks.push(CentroidPeak::new(envelope.isotope_mz(z, slot), intensity, 0));
                    }
                }
            }
            // sparse flat noise well away from the envelope
            peaks.push(CentroidPeak::new(350.0 + col as f64 * 0.37, 4.0, 0));
            (LcMsScan::new(col as u32, col as f64 * 0.1, 1), peaks)
        });
        Arc::new(LcMsRun::new(scans).with_mz_bounds(300.0, 2000.0))
    }

    fn matrix_for(run: Arc<LcMsRun>) -> FeatureMatrix<CachingAveragineProvider<'static>> {
        let mut params = MatrixParams::default();
        params.max_threads = 2;
        FeatureMatrix::new(run, CachingAveragineProvider::peptide(), params)
    }

    fn binned_mass(matrix: &FeatureMatrix<CachingAveragineProvider<'static>>, mass: f64) -> f64 {
        matrix.binning().mass_of(matrix.binning().bin_of(mass))
    }

    #[test]
    fn test_empty_matrix_finds_nothing() {
        let run = Arc::new(
            LcMsRun::from_ms1_scans(
                (0..5).map(|i| (i as u32, i as f64 * 0.1, vec![CentroidPeak::new(350.0, 5.0, 0)])),
            )
            .with_mz_bounds(300.0, 2000.0),
        );
        let mut matrix = matrix_for(run);
        let bin = matrix.binning().bin_of(5000.0);
        let features = matrix.find_features(bin);
        assert!(features.is_empty());
        assert!(matrix.seeds().is_empty());
    }

    #[test]
    fn test_find_single_feature() {
        let probe = matrix_for(synthetic_run(5000.0, &[7, 8, 9], 5000.0, usize::MAX));
        let mass = binned_mass(&probe, 5000.0);
        let run = synthetic_run(mass, &[7, 8, 9], 5000.0, usize::MAX);
        let mut matrix = matrix_for(run);
        let bin = matrix.binning().bin_of(mass);
        let features = matrix.find_features(bin);
        assert_eq!(features.len(), 1, "expected a single cluster");
        let feature = &features[0];
        let ppm = (feature.representative_mass - mass).abs() / mass * 1e6;
        assert!(ppm < 20.0, "recovered mass off by {ppm} ppm");
        assert!(feature.min_charge <= 8 && feature.max_charge >= 8);
        assert!(feature.abundance > 0.0);
        assert!(feature.good_enough());
        assert!(feature.min_scan < feature.max_scan);
    }

    #[test]
    fn test_find_features_idempotent() {
        let probe = matrix_for(synthetic_run(5000.0, &[7, 8], 5000.0, usize::MAX));
        let mass = binned_mass(&probe, 5000.0);
        let mut matrix = matrix_for(synthetic_run(mass, &[7, 8], 5000.0, usize::MAX));
        let bin = matrix.binning().bin_of(mass);
        let first = matrix.find_features(bin);
        assert!(!first.is_empty());
        let second = matrix.find_features(bin);
        assert!(
            second.is_empty(),
            "claimed cells must not re-emit clusters, got {}",
            second.len()
        );
    }

    #[test]
    fn test_minimum_peak_count_invalidates_cells() {
        // at 8 kDa at least 4 isotope peaks are required, supply only 2
        let probe = matrix_for(synthetic_run(8000.0, &[8], 5000.0, 2));
        let mass = binned_mass(&probe, 8000.0);
        let mut matrix = matrix_for(synthetic_run(mass, &[8], 5000.0, 2));
        matrix.build_matrix(mass);
        for row in matrix.rows.iter() {
            for cell in row.cells.iter() {
                assert!(!cell.exists());
            }
        }
        assert!(matrix.seeds().is_empty());
        let bin = matrix.binning().bin_of(mass);
        assert!(matrix.find_features(bin).is_empty());
    }

    #[test]
    fn test_get_feature_refines_supplied_region() {
        let probe = matrix_for(synthetic_run(5000.0, &[7, 8], 5000.0, usize::MAX));
        let mass = binned_mass(&probe, 5000.0);
        let mut matrix = matrix_for(synthetic_run(mass, &[7, 8], 5000.0, usize::MAX));
        let feature = matrix.get_feature(mass, 8, 4, 10);
        let feature = feature.expect("expected a refined cluster");
        assert!(feature.envelopes.len() > 1);
        assert!(feature.abundance > 0.0);
        // the mass does not change by refining
        let ppm = (feature.representative_mass - mass).abs() / mass * 1e6;
        assert!(ppm < 20.0);
    }

    #[test]
    fn test_charge_plausibility_rejects_wrong_charge() {
        // a genuine charge-7 species; pretend it's charge 2 and the local
        // spacing check should refuse it
        let probe = matrix_for(synthetic_run(2400.0, &[2], 5000.0, usize::MAX));
        let mass = binned_mass(&probe, 2400.0);
        let mut provider = CachingAveragineProvider::peptide();
        let envelope = provider.envelope_of(mass);
        let contaminant_anchor = envelope.isotope_mz(2, envelope.most_abundant);

        let scans = (0..N_COLUMNS).map(|col| {
            let mut peaks = Vec::new();
            // the claimed charge-2 envelope
            for (slot, &rel) in envelope.intensities.iter().enumerate() {
                peaks.push(CentroidPeak::new(
                    envelope.isotope_mz(2, slot),
                    rel as f32 * 3000.0,
                    0,
                ));
            }
            // a dense interleaved series spaced like charge 7, weak enough
            // to leave the seed's signal-to-noise intact but above the 10%
            // intensity floor of the plausibility check
            for k in 1..=14 {
                peaks.push(CentroidPeak::new(
                    contaminant_anchor + 0.04 + k as f64 * NEUTRON_SHIFT / 7.0,
                    400.0,
                    0,
                ));
            }
            (LcMsScan::new(col as u32, col as f64 * 0.1, 1), peaks)
        });
        let run = Arc::new(LcMsRun::new(scans).with_mz_bounds(300.0, 2000.0));
        let mut matrix = matrix_for(run);
        matrix.build_matrix(mass);
        let seed = matrix
            .seeds()
            .iter()
            .copied()
            .find(|s| matrix.rows[s.row].charge == 2);
        if let Some(seed) = seed {
            assert!(
                !matrix.charge_is_plausible(&seed),
                "charge-7 spacing should reject a charge-2 seed"
            );
        }
    }

    #[test]
    fn test_boundary_expansion() {
        let xic: Vec<f32> = (0..21)
            .map(|i| 1000.0 * (-((i as f32 - 10.0) / 2.0).powi(2)).exp())
            .collect();
        let (left, right) = expand_elution_boundaries(&xic, 10);
        assert!(left < 10 && right > 10);
        // one-sigma cut: e^-1 of apex is reached two columns out
        assert!(10 - left >= 2, "left boundary too tight: {left}");
        assert!(right - 10 >= 2, "right boundary too tight: {right}");
        // a flat trace never decays below the cut
        let flat = vec![10.0f32; 9];
        let (l, r) = expand_elution_boundaries(&flat, 4);
        assert_eq!((l, r), (0, 8));
    }

    #[test]
    fn test_detectable_charge_range_scales_with_mass() {
        let matrix = matrix_for(synthetic_run(5000.0, &[8], 5000.0, usize::MAX));
        let (lo_small, hi_small) = matrix.detectable_charge_range(2000.0).unwrap();
        let (lo_large, hi_large) = matrix.detectable_charge_range(20000.0).unwrap();
        assert!(lo_large >= lo_small);
        assert!(hi_large >= hi_small);
        assert!(
            (hi_large - lo_large + 1) as usize <= matrix.params().max_charge_rows,
            "row span must be capped"
        );
    }

    #[test]
    fn test_collect_abundance_denovo_and_noise_fallback() {
        let probe = matrix_for(synthetic_run(5000.0, &[8], 5000.0, usize::MAX));
        let mass = binned_mass(&probe, 5000.0);
        let mut matrix = matrix_for(synthetic_run(mass, &[8], 5000.0, usize::MAX));
        let abundance = matrix.collect_abundance(mass, (7, 9), (3, 11));
        assert!(abundance > 0.0);

        // a mass with no signal anywhere: the envelope never assembles and
        // the noise fallback finds nothing either
        let empty = matrix.collect_abundance(3210.0, (2, 4), (0, N_COLUMNS - 1));
        assert_eq!(empty, 0.0);
    }
}
