//! The feature cluster: one candidate species' matched isotope envelopes
//! across charge and elution time, and the derived statistics that decide
//! whether it is real.

use identity_hash::BuildIdentityHasher;
use std::collections::HashSet;

use mzpeaks::{PeakCollection, Tolerance};

use crate::envelope::{mass_to_mz, tolerance_width, TheoreticalEnvelope, NEUTRON_SHIFT};
use crate::likelihood::ScoreKind;
use crate::run::{LcMsRun, PeakId};
use crate::stats;

/// Theoretical relative intensity above which an isotope slot's peak counts
/// as a "major" peak for overlap bookkeeping
pub const MAJOR_ISOTOPE_RATIO: f64 = 0.3;

/// Charge states bucketed by parity. Even and odd charges behave as
/// semi-independent evidence sources for the same mass, so the derived
/// statistics are kept separately per bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChargeParity {
    Even,
    Odd,
}

impl ChargeParity {
    pub const BOTH: [ChargeParity; 2] = [ChargeParity::Even, ChargeParity::Odd];

    #[inline(always)]
    pub fn of(charge: i32) -> Self {
        if charge.abs() % 2 == 0 {
            ChargeParity::Even
        } else {
            ChargeParity::Odd
        }
    }

    #[inline(always)]
    pub fn index(&self) -> usize {
        match self {
            ChargeParity::Even => 0,
            ChargeParity::Odd => 1,
        }
    }
}

/// One matched isotope envelope at a single (charge, scan) cell. Immutable
/// after construction except for the `good_enough` classification flag set
/// during score updates.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObservedEnvelope {
    /// The accurate monoisotopic mass inferred from the anchor peak
    pub mass: f64,
    pub charge: i32,
    pub scan_column: usize,
    /// One slot per theoretical isotope position; `None` where no peak
    /// matched
    pub peaks: Box<[Option<PeakId>]>,
    /// Sum of the active matched peak intensities
    pub abundance: f64,
    pub good_enough: bool,
}

impl ObservedEnvelope {
    pub fn new(
        mass: f64,
        charge: i32,
        scan_column: usize,
        peaks: Vec<Option<PeakId>>,
        run: &LcMsRun,
    ) -> Self {
        let mut envelope = Self {
            mass,
            charge,
            scan_column,
            peaks: peaks.into_boxed_slice(),
            abundance: 0.0,
            good_enough: false,
        };
        envelope.refresh_abundance(run);
        envelope
    }

    pub fn peak_count(&self) -> usize {
        self.peaks.iter().flatten().count()
    }

    /// Per-slot active intensities, zero where a slot is empty or its peak
    /// has been claimed by another feature
    pub fn intensities(&self, run: &LcMsRun) -> Vec<f32> {
        self.peaks
            .iter()
            .map(|slot| match slot {
                Some(id) => {
                    let peak = run.peak(*id);
                    if peak.is_active() {
                        peak.intensity
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            })
            .collect()
    }

    /// Recompute the abundance from the currently active peaks
    pub fn refresh_abundance(&mut self, run: &LcMsRun) {
        self.abundance = self
            .intensities(run)
            .iter()
            .map(|&v| v as f64)
            .sum();
    }
}

/// Derived statistics for one charge-parity bucket
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ParityScores {
    pub abundance_ratio: f64,
    pub best_divergence: f64,
    pub summed_divergence: f64,
    pub best_correlation: f64,
    pub summed_correlation: f64,
    pub best_intensity_ratio: f64,
    pub summed_intensity_ratio: f64,
}

impl Default for ParityScores {
    fn default() -> Self {
        Self {
            abundance_ratio: 0.0,
            best_divergence: f64::INFINITY,
            summed_divergence: f64::INFINITY,
            best_correlation: 0.0,
            summed_correlation: 0.0,
            best_intensity_ratio: 0.0,
            summed_intensity_ratio: 0.0,
        }
    }
}

/// The full score vector fed to the likelihood scorer
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScoreVector {
    pub parities: [ParityScores; 2],
    /// Correlation between the best even and best odd charge's smoothed
    /// extracted chromatograms
    pub xic_correlation: f64,
}

impl ScoreVector {
    pub fn get(&self, kind: ScoreKind, parity: ChargeParity) -> f64 {
        let bucket = &self.parities[parity.index()];
        match kind {
            ScoreKind::AbundanceRatio => bucket.abundance_ratio,
            ScoreKind::BestDivergence => bucket.best_divergence,
            ScoreKind::SummedDivergence => bucket.summed_divergence,
            ScoreKind::BestCorrelation => bucket.best_correlation,
            ScoreKind::SummedCorrelation => bucket.summed_correlation,
            ScoreKind::BestIntensityRatio => bucket.best_intensity_ratio,
            ScoreKind::SummedIntensityRatio => bucket.summed_intensity_ratio,
            ScoreKind::XicCorrelation => self.xic_correlation,
        }
    }
}

/// Everything `update_score` needs from the surrounding search
#[derive(Debug, Clone, Copy)]
pub struct ScoringContext<'a> {
    pub run: &'a LcMsRun,
    pub envelope: &'a TheoreticalEnvelope,
    pub tolerance: Tolerance,
    pub significance: f64,
}

/// One candidate feature: the matched envelopes across charge and time and
/// the derived evidence that it traces a single chemical species.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FeatureCluster {
    pub representative_mass: f64,
    pub representative_charge: i32,
    pub representative_mz: f64,
    pub representative_scan: u32,
    pub min_charge: i32,
    pub max_charge: i32,
    pub min_scan: u32,
    pub max_scan: u32,
    pub min_elution_time: f64,
    pub max_elution_time: f64,
    pub min_net: f64,
    pub max_net: f64,
    pub envelopes: Vec<ObservedEnvelope>,
    /// Theoretical relative intensity template of the candidate mass
    pub relative_intensities: Box<[f64]>,
    pub scores: ScoreVector,
    pub score: f64,
    pub abundance: f64,
    /// Set on alignment placeholders borrowed from neighboring groups
    /// rather than independently detected
    pub inferred: bool,
}

impl FeatureCluster {
    pub fn from_extents(
        representative_mass: f64,
        charge_range: (i32, i32),
        scan_range: (u32, u32),
        elution_range: (f64, f64),
    ) -> Self {
        let (min_charge, max_charge) = charge_range;
        let (min_scan, max_scan) = scan_range;
        let (min_elution_time, max_elution_time) = elution_range;
        Self {
            representative_mass,
            representative_charge: min_charge,
            representative_mz: mass_to_mz(representative_mass, min_charge.max(1)),
            representative_scan: min_scan,
            min_charge,
            max_charge,
            min_scan,
            max_scan,
            min_elution_time,
            max_elution_time,
            // empty until envelopes arrive or the caller assigns a span
            min_net: f64::INFINITY,
            max_net: f64::NEG_INFINITY,
            envelopes: Vec::new(),
            relative_intensities: Box::default(),
            scores: ScoreVector::default(),
            score: 0.0,
            abundance: 0.0,
            inferred: false,
        }
    }

    /// Fold an envelope in, widening the charge/scan/elution extents
    /// monotonically. Extents never shrink.
    pub fn expand(&mut self, envelope: ObservedEnvelope, run: &LcMsRun) {
        let scan_number = run.scan_number_of(envelope.scan_column);
        let time = run.elution_time_of(envelope.scan_column);
        let net = run.net_of(time);
        self.min_charge = self.min_charge.min(envelope.charge);
        self.max_charge = self.max_charge.max(envelope.charge);
        self.min_scan = self.min_scan.min(scan_number);
        self.max_scan = self.max_scan.max(scan_number);
        self.min_elution_time = self.min_elution_time.min(time);
        self.max_elution_time = self.max_elution_time.max(time);
        self.min_net = self.min_net.min(net);
        self.max_net = self.max_net.max(net);
        self.envelopes.push(envelope);
    }

    pub fn add_envelopes(
        &mut self,
        envelopes: impl IntoIterator<Item = ObservedEnvelope>,
        run: &LcMsRun,
    ) {
        for envelope in envelopes {
            self.expand(envelope, run);
        }
    }

    pub fn elution_length(&self) -> f64 {
        self.max_elution_time - self.min_elution_time
    }

    pub fn net_length(&self) -> f64 {
        (self.max_net - self.min_net).max(0.0)
    }

    /// Length of the shared elution-time interval with another cluster
    pub fn co_elution_length(&self, other: &FeatureCluster) -> f64 {
        let lo = self.min_elution_time.max(other.min_elution_time);
        let hi = self.max_elution_time.min(other.max_elution_time);
        (hi - lo).max(0.0)
    }

    /// Total abundance of the matched envelopes
    pub fn envelope_abundance(&self) -> f64 {
        self.envelopes.iter().map(|e| e.abundance).sum()
    }

    /// The best single-cell correlation observed in either parity bucket
    pub fn best_correlation(&self) -> f64 {
        self.scores.parities[0]
            .best_correlation
            .max(self.scores.parities[1].best_correlation)
    }

    /// Mass-scaled acceptance bar: larger isotope envelopes are noisier,
    /// so larger masses must correlate more strongly to be trusted.
    pub fn good_enough(&self) -> bool {
        self.best_correlation() >= correlation_acceptance_bar(self.representative_mass)
    }

    /// Peak ids sitting in high-ratio theoretical isotope slots
    pub fn major_peaks(&self) -> Vec<PeakId> {
        self.peaks_with(|ratio| ratio > MAJOR_ISOTOPE_RATIO)
    }

    /// Peak ids sitting in the remaining (low-ratio) slots
    pub fn minor_peaks(&self) -> Vec<PeakId> {
        let majors: HashSet<PeakId, BuildIdentityHasher<PeakId>> =
            self.major_peaks().into_iter().collect();
        self.peaks_with(|ratio| ratio <= MAJOR_ISOTOPE_RATIO)
            .into_iter()
            .filter(|id| !majors.contains(id))
            .collect()
    }

    fn peaks_with(&self, accept: impl Fn(f64) -> bool) -> Vec<PeakId> {
        let mut seen: HashSet<PeakId, BuildIdentityHasher<PeakId>> = HashSet::default();
        let mut out = Vec::new();
        for envelope in self.envelopes.iter() {
            for (slot, peak) in envelope.peaks.iter().enumerate() {
                let ratio = self.relative_intensities.get(slot).copied().unwrap_or(0.0);
                if let Some(id) = peak {
                    if accept(ratio) && seen.insert(*id) {
                        out.push(*id);
                    }
                }
            }
        }
        out
    }

    /// Recompute the per-parity derived statistics and the cross-charge XIC
    /// correlation.
    ///
    /// With `pvalue_check` set, an envelope only contributes when it is
    /// statistically distinguishable from its local m/z neighborhood; a
    /// parity bucket whose envelopes all fail the gate is backfilled from a
    /// second, ungated pass so legitimate low-evidence charges do not leave
    /// spuriously empty score fields.
    pub fn update_score(&mut self, ctx: &ScoringContext<'_>, pvalue_check: bool) {
        let nslots = ctx.envelope.len();
        if nslots == 0 || self.envelopes.is_empty() {
            self.scores = ScoreVector::default();
            return;
        }

        struct EnvelopeStats {
            parity: usize,
            charge: i32,
            column: usize,
            significant: bool,
            divergence: f64,
            correlation: f64,
            intensity_ratio: f64,
            abundance: f64,
            intensities: Vec<f32>,
        }

        let mut per_envelope = Vec::with_capacity(self.envelopes.len());
        for envelope in self.envelopes.iter_mut() {
            let intensities = envelope.intensities(ctx.run);
            let significant =
                !pvalue_check || envelope_is_significant(envelope, &intensities, ctx);
            envelope.good_enough = significant;
            per_envelope.push(EnvelopeStats {
                parity: ChargeParity::of(envelope.charge).index(),
                charge: envelope.charge,
                column: envelope.scan_column,
                significant,
                divergence: ctx.envelope.divergence(&intensities),
                correlation: ctx.envelope.correlation(&intensities),
                intensity_ratio: ctx.envelope.coverage(&intensities),
                abundance: intensities.iter().map(|&v| v as f64).sum(),
                intensities,
            });
        }

        // a parity with envelopes but no significant ones is backfilled
        // from the ungated pass
        let mut use_ungated = [false, false];
        for parity in 0..2 {
            let any = per_envelope.iter().any(|e| e.parity == parity);
            let any_significant = per_envelope
                .iter()
                .any(|e| e.parity == parity && e.significant);
            use_ungated[parity] = any && !any_significant;
        }

        let mut scores = ScoreVector::default();
        let mut summed = [vec![0.0f32; nslots], vec![0.0f32; nslots]];
        let mut parity_abundance = [0.0f64; 2];
        let mut counted = [0usize; 2];

        for stats in per_envelope.iter() {
            if !(stats.significant || use_ungated[stats.parity]) {
                continue;
            }
            let bucket = &mut scores.parities[stats.parity];
            bucket.best_divergence = bucket.best_divergence.min(stats.divergence);
            bucket.best_correlation = bucket.best_correlation.max(stats.correlation);
            bucket.best_intensity_ratio =
                bucket.best_intensity_ratio.max(stats.intensity_ratio);
            for (acc, &v) in summed[stats.parity].iter_mut().zip(stats.intensities.iter()) {
                *acc += v;
            }
            parity_abundance[stats.parity] += stats.abundance;
            counted[stats.parity] += 1;
        }

        for parity in 0..2 {
            if counted[parity] == 0 {
                continue;
            }
            let bucket = &mut scores.parities[parity];
            bucket.summed_divergence = ctx.envelope.divergence(&summed[parity]);
            bucket.summed_correlation = ctx.envelope.correlation(&summed[parity]);
            bucket.summed_intensity_ratio = ctx.envelope.coverage(&summed[parity]);
        }

        let total_abundance: f64 = parity_abundance.iter().sum();
        if total_abundance > 0.0 {
            for parity in 0..2 {
                scores.parities[parity].abundance_ratio =
                    parity_abundance[parity] / total_abundance;
            }
        }

        // cross-charge agreement: the smoothed chromatograms of the best
        // even and best odd charge should rise and fall together
        let best_charge = |parity: usize| -> Option<i32> {
            let mut totals: Vec<(i32, f64)> = Vec::new();
            for stats in per_envelope
                .iter()
                .filter(|e| e.parity == parity && (e.significant || use_ungated[parity]))
            {
                match totals.iter_mut().find(|(z, _)| *z == stats.charge) {
                    Some((_, total)) => *total += stats.abundance,
                    None => totals.push((stats.charge, stats.abundance)),
                }
            }
            totals
                .into_iter()
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(z, _)| z)
        };

        scores.xic_correlation = match (best_charge(0), best_charge(1)) {
            (Some(even), Some(odd)) => {
                let min_col = per_envelope.iter().map(|e| e.column).min().unwrap_or(0);
                let max_col = per_envelope.iter().map(|e| e.column).max().unwrap_or(0);
                let width = max_col - min_col + 1;
                let mut xic_even = vec![0.0f32; width];
                let mut xic_odd = vec![0.0f32; width];
                for stats in per_envelope.iter() {
                    let target = if stats.charge == even {
                        &mut xic_even
                    } else if stats.charge == odd {
                        &mut xic_odd
                    } else {
                        continue;
                    };
                    target[stats.column - min_col] += stats.abundance as f32;
                }
                let xic_even = stats::smooth_moving_average(&xic_even, 1);
                let xic_odd = stats::smooth_moving_average(&xic_odd, 1);
                stats::pearson(&xic_even, &xic_odd)
            }
            _ => 0.0,
        };

        self.scores = scores;
    }
}

/// The correlation a cluster must reach to be believed, by mass
fn correlation_acceptance_bar(mass: f64) -> f64 {
    if mass < 15_000.0 {
        0.70
    } else if mass < 25_000.0 {
        0.75
    } else if mass < 35_000.0 {
        0.80
    } else {
        0.85
    }
}

/// Rank-sum and Poisson tests of one envelope against its local m/z
/// neighborhood in the owning scan.
pub(crate) fn envelope_is_significant(
    envelope: &ObservedEnvelope,
    intensities: &[f32],
    ctx: &ScoringContext<'_>,
) -> bool {
    let nslots = envelope.peaks.len();
    let anchor = ctx
        .envelope
        .most_abundant
        .min(nslots.saturating_sub(1));
    let anchor_id = match envelope.peaks.get(anchor).copied().flatten() {
        Some(id) => id,
        None => return false,
    };
    let anchor_peak = ctx.run.peak(anchor_id);
    let charge = envelope.charge.max(1);
    let half_span = nslots as f64 * NEUTRON_SHIFT / charge as f64;
    let lo = anchor_peak.mz - half_span;
    let hi = anchor_peak.mz + half_span;

    let local = ctx
        .run
        .peaks_of(envelope.scan_column)
        .between(lo, hi, Tolerance::Da(0.001));

    let mut sample = Vec::with_capacity(nslots);
    let mut background = Vec::with_capacity(local.len());
    for peak in local.iter() {
        if !peak.is_active() {
            continue;
        }
        if envelope.peaks.iter().flatten().any(|&id| id == peak.id()) {
            sample.push(peak.intensity);
        } else {
            background.push(peak.intensity);
        }
    }

    let p_rank = stats::rank_sum_pvalue(&sample, &background);

    let slot_window = 2.0 * tolerance_width(ctx.tolerance, anchor_peak.mz);
    let window_width = hi - lo;
    let lambda = if window_width > 0.0 {
        local.len() as f64 * (nslots as f64 * slot_window / window_width)
    } else {
        0.0
    };
    let matched = intensities.iter().filter(|&&v| v > 0.0).count() as u64;
    let p_poisson = stats::poisson_pvalue(matched, lambda);

    p_rank < ctx.significance && p_poisson < ctx.significance
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::envelope::{AveragineModel, EnvelopeProvider};
    use crate::run::{LcMsRun, LcMsScan};
    use mzpeaks::CentroidPeak;

    fn cluster_with_correlation(mass: f64, correlation: f64) -> FeatureCluster {
        let mut cluster = FeatureCluster::from_extents(mass, (2, 3), (10, 20), (1.0, 2.0));
        cluster.scores.parities[0].best_correlation = correlation;
        cluster
    }

    #[test]
    fn test_good_enough_scales_with_mass() {
        assert!(cluster_with_correlation(5_000.0, 0.72).good_enough());
        assert!(!cluster_with_correlation(40_000.0, 0.72).good_enough());
        // monotone: once rejected at a lower mass, always rejected higher
        let masses = [1_000.0, 14_999.0, 20_000.0, 30_000.0, 40_000.0];
        let bars: Vec<f64> = masses.iter().map(|&m| correlation_acceptance_bar(m)).collect();
        assert!(bars.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_co_elution_length() {
        let a = FeatureCluster::from_extents(1000.0, (2, 2), (0, 10), (1.0, 3.0));
        let b = FeatureCluster::from_extents(1000.0, (2, 2), (0, 10), (2.0, 5.0));
        assert!((a.co_elution_length(&b) - 1.0).abs() < 1e-9);
        assert!((b.co_elution_length(&a) - 1.0).abs() < 1e-9);
        let c = FeatureCluster::from_extents(1000.0, (2, 2), (0, 10), (4.0, 5.0));
        assert_eq!(a.co_elution_length(&c), 0.0);
    }

    #[test]
    fn test_parity() {
        assert_eq!(ChargeParity::of(8), ChargeParity::Even);
        assert_eq!(ChargeParity::of(7), ChargeParity::Odd);
        assert_eq!(ChargeParity::of(-3), ChargeParity::Odd);
    }

    fn synthetic_run_with_envelopes(
        env: &TheoreticalEnvelope,
        charges: &[i32],
        columns: usize,
    ) -> LcMsRun {
        let apex = columns as f64 / 2.0;
        let scans = (0..columns).map(|col| {
            let scale = (-((col as f64 - apex) / 2.0).powi(2)).exp() as f32 * 1000.0 + 1.0;
            let mut peaks = Vec::new();
            for &z in charges {
                for (slot, &rel) in env.intensities.iter().enumerate() {
                    peaks.push(CentroidPeak::new(
                        env.isotope_mz(z, slot),
                        rel as f32 * scale,
                        0,
                    ));
                }
            }
            (LcMsScan::new(col as u32, col as f64 * 0.1, 1), peaks)
        });
        LcMsRun::new(scans)
    }

    fn collect_envelopes(
        run: &LcMsRun,
        env: &TheoreticalEnvelope,
        charges: &[i32],
    ) -> Vec<ObservedEnvelope> {
        let mut out = Vec::new();
        for col in 0..run.n_columns() {
            for &z in charges {
                let peaks: Vec<Option<PeakId>> = (0..env.len())
                    .map(|slot| {
                        let mz = env.isotope_mz(z, slot);
                        run.peaks_between(mz - 0.001, mz + 0.001)
                            .find(|&id| run.peak(id).scan_column as usize == col)
                    })
                    .collect();
                out.push(ObservedEnvelope::new(
                    env.monoisotopic_mass,
                    z,
                    col,
                    peaks,
                    run,
                ));
            }
        }
        out
    }

    #[test]
    fn test_update_score_two_parities() {
        let mut model = AveragineModel::peptide();
        let env = model.envelope_of(5000.0);
        let run = synthetic_run_with_envelopes(&env, &[7, 8], 11);
        let mut cluster = FeatureCluster::from_extents(5000.0, (7, 8), (0, 10), (0.0, 1.0));
        cluster.relative_intensities = env.intensities.clone();
        cluster.add_envelopes(collect_envelopes(&run, &env, &[7, 8]), &run);

        let ctx = ScoringContext {
            run: &run,
            envelope: &env,
            tolerance: Tolerance::PPM(10.0),
            significance: 0.01,
        };
        cluster.update_score(&ctx, true);

        for parity in 0..2 {
            let bucket = &cluster.scores.parities[parity];
            assert!(
                bucket.best_correlation > 0.99,
                "parity {parity} correlation {}",
                bucket.best_correlation
            );
            assert!(bucket.best_divergence < 0.01);
            assert!(bucket.summed_correlation > 0.99);
            assert!(bucket.abundance_ratio > 0.0);
        }
        // both charges trace the same gaussian elution profile
        assert!(
            cluster.scores.xic_correlation > 0.95,
            "xic correlation {}",
            cluster.scores.xic_correlation
        );
        assert!(cluster.good_enough());
    }

    #[test]
    fn test_update_score_empty_cluster_is_neutral() {
        let mut model = AveragineModel::peptide();
        let env = model.envelope_of(5000.0);
        let run = synthetic_run_with_envelopes(&env, &[8], 3);
        let mut cluster = FeatureCluster::from_extents(5000.0, (8, 8), (0, 2), (0.0, 0.2));
        let ctx = ScoringContext {
            run: &run,
            envelope: &env,
            tolerance: Tolerance::PPM(10.0),
            significance: 0.01,
        };
        cluster.update_score(&ctx, true);
        assert_eq!(cluster.scores, ScoreVector::default());
        assert!(!cluster.good_enough());
    }

    #[test]
    fn test_major_and_minor_peaks() {
        let mut model = AveragineModel::peptide();
        let env = model.envelope_of(5000.0);
        let run = synthetic_run_with_envelopes(&env, &[8], 3);
        let mut cluster = FeatureCluster::from_extents(5000.0, (8, 8), (0, 2), (0.0, 0.2));
        cluster.relative_intensities = env.intensities.clone();
        cluster.add_envelopes(collect_envelopes(&run, &env, &[8]), &run);

        let majors = cluster.major_peaks();
        let minors = cluster.minor_peaks();
        assert!(!majors.is_empty());
        let n_major_slots = env
            .intensities
            .iter()
            .filter(|&&r| r > MAJOR_ISOTOPE_RATIO)
            .count();
        assert_eq!(majors.len(), n_major_slots * run.n_columns());
        for id in majors.iter() {
            assert!(!minors.contains(id));
        }
    }

    #[test]
    fn test_expand_widens_monotonically() {
        let mut model = AveragineModel::peptide();
        let env = model.envelope_of(5000.0);
        let run = synthetic_run_with_envelopes(&env, &[8], 5);
        let mut cluster = FeatureCluster::from_extents(5000.0, (8, 8), (2, 2), (0.2, 0.2));
        let envelopes = collect_envelopes(&run, &env, &[8]);
        cluster.add_envelopes(envelopes, &run);
        assert_eq!(cluster.min_scan, 0);
        assert_eq!(cluster.max_scan, 4);
        assert!(cluster.min_elution_time <= 0.0 + 1e-9);
        assert!(cluster.max_elution_time >= 0.4 - 1e-9);
        assert!(cluster.min_net <= 0.0 + 1e-9);
        assert!((cluster.max_net - 1.0).abs() < 1e-9);
    }
}
