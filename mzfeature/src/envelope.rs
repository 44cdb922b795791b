/*! Theoretical isotope envelopes and the similarity measures used to
compare them against observed peak intensities. */
use std::collections::btree_map::{BTreeMap, Entry as BEntry};

use chemical_elements::isotopic_pattern::BafflingRecursiveIsotopicPatternGenerator;
use chemical_elements::{ChemicalComposition, ElementSpecification, PROTON as _PROTON};

use mzpeaks::Tolerance;
use num_traits::Float;

/// The mass of H+, a hydrogen atom minus an electron
pub const PROTON: f64 = _PROTON;

/// The mass difference between isotopes `C[13]` and `C[12]`. Not precisely
/// universal, but the majority of expected applications are carbon-based
pub const NEUTRON_SHIFT: f64 = 1.0033548378;

pub(crate) fn isclose<T: Float>(a: T, b: T, delta: T) -> bool {
    (a - b).abs() < delta
}

/// The absolute width of a tolerance window at a given m/z (or mass)
#[inline(always)]
pub fn tolerance_width(tolerance: Tolerance, at: f64) -> f64 {
    match tolerance {
        Tolerance::Da(d) => d,
        Tolerance::PPM(p) => at * p * 1e-6,
    }
}

/// Convert a neutral monoisotopic mass to the m/z of its `charge`-protonated form
#[inline(always)]
pub fn mass_to_mz(mass: f64, charge: i32) -> f64 {
    mass / charge as f64 + PROTON
}

/// Convert an observed m/z at a known charge back to a neutral mass
#[inline(always)]
pub fn mz_to_mass(mz: f64, charge: i32) -> f64 {
    (mz - PROTON) * charge as f64
}

/// The theoretical isotope envelope of one candidate monoisotopic mass:
/// per-isotope relative intensities (most abundant = 1), the isotope
/// indices ranked by descending abundance, and the similarity measures
/// against observed intensity vectors.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TheoreticalEnvelope {
    pub monoisotopic_mass: f64,
    pub intensities: Box<[f64]>,
    pub ranked: Box<[usize]>,
    pub most_abundant: usize,
}

impl TheoreticalEnvelope {
    /// Build an envelope from raw isotopologue intensities, normalizing so
    /// the most abundant isotope has relative intensity 1
    pub fn from_intensities(monoisotopic_mass: f64, intensities: Vec<f64>) -> Self {
        let max = intensities
            .iter()
            .copied()
            .fold(f64::MIN_POSITIVE, f64::max);
        let intensities: Box<[f64]> = intensities.iter().map(|i| i / max).collect();
        let mut ranked: Vec<usize> = (0..intensities.len()).collect();
        ranked.sort_by(|&a, &b| intensities[b].total_cmp(&intensities[a]));
        let most_abundant = ranked.first().copied().unwrap_or_default();
        Self {
            monoisotopic_mass,
            intensities,
            ranked: ranked.into_boxed_slice(),
            most_abundant,
        }
    }

    /// Re-target the envelope shape at a different monoisotopic mass
    pub fn at_mass(&self, monoisotopic_mass: f64) -> Self {
        let mut dup = self.clone();
        dup.monoisotopic_mass = monoisotopic_mass;
        dup
    }

    pub fn len(&self) -> usize {
        self.intensities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intensities.is_empty()
    }

    /// The m/z of isotope `slot` at `charge`
    #[inline(always)]
    pub fn isotope_mz(&self, charge: i32, slot: usize) -> f64 {
        (self.monoisotopic_mass + slot as f64 * NEUTRON_SHIFT) / charge as f64 + PROTON
    }

    /// The m/z range spanned by the whole envelope at `charge`
    pub fn mz_span(&self, charge: i32) -> (f64, f64) {
        (
            self.isotope_mz(charge, 0),
            self.isotope_mz(charge, self.len().saturating_sub(1)),
        )
    }

    /// The Bhattacharyya divergence between the theoretical envelope and an
    /// observed per-slot intensity vector.
    ///
    /// ```math
    /// D(o, t) = -\ln{\displaystyle\sum_i^n \sqrt{\hat{o}_i \hat{t}_i}}
    /// ```
    ///
    /// where both distributions are normalized to sum to 1. Identical
    /// distributions give 0; an empty observation gives infinity, the
    /// neutral "worst" value, never NaN.
    pub fn divergence(&self, observed: &[f32]) -> f64 {
        let total_o: f64 = observed.iter().map(|&o| o as f64).sum();
        if total_o <= 0.0 {
            return f64::INFINITY;
        }
        let total_t: f64 = self.intensities.iter().sum();
        let mut bc = 0.0f64;
        for (&o, &t) in observed.iter().zip(self.intensities.iter()) {
            bc += ((o as f64 / total_o) * (t / total_t)).sqrt();
        }
        if bc <= 0.0 {
            return f64::INFINITY;
        }
        (-bc.ln()).max(0.0)
    }

    /// The Pearson correlation between the theoretical envelope and an
    /// observed per-slot intensity vector. Degenerate inputs (fewer than
    /// two slots, zero variance) give 0, never NaN.
    pub fn correlation(&self, observed: &[f32]) -> f64 {
        let n = self.intensities.len().min(observed.len());
        if n < 2 {
            return 0.0;
        }
        let mean_o = observed[..n].iter().map(|&o| o as f64).sum::<f64>() / n as f64;
        let mean_t = self.intensities[..n].iter().sum::<f64>() / n as f64;
        let mut cov = 0.0;
        let mut var_o = 0.0;
        let mut var_t = 0.0;
        for (&o, &t) in observed[..n].iter().zip(self.intensities[..n].iter()) {
            let od = o as f64 - mean_o;
            let td = t - mean_t;
            cov += od * td;
            var_o += od * od;
            var_t += td * td;
        }
        let denom = (var_o * var_t).sqrt();
        if denom <= 0.0 {
            0.0
        } else {
            cov / denom
        }
    }

    /// The fraction of theoretical signal covered by the filled slots of an
    /// observed intensity vector, in `[0, 1]`
    pub fn coverage(&self, observed: &[f32]) -> f64 {
        let total: f64 = self.intensities.iter().sum();
        if total <= 0.0 {
            return 0.0;
        }
        let covered: f64 = self
            .intensities
            .iter()
            .zip(observed.iter())
            .filter(|(_, &o)| o > 0.0)
            .map(|(&t, _)| t)
            .sum();
        covered / total
    }
}

/// The capability to produce a theoretical envelope for a candidate
/// monoisotopic mass
pub trait EnvelopeProvider {
    fn envelope_of(&mut self, monoisotopic_mass: f64) -> TheoreticalEnvelope;
}

/// A model for converting a neutral mass into a theoretical isotopic
/// pattern based upon an "average monomer" and linear extension.
///
/// This is an implementation of Senko's Averagine [^1]
///
/// # References
/// [^1]: Senko M, Beu S, McLafferty F: Determination of Monoisotopic Masses and Ion
///       Populations for Large Biomolecules from Resolved Isotopic Distributions.
///       Journal of the American Society for Mass Spectrometry 1995, 6:229-233
///       <https://doi.org/10.1016/1044-0305(95)00017-8>
#[derive(Debug, Clone)]
pub struct AveragineModel<'lifespan> {
    base_composition: Vec<(ElementSpecification<'lifespan>, f64)>,
    base_mass: f64,
    hydrogen: ElementSpecification<'lifespan>,
    generator: BafflingRecursiveIsotopicPatternGenerator<'lifespan>,
    /// The cumulative abundance percentage of isotopic signal to retain
    pub truncate_after: f64,
    /// The minimum abundance percentage of isotopic signal a peak must
    /// have to be kept
    pub ignore_below: f64,
}

impl<'lifespan: 'transient, 'transient> AveragineModel<'lifespan> {
    pub fn new(base_composition: Vec<(ElementSpecification<'lifespan>, f64)>) -> Self {
        let base_mass = base_composition
            .iter()
            .map(|(e, c)| e.element.most_abundant_mass * *c)
            .sum();
        Self {
            base_composition,
            base_mass,
            hydrogen: ElementSpecification::parse("H").unwrap(),
            generator: BafflingRecursiveIsotopicPatternGenerator::new(),
            truncate_after: 0.999,
            ignore_below: 0.005,
        }
    }

    /// The peptide averagine monomer
    pub fn peptide() -> Self {
        let composition = [
            ("H", 7.7583f64),
            ("C", 4.9384),
            ("S", 0.0417),
            ("O", 1.4773),
            ("N", 1.3577),
        ];
        Self::new(
            composition
                .into_iter()
                .map(|(e, c)| {
                    (
                        e.parse()
                            .expect("Failed to parse element specification"),
                        c,
                    )
                })
                .collect(),
        )
    }

    fn scale_to(&self, neutral: f64) -> ChemicalComposition<'transient> {
        let scale = neutral / self.base_mass;
        let mut scaled = ChemicalComposition::new();
        for (elt, count) in self.base_composition.iter() {
            scaled.set(*elt, (*count * scale).round() as i32);
        }
        let scaled_mass = scaled.mass();
        let delta = (scaled_mass - neutral).round() as i32;
        let hydrogens = scaled[&self.hydrogen];
        if hydrogens > delta {
            scaled[&self.hydrogen] -= delta;
        } else {
            scaled[&self.hydrogen] = 0;
        }
        scaled
    }
}

impl EnvelopeProvider for AveragineModel<'_> {
    fn envelope_of(&mut self, monoisotopic_mass: f64) -> TheoreticalEnvelope {
        let composition = self.scale_to(monoisotopic_mass);
        let peaks = self.generator.isotopic_variants(composition, 0, 1, PROTON);
        let tid = chemical_elements::isotopic_pattern::TheoreticalIsotopicPattern::from(peaks)
            .truncate_after(self.truncate_after)
            .ignore_below(self.ignore_below);
        let intensities: Vec<f64> = tid.peaks.iter().map(|p| p.intensity).collect();
        TheoreticalEnvelope::from_intensities(monoisotopic_mass, intensities)
    }
}

/// An [`AveragineModel`] with a cache over envelopes keyed by truncated
/// mass: nearby masses share one isotopologue distribution, re-targeted
/// at the exact query mass.
#[derive(Debug, Clone)]
pub struct CachingAveragineProvider<'lifespan> {
    inner: AveragineModel<'lifespan>,
    cache: BTreeMap<i64, TheoreticalEnvelope>,
    cache_step: f64,
}

impl<'lifespan> CachingAveragineProvider<'lifespan> {
    pub fn new(inner: AveragineModel<'lifespan>, cache_step: f64) -> Self {
        Self {
            inner,
            cache: BTreeMap::new(),
            cache_step,
        }
    }

    pub fn peptide() -> Self {
        Self::new(AveragineModel::peptide(), 1.0)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn key_of(&self, mass: f64) -> i64 {
        (mass / self.cache_step).round() as i64
    }
}

impl EnvelopeProvider for CachingAveragineProvider<'_> {
    fn envelope_of(&mut self, monoisotopic_mass: f64) -> TheoreticalEnvelope {
        let key = self.key_of(monoisotopic_mass);
        match self.cache.entry(key) {
            BEntry::Occupied(ent) => ent.get().at_mass(monoisotopic_mass),
            BEntry::Vacant(ent) => {
                let env = self
                    .inner
                    .envelope_of(key as f64 * self.cache_step);
                ent.insert(env).at_mass(monoisotopic_mass)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn observed_from(env: &TheoreticalEnvelope, scale: f32) -> Vec<f32> {
        env.intensities.iter().map(|&t| t as f32 * scale).collect()
    }

    #[test]
    fn test_peptide_envelope() {
        let mut model = AveragineModel::peptide();
        let env = model.envelope_of(5000.0);
        assert!(env.len() > 3);
        assert!((env.intensities[env.most_abundant] - 1.0).abs() < 1e-9);
        assert_eq!(env.ranked[0], env.most_abundant);
        // for a 5 kDa peptide the monoisotopic peak is no longer the apex
        assert!(env.most_abundant > 0);

        let mz = env.isotope_mz(8, 0);
        assert!(isclose(mz, 5000.0 / 8.0 + PROTON, 1e-9));
        let (lo, hi) = env.mz_span(8);
        assert!(hi > lo);
    }

    #[test]
    fn test_divergence_identity() {
        let mut model = AveragineModel::peptide();
        let env = model.envelope_of(2400.0);
        let obs = observed_from(&env, 250.0);
        let d = env.divergence(&obs);
        assert!(d < 1e-6, "identical distributions should diverge by ~0, got {d}");
        let r = env.correlation(&obs);
        assert!(r > 0.999, "identical distributions should correlate at ~1, got {r}");
    }

    #[test]
    fn test_divergence_bounds() {
        let mut model = AveragineModel::peptide();
        let env = model.envelope_of(2400.0);
        let mut obs = observed_from(&env, 100.0);
        obs.reverse();
        let d = env.divergence(&obs);
        assert!(d >= 0.0);
        assert!(d.is_finite());
        let r = env.correlation(&obs);
        assert!((-1.0..=1.0).contains(&r));
    }

    #[test]
    fn test_degenerate_inputs() {
        let env = TheoreticalEnvelope::from_intensities(1000.0, vec![1.0, 0.6, 0.2]);
        assert_eq!(env.divergence(&[0.0, 0.0, 0.0]), f64::INFINITY);
        assert_eq!(env.correlation(&[]), 0.0);
        assert_eq!(env.correlation(&[0.0, 0.0, 0.0]), 0.0);
        assert_eq!(env.coverage(&[0.0, 0.0, 0.0]), 0.0);
        assert!((env.coverage(&[1.0, 0.6, 0.2]) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_caching_provider() {
        let mut provider = CachingAveragineProvider::peptide();
        let a = provider.envelope_of(5000.0);
        let b = provider.envelope_of(5000.2);
        assert_eq!(provider.len(), 1);
        assert_eq!(a.intensities, b.intensities);
        assert!(isclose(b.monoisotopic_mass, 5000.2, 1e-9));
    }

    #[test]
    fn test_coverage_partial() {
        let env = TheoreticalEnvelope::from_intensities(1000.0, vec![1.0, 1.0]);
        let c = env.coverage(&[5.0, 0.0]);
        assert!(isclose(c, 0.5, 1e-9));
    }
}
