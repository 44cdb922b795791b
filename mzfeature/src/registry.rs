//! The accepted-feature set and its peak-sharing conflict resolution.
//!
//! Accepted clusters tag their major and minor peaks with index-based
//! back-references (peak id → feature ids), which makes many-to-many
//! overlap discovery cheap without pointer cycles. Overlap groups are
//! resolved best-first: the winner keeps its evidence, everyone who
//! shared it is rescored against what remains.

use std::collections::{HashMap, HashSet};

use identity_hash::BuildIdentityHasher;
use tracing::{debug, trace};

use crate::cluster::FeatureCluster;
use crate::envelope::NEUTRON_SHIFT;
use crate::graph::connected_components;
use crate::run::{LcMsRun, PeakId};

pub type FeatureId = u32;

type PeakIdSet = HashSet<PeakId, BuildIdentityHasher<PeakId>>;
type OwnerMap = HashMap<PeakId, Vec<FeatureId>, BuildIdentityHasher<PeakId>>;

/// Masses closer than this are considered the same species when their
/// elution heavily overlaps
const DUPLICATE_MASS_WINDOW: f64 = 1e-4;

/// Fraction of either cluster's elution span that must overlap for the
/// near-duplicate rejection to fire
const DUPLICATE_ELUTION_FRACTION: f64 = 0.8;

/// How close a loser's score must be to the winner's for the pair to be
/// kept as an isotope-shift artifact instead of discarded
const ISOTOPE_SHIFT_SCORE_FRACTION: f64 = 0.7;

const ISOTOPE_SHIFT_MASS_WINDOW: f64 = 0.02;

/// The accepted-feature registry and overlap resolver
#[derive(Debug, Default)]
pub struct FeatureRegistry {
    features: Vec<FeatureCluster>,
    major_owners: OwnerMap,
    minor_owners: OwnerMap,
    /// Pairs accepted together as isotope-shift artifacts of one species
    isotope_shift_pairs: Vec<(FeatureId, FeatureId)>,
    pub score_threshold: f64,
}

impl FeatureRegistry {
    pub fn new(score_threshold: f64) -> Self {
        Self {
            score_threshold,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn get(&self, id: FeatureId) -> Option<&FeatureCluster> {
        self.features.get(id as usize)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FeatureCluster> {
        self.features.iter()
    }

    pub fn into_features(self) -> Vec<FeatureCluster> {
        self.features
    }

    pub fn isotope_shift_pairs(&self) -> &[(FeatureId, FeatureId)] {
        &self.isotope_shift_pairs
    }

    /// Accept a cluster into the registry, or reject it for a weak score,
    /// a failed correlation bar, or near-duplication of an existing
    /// accepted cluster. Returns the assigned id on acceptance.
    pub fn add(&mut self, cluster: FeatureCluster) -> Option<FeatureId> {
        if cluster.score < self.score_threshold {
            trace!(
                "rejecting {:0.4} Da: score {:0.3} below threshold",
                cluster.representative_mass,
                cluster.score
            );
            return None;
        }
        if !cluster.good_enough() {
            trace!(
                "rejecting {:0.4} Da: correlation below the mass-scaled bar",
                cluster.representative_mass
            );
            return None;
        }
        if self.is_near_duplicate(&cluster) {
            trace!(
                "rejecting {:0.4} Da: near-duplicate of an accepted cluster",
                cluster.representative_mass
            );
            return None;
        }

        let id = self.features.len() as FeatureId;
        for peak in cluster.major_peaks() {
            self.major_owners.entry(peak).or_default().push(id);
        }
        for peak in cluster.minor_peaks() {
            self.minor_owners.entry(peak).or_default().push(id);
        }
        self.features.push(cluster);
        Some(id)
    }

    fn is_near_duplicate(&self, cluster: &FeatureCluster) -> bool {
        self.features.iter().any(|existing| {
            if (existing.representative_mass - cluster.representative_mass).abs()
                >= DUPLICATE_MASS_WINDOW
            {
                return false;
            }
            let overlap = existing.co_elution_length(cluster);
            overlap >= DUPLICATE_ELUTION_FRACTION * existing.elution_length()
                || overlap >= DUPLICATE_ELUTION_FRACTION * cluster.elution_length()
        })
    }

    /// The set of other registered clusters sharing at least one major
    /// peak with `id`, or sharing one of `id`'s minor peaks that is major
    /// for the other cluster
    pub fn overlapped_features(&self, id: FeatureId) -> Vec<FeatureId> {
        let Some(cluster) = self.get(id) else {
            return Vec::new();
        };
        let mut out: HashSet<FeatureId, BuildIdentityHasher<FeatureId>> = HashSet::default();
        for peak in cluster.major_peaks() {
            if let Some(owners) = self.major_owners.get(&peak) {
                out.extend(owners.iter().copied());
            }
        }
        for peak in cluster.minor_peaks() {
            if let Some(owners) = self.major_owners.get(&peak) {
                out.extend(owners.iter().copied());
            }
        }
        out.remove(&id);
        let mut out: Vec<FeatureId> = out.into_iter().collect();
        out.sort_unstable();
        out
    }

    /// Resolve peak-sharing conflicts. Within each connected component of
    /// the overlap relation, repeatedly accept the highest-scoring
    /// remaining cluster, deactivate its major peaks, rescore everything
    /// that shared evidence with it, and drop whatever no longer clears
    /// the score threshold. Clusters 1-2 Da from a winner with similarly
    /// strong scores are kept alongside it as isotope-shift artifacts.
    pub fn resolve_overlaps<F>(&mut self, run: &LcMsRun, mut rescore: F)
    where
        F: FnMut(&mut FeatureCluster) -> f64,
    {
        let n = self.features.len();
        if n == 0 {
            return;
        }

        let majors: Vec<PeakIdSet> = self
            .features
            .iter()
            .map(|f| f.major_peaks().into_iter().collect())
            .collect();
        let minors: Vec<PeakIdSet> = self
            .features
            .iter()
            .map(|f| f.minor_peaks().into_iter().collect())
            .collect();

        let indices: Vec<usize> = (0..n).collect();
        let share = |&a: &usize, &b: &usize| -> bool {
            !majors[a].is_disjoint(&majors[b]) || !minors[a].is_disjoint(&majors[b])
        };
        let components = connected_components(&indices, share);
        debug!(
            "resolving {} clusters in {} overlap groups",
            n,
            components.len()
        );

        let mut keep = vec![false; n];
        let mut shift_pairs = Vec::new();
        for component in components {
            let mut pool: Vec<usize> = component;
            while !pool.is_empty() {
                let winner = pool
                    .iter()
                    .copied()
                    .max_by(|&a, &b| self.features[a].score.total_cmp(&self.features[b].score))
                    .unwrap();
                pool.retain(|&i| i != winner);
                keep[winner] = true;

                // isotope-shift artifacts of the winner survive alongside it
                let mut accepted = vec![winner];
                let winner_mass = self.features[winner].representative_mass;
                let winner_score = self.features[winner].score;
                let partners: Vec<usize> = pool
                    .iter()
                    .copied()
                    .filter(|&i| {
                        let delta =
                            (self.features[i].representative_mass - winner_mass).abs();
                        let shifted = (1..=2).any(|k| {
                            (delta - k as f64 * NEUTRON_SHIFT).abs() < ISOTOPE_SHIFT_MASS_WINDOW
                        });
                        shifted
                            && self.features[i].score
                                >= winner_score * ISOTOPE_SHIFT_SCORE_FRACTION
                    })
                    .collect();
                for partner in partners {
                    pool.retain(|&i| i != partner);
                    keep[partner] = true;
                    shift_pairs.push((winner as FeatureId, partner as FeatureId));
                    accepted.push(partner);
                }

                let mut touched: PeakIdSet = HashSet::default();
                for &i in accepted.iter() {
                    for &peak in majors[i].iter() {
                        run.deactivate_peak(peak);
                        touched.insert(peak);
                    }
                }

                // everyone who shared the deactivated evidence is rescored
                pool.retain(|&i| {
                    let shared = !majors[i].is_disjoint(&touched)
                        || !minors[i].is_disjoint(&touched);
                    if !shared {
                        return true;
                    }
                    let cluster = &mut self.features[i];
                    let score = rescore(cluster);
                    cluster.score = score;
                    if score >= self.score_threshold {
                        true
                    } else {
                        trace!(
                            "dropping {:0.4} Da after losing shared evidence (score {score:0.3})",
                            cluster.representative_mass
                        );
                        false
                    }
                });
            }
        }

        // compact the registry to the survivors, remapping ids
        let mut id_map: HashMap<FeatureId, FeatureId> = HashMap::new();
        let mut survivors = Vec::new();
        for (i, cluster) in std::mem::take(&mut self.features).into_iter().enumerate() {
            if keep[i] {
                id_map.insert(i as FeatureId, survivors.len() as FeatureId);
                survivors.push(cluster);
            }
        }
        self.features = survivors;
        self.isotope_shift_pairs = shift_pairs
            .into_iter()
            .filter_map(|(a, b)| Some((*id_map.get(&a)?, *id_map.get(&b)?)))
            .collect();
        self.rebuild_owner_maps();
        debug!("{} clusters survive overlap resolution", self.features.len());
    }

    fn rebuild_owner_maps(&mut self) {
        self.major_owners.clear();
        self.minor_owners.clear();
        for (i, cluster) in self.features.iter().enumerate() {
            for peak in cluster.major_peaks() {
                self.major_owners.entry(peak).or_default().push(i as FeatureId);
            }
            for peak in cluster.minor_peaks() {
                self.minor_owners.entry(peak).or_default().push(i as FeatureId);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::run::{LcMsRun, LcMsScan};
    use mzpeaks::CentroidPeak;

    /// A run with one scan of evenly spaced peaks, so synthetic clusters
    /// can reference real peak ids
    fn backing_run(n_peaks: usize) -> LcMsRun {
        let peaks: Vec<CentroidPeak> = (0..n_peaks)
            .map(|i| CentroidPeak::new(500.0 + i as f64, 100.0, 0))
            .collect();
        LcMsRun::new(vec![(LcMsScan::new(0, 0.0, 1), peaks)])
    }

    fn cluster_with_peaks(
        run: &LcMsRun,
        mass: f64,
        score: f64,
        elution: (f64, f64),
        peak_ids: &[PeakId],
    ) -> FeatureCluster {
        let mut cluster = FeatureCluster::from_extents(mass, (2, 3), (0, 10), elution);
        // one envelope holding the given peaks, all in major slots
        cluster.relative_intensities = vec![1.0; peak_ids.len()].into_boxed_slice();
        let envelope = crate::cluster::ObservedEnvelope::new(
            mass,
            2,
            0,
            peak_ids.iter().map(|&id| Some(id)).collect(),
            run,
        );
        cluster.envelopes.push(envelope);
        cluster.score = score;
        cluster.scores.parities[0].best_correlation = 0.95;
        cluster
    }

    #[test]
    fn test_add_rejects_weak_scores() {
        let run = backing_run(4);
        let mut registry = FeatureRegistry::new(0.5);
        let cluster = cluster_with_peaks(&run, 1000.0, 0.1, (1.0, 2.0), &[0, 1]);
        assert!(registry.add(cluster).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_add_rejects_failed_correlation_bar() {
        let run = backing_run(4);
        let mut registry = FeatureRegistry::new(0.0);
        let mut cluster = cluster_with_peaks(&run, 40_000.0, 1.0, (1.0, 2.0), &[0, 1]);
        cluster.scores.parities[0].best_correlation = 0.72;
        assert!(registry.add(cluster).is_none());
    }

    #[test]
    fn test_add_rejects_near_duplicates() {
        let run = backing_run(8);
        let mut registry = FeatureRegistry::new(0.0);
        let a = cluster_with_peaks(&run, 1000.0, 1.0, (1.0, 2.0), &[0, 1]);
        assert!(registry.add(a).is_some());
        // same mass to within 5e-5 Da, 100% elution overlap
        let b = cluster_with_peaks(&run, 1000.00005, 1.0, (1.0, 2.0), &[2, 3]);
        assert!(registry.add(b).is_none());
        // same mass but disjoint elution survives
        let c = cluster_with_peaks(&run, 1000.00005, 1.0, (5.0, 6.0), &[4, 5]);
        assert!(registry.add(c).is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_overlapped_features() {
        let run = backing_run(8);
        let mut registry = FeatureRegistry::new(0.0);
        let a = registry
            .add(cluster_with_peaks(&run, 1000.0, 1.0, (1.0, 2.0), &[0, 1]))
            .unwrap();
        let b = registry
            .add(cluster_with_peaks(&run, 1500.0, 1.0, (1.0, 2.0), &[1, 2]))
            .unwrap();
        let c = registry
            .add(cluster_with_peaks(&run, 2000.0, 1.0, (1.0, 2.0), &[5, 6]))
            .unwrap();
        assert_eq!(registry.overlapped_features(a), vec![b]);
        assert_eq!(registry.overlapped_features(b), vec![a]);
        assert!(registry.overlapped_features(c).is_empty());
    }

    #[test]
    fn test_resolution_keeps_single_survivor() {
        // two clusters 1e-4 Da apart, 90% elution overlap, near-identical
        // scores, sharing all their major peaks: exactly one survives
        let run = backing_run(4);
        let mut registry = FeatureRegistry::new(0.5);
        let a = cluster_with_peaks(&run, 8000.0, 1.00, (1.0, 2.0), &[0, 1, 2]);
        let b = cluster_with_peaks(&run, 8000.0001, 0.99, (1.1, 2.1), &[0, 1, 2]);
        assert!(registry.add(a).is_some());
        assert!(registry.add(b).is_some());
        assert_eq!(registry.len(), 2);

        registry.resolve_overlaps(&run, |cluster| {
            // losing a major peak drops the cluster below threshold
            let active = cluster
                .envelopes
                .iter()
                .flat_map(|e| e.peaks.iter().flatten())
                .filter(|&&id| run.peak(id).is_active())
                .count();
            if active == 0 {
                0.0
            } else {
                cluster.score
            }
        });
        assert_eq!(registry.len(), 1, "exactly one of the pair survives");
        assert!((registry.get(0).unwrap().representative_mass - 8000.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_two_survivors_share_active_major_peaks() {
        let run = backing_run(10);
        let mut registry = FeatureRegistry::new(0.1);
        registry
            .add(cluster_with_peaks(&run, 1000.0, 3.0, (1.0, 2.0), &[0, 1]))
            .unwrap();
        registry
            .add(cluster_with_peaks(&run, 1250.0, 2.0, (1.0, 2.0), &[1, 2]))
            .unwrap();
        registry
            .add(cluster_with_peaks(&run, 1700.0, 1.0, (1.0, 2.0), &[2, 3]))
            .unwrap();
        registry.resolve_overlaps(&run, |cluster| cluster.score);

        let shift_pairs = registry.isotope_shift_pairs().to_vec();
        for i in 0..registry.len() as FeatureId {
            for j in (i + 1)..registry.len() as FeatureId {
                if shift_pairs.contains(&(i, j)) || shift_pairs.contains(&(j, i)) {
                    continue;
                }
                let majors_i: PeakIdSet = registry
                    .get(i)
                    .unwrap()
                    .major_peaks()
                    .into_iter()
                    .filter(|&id| run.peak(id).is_active())
                    .collect();
                let majors_j: PeakIdSet = registry
                    .get(j)
                    .unwrap()
                    .major_peaks()
                    .into_iter()
                    .filter(|&id| run.peak(id).is_active())
                    .collect();
                assert!(
                    majors_i.is_disjoint(&majors_j),
                    "clusters {i} and {j} share an active major peak"
                );
            }
        }
    }

    #[test]
    fn test_isotope_shift_pair_survives() {
        let run = backing_run(6);
        let mut registry = FeatureRegistry::new(0.1);
        let a = cluster_with_peaks(&run, 8000.0, 1.0, (1.0, 2.0), &[0, 1]);
        // one neutron shift away, strong score, sharing a major peak
        let b = cluster_with_peaks(&run, 8000.0 + NEUTRON_SHIFT, 0.9, (1.0, 2.0), &[1, 2]);
        assert!(registry.add(a).is_some());
        assert!(registry.add(b).is_some());
        registry.resolve_overlaps(&run, |_| 0.0);
        assert_eq!(
            registry.len(),
            2,
            "the isotope-shift partner must be kept alongside the winner"
        );
        assert_eq!(registry.isotope_shift_pairs().len(), 1);
    }
}
