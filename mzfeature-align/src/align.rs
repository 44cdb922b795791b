//! Cross-run feature alignment: group features detected independently in
//! each run into sets hypothesized to trace the same species, fill gaps
//! from neighboring groups, and re-quantify every run against its own
//! matrix.

use tracing::{debug, trace};

use mzfeature::cluster::FeatureCluster;
use mzfeature::envelope::{EnvelopeProvider, NEUTRON_SHIFT};
use mzfeature::graph::connected_components;
use mzfeature::matrix::FeatureMatrix;

#[derive(Debug, Clone)]
pub struct AlignmentParams {
    /// Mass agreement tolerance between runs
    pub mass_tolerance_ppm: f64,
    /// Also accept a 1-2 Da isotope shift for large masses
    pub allow_isotope_shift: bool,
    /// Masses below this never use the isotope-shift allowance
    pub isotope_shift_min_mass: f64,
    /// Tolerance applied to the normalized elution-time overlap test
    pub net_tolerance: f64,
    /// Maximum relative disparity of the two normalized elution lengths
    pub max_length_disparity: f64,
    /// Gap filling stops scanning neighbor groups past this mass distance
    pub gap_mass_cutoff: f64,
}

impl Default for AlignmentParams {
    fn default() -> Self {
        Self {
            mass_tolerance_ppm: 10.0,
            allow_isotope_shift: true,
            isotope_shift_min_mass: 10_000.0,
            net_tolerance: 0.01,
            max_length_disparity: 0.5,
            gap_mass_cutoff: 2.5,
        }
    }
}

/// A feature with its originating run id
#[derive(Debug, Clone)]
pub struct RunFeature {
    pub run_id: usize,
    pub cluster: FeatureCluster,
}

/// One slot of an alignment group
#[derive(Debug, Clone)]
pub struct AlignedFeature {
    pub cluster: FeatureCluster,
    /// Borrowed from a neighbor group or re-quantified denovo rather than
    /// independently detected
    pub inferred: bool,
}

/// One cross-run species hypothesis: a slot per run id, null where the
/// run contributed nothing
#[derive(Debug, Clone)]
pub struct AlignmentGroup {
    pub representative_mass: f64,
    pub representative_run: usize,
    pub slots: Vec<Option<AlignedFeature>>,
}

impl AlignmentGroup {
    pub fn n_filled(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(|s| s.is_some())
    }

    pub fn representative(&self) -> Option<&FeatureCluster> {
        self.slots[self.representative_run]
            .as_ref()
            .map(|f| &f.cluster)
    }
}

/// Aligns per-run feature lists into cross-run groups
#[derive(Debug)]
pub struct FeatureAligner {
    n_runs: usize,
    params: AlignmentParams,
    features: Vec<RunFeature>,
    groups: Vec<AlignmentGroup>,
}

impl FeatureAligner {
    pub fn new(n_runs: usize, params: AlignmentParams) -> Self {
        Self {
            n_runs,
            params,
            features: Vec::new(),
            groups: Vec::new(),
        }
    }

    pub fn n_runs(&self) -> usize {
        self.n_runs
    }

    pub fn groups(&self) -> &[AlignmentGroup] {
        &self.groups
    }

    pub fn add_features(&mut self, run_id: usize, clusters: impl IntoIterator<Item = FeatureCluster>) {
        debug_assert!(run_id < self.n_runs);
        self.features.extend(
            clusters
                .into_iter()
                .map(|cluster| RunFeature { run_id, cluster }),
        );
    }

    /// The pairwise alignable test. Never true for two features of the
    /// same run, and symmetric in its arguments.
    pub fn alignable(
        &self,
        run_a: usize,
        a: &FeatureCluster,
        run_b: usize,
        b: &FeatureCluster,
    ) -> bool {
        if run_a == run_b {
            return false;
        }

        let mass_a = a.representative_mass;
        let mass_b = b.representative_mass;
        let window = mass_a.max(mass_b) * self.params.mass_tolerance_ppm * 1e-6;
        let delta = (mass_a - mass_b).abs();
        let mass_ok = delta <= window
            || (self.params.allow_isotope_shift
                && mass_a >= self.params.isotope_shift_min_mass
                && mass_b >= self.params.isotope_shift_min_mass
                && (1..=2).any(|k| (delta - k as f64 * NEUTRON_SHIFT).abs() <= window));
        if !mass_ok {
            return false;
        }

        let len_a = a.net_length();
        let len_b = b.net_length();
        let longest = len_a.max(len_b);
        if longest > 0.0 && (len_a - len_b).abs() / longest > self.params.max_length_disparity {
            return false;
        }

        // endpoint-in-interval overlap conditions, kept as four separate
        // single-endpoint checks
        let tol = self.params.net_tolerance;
        (a.min_net >= b.min_net - tol && a.min_net <= b.max_net + tol)
            || (a.max_net >= b.min_net - tol && a.max_net <= b.max_net + tol)
            || (b.min_net >= a.min_net - tol && b.min_net <= a.max_net + tol)
            || (b.max_net >= a.min_net - tol && b.max_net <= a.max_net + tol)
    }

    /// Group all added features into alignment groups: connected
    /// components of the alignable relation, then within each component
    /// seeded groups grown one run at a time by elution proximity.
    pub fn align(&mut self) -> &[AlignmentGroup] {
        let features = std::mem::take(&mut self.features);
        let components = connected_components(&features, |a, b| {
            self.alignable(a.run_id, &a.cluster, b.run_id, &b.cluster)
        });
        debug!(
            "aligning {} features from {} runs in {} components",
            features.len(),
            self.n_runs,
            components.len()
        );

        let mut groups = Vec::new();
        for component in components {
            let mut pool = component;
            while !pool.is_empty() {
                let seed = self.pick_seed(&features, &pool);
                let seed_feature = &features[seed];
                let mut member_runs = vec![false; self.n_runs];
                member_runs[seed_feature.run_id] = true;
                let mut members = vec![seed];
                pool.retain(|&i| i != seed);

                loop {
                    let candidate = pool
                        .iter()
                        .copied()
                        .filter(|&i| !member_runs[features[i].run_id])
                        .filter(|&i| {
                            members.iter().any(|&m| {
                                self.alignable(
                                    features[m].run_id,
                                    &features[m].cluster,
                                    features[i].run_id,
                                    &features[i].cluster,
                                )
                            })
                        })
                        .min_by(|&x, &y| {
                            let dx = group_distance(&features, &members, x);
                            let dy = group_distance(&features, &members, y);
                            dx.total_cmp(&dy)
                        });
                    let Some(next) = candidate else {
                        break;
                    };
                    member_runs[features[next].run_id] = true;
                    members.push(next);
                    pool.retain(|&i| i != next);
                }

                let mut slots: Vec<Option<AlignedFeature>> = vec![None; self.n_runs];
                for &m in members.iter() {
                    slots[features[m].run_id] = Some(AlignedFeature {
                        cluster: features[m].cluster.clone(),
                        inferred: false,
                    });
                }
                groups.push(AlignmentGroup {
                    representative_mass: features[seed].cluster.representative_mass,
                    representative_run: features[seed].run_id,
                    slots,
                });
            }
        }

        groups.sort_by(|a, b| a.representative_mass.total_cmp(&b.representative_mass));
        debug!("{} alignment groups", groups.len());
        self.groups = groups;
        &self.groups
    }

    /// The seed minimizes the summed elution distance to its nearest
    /// alignable neighbor in every other run
    fn pick_seed(&self, features: &[RunFeature], pool: &[usize]) -> usize {
        pool.iter()
            .copied()
            .min_by(|&x, &y| {
                let dx = self.seed_cost(features, pool, x);
                let dy = self.seed_cost(features, pool, y);
                dx.total_cmp(&dy)
            })
            .unwrap()
    }

    fn seed_cost(&self, features: &[RunFeature], pool: &[usize], candidate: usize) -> f64 {
        let this = &features[candidate];
        let mut cost = 0.0;
        for run in 0..self.n_runs {
            if run == this.run_id {
                continue;
            }
            let nearest = pool
                .iter()
                .copied()
                .filter(|&i| features[i].run_id == run)
                .filter(|&i| {
                    self.alignable(
                        this.run_id,
                        &this.cluster,
                        features[i].run_id,
                        &features[i].cluster,
                    )
                })
                .map(|i| (elution_center(&features[i].cluster) - elution_center(&this.cluster)).abs())
                .min_by(f64::total_cmp);
            if let Some(distance) = nearest {
                cost += distance;
            }
        }
        cost
    }

    /// For groups missing a run, scan neighboring groups by ascending
    /// index distance (bounded by the mass cutoff) for an alignable
    /// feature of that run, and borrow its charge/scan/abundance with the
    /// group's own representative mass substituted.
    pub fn fill_gaps(&mut self) {
        let n_groups = self.groups.len();
        let mut fills: Vec<(usize, usize, AlignedFeature)> = Vec::new();
        for gi in 0..n_groups {
            let group = &self.groups[gi];
            let Some(representative) = group.representative() else {
                continue;
            };
            for run in 0..self.n_runs {
                if group.slots[run].is_some() {
                    continue;
                }
                'search: for distance in 1..n_groups {
                    let mut any_in_range = false;
                    for nj in [gi.checked_sub(distance), gi.checked_add(distance)] {
                        let Some(nj) = nj else { continue };
                        if nj >= n_groups {
                            continue;
                        }
                        let neighbor = &self.groups[nj];
                        if (neighbor.representative_mass - group.representative_mass).abs()
                            > self.params.gap_mass_cutoff
                        {
                            continue;
                        }
                        any_in_range = true;
                        let Some(candidate) = neighbor.slots[run].as_ref() else {
                            continue;
                        };
                        if candidate.inferred {
                            continue;
                        }
                        if !self.alignable(
                            group.representative_run,
                            representative,
                            run,
                            &candidate.cluster,
                        ) {
                            continue;
                        }
                        let mut borrowed = candidate.cluster.clone();
                        borrowed.representative_mass = group.representative_mass;
                        borrowed.inferred = true;
                        trace!(
                            "group {gi}: borrowing run {run} feature from group {nj} for \
                             {:0.3} Da",
                            group.representative_mass
                        );
                        fills.push((
                            gi,
                            run,
                            AlignedFeature {
                                cluster: borrowed,
                                inferred: true,
                            },
                        ));
                        break 'search;
                    }
                    if !any_in_range {
                        break;
                    }
                }
            }
        }
        let n_filled = fills.len();
        for (gi, run, filled) in fills {
            self.groups[gi].slots[run] = Some(filled);
        }
        debug!("gap filling inferred {n_filled} slots");
    }

    /// Recompute every slot's abundance directly from its run's matrix.
    /// Runs that never detected the feature get a synthetic scan window
    /// derived from the representative's normalized elution span and a
    /// denovo collection attempt; when even the noise-only fallback finds
    /// nothing, the slot stays empty.
    pub fn refine_abundance<P: EnvelopeProvider>(&mut self, matrices: &mut [FeatureMatrix<P>]) {
        debug_assert_eq!(matrices.len(), self.n_runs);
        for group in self.groups.iter_mut() {
            let Some(representative) = group.slots[group.representative_run]
                .as_ref()
                .map(|f| f.cluster.clone())
            else {
                continue;
            };
            let mass = group.representative_mass;
            for run_id in 0..self.n_runs {
                let matrix = &mut matrices[run_id];
                match &mut group.slots[run_id] {
                    Some(slot) if !slot.inferred => {
                        if let Some(refined) = matrix.get_feature(
                            mass,
                            slot.cluster.representative_charge,
                            slot.cluster.min_scan,
                            slot.cluster.max_scan,
                        ) {
                            slot.cluster.abundance = refined.abundance;
                        }
                    }
                    slot => {
                        let run = matrix.run().clone();
                        if run.n_columns() == 0 {
                            continue;
                        }
                        let t_lo = run.time_of_net(representative.min_net);
                        let t_hi = run.time_of_net(representative.max_net);
                        let col_lo = nearest_column(&run, t_lo);
                        let col_hi = nearest_column(&run, t_hi);
                        let abundance = matrix.collect_abundance(
                            mass,
                            (representative.min_charge, representative.max_charge),
                            (col_lo, col_hi),
                        );
                        if abundance <= 0.0 {
                            continue;
                        }
                        match slot {
                            Some(inferred_slot) => inferred_slot.cluster.abundance = abundance,
                            None => {
                                let mut cluster = FeatureCluster::from_extents(
                                    mass,
                                    (representative.min_charge, representative.max_charge),
                                    (
                                        run.scan_number_of(col_lo),
                                        run.scan_number_of(col_hi),
                                    ),
                                    (t_lo, t_hi),
                                );
                                cluster.min_net = representative.min_net;
                                cluster.max_net = representative.max_net;
                                cluster.abundance = abundance;
                                cluster.inferred = true;
                                *slot = Some(AlignedFeature {
                                    cluster,
                                    inferred: true,
                                });
                            }
                        }
                    }
                }
            }
        }
    }
}

fn elution_center(cluster: &FeatureCluster) -> f64 {
    (cluster.min_elution_time + cluster.max_elution_time) / 2.0
}

fn group_distance(features: &[RunFeature], members: &[usize], candidate: usize) -> f64 {
    let center = elution_center(&features[candidate].cluster);
    members
        .iter()
        .map(|&m| (elution_center(&features[m].cluster) - center).abs())
        .fold(f64::INFINITY, f64::min)
}

fn nearest_column(run: &mzfeature::run::LcMsRun, time: f64) -> usize {
    let mut best = 0;
    let mut best_delta = f64::INFINITY;
    for column in 0..run.n_columns() {
        let delta = (run.elution_time_of(column) - time).abs();
        if delta < best_delta {
            best_delta = delta;
            best = column;
        }
    }
    best
}
