//! Statistical significance tests and small signal helpers shared by the
//! matrix and cluster scoring paths.

use statrs::distribution::{ContinuousCDF, DiscreteCDF, Normal, Poisson};

/// The minimum number of background peaks required before the rank-sum
/// test can distinguish an envelope from its neighborhood. Below this the
/// test is vacuously significant so clean spectra are not rejected for
/// lacking noise.
const MIN_BACKGROUND: usize = 3;

/// One-sided Wilcoxon rank-sum p-value (normal approximation) for the
/// hypothesis that `sample` intensities are drawn from a stronger
/// distribution than `background` intensities.
pub fn rank_sum_pvalue(sample: &[f32], background: &[f32]) -> f64 {
    let n1 = sample.len();
    let n2 = background.len();
    if n1 == 0 {
        return 1.0;
    }
    if n2 < MIN_BACKGROUND {
        return 0.0;
    }

    let mut pooled: Vec<(f32, bool)> = Vec::with_capacity(n1 + n2);
    pooled.extend(sample.iter().map(|&v| (v, true)));
    pooled.extend(background.iter().map(|&v| (v, false)));
    pooled.sort_by(|a, b| a.0.total_cmp(&b.0));

    // average ranks over ties
    let mut rank_sum = 0.0f64;
    let mut i = 0;
    while i < pooled.len() {
        let mut j = i;
        while j + 1 < pooled.len() && pooled[j + 1].0 == pooled[i].0 {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for item in &pooled[i..=j] {
            if item.1 {
                rank_sum += rank;
            }
        }
        i = j + 1;
    }

    let n1f = n1 as f64;
    let n2f = n2 as f64;
    let u = rank_sum - n1f * (n1f + 1.0) / 2.0;
    let mean = n1f * n2f / 2.0;
    let variance = n1f * n2f * (n1f + n2f + 1.0) / 12.0;
    if variance <= 0.0 {
        return 1.0;
    }
    let z = (u - mean) / variance.sqrt();
    match Normal::new(0.0, 1.0) {
        Ok(normal) => 1.0 - normal.cdf(z),
        Err(_) => 1.0,
    }
}

/// The probability of matching at least `n_matched` isotope slots by
/// chance when `lambda` matches are expected from the local peak density.
pub fn poisson_pvalue(n_matched: u64, lambda: f64) -> f64 {
    if n_matched == 0 {
        return 1.0;
    }
    if lambda <= 0.0 {
        return 0.0;
    }
    match Poisson::new(lambda) {
        Ok(poisson) => (1.0 - poisson.cdf(n_matched - 1)).max(0.0),
        Err(_) => 1.0,
    }
}

/// Fixed small-kernel moving average used to smooth extracted ion
/// chromatograms before apex and boundary estimation.
pub fn smooth_moving_average(values: &[f32], half_width: usize) -> Vec<f32> {
    if values.is_empty() || half_width == 0 {
        return values.to_vec();
    }
    let n = values.len();
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let lo = i.saturating_sub(half_width);
        let hi = (i + half_width).min(n - 1);
        let sum: f32 = values[lo..=hi].iter().sum();
        out.push(sum / (hi - lo + 1) as f32);
    }
    out
}

/// Pearson correlation of two equal-length traces. Degenerate inputs give 0.
pub fn pearson(a: &[f32], b: &[f32]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let mean_a = a[..n].iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let mean_b = b[..n].iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (&x, &y) in a[..n].iter().zip(b[..n].iter()) {
        let xd = x as f64 - mean_a;
        let yd = y as f64 - mean_b;
        cov += xd * yd;
        var_a += xd * xd;
        var_b += yd * yd;
    }
    let denom = (var_a * var_b).sqrt();
    if denom <= 0.0 {
        0.0
    } else {
        cov / denom
    }
}
