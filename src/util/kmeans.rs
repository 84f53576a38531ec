use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;

/// Result of a K-Means run over embedding vectors.
pub(crate) struct KMeansFit {
    #[allow(dead_code)]
    pub(crate) centroids: Vec<Vec<f32>>,
    pub(crate) assignments: Vec<usize>,
    pub(crate) inertia: f64,
}

/// Runs seeded multi-restart K-Means and keeps the restart with the lowest
/// inertia.
///
/// Restart `r` derives its RNG from `seed + r`, so a fixed seed and a fixed
/// input reproduce identical assignments across invocations.
///
/// # Arguments
/// * `data` - List of data points (vectors), all of the same dimension.
/// * `k` - Number of clusters, `1 <= k <= data.len()`.
/// * `restarts` - Number of independent restarts, at least 1.
/// * `max_iterations` - Iteration cap per restart.
/// * `seed` - Base RNG seed.
pub(crate) fn fit(
    data: &[Vec<f32>],
    k: usize,
    restarts: usize,
    max_iterations: usize,
    seed: u64,
) -> KMeansFit {
    debug_assert!(!data.is_empty() && k >= 1 && k <= data.len() && restarts >= 1);

    let mut best: Option<KMeansFit> = None;
    for restart in 0..restarts {
        let candidate = fit_once(data, k, max_iterations, seed.wrapping_add(restart as u64));
        if best
            .as_ref()
            .is_none_or(|current| candidate.inertia < current.inertia)
        {
            best = Some(candidate);
        }
    }
    best.expect("at least one restart runs")
}

#[allow(clippy::cast_precision_loss)]
fn fit_once(data: &[Vec<f32>], k: usize, max_iterations: usize, seed: u64) -> KMeansFit {
    let dim = data[0].len();
    let mut rng = StdRng::seed_from_u64(seed);

    // Initialize centroids from k distinct points
    let mut centroids: Vec<Vec<f32>> = rand::seq::index::sample(&mut rng, data.len(), k)
        .into_iter()
        .map(|index| data[index].clone())
        .collect();

    let mut assignments = vec![0; data.len()];
    let mut changes = true;
    let mut iterations = 0;

    while changes && iterations < max_iterations {
        changes = false;
        iterations += 1;

        // E-step: assign points to nearest centroid
        let mut new_assignments = vec![0; data.len()];
        for (i, point) in data.iter().enumerate() {
            new_assignments[i] = nearest_centroid(point, &centroids).0;
        }

        if new_assignments != assignments {
            assignments = new_assignments;
            changes = true;
        }

        // M-step: update centroids
        let mut sums = vec![vec![0.0; dim]; k];
        let mut counts = vec![0usize; k];

        for (i, &cluster) in assignments.iter().enumerate() {
            for (j, val) in data[i].iter().enumerate() {
                sums[cluster][j] += val;
            }
            counts[cluster] += 1;
        }

        for j in 0..k {
            if counts[j] > 0 {
                for l in 0..dim {
                    centroids[j][l] = sums[j][l] / counts[j] as f32;
                }
            } else if let Some(random_point) = data.choose(&mut rng) {
                // Re-seed an empty cluster with a random point
                centroids[j].clone_from(random_point);
            }
        }
    }

    // Final pass keeps assignments consistent with the converged centroids
    // and accumulates the inertia.
    let mut inertia = 0.0f64;
    for (i, point) in data.iter().enumerate() {
        let (cluster, dist_sq) = nearest_centroid(point, &centroids);
        assignments[i] = cluster;
        inertia += f64::from(dist_sq);
    }

    KMeansFit {
        centroids,
        assignments,
        inertia,
    }
}

fn nearest_centroid(point: &[f32], centroids: &[Vec<f32>]) -> (usize, f32) {
    let mut min_dist_sq = f32::MAX;
    let mut best_cluster = 0;
    for (j, centroid) in centroids.iter().enumerate() {
        let dist_sq = distance_sq(point, centroid);
        if dist_sq < min_dist_sq {
            min_dist_sq = dist_sq;
            best_cluster = j;
        }
    }
    (best_cluster, min_dist_sq)
}

pub(crate) fn distance_sq(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

#[cfg(test)]
#[allow(clippy::cast_precision_loss)]
pub(crate) fn three_blobs() -> Vec<Vec<f32>> {
    // 30 points in three well-separated 4-dimensional blobs of ten.
    let mut data = Vec::with_capacity(30);
    for blob in 0..3u32 {
        let offset = blob as f32 * 10.0;
        for point in 0..10u32 {
            let wobble = point as f32 * 0.01;
            data.push(vec![
                offset + wobble,
                offset - wobble,
                offset + 0.5 + wobble,
                offset - 0.5 - wobble,
            ]);
        }
    }
    data
}
