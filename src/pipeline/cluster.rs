use std::num::NonZeroUsize;
use std::path::Path;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use plotters::prelude::*;
use thiserror::Error;
use tracing::{debug, info};

use crate::pipeline::RunContext;
use crate::store::models::EmbeddingMatrix;
use crate::util::kmeans;
use crate::util::silhouette::mean_silhouette;

/// 1つのクラスタ数候補に対する評価値。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KDiagnostic {
    pub k: usize,
    pub inertia: f64,
    pub silhouette: f64,
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("k={k} is outside the valid range [2, {}] for {n} episodes", .n.saturating_sub(1))]
    InvalidK { k: usize, n: usize },
    #[error(
        "exploration range [{min}, {max}] does not intersect the valid range [2, {}] for {n} episodes",
        .n.saturating_sub(1)
    )]
    EmptyExplorationRange { min: usize, max: usize, n: usize },
}

#[async_trait]
pub trait ClusterStage: Send + Sync {
    /// Partitions the rows of `matrix` into `k` clusters.
    async fn assign(
        &self,
        ctx: &RunContext,
        matrix: &EmbeddingMatrix,
        k: usize,
    ) -> anyhow::Result<Vec<usize>>;

    /// Scores each candidate cluster count over the rows of `matrix`.
    async fn explore(
        &self,
        ctx: &RunContext,
        matrix: &EmbeddingMatrix,
        candidates: &[usize],
    ) -> anyhow::Result<Vec<KDiagnostic>>;
}

/// シード固定のK-Meansでエピソードをクラスタリングするステージ。
#[derive(Debug, Clone, Copy)]
pub struct KMeansClusterStage {
    seed: u64,
    restarts: NonZeroUsize,
    max_iterations: usize,
}

impl KMeansClusterStage {
    #[must_use]
    pub fn new(seed: u64, restarts: NonZeroUsize, max_iterations: usize) -> Self {
        Self {
            seed,
            restarts,
            max_iterations,
        }
    }
}

#[async_trait]
impl ClusterStage for KMeansClusterStage {
    async fn assign(
        &self,
        ctx: &RunContext,
        matrix: &EmbeddingMatrix,
        k: usize,
    ) -> Result<Vec<usize>> {
        let data = matrix.to_rows();
        let fit = kmeans::fit(&data, k, self.restarts.get(), self.max_iterations, self.seed);
        info!(
            run_id = %ctx.run_id,
            k,
            inertia = fit.inertia,
            "assigned episodes to clusters"
        );
        Ok(fit.assignments)
    }

    async fn explore(
        &self,
        ctx: &RunContext,
        matrix: &EmbeddingMatrix,
        candidates: &[usize],
    ) -> Result<Vec<KDiagnostic>> {
        let data = matrix.to_rows();
        let mut diagnostics = Vec::with_capacity(candidates.len());
        for &k in candidates {
            let fit = kmeans::fit(&data, k, self.restarts.get(), self.max_iterations, self.seed);
            let silhouette = mean_silhouette(&data, &fit.assignments, k);
            debug!(
                run_id = %ctx.run_id,
                k,
                inertia = fit.inertia,
                silhouette,
                "scored cluster count"
            );
            diagnostics.push(KDiagnostic {
                k,
                inertia: fit.inertia,
                silhouette,
            });
        }
        Ok(diagnostics)
    }
}

/// k候補ごとのイナーシャとシルエット係数を1枚のPNGに描画する。
///
/// # Errors
/// 描画バックエンドへの出力に失敗した場合はエラーを返す。
#[allow(clippy::cast_precision_loss)]
pub(crate) fn render_k_selection(path: &Path, diagnostics: &[KDiagnostic]) -> Result<()> {
    if diagnostics.is_empty() {
        bail!("no diagnostics to chart");
    }

    let k_lo = diagnostics.iter().map(|d| d.k).min().unwrap_or(0) as f64 - 0.5;
    let k_hi = diagnostics.iter().map(|d| d.k).max().unwrap_or(0) as f64 + 0.5;
    let inertia_hi = diagnostics
        .iter()
        .map(|d| d.inertia)
        .fold(0.0f64, f64::max)
        .max(1.0)
        * 1.05;

    let root = BitMapBackend::new(path, (900, 600)).into_drawing_area();
    root.fill(&WHITE)
        .map_err(|error| anyhow!("failed to fill chart background: {error}"))?;
    let (upper, lower) = root.split_vertically(300);

    let mut inertia_chart = ChartBuilder::on(&upper)
        .caption("Inertia by cluster count", ("sans-serif", 20))
        .margin(10)
        .x_label_area_size(30)
        .y_label_area_size(60)
        .build_cartesian_2d(k_lo..k_hi, 0.0f64..inertia_hi)
        .map_err(|error| anyhow!("failed to build inertia chart: {error}"))?;
    inertia_chart
        .configure_mesh()
        .draw()
        .map_err(|error| anyhow!("failed to draw inertia mesh: {error}"))?;
    inertia_chart
        .draw_series(LineSeries::new(
            diagnostics.iter().map(|d| (d.k as f64, d.inertia)),
            &BLUE,
        ))
        .map_err(|error| anyhow!("failed to draw inertia series: {error}"))?;

    let mut silhouette_chart = ChartBuilder::on(&lower)
        .caption("Silhouette score by cluster count", ("sans-serif", 20))
        .margin(10)
        .x_label_area_size(30)
        .y_label_area_size(60)
        .build_cartesian_2d(k_lo..k_hi, -1.0f64..1.0f64)
        .map_err(|error| anyhow!("failed to build silhouette chart: {error}"))?;
    silhouette_chart
        .configure_mesh()
        .draw()
        .map_err(|error| anyhow!("failed to draw silhouette mesh: {error}"))?;
    silhouette_chart
        .draw_series(LineSeries::new(
            diagnostics.iter().map(|d| (d.k as f64, d.silhouette)),
            &RED,
        ))
        .map_err(|error| anyhow!("failed to draw silhouette series: {error}"))?;

    root.present()
        .map_err(|error| anyhow!("failed to write chart: {error}"))?;
    Ok(())
}
