use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    clients::FeedClient,
    config::Config,
    store::artifacts::ArtifactStore,
    store::models::{ClusteredEpisode, EmbeddingMatrix, LabeledEpisode},
};

pub mod cluster;
pub mod embed;
pub mod export;
pub mod ingest;
pub mod label;

use cluster::{ClusterError, ClusterStage, KMeansClusterStage, render_k_selection};
use embed::{EmbedStage, RustBertEmbedStage};
use export::{CatalogExportStage, ExportStage};
use ingest::{FeedIngestStage, IngestStage};
use label::{CategoryLabelStage, LabelStage};

/// 1回のコマンド実行を識別するコンテキスト。
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub podcast: String,
}

impl RunContext {
    #[must_use]
    pub fn new(podcast: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            podcast: podcast.into(),
        }
    }
}

pub struct CatalogPipeline {
    config: Arc<Config>,
    store: Arc<ArtifactStore>,
    stages: PipelineStages,
}

struct PipelineStages {
    ingest: Arc<dyn IngestStage>,
    embed: Arc<dyn EmbedStage>,
    cluster: Arc<dyn ClusterStage>,
    label: Arc<dyn LabelStage>,
    export: Arc<dyn ExportStage>,
}

pub struct PipelineBuilder {
    config: Arc<Config>,
    ingest: Option<Arc<dyn IngestStage>>,
    embed: Option<Arc<dyn EmbedStage>>,
    cluster: Option<Arc<dyn ClusterStage>>,
    label: Option<Arc<dyn LabelStage>>,
    export: Option<Arc<dyn ExportStage>>,
}

#[derive(Debug)]
pub struct IngestSummary {
    pub podcast: String,
    pub episodes: usize,
}

impl fmt::Display for IngestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ingested {} episodes for {}", self.episodes, self.podcast)
    }
}

#[derive(Debug)]
pub struct EmbedSummary {
    pub podcast: String,
    pub rows: usize,
    pub cols: usize,
}

impl fmt::Display for EmbedSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "embedded {} episodes into {}-dimensional vectors for {}",
            self.rows, self.cols, self.podcast
        )
    }
}

/// 1クラスタ分の人間向けダイジェスト。
#[derive(Debug)]
pub struct ClusterDigest {
    pub cluster_id: usize,
    pub episodes: usize,
    pub sample_titles: Vec<String>,
}

#[derive(Debug)]
pub enum ClusterSummary {
    /// k-selection mode: diagnostics only, nothing assigned or persisted.
    Explored {
        podcast: String,
        lo: usize,
        hi: usize,
        k: usize,
        silhouette: f64,
        chart: PathBuf,
    },
    /// Assignment mode: episodes clustered and persisted.
    Assigned {
        podcast: String,
        k: usize,
        episodes: usize,
        clusters: Vec<ClusterDigest>,
    },
}

impl fmt::Display for ClusterSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explored {
                podcast,
                lo,
                hi,
                k,
                silhouette,
                chart,
            } => write!(
                f,
                "explored k in [{lo}, {hi}] for {podcast}: recommended k={k} \
                 (silhouette {silhouette:.4}), chart at {}",
                chart.display()
            ),
            Self::Assigned {
                podcast,
                k,
                episodes,
                clusters,
            } => {
                write!(f, "clustered {episodes} episodes into k={k} for {podcast}")?;
                for digest in clusters {
                    write!(
                        f,
                        "\n  cluster {}: {} episodes",
                        digest.cluster_id, digest.episodes
                    )?;
                    if !digest.sample_titles.is_empty() {
                        write!(f, " ({})", digest.sample_titles.join(", "))?;
                    }
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug)]
pub struct LabelSummary {
    pub podcast: String,
    pub episodes: usize,
    pub label_counts: Vec<(String, usize)>,
}

impl fmt::Display for LabelSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "labeled {} episodes for {}", self.episodes, self.podcast)?;
        if !self.label_counts.is_empty() {
            let parts: Vec<String> = self
                .label_counts
                .iter()
                .map(|(label, count)| format!("{label}={count}"))
                .collect();
            write!(f, ": {}", parts.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ExportSummary {
    pub podcast: String,
    pub total_episodes: usize,
    pub categories: usize,
    pub path: PathBuf,
}

impl fmt::Display for ExportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "exported {} episodes in {} categories for {} to {}",
            self.total_episodes,
            self.categories,
            self.podcast,
            self.path.display()
        )
    }
}

impl CatalogPipeline {
    /// 設定から本番用のステージ一式を組み立てる。
    ///
    /// # Errors
    /// HTTPクライアントの構築に失敗した場合はエラーを返す。
    pub fn from_config(config: Arc<Config>) -> Result<Self> {
        let client = Arc::new(FeedClient::from_config(&config)?);
        let store = Arc::new(ArtifactStore::new(config.data_dir().clone()));
        Ok(Self::builder(Arc::clone(&config))
            .with_ingest_stage(Arc::new(FeedIngestStage::new(
                client,
                config.feeds().to_vec(),
            )))
            .with_embed_stage(Arc::new(RustBertEmbedStage::new(
                config.embedding_model().to_string(),
                config.embedding_text_prefix().map(ToString::to_string),
                config.embedding_batch_size(),
            )))
            .with_cluster_stage(Arc::new(KMeansClusterStage::new(
                config.kmeans_seed(),
                config.kmeans_restarts(),
                config.kmeans_max_iterations(),
            )))
            .with_label_stage(Arc::new(CategoryLabelStage::new()))
            .with_export_stage(Arc::new(CatalogExportStage::new()))
            .build(store))
    }

    #[must_use]
    pub fn builder(config: Arc<Config>) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// フィードを取得してエピソードカタログを書き出す。
    ///
    /// # Errors
    /// フィードの取得・パース、または成果物の書き込みに失敗した場合はエラーを返す。
    pub async fn run_ingest(&self, ctx: &RunContext) -> Result<IngestSummary> {
        let episodes = self.stages.ingest.ingest(ctx).await?;
        self.store.write_episodes(&ctx.podcast, &episodes)?;
        Ok(IngestSummary {
            podcast: ctx.podcast.clone(),
            episodes: episodes.len(),
        })
    }

    /// カタログをベクトル化して埋め込み行列を書き出す。
    ///
    /// 行列の行はカタログのエピソード順と一致する。
    ///
    /// # Errors
    /// カタログ成果物が無い場合、ベクトル化に失敗した場合、行数がエピソード数と
    /// 一致しない場合はエラーを返す。
    pub async fn run_embed(&self, ctx: &RunContext) -> Result<EmbedSummary> {
        let episodes = self.store.read_episodes(&ctx.podcast)?;
        let texts: Vec<String> = episodes
            .iter()
            .map(|episode| episode.text_for_embedding.clone())
            .collect();
        let vectors = self.stages.embed.embed(ctx, &texts).await?;
        if vectors.len() != episodes.len() {
            bail!(
                "embedding produced {} rows for {} episodes",
                vectors.len(),
                episodes.len()
            );
        }
        let matrix = EmbeddingMatrix::from_rows(vectors)?;
        self.store.write_embeddings(&ctx.podcast, &matrix)?;
        Ok(EmbedSummary {
            podcast: ctx.podcast.clone(),
            rows: matrix.rows(),
            cols: matrix.cols(),
        })
    }

    /// エピソードをクラスタリングする。
    ///
    /// `requested_k` があれば割り当てを実行してクラスタ成果物を書き出す。
    /// 無ければ設定された探索範囲を診断し、推奨kとチャートだけを出力する。
    /// 探索モードはクラスタ成果物を書かない。
    ///
    /// # Errors
    /// 先行成果物が無い場合、成果物同士の行数が食い違う場合、kが有効範囲を
    /// 外れる場合はエラーを返す。
    pub async fn run_cluster(
        &self,
        ctx: &RunContext,
        requested_k: Option<usize>,
    ) -> Result<ClusterSummary> {
        let episodes = self.store.read_episodes(&ctx.podcast)?;
        let matrix = self.store.read_embeddings(&ctx.podcast)?;
        let n = matrix.rows();
        if n != episodes.len() {
            bail!(
                "embeddings cover {n} rows but the catalog has {} episodes: run `catalog-worker embed {}` again",
                episodes.len(),
                ctx.podcast
            );
        }

        let Some(k) = requested_k else {
            return self.explore_k(ctx, &matrix, n).await;
        };
        if k < 2 || k > n.saturating_sub(1) {
            return Err(ClusterError::InvalidK { k, n }.into());
        }

        let assignments = self.stages.cluster.assign(ctx, &matrix, k).await?;
        let clustered: Vec<ClusteredEpisode> = episodes
            .into_iter()
            .zip(assignments)
            .map(|(episode, cluster_id)| ClusteredEpisode {
                episode,
                cluster_id,
            })
            .collect();
        self.store.write_clustered(&ctx.podcast, &clustered)?;
        Ok(ClusterSummary::Assigned {
            podcast: ctx.podcast.clone(),
            k,
            episodes: clustered.len(),
            clusters: digest_clusters(&clustered, k),
        })
    }

    async fn explore_k(
        &self,
        ctx: &RunContext,
        matrix: &EmbeddingMatrix,
        n: usize,
    ) -> Result<ClusterSummary> {
        let lo = self.config.k_exploration_min().max(2);
        let hi = self.config.k_exploration_max().min(n.saturating_sub(1));
        if lo > hi {
            return Err(ClusterError::EmptyExplorationRange {
                min: self.config.k_exploration_min(),
                max: self.config.k_exploration_max(),
                n,
            }
            .into());
        }

        let candidates: Vec<usize> = (lo..=hi).collect();
        let diagnostics = self
            .stages
            .cluster
            .explore(ctx, matrix, &candidates)
            .await?;

        // Ties resolve to the smallest k
        let mut best = diagnostics.first().context("no diagnostics produced")?;
        for diagnostic in &diagnostics {
            if diagnostic.silhouette > best.silhouette {
                best = diagnostic;
            }
        }

        let render_path = self.store.chart_render_path(&ctx.podcast)?;
        render_k_selection(&render_path, &diagnostics)?;
        let chart = self.store.commit_chart(&ctx.podcast, &render_path)?;
        info!(
            run_id = %ctx.run_id,
            k = best.k,
            silhouette = best.silhouette,
            chart = %chart.display(),
            "recommended cluster count"
        );
        Ok(ClusterSummary::Explored {
            podcast: ctx.podcast.clone(),
            lo,
            hi,
            k: best.k,
            silhouette: best.silhouette,
            chart,
        })
    }

    /// ラベル表を適用してラベル付きカタログを書き出す。
    ///
    /// ラベル表が無い場合は警告を出し、全クラスタをフォールバック名で埋める。
    ///
    /// # Errors
    /// クラスタ成果物が無い場合やラベル表のパースに失敗した場合はエラーを返す。
    pub async fn run_label(&self, ctx: &RunContext) -> Result<LabelSummary> {
        let clustered = self.store.read_clustered(&ctx.podcast)?;
        let table = match self.store.read_label_table(&ctx.podcast)? {
            Some(table) => table,
            None => {
                warn!(
                    run_id = %ctx.run_id,
                    podcast = %ctx.podcast,
                    "no label table found, using generated category names"
                );
                HashMap::new()
            }
        };
        let labeled = self.stages.label.label(ctx, clustered, &table).await?;
        self.store.write_labeled(&ctx.podcast, &labeled)?;
        let label_counts = count_labels(&labeled);
        Ok(LabelSummary {
            podcast: ctx.podcast.clone(),
            episodes: labeled.len(),
            label_counts,
        })
    }

    /// ラベル付きカタログを配信用JSONへ変換して書き出す。
    ///
    /// # Errors
    /// ラベル成果物が無い場合や書き込みに失敗した場合はエラーを返す。
    pub async fn run_export(&self, ctx: &RunContext) -> Result<ExportSummary> {
        let labeled = self.store.read_labeled(&ctx.podcast)?;
        let output = self.stages.export.export(ctx, &labeled).await?;
        let path = self.store.write_export(&ctx.podcast, &output)?;
        Ok(ExportSummary {
            podcast: ctx.podcast.clone(),
            total_episodes: output.total_episodes,
            categories: output.categories.len(),
            path,
        })
    }
}

const SAMPLE_TITLES_PER_CLUSTER: usize = 3;

fn digest_clusters(clustered: &[ClusteredEpisode], k: usize) -> Vec<ClusterDigest> {
    let mut digests: Vec<ClusterDigest> = (0..k)
        .map(|cluster_id| ClusterDigest {
            cluster_id,
            episodes: 0,
            sample_titles: Vec::new(),
        })
        .collect();
    for entry in clustered {
        let digest = &mut digests[entry.cluster_id];
        digest.episodes += 1;
        if digest.sample_titles.len() < SAMPLE_TITLES_PER_CLUSTER {
            digest.sample_titles.push(entry.episode.title.clone());
        }
    }
    digests
}

fn count_labels(labeled: &[LabeledEpisode]) -> Vec<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for episode in labeled {
        *counts.entry(episode.cluster_label.as_str()).or_insert(0) += 1;
    }
    let mut sorted: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(label, count)| (label.to_string(), count))
        .collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    sorted
}

impl PipelineBuilder {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            ingest: None,
            embed: None,
            cluster: None,
            label: None,
            export: None,
        }
    }

    pub fn with_ingest_stage(mut self, stage: Arc<dyn IngestStage>) -> Self {
        self.ingest = Some(stage);
        self
    }

    pub fn with_embed_stage(mut self, stage: Arc<dyn EmbedStage>) -> Self {
        self.embed = Some(stage);
        self
    }

    pub fn with_cluster_stage(mut self, stage: Arc<dyn ClusterStage>) -> Self {
        self.cluster = Some(stage);
        self
    }

    pub fn with_label_stage(mut self, stage: Arc<dyn LabelStage>) -> Self {
        self.label = Some(stage);
        self
    }

    pub fn with_export_stage(mut self, stage: Arc<dyn ExportStage>) -> Self {
        self.export = Some(stage);
        self
    }

    /// パイプラインを確定する。
    ///
    /// # Panics
    /// 外部リソースを必要とするステージ（ingest/embed）が未設定の場合はpanicする。
    #[must_use]
    pub fn build(self, store: Arc<ArtifactStore>) -> CatalogPipeline {
        let stages = PipelineStages {
            ingest: self
                .ingest
                .unwrap_or_else(|| panic!("ingest stage must be configured before build")),
            embed: self
                .embed
                .unwrap_or_else(|| panic!("embed stage must be configured before build")),
            cluster: self.cluster.unwrap_or_else(|| {
                Arc::new(KMeansClusterStage::new(
                    self.config.kmeans_seed(),
                    self.config.kmeans_restarts(),
                    self.config.kmeans_max_iterations(),
                ))
            }),
            label: self
                .label
                .unwrap_or_else(|| Arc::new(CategoryLabelStage::new())),
            export: self
                .export
                .unwrap_or_else(|| Arc::new(CatalogExportStage::new())),
        };

        CatalogPipeline {
            config: self.config,
            store,
            stages,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::config::ENV_MUTEX;
    use crate::pipeline::cluster::KDiagnostic;
    use crate::pipeline::export::ApiOutput;
    use crate::store::models::Episode;
    use crate::util::silhouette::mean_silhouette;

    fn setup_config(data_dir: &std::path::Path) -> Arc<Config> {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        // SAFETY: tests adjust environment variables in a controlled manner.
        unsafe {
            std::env::set_var("CATALOG_DATA_DIR", data_dir);
            std::env::set_var("CATALOG_FEEDS", "cine=https://feeds.example.com/cine.xml");
            // Config tests in this binary leave their overrides behind.
            std::env::remove_var("EMBEDDING_BATCH_SIZE");
            std::env::remove_var("K_EXPLORATION_MIN");
            std::env::remove_var("K_EXPLORATION_MAX");
        }
        Arc::new(Config::from_env().expect("config should load for tests"))
    }

    fn sample_episode(guid: &str, text: &str) -> Episode {
        Episode {
            episode_num: None,
            title: guid.to_string(),
            movie_title: guid.to_string(),
            description: text.to_string(),
            guid: guid.to_string(),
            pub_date: String::new(),
            audio_url: None,
            image_url: None,
            duration: None,
            text_for_embedding: text.to_string(),
        }
    }

    struct RecordingIngest {
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl IngestStage for RecordingIngest {
        async fn ingest(&self, _ctx: &RunContext) -> Result<Vec<Episode>> {
            self.order.lock().expect("order lock").push("ingest");
            Ok(vec![
                sample_episode("a", "기생충"),
                sample_episode("b", "설국열차"),
                sample_episode("c", "러브레터"),
                sample_episode("d", "윤희에게"),
            ])
        }
    }

    struct RecordingEmbed {
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl EmbedStage for RecordingEmbed {
        async fn embed(&self, _ctx: &RunContext, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            assert_eq!(texts.len(), 4);
            self.order.lock().expect("order lock").push("embed");
            Ok(vec![
                vec![0.0, 0.0],
                vec![0.1, 0.0],
                vec![10.0, 10.0],
                vec![10.1, 10.0],
            ])
        }
    }

    struct RecordingCluster {
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ClusterStage for RecordingCluster {
        async fn assign(
            &self,
            _ctx: &RunContext,
            matrix: &EmbeddingMatrix,
            _k: usize,
        ) -> Result<Vec<usize>> {
            self.order.lock().expect("order lock").push("cluster");
            Ok((0..matrix.rows())
                .map(|row| usize::from(matrix.row(row)[0] > 5.0))
                .collect())
        }

        async fn explore(
            &self,
            ctx: &RunContext,
            matrix: &EmbeddingMatrix,
            candidates: &[usize],
        ) -> Result<Vec<KDiagnostic>> {
            let mut diagnostics = Vec::new();
            for &k in candidates {
                let assignments = self.assign(ctx, matrix, k).await?;
                let silhouette = mean_silhouette(&matrix.to_rows(), &assignments, k);
                diagnostics.push(KDiagnostic {
                    k,
                    inertia: 0.0,
                    silhouette,
                });
            }
            Ok(diagnostics)
        }
    }

    struct RecordingLabel {
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl LabelStage for RecordingLabel {
        async fn label(
            &self,
            ctx: &RunContext,
            episodes: Vec<ClusteredEpisode>,
            table: &HashMap<usize, String>,
        ) -> Result<Vec<LabeledEpisode>> {
            self.order.lock().expect("order lock").push("label");
            CategoryLabelStage::new().label(ctx, episodes, table).await
        }
    }

    struct RecordingExport {
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ExportStage for RecordingExport {
        async fn export(
            &self,
            ctx: &RunContext,
            episodes: &[LabeledEpisode],
        ) -> Result<ApiOutput> {
            self.order.lock().expect("order lock").push("export");
            CatalogExportStage::new().export(ctx, episodes).await
        }
    }

    fn recording_pipeline(
        config: Arc<Config>,
        store: Arc<ArtifactStore>,
        order: Arc<Mutex<Vec<&'static str>>>,
    ) -> CatalogPipeline {
        CatalogPipeline::builder(config)
            .with_ingest_stage(Arc::new(RecordingIngest {
                order: Arc::clone(&order),
            }))
            .with_embed_stage(Arc::new(RecordingEmbed {
                order: Arc::clone(&order),
            }))
            .with_cluster_stage(Arc::new(RecordingCluster {
                order: Arc::clone(&order),
            }))
            .with_label_stage(Arc::new(RecordingLabel {
                order: Arc::clone(&order),
            }))
            .with_export_stage(Arc::new(RecordingExport {
                order: Arc::clone(&order),
            }))
            .build(store)
    }

    #[tokio::test]
    async fn commands_run_stages_in_order_and_chain_artifacts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = setup_config(dir.path());
        let store = Arc::new(ArtifactStore::new(dir.path()));
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let pipeline = recording_pipeline(config, Arc::clone(&store), Arc::clone(&order));
        let ctx = RunContext::new("cine");

        pipeline.run_ingest(&ctx).await.expect("ingest");
        pipeline.run_embed(&ctx).await.expect("embed");
        let cluster = pipeline.run_cluster(&ctx, Some(2)).await.expect("cluster");
        pipeline.run_label(&ctx).await.expect("label");
        let summary = pipeline.run_export(&ctx).await.expect("export");

        let ClusterSummary::Assigned {
            k,
            episodes,
            clusters,
            ..
        } = cluster
        else {
            panic!("expected an assignment summary");
        };
        assert_eq!(k, 2);
        assert_eq!(episodes, 4);
        assert_eq!(clusters.len(), 2);
        assert!(clusters.iter().all(|digest| digest.episodes == 2));

        assert_eq!(summary.total_episodes, 4);
        assert_eq!(summary.categories, 2);
        assert!(store.export_path("cine").exists());

        let recorded = order.lock().expect("order lock").clone();
        assert_eq!(
            recorded,
            vec!["ingest", "embed", "cluster", "label", "export"]
        );
    }

    #[tokio::test]
    async fn cluster_without_k_recommends_but_does_not_assign() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = setup_config(dir.path());
        let store = Arc::new(ArtifactStore::new(dir.path()));
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let pipeline = recording_pipeline(config, Arc::clone(&store), order);
        let ctx = RunContext::new("cine");

        pipeline.run_ingest(&ctx).await.expect("ingest");
        pipeline.run_embed(&ctx).await.expect("embed");
        let summary = pipeline.run_cluster(&ctx, None).await.expect("explore");

        // Four episodes cap the default exploration range at k = 3.
        let ClusterSummary::Explored { lo, hi, k, chart, .. } = summary else {
            panic!("expected an exploration summary");
        };
        assert_eq!((lo, hi), (3, 3));
        assert_eq!(k, 3);
        assert!(chart.exists());

        let error = store
            .read_clustered("cine")
            .expect_err("exploration must not persist assignments");
        assert!(error.to_string().contains("catalog-worker cluster cine"));
    }

    #[tokio::test]
    async fn embed_without_a_catalog_names_the_missing_command() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = setup_config(dir.path());
        let store = Arc::new(ArtifactStore::new(dir.path()));
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let pipeline = recording_pipeline(config, store, order);

        let error = pipeline
            .run_embed(&RunContext::new("cine"))
            .await
            .expect_err("missing artifact");

        assert!(error.to_string().contains("catalog-worker ingest cine"));
    }

    #[tokio::test]
    async fn cluster_rejects_k_outside_the_valid_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = setup_config(dir.path());
        let store = Arc::new(ArtifactStore::new(dir.path()));
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let pipeline = recording_pipeline(config, store, order);
        let ctx = RunContext::new("cine");

        pipeline.run_ingest(&ctx).await.expect("ingest");
        pipeline.run_embed(&ctx).await.expect("embed");
        let error = pipeline
            .run_cluster(&ctx, Some(4))
            .await
            .expect_err("k exceeds n - 1");

        assert!(error.to_string().contains("[2, 3]"));
    }

    #[tokio::test]
    async fn label_counts_are_sorted_by_descending_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = setup_config(dir.path());
        let store = Arc::new(ArtifactStore::new(dir.path()));
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let pipeline = recording_pipeline(config, Arc::clone(&store), order);
        let ctx = RunContext::new("cine");

        pipeline.run_ingest(&ctx).await.expect("ingest");
        pipeline.run_embed(&ctx).await.expect("embed");
        pipeline.run_cluster(&ctx, Some(2)).await.expect("cluster");
        let summary = pipeline.run_label(&ctx).await.expect("label");

        assert_eq!(summary.episodes, 4);
        assert_eq!(summary.label_counts.len(), 2);
        assert!(summary.label_counts[0].1 >= summary.label_counts[1].1);
    }
}
