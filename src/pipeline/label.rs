use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::pipeline::RunContext;
use crate::store::models::{ClusteredEpisode, LabeledEpisode};

#[async_trait]
pub trait LabelStage: Send + Sync {
    async fn label(
        &self,
        ctx: &RunContext,
        episodes: Vec<ClusteredEpisode>,
        table: &HashMap<usize, String>,
    ) -> anyhow::Result<Vec<LabeledEpisode>>;
}

/// 人手で用意したラベル表をクラスタIDに適用するステージ。
///
/// 表に無いクラスタIDは `Category {id}` で補う。再クラスタリング後に表が
/// 古くなっていても処理は止めない。
#[derive(Debug, Clone, Copy, Default)]
pub struct CategoryLabelStage;

impl CategoryLabelStage {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LabelStage for CategoryLabelStage {
    async fn label(
        &self,
        ctx: &RunContext,
        episodes: Vec<ClusteredEpisode>,
        table: &HashMap<usize, String>,
    ) -> Result<Vec<LabeledEpisode>> {
        let mut fallback_clusters: Vec<usize> = Vec::new();
        let labeled: Vec<LabeledEpisode> = episodes
            .into_iter()
            .map(|clustered| {
                let cluster_label = table.get(&clustered.cluster_id).cloned().unwrap_or_else(|| {
                    if !fallback_clusters.contains(&clustered.cluster_id) {
                        fallback_clusters.push(clustered.cluster_id);
                    }
                    format!("Category {}", clustered.cluster_id)
                });
                LabeledEpisode {
                    clustered,
                    cluster_label,
                }
            })
            .collect();

        if !fallback_clusters.is_empty() {
            warn!(
                run_id = %ctx.run_id,
                clusters = ?fallback_clusters,
                "no label for some clusters, using fallback names"
            );
        }
        info!(
            run_id = %ctx.run_id,
            episodes = labeled.len(),
            "labeled episodes"
        );
        Ok(labeled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::Episode;

    fn clustered(guid: &str, cluster_id: usize) -> ClusteredEpisode {
        ClusteredEpisode {
            episode: Episode {
                episode_num: None,
                title: String::new(),
                movie_title: String::new(),
                description: String::new(),
                guid: guid.to_string(),
                pub_date: String::new(),
                audio_url: None,
                image_url: None,
                duration: None,
                text_for_embedding: String::new(),
            },
            cluster_id,
        }
    }

    #[tokio::test]
    async fn label_applies_the_table_by_cluster_id() {
        let table = HashMap::from([(0, "스릴러".to_string()), (1, "멜로".to_string())]);
        let episodes = vec![clustered("a", 0), clustered("b", 1), clustered("c", 0)];

        let labeled = CategoryLabelStage::new()
            .label(&RunContext::new("cine"), episodes, &table)
            .await
            .expect("labeling succeeds");

        let labels: Vec<&str> = labeled.iter().map(|e| e.cluster_label.as_str()).collect();
        assert_eq!(labels, vec!["스릴러", "멜로", "스릴러"]);
    }

    #[tokio::test]
    async fn label_falls_back_for_unknown_cluster_ids() {
        let table = HashMap::from([(0, "스릴러".to_string())]);
        let episodes = vec![clustered("a", 0), clustered("b", 7)];

        let labeled = CategoryLabelStage::new()
            .label(&RunContext::new("cine"), episodes, &table)
            .await
            .expect("labeling succeeds");

        assert_eq!(labeled[1].cluster_label, "Category 7");
    }

    #[tokio::test]
    async fn label_handles_an_empty_table() {
        let episodes = vec![clustered("a", 2)];

        let labeled = CategoryLabelStage::new()
            .label(&RunContext::new("cine"), episodes, &HashMap::new())
            .await
            .expect("labeling succeeds");

        assert_eq!(labeled[0].cluster_label, "Category 2");
    }
}
