use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::pipeline::RunContext;
use crate::store::models::LabeledEpisode;

/// API出力に載せるエピソードの要約。メディア系フィールドは含めない。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSummary {
    pub episode_num: Option<u32>,
    pub title: String,
    pub movie_title: String,
    pub description: String,
    pub guid: String,
}

/// 同じラベルを持つエピソードのまとまり。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub label: String,
    pub cluster_id: usize,
    pub episodes: Vec<EpisodeSummary>,
}

/// 配信用のカタログ全体。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiOutput {
    pub podcast: String,
    pub total_episodes: usize,
    pub categories: Vec<Category>,
}

#[async_trait]
pub trait ExportStage: Send + Sync {
    async fn export(
        &self,
        ctx: &RunContext,
        episodes: &[LabeledEpisode],
    ) -> anyhow::Result<ApiOutput>;
}

/// ラベル付きエピソードをカテゴリ別のAPI出力へ畳み込むステージ。
///
/// カテゴリはラベルの初出順、カテゴリ内はエピソードの入力順を保つ。
#[derive(Debug, Clone, Copy, Default)]
pub struct CatalogExportStage;

impl CatalogExportStage {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExportStage for CatalogExportStage {
    async fn export(
        &self,
        ctx: &RunContext,
        episodes: &[LabeledEpisode],
    ) -> Result<ApiOutput> {
        let mut categories: Vec<Category> = Vec::new();
        let mut index_by_label: HashMap<&str, usize> = HashMap::new();

        for labeled in episodes {
            let index = match index_by_label.get(labeled.cluster_label.as_str()) {
                Some(&index) => index,
                None => {
                    categories.push(Category {
                        label: labeled.cluster_label.clone(),
                        cluster_id: labeled.clustered.cluster_id,
                        episodes: Vec::new(),
                    });
                    let index = categories.len() - 1;
                    index_by_label.insert(labeled.cluster_label.as_str(), index);
                    index
                }
            };
            let episode = &labeled.clustered.episode;
            categories[index].episodes.push(EpisodeSummary {
                episode_num: episode.episode_num,
                title: episode.title.clone(),
                movie_title: episode.movie_title.clone(),
                description: episode.description.clone(),
                guid: episode.guid.clone(),
            });
        }

        info!(
            run_id = %ctx.run_id,
            episodes = episodes.len(),
            categories = categories.len(),
            "assembled catalog output"
        );
        Ok(ApiOutput {
            podcast: ctx.podcast.clone(),
            total_episodes: episodes.len(),
            categories,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{ClusteredEpisode, Episode};

    fn labeled(guid: &str, cluster_id: usize, label: &str) -> LabeledEpisode {
        LabeledEpisode {
            clustered: ClusteredEpisode {
                episode: Episode {
                    episode_num: Some(1),
                    title: format!("1회 - {guid}"),
                    movie_title: guid.to_string(),
                    description: String::new(),
                    guid: guid.to_string(),
                    pub_date: String::new(),
                    audio_url: Some("https://cdn.example.com/a.mp3".to_string()),
                    image_url: None,
                    duration: None,
                    text_for_embedding: String::new(),
                },
                cluster_id,
            },
            cluster_label: label.to_string(),
        }
    }

    #[tokio::test]
    async fn export_groups_by_label_in_first_seen_order() {
        let episodes = vec![
            labeled("a", 1, "멜로"),
            labeled("b", 0, "스릴러"),
            labeled("c", 1, "멜로"),
        ];

        let output = CatalogExportStage::new()
            .export(&RunContext::new("cine"), &episodes)
            .await
            .expect("export succeeds");

        assert_eq!(output.podcast, "cine");
        let labels: Vec<&str> = output
            .categories
            .iter()
            .map(|category| category.label.as_str())
            .collect();
        assert_eq!(labels, vec!["멜로", "스릴러"]);
        assert_eq!(output.categories[0].cluster_id, 1);
        let guids: Vec<&str> = output.categories[0]
            .episodes
            .iter()
            .map(|episode| episode.guid.as_str())
            .collect();
        assert_eq!(guids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn export_partitions_every_episode_exactly_once() {
        let episodes = vec![
            labeled("a", 0, "스릴러"),
            labeled("b", 1, "멜로"),
            labeled("c", 2, "Category 2"),
        ];

        let output = CatalogExportStage::new()
            .export(&RunContext::new("cine"), &episodes)
            .await
            .expect("export succeeds");

        assert_eq!(output.total_episodes, 3);
        let grouped: usize = output
            .categories
            .iter()
            .map(|category| category.episodes.len())
            .sum();
        assert_eq!(grouped, output.total_episodes);
    }

    #[tokio::test]
    async fn export_summary_omits_media_fields() {
        let episodes = vec![labeled("a", 0, "스릴러")];

        let output = CatalogExportStage::new()
            .export(&RunContext::new("cine"), &episodes)
            .await
            .expect("export succeeds");

        let value = serde_json::to_value(&output).expect("serializes");
        let episode = &value["categories"][0]["episodes"][0];
        assert_eq!(episode["guid"], "a");
        assert!(episode.get("audio_url").is_none());
        assert!(episode.get("image_url").is_none());
        assert!(episode.get("duration").is_none());
    }
}
