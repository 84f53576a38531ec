use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// 1エピソード分のカタログレコード。
///
/// フィードに存在しない文字列フィールドは空文字列で埋める。メディア系の
/// フィールドはフォールバック解決後も欠けることがあるため `Option` のまま。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub episode_num: Option<u32>,
    pub title: String,
    pub movie_title: String,
    pub description: String,
    pub guid: String,
    pub pub_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    pub text_for_embedding: String,
}

/// クラスタ割り当てを付与したエピソード。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteredEpisode {
    #[serde(flatten)]
    pub episode: Episode,
    pub cluster_id: usize,
}

/// カテゴリラベルまで付与したエピソード。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledEpisode {
    #[serde(flatten)]
    pub clustered: ClusteredEpisode,
    pub cluster_label: String,
}

/// Row-major embedding matrix, positionally aligned with the episode list:
/// row `i` is the vector for episode `i`.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl EmbeddingMatrix {
    /// Builds a matrix from per-episode vectors, preserving order.
    ///
    /// # Errors
    /// Returns an error when the rows do not all share the same dimension.
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self> {
        let Some(first) = rows.first() else {
            return Ok(Self {
                rows: 0,
                cols: 0,
                data: Vec::new(),
            });
        };
        let cols = first.len();
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (index, row) in rows.iter().enumerate() {
            if row.len() != cols {
                bail!(
                    "ragged embedding output: row {index} has {} values, expected {cols}",
                    row.len()
                );
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data,
        })
    }

    pub(crate) fn from_raw(rows: usize, cols: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(rows * cols, data.len());
        Self { rows, cols, data }
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[must_use]
    pub fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.cols..(index + 1) * self.cols]
    }

    #[must_use]
    pub fn to_rows(&self) -> Vec<Vec<f32>> {
        (0..self.rows).map(|i| self.row(i).to_vec()).collect()
    }

    pub(crate) fn data(&self) -> &[f32] {
        &self.data
    }
}
