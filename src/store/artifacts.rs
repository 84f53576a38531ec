use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::store::models::{ClusteredEpisode, EmbeddingMatrix, Episode, LabeledEpisode};

const EMBEDDINGS_MAGIC: &[u8; 4] = b"CWEM";
const EMBEDDINGS_VERSION: u32 = 1;
const HEADER_LEN: usize = 16;

/// ファイルベースの成果物ストアのエラー。
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("missing {artifact} for podcast {podcast}: run `catalog-worker {command} {podcast}` first")]
    Missing {
        artifact: &'static str,
        command: &'static str,
        podcast: String,
    },
    #[error("failed to read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed JSON in {}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed embedding matrix in {}: {reason}", path.display())]
    Matrix { path: PathBuf, reason: String },
}

/// `{data_dir}/{podcast}/` 配下にステージ間の成果物を保存するストア。
///
/// すべての書き込みは隣接する一時ファイルに書いてから rename で確定するため、
/// 部分的に書かれた成果物が見えることはない。
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn podcast_dir(&self, podcast: &str) -> PathBuf {
        self.root.join(podcast)
    }

    #[must_use]
    pub fn episodes_path(&self, podcast: &str) -> PathBuf {
        self.podcast_dir(podcast).join("episodes.json")
    }

    #[must_use]
    pub fn embeddings_path(&self, podcast: &str) -> PathBuf {
        self.podcast_dir(podcast).join("embeddings.bin")
    }

    #[must_use]
    pub fn clustered_path(&self, podcast: &str) -> PathBuf {
        self.podcast_dir(podcast).join("clustered.json")
    }

    #[must_use]
    pub fn labeled_path(&self, podcast: &str) -> PathBuf {
        self.podcast_dir(podcast).join("labeled.json")
    }

    #[must_use]
    pub fn export_path(&self, podcast: &str) -> PathBuf {
        self.podcast_dir(podcast).join("api_output.json")
    }

    #[must_use]
    pub fn label_table_path(&self, podcast: &str) -> PathBuf {
        self.podcast_dir(podcast).join("labels.json")
    }

    #[must_use]
    pub fn chart_path(&self, podcast: &str) -> PathBuf {
        self.podcast_dir(podcast).join("k_selection.png")
    }

    /// チャート描画用の一時パスを返す。親ディレクトリも作成する。
    ///
    /// 拡張子からフォーマットを推論するレンダラ向けに `.png` のまま返す。
    ///
    /// # Errors
    /// ディレクトリ作成に失敗した場合は [`StoreError::Write`] を返す。
    pub fn chart_render_path(&self, podcast: &str) -> Result<PathBuf, StoreError> {
        let dir = self.podcast_dir(podcast);
        fs::create_dir_all(&dir).map_err(|source| StoreError::Write {
            path: dir.clone(),
            source,
        })?;
        Ok(dir.join("k_selection.tmp.png"))
    }

    /// 描画済みの一時チャートを最終パスへ rename で確定する。
    ///
    /// # Errors
    /// rename に失敗した場合は [`StoreError::Write`] を返す。
    pub fn commit_chart(&self, podcast: &str, rendered: &Path) -> Result<PathBuf, StoreError> {
        let path = self.chart_path(podcast);
        fs::rename(rendered, &path).map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// # Errors
    /// 書き込みに失敗した場合は [`StoreError`] を返す。
    pub fn write_episodes(
        &self,
        podcast: &str,
        episodes: &[Episode],
    ) -> Result<PathBuf, StoreError> {
        let path = self.episodes_path(podcast);
        self.write_json(&path, &episodes)?;
        Ok(path)
    }

    /// # Errors
    /// 成果物が存在しない場合は、先行コマンド名を含む [`StoreError::Missing`] を返す。
    pub fn read_episodes(&self, podcast: &str) -> Result<Vec<Episode>, StoreError> {
        self.read_json(&self.episodes_path(podcast), "episodes.json", "ingest", podcast)
    }

    /// # Errors
    /// 行列サイズが `u32` を超える場合や書き込みに失敗した場合はエラーを返す。
    pub fn write_embeddings(
        &self,
        podcast: &str,
        matrix: &EmbeddingMatrix,
    ) -> Result<PathBuf, StoreError> {
        let path = self.embeddings_path(podcast);
        let rows = u32::try_from(matrix.rows()).map_err(|_| StoreError::Matrix {
            path: path.clone(),
            reason: format!("row count {} exceeds u32", matrix.rows()),
        })?;
        let cols = u32::try_from(matrix.cols()).map_err(|_| StoreError::Matrix {
            path: path.clone(),
            reason: format!("column count {} exceeds u32", matrix.cols()),
        })?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + matrix.data().len() * 4);
        bytes.extend_from_slice(EMBEDDINGS_MAGIC);
        bytes.extend_from_slice(&EMBEDDINGS_VERSION.to_le_bytes());
        bytes.extend_from_slice(&rows.to_le_bytes());
        bytes.extend_from_slice(&cols.to_le_bytes());
        for value in matrix.data() {
            bytes.extend_from_slice(&value.to_le_bytes());
        }

        self.write_atomic(&path, &bytes)?;
        Ok(path)
    }

    /// # Errors
    /// 成果物が存在しない場合は [`StoreError::Missing`]、ヘッダやサイズが
    /// 一致しない場合は [`StoreError::Matrix`] を返す。
    pub fn read_embeddings(&self, podcast: &str) -> Result<EmbeddingMatrix, StoreError> {
        let path = self.embeddings_path(podcast);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(StoreError::Missing {
                    artifact: "embeddings.bin",
                    command: "embed",
                    podcast: podcast.to_string(),
                });
            }
            Err(source) => return Err(StoreError::Read { path, source }),
        };

        if bytes.len() < HEADER_LEN {
            return Err(StoreError::Matrix {
                path,
                reason: format!("truncated header: {} bytes", bytes.len()),
            });
        }
        if &bytes[0..4] != EMBEDDINGS_MAGIC {
            return Err(StoreError::Matrix {
                path,
                reason: "bad magic".to_string(),
            });
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != EMBEDDINGS_VERSION {
            return Err(StoreError::Matrix {
                path,
                reason: format!("unsupported version {version}"),
            });
        }
        let rows = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let cols = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]) as usize;
        let expected = HEADER_LEN + rows * cols * 4;
        if bytes.len() != expected {
            return Err(StoreError::Matrix {
                path,
                reason: format!(
                    "payload is {} bytes, expected {expected} for {rows}x{cols}",
                    bytes.len()
                ),
            });
        }

        let data = bytes[HEADER_LEN..]
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Ok(EmbeddingMatrix::from_raw(rows, cols, data))
    }

    /// # Errors
    /// 書き込みに失敗した場合は [`StoreError`] を返す。
    pub fn write_clustered(
        &self,
        podcast: &str,
        episodes: &[ClusteredEpisode],
    ) -> Result<PathBuf, StoreError> {
        let path = self.clustered_path(podcast);
        self.write_json(&path, &episodes)?;
        Ok(path)
    }

    /// # Errors
    /// 成果物が存在しない場合は、先行コマンド名を含む [`StoreError::Missing`] を返す。
    pub fn read_clustered(&self, podcast: &str) -> Result<Vec<ClusteredEpisode>, StoreError> {
        self.read_json(
            &self.clustered_path(podcast),
            "clustered.json",
            "cluster",
            podcast,
        )
    }

    /// # Errors
    /// 書き込みに失敗した場合は [`StoreError`] を返す。
    pub fn write_labeled(
        &self,
        podcast: &str,
        episodes: &[LabeledEpisode],
    ) -> Result<PathBuf, StoreError> {
        let path = self.labeled_path(podcast);
        self.write_json(&path, &episodes)?;
        Ok(path)
    }

    /// # Errors
    /// 成果物が存在しない場合は、先行コマンド名を含む [`StoreError::Missing`] を返す。
    pub fn read_labeled(&self, podcast: &str) -> Result<Vec<LabeledEpisode>, StoreError> {
        self.read_json(&self.labeled_path(podcast), "labeled.json", "label", podcast)
    }

    /// # Errors
    /// 書き込みに失敗した場合は [`StoreError`] を返す。
    pub fn write_export<T: Serialize>(
        &self,
        podcast: &str,
        payload: &T,
    ) -> Result<PathBuf, StoreError> {
        let path = self.export_path(podcast);
        self.write_json(&path, payload)?;
        Ok(path)
    }

    /// 運用者が用意する `cluster_id → label` テーブルを読む。
    /// 存在しない場合は `None`（呼び出し側が空テーブル扱いにする）。
    ///
    /// # Errors
    /// 読み取りまたは JSON のパースに失敗した場合はエラーを返す。
    pub fn read_label_table(
        &self,
        podcast: &str,
    ) -> Result<Option<HashMap<usize, String>>, StoreError> {
        let path = self.label_table_path(podcast);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Read { path, source }),
        };
        let table =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Json { path, source })?;
        Ok(Some(table))
    }

    fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        self.write_atomic(path, &bytes)
    }

    fn read_json<T: DeserializeOwned>(
        &self,
        path: &Path,
        artifact: &'static str,
        command: &'static str,
        podcast: &str,
    ) -> Result<T, StoreError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(StoreError::Missing {
                    artifact,
                    command,
                    podcast: podcast.to_string(),
                });
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let tmp = tmp_sibling(path);
        fs::write(&tmp, bytes).map_err(|source| StoreError::Write {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, path).map_err(|source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
