use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use rust_bert::pipelines::sentence_embeddings::{
    SentenceEmbeddingsBuilder, SentenceEmbeddingsModel, SentenceEmbeddingsModelType,
};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::pipeline::RunContext;

#[async_trait]
pub trait EmbedStage: Send + Sync {
    async fn embed(&self, ctx: &RunContext, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

/// Embedding generation service using rust-bert.
/// This runs on CPU.
#[derive(Clone)]
pub struct EmbeddingService {
    model: Arc<Mutex<SentenceEmbeddingsModel>>,
}

impl std::fmt::Debug for EmbeddingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingService")
            .field("model", &"<SentenceEmbeddingsModel>")
            .finish()
    }
}

impl EmbeddingService {
    /// Initialize the embedding model.
    /// This might take a while to download the model on first run.
    ///
    /// # Errors
    /// Returns an error when the model cannot be downloaded or loaded.
    pub fn new(model_type: SentenceEmbeddingsModelType) -> Result<Self> {
        // Use a separate thread to initialize the model because it's blocking and heavy
        let model = std::thread::spawn(move || {
            SentenceEmbeddingsBuilder::remote(model_type).create_model()
        })
        .join()
        .map_err(|_| anyhow::anyhow!("Failed to join model creation thread"))??;

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
        })
    }

    /// Generate embeddings for a batch of texts.
    ///
    /// # Errors
    /// Returns an error when encoding fails or the blocking task is cancelled.
    pub async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.model.clone();
        let texts = texts.to_vec();

        // Offload to blocking thread
        tokio::task::spawn_blocking(move || {
            let model = model.blocking_lock();
            model.encode(&texts)
        })
        .await
        .context("Failed to join embedding task")?
        .context("Failed to encode texts")
    }
}

/// 設定されたモデルでエピソードテキストをベクトル化するステージ。
///
/// モデルのロードは初回の `embed` 呼び出しまで遅延させる。ロードを伴わない
/// コマンドの起動を重くしないためのもの。
pub(crate) struct RustBertEmbedStage {
    model_name: String,
    text_prefix: Option<String>,
    batch_size: NonZeroUsize,
    service: OnceCell<EmbeddingService>,
}

impl RustBertEmbedStage {
    pub(crate) fn new(
        model_name: String,
        text_prefix: Option<String>,
        batch_size: NonZeroUsize,
    ) -> Self {
        Self {
            model_name,
            text_prefix,
            batch_size,
            service: OnceCell::new(),
        }
    }
}

#[async_trait]
impl EmbedStage for RustBertEmbedStage {
    async fn embed(&self, ctx: &RunContext, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let inputs = apply_prefix(self.text_prefix.as_deref(), texts);

        let service = self
            .service
            .get_or_try_init(|| async {
                let model_type = model_type_from_name(&self.model_name)?;
                info!(model = %self.model_name, "loading sentence embedding model");
                EmbeddingService::new(model_type)
            })
            .await?;

        let mut vectors = Vec::with_capacity(inputs.len());
        for (index, batch) in inputs.chunks(self.batch_size.get()).enumerate() {
            debug!(
                run_id = %ctx.run_id,
                batch = index,
                size = batch.len(),
                "encoding batch"
            );
            vectors.extend(service.encode(batch).await?);
        }
        Ok(vectors)
    }
}

fn apply_prefix(prefix: Option<&str>, texts: &[String]) -> Vec<String> {
    match prefix {
        Some(prefix) => texts.iter().map(|text| format!("{prefix}{text}")).collect(),
        None => texts.to_vec(),
    }
}

/// モデル設定値をrust-bertのモデル種別へ対応付ける。
fn model_type_from_name(name: &str) -> Result<SentenceEmbeddingsModelType> {
    let model_type = match name {
        "distiluse-base-multilingual-cased" => {
            SentenceEmbeddingsModelType::DistiluseBaseMultilingualCased
        }
        "bert-base-nli-mean-tokens" => SentenceEmbeddingsModelType::BertBaseNliMeanTokens,
        "all-minilm-l12-v2" => SentenceEmbeddingsModelType::AllMiniLmL12V2,
        "all-minilm-l6-v2" => SentenceEmbeddingsModelType::AllMiniLmL6V2,
        "all-distilroberta-v1" => SentenceEmbeddingsModelType::AllDistilrobertaV1,
        "paraphrase-albert-small-v2" => SentenceEmbeddingsModelType::ParaphraseAlbertSmallV2,
        "sentence-t5-base" => SentenceEmbeddingsModelType::SentenceT5Base,
        other => bail!("unsupported embedding model: {other}"),
    };
    Ok(model_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_type_from_name_accepts_known_models() {
        assert!(model_type_from_name("distiluse-base-multilingual-cased").is_ok());
        assert!(model_type_from_name("all-minilm-l12-v2").is_ok());
    }

    #[test]
    fn model_type_from_name_rejects_unknown_models() {
        let error = model_type_from_name("word2vec")
            .err()
            .expect("unknown model");

        assert!(error.to_string().contains("word2vec"));
    }

    #[test]
    fn apply_prefix_prepends_to_every_text() {
        let texts = vec!["기생충".to_string(), "올드보이".to_string()];

        let prefixed = apply_prefix(Some("query: "), &texts);

        assert_eq!(prefixed, vec!["query: 기생충", "query: 올드보이"]);
    }

    #[test]
    fn apply_prefix_is_identity_without_a_prefix() {
        let texts = vec!["기생충".to_string()];

        assert_eq!(apply_prefix(None, &texts), texts);
    }
}
