//! BERT token-classification extractor (CoNLL-03 labels) running on candle

use candle_core::{DType, Device, Tensor};
use candle_nn::{Linear, Module, VarBuilder};
use candle_transformers::models::bert::{BertModel, Config as BertConfig, DTYPE};
use hf_hub::{Repo, RepoType, api::sync::Api};
use serde::Deserialize;
use std::collections::HashMap;
use tokenizers::Tokenizer;
use tracing::info;

use super::{Entity, EntityExtractor, EntityLabel};
use crate::error::{RecollectError, Result};

/// Default Hugging Face model
pub const DEFAULT_NER_MODEL: &str = "dslim/bert-base-NER";
const MODEL_REVISION: &str = "main";

fn extraction_err(context: &str, e: impl std::fmt::Display) -> RecollectError {
    RecollectError::Extraction(format!("{context}: {e}"))
}

#[derive(Deserialize)]
struct ModelConfig {
    #[serde(flatten)]
    bert_config: BertConfig,
    id2label: Option<HashMap<String, String>>,
}

/// Entity extractor backed by a BERT NER checkpoint
pub struct BertEntityExtractor {
    model: BertModel,
    classifier: Linear,
    tokenizer: Tokenizer,
    device: Device,
    id2label: HashMap<u32, String>,
}

impl BertEntityExtractor {
    pub fn new() -> Result<Self> {
        Self::from_hub(DEFAULT_NER_MODEL)
    }

    /// Download (or reuse the cached copy of) `model_id` and load it on CPU
    pub fn from_hub(model_id: &str) -> Result<Self> {
        let device = Device::Cpu;
        info!("Loading NER model {model_id}");

        let api = Api::new().map_err(|e| extraction_err("Failed to create HF API", e))?;
        let repo = api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            MODEL_REVISION.to_string(),
        ));

        let config_path = repo
            .get("config.json")
            .map_err(|e| extraction_err("Failed to download config", e))?;
        let tokenizer_path = repo
            .get("tokenizer.json")
            .or_else(|_| repo.get("onnx/tokenizer.json"))
            .map_err(|e| extraction_err("Failed to download tokenizer", e))?;
        let weights_path = repo
            .get("model.safetensors")
            .map_err(|e| extraction_err("Failed to download weights", e))?;

        let config_str = std::fs::read_to_string(&config_path)?;
        let model_config: ModelConfig = serde_json::from_str(&config_str)
            .map_err(|e| extraction_err("Failed to parse config", e))?;

        let id2label: HashMap<u32, String> = model_config
            .id2label
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(k, v)| k.parse::<u32>().ok().map(|id| (id, v)))
            .collect();

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| extraction_err("Failed to load tokenizer", e))?;

        // SAFETY: the safetensors file is owned by the hf-hub cache and not
        // modified while mapped.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], DTYPE, &device)
                .map_err(|e| extraction_err("Failed to load weights", e))?
        };

        let model = BertModel::load(vb.pp("bert"), &model_config.bert_config)
            .map_err(|e| extraction_err("Failed to load BERT model", e))?;

        let num_labels = if id2label.is_empty() { 9 } else { id2label.len() };
        let classifier = candle_nn::linear(
            model_config.bert_config.hidden_size,
            num_labels,
            vb.pp("classifier"),
        )
        .map_err(|e| extraction_err("Failed to load classifier", e))?;

        Ok(Self {
            model,
            classifier,
            tokenizer,
            device,
            id2label,
        })
    }

    fn tag(&self, id: u32) -> &str {
        self.id2label.get(&id).map(String::as_str).unwrap_or("O")
    }
}

impl EntityExtractor for BertEntityExtractor {
    fn extract(&self, text: &str) -> Result<Vec<Entity>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| extraction_err("Tokenization failed", e))?;

        let token_ids = encoding.get_ids();
        if token_ids.is_empty() {
            return Ok(Vec::new());
        }

        let input = Tensor::new(token_ids, &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(|e| extraction_err("Failed to build input tensor", e))?;
        let token_type_ids = input
            .zeros_like()
            .map_err(|e| extraction_err("Failed to build token types", e))?;

        let hidden = self
            .model
            .forward(&input, &token_type_ids, None)
            .map_err(|e| extraction_err("Model forward pass failed", e))?;
        let logits = self
            .classifier
            .forward(&hidden)
            .and_then(|l| l.squeeze(0))
            .map_err(|e| extraction_err("Classifier forward failed", e))?;

        let probabilities = candle_nn::ops::softmax(&logits, 1)
            .and_then(|p| p.to_dtype(DType::F32))
            .map_err(|e| extraction_err("Softmax failed", e))?;
        let predictions = logits
            .argmax(1)
            .and_then(|p| p.to_vec1::<u32>())
            .map_err(|e| extraction_err("Argmax failed", e))?;

        let confidences: Vec<f32> = (0..predictions.len())
            .map(|idx| {
                probabilities
                    .get(idx)
                    .and_then(|row| row.max(0))
                    .and_then(|t| t.to_scalar::<f32>())
                    .unwrap_or(0.0)
            })
            .collect();

        let tags: Vec<&str> = predictions.iter().map(|&id| self.tag(id)).collect();
        Ok(decode_bio(encoding.get_tokens(), &tags, &confidences))
    }
}

/// Entity being assembled from consecutive BIO tokens
struct Span {
    text: String,
    label: EntityLabel,
    confidences: Vec<f32>,
}

impl Span {
    fn finish(self) -> Entity {
        let confidence =
            self.confidences.iter().sum::<f32>() / self.confidences.len().max(1) as f32;
        Entity {
            text: clean_token_text(&self.text),
            label: self.label,
            confidence,
        }
    }
}

/// Merge word-piece tokens tagged `B-X`/`I-X` into entities
fn decode_bio(tokens: &[String], tags: &[&str], confidences: &[f32]) -> Vec<Entity> {
    let mut entities = Vec::new();
    let mut current: Option<Span> = None;

    for ((token, tag), &confidence) in tokens.iter().zip(tags).zip(confidences) {
        if matches!(token.as_str(), "[CLS]" | "[SEP]" | "[PAD]") {
            entities.extend(current.take().map(Span::finish));
            continue;
        }

        let label = EntityLabel::from_tag(tag);
        if tag.starts_with("B-") {
            entities.extend(current.take().map(Span::finish));
            current = label.map(|label| Span {
                text: token.clone(),
                label,
                confidences: vec![confidence],
            });
        } else if tag.starts_with("I-") {
            match current.as_mut() {
                Some(span) if Some(span.label) == label => {
                    match token.strip_prefix("##") {
                        Some(piece) => span.text.push_str(piece),
                        None => {
                            span.text.push(' ');
                            span.text.push_str(token);
                        }
                    }
                    span.confidences.push(confidence);
                }
                _ => entities.extend(current.take().map(Span::finish)),
            }
        } else {
            entities.extend(current.take().map(Span::finish));
        }
    }

    entities.extend(current.map(Span::finish));
    entities
}

fn clean_token_text(text: &str) -> String {
    text.replace(" ##", "").replace("##", "").trim().to_string()
}
