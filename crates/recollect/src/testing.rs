//! Test doubles for recollect
//!
//! - [`MockEmbedder`]: deterministic bag-of-words vectors, no model download
//! - [`ScriptedGenerator`]: replays canned model replies and records prompts

use async_trait::async_trait;
use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

use crate::conversation::{Conversation, Message};
use crate::embedding::{EMBEDDING_DIMENSION, Embedder, l2_normalize};
use crate::error::Result;
use crate::llm::{Generator, GeneratorError};

/// Mock embedder for fast unit tests that don't need real ML.
///
/// Each lower-cased word is hashed into one of 384 buckets, so texts sharing
/// words have a positive cosine similarity and identical texts score 1.0.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockEmbedder;

impl Embedder for MockEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; EMBEDDING_DIMENSION];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            v[(hasher.finish() % EMBEDDING_DIMENSION as u64) as usize] += 1.0;
        }

        if v.iter().all(|x| *x == 0.0) {
            v[0] = 1.0;
        }
        Ok(l2_normalize(v))
    }
}

/// Generator that answers with scripted replies, in order.
///
/// Replies are parsed like real model output, so they may contain `<think>`
/// blocks. Runs out with an `ApiError`.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<(Conversation, Option<String>)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ScriptedGenerator {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        lock(&self.replies).push_back(reply.into());
    }

    /// Number of `generate` calls so far
    pub fn calls(&self) -> usize {
        lock(&self.prompts).len()
    }

    /// Every conversation and context passed to `generate`, in call order
    pub fn prompts(&self) -> Vec<(Conversation, Option<String>)> {
        lock(&self.prompts).clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(
        &self,
        conversation: &Conversation,
        context: Option<&str>,
    ) -> std::result::Result<Message, GeneratorError> {
        lock(&self.prompts).push((conversation.clone(), context.map(str::to_string)));

        let reply = lock(&self.replies)
            .pop_front()
            .ok_or_else(|| GeneratorError::ApiError("No scripted reply left".to_string()))?;

        Ok(Message::from_model_output(&reply, context))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[test]
    fn mock_embedding_is_deterministic() {
        let a = MockEmbedder.embed("hello world").unwrap();
        let b = MockEmbedder.embed("Hello, world!").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIMENSION);
    }

    #[test]
    fn mock_embedding_is_normalized() {
        for text in ["", "one", "a much longer sentence with many words"] {
            let v = MockEmbedder.embed(text).unwrap();
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn mock_embedding_shared_words_are_closer() {
        let a = MockEmbedder.embed("rust ownership rules").unwrap();
        let b = MockEmbedder.embed("ownership rules in rust").unwrap();
        let c = MockEmbedder.embed("gardening").unwrap();
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[tokio::test]
    async fn scripted_generator_replays_in_order() {
        let generator = ScriptedGenerator::new(["<think>hmm</think>first"]);
        generator.push_reply("second");
        let conversation = Conversation::from_messages(vec![Message::user("hi")]);

        let first = generator.generate(&conversation, None).await.unwrap();
        assert_eq!(first.content, "first");
        assert_eq!(first.reasoning_text(), "hmm");

        let second = generator.generate(&conversation, Some("primed")).await.unwrap();
        assert_eq!(second.content, "second");
        assert_eq!(second.reasoning_text(), "primed");

        assert!(generator.generate(&conversation, None).await.is_err());
        assert_eq!(generator.calls(), 3);
        assert_eq!(generator.prompts()[1].1.as_deref(), Some("primed"));
    }
}
