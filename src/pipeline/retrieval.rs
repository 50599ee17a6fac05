//! Retrieval-augmented reply generation.
//!
//! Embeds the inbound message, cosine-filters the active knowledge base,
//! and requests a grounded completion. With no entry above the threshold
//! the completion still runs ungrounded. Any embed/complete failure
//! surfaces as a retrieval error and no reply is dispatched for the event.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::config::RagConfig;
use crate::error::PipelineError;
use crate::llm::provider::{ChatMessage, CompletionModel, CompletionRequest, EmbeddingModel};
use crate::store::Store;
use crate::store::models::{Conversation, NewRagQueryLog, RagSource};

/// A grounded (or gracefully ungrounded) reply.
#[derive(Debug, Clone)]
pub struct RagReply {
    pub answer: String,
    /// Coarse length-derived proxy, not a calibrated probability.
    pub confidence: f32,
    /// Cited knowledge entries, descending by similarity.
    pub sources: Vec<RagSource>,
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Derive a confidence score from the answer length.
fn confidence_from_length(answer: &str) -> f32 {
    let len = answer.chars().count();
    if len >= 100 {
        0.9
    } else if len >= 50 {
        0.7
    } else if len >= 20 {
        0.5
    } else {
        0.3
    }
}

/// Orchestrates knowledge retrieval and grounded completion.
pub struct RetrievalOrchestrator {
    store: Arc<dyn Store>,
    completion: Arc<dyn CompletionModel>,
    embedding: Arc<dyn EmbeddingModel>,
    config: RagConfig,
    temperature: f32,
    max_tokens: u32,
}

impl RetrievalOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        completion: Arc<dyn CompletionModel>,
        embedding: Arc<dyn EmbeddingModel>,
        config: RagConfig,
        temperature: f32,
        max_tokens: u32,
    ) -> Self {
        Self {
            store,
            completion,
            embedding,
            config,
            temperature,
            max_tokens,
        }
    }

    /// Produce a reply for the inbound message body.
    pub async fn respond(
        &self,
        conversation: &Conversation,
        body: &str,
    ) -> Result<RagReply, PipelineError> {
        let started = Instant::now();

        let query_embedding = self
            .embedding
            .embed(body)
            .await
            .map_err(|e| PipelineError::Retrieval(format!("embedding: {e}")))?;

        let entries = self
            .store
            .get_active_knowledge_entries()
            .await
            .map_err(|e| PipelineError::Retrieval(format!("knowledge fetch: {e}")))?;

        // Cosine-filter entries that carry an embedding, best first.
        let mut scored: Vec<(usize, f32)> = entries
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| {
                let embedding = entry.embedding.as_ref()?;
                let similarity = cosine_similarity(&query_embedding, embedding);
                (similarity >= self.config.similarity_threshold).then_some((i, similarity))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.config.top_k);

        let sources: Vec<RagSource> = scored
            .iter()
            .map(|&(i, similarity)| RagSource {
                entry_id: entries[i].id.clone(),
                similarity,
            })
            .collect();

        let mut messages = vec![ChatMessage::system(self.config.system_prompt.clone())];
        if let Some(summary) = conversation.summary.as_deref() {
            messages.push(ChatMessage::system(format!(
                "Conversation so far: {summary}"
            )));
        }
        if !scored.is_empty() {
            let context_block: String = scored
                .iter()
                .map(|&(i, _)| {
                    let entry = &entries[i];
                    format!("### {}\n{}", entry.title, entry.content)
                })
                .collect::<Vec<_>>()
                .join("\n\n");
            messages.push(ChatMessage::system(format!(
                "Reference material:\n\n{context_block}"
            )));
            debug!(
                conversation_id = %conversation.id,
                entries = scored.len(),
                top_similarity = scored[0].1,
                "Context block built"
            );
        } else {
            debug!(
                conversation_id = %conversation.id,
                "No knowledge entry above threshold, answering ungrounded"
            );
        }
        messages.push(ChatMessage::user(body.to_string()));

        let request = CompletionRequest::new(messages)
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens);

        let response = self
            .completion
            .complete(request)
            .await
            .map_err(|e| PipelineError::Retrieval(format!("completion: {e}")))?;

        let answer = response.content;
        let confidence = confidence_from_length(&answer);
        let latency_ms = started.elapsed().as_millis() as i64;

        // Audit is best-effort: a reply exists, so a failed log write must
        // not turn into a retrieval failure.
        if let Err(e) = self
            .store
            .create_rag_query_log(NewRagQueryLog {
                conversation_id: conversation.id.clone(),
                query: body.to_string(),
                answer: answer.clone(),
                sources: sources.clone(),
                latency_ms,
            })
            .await
        {
            warn!(conversation_id = %conversation.id, error = %e, "RAG audit write failed");
        }

        Ok(RagReply {
            answer,
            confidence,
            sources,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::provider::CompletionResponse;
    use crate::store::LibSqlStore;
    use crate::store::models::{
        ConversationStatus, NewContact, NewKnowledgeEntry, Priority,
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    struct MockCompletion {
        reply: String,
        fail: bool,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl MockCompletion {
        fn replying(reply: &str) -> Self {
            Self {
                reply: reply.into(),
                fail: false,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                reply: String::new(),
                fail: true,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CompletionModel for MockCompletion {
        fn model_name(&self) -> &str {
            "mock-chat"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            if self.fail {
                return Err(LlmError::RequestFailed {
                    provider: "mock".into(),
                    reason: "down".into(),
                });
            }
            self.requests.lock().unwrap().push(request);
            Ok(CompletionResponse {
                content: self.reply.clone(),
                input_tokens: 10,
                output_tokens: 10,
            })
        }
    }

    struct MockEmbedding {
        vector: Vec<f32>,
        fail: bool,
    }

    #[async_trait]
    impl EmbeddingModel for MockEmbedding {
        fn model_name(&self) -> &str {
            "mock-embed"
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, LlmError> {
            if self.fail {
                return Err(LlmError::RequestFailed {
                    provider: "mock".into(),
                    reason: "down".into(),
                });
            }
            Ok(self.vector.clone())
        }
    }

    fn conv_stub() -> Conversation {
        Conversation {
            id: "conv-1".into(),
            contact_id: "contact-1".into(),
            status: ConversationStatus::Active,
            priority: Priority::Medium,
            tags: vec![],
            summary: None,
            sentiment: None,
            assigned_agent: None,
            last_message_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn store_with_entry(embedding: Option<Vec<f32>>, active: bool) -> Arc<dyn Store> {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        // A contact/conversation so audit rows have something to refer to
        let contact = store
            .create_contact(NewContact {
                phone: "+5511999990000".into(),
                display_name: "Maria".into(),
                tags: vec![],
            })
            .await
            .unwrap();
        store.create_conversation(&contact.id).await.unwrap();
        store
            .create_knowledge_entry(NewKnowledgeEntry {
                title: "Horário de atendimento".into(),
                content: "Atendemos de segunda a sexta, das 9h às 18h.".into(),
                category: Some("faq".into()),
                tags: vec![],
                embedding,
                active,
            })
            .await
            .unwrap();
        store
    }

    fn orchestrator(
        store: Arc<dyn Store>,
        completion: Arc<MockCompletion>,
        embedding: Arc<MockEmbedding>,
    ) -> RetrievalOrchestrator {
        RetrievalOrchestrator::new(
            store,
            completion,
            embedding,
            RagConfig::default(),
            0.4,
            512,
        )
    }

    // ── Scoring primitives ──────────────────────────────────────────

    #[test]
    fn cosine_identical_orthogonal_mismatched() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn confidence_ladder() {
        assert!((confidence_from_length(&"x".repeat(150)) - 0.9).abs() < f32::EPSILON);
        assert!((confidence_from_length(&"x".repeat(60)) - 0.7).abs() < f32::EPSILON);
        assert!((confidence_from_length(&"x".repeat(25)) - 0.5).abs() < f32::EPSILON);
        assert!((confidence_from_length("curto") - 0.3).abs() < f32::EPSILON);
    }

    // ── End-to-end respond() ────────────────────────────────────────

    #[tokio::test]
    async fn grounded_reply_includes_context_and_sources() {
        // Entry embedding identical to query embedding → similarity 1.0
        let store = store_with_entry(Some(vec![1.0, 0.0, 0.0]), true).await;
        let completion = Arc::new(MockCompletion::replying(
            "Atendemos de segunda a sexta, das 9h às 18h. Posso ajudar com algo mais?",
        ));
        let embedding = Arc::new(MockEmbedding {
            vector: vec![1.0, 0.0, 0.0],
            fail: false,
        });
        let orch = orchestrator(store.clone(), completion.clone(), embedding);

        let reply = orch
            .respond(&conv_stub(), "qual o horário de vocês?")
            .await
            .unwrap();

        assert_eq!(reply.sources.len(), 1);
        assert!(reply.sources[0].similarity > 0.99);
        assert!((reply.confidence - 0.7).abs() < f32::EPSILON);

        // Completion saw persona, context block, then the user message
        let requests = completion.requests.lock().unwrap();
        let messages = &requests[0].messages;
        assert_eq!(messages.len(), 3);
        assert!(messages[1].content.contains("Reference material"));
        assert!(messages[1].content.contains("das 9h às 18h"));
        assert_eq!(messages[2].content, "qual o horário de vocês?");
        assert_eq!(requests[0].temperature, Some(0.4));
        assert_eq!(requests[0].max_tokens, Some(512));
    }

    #[tokio::test]
    async fn below_threshold_answers_ungrounded() {
        // Orthogonal embedding → similarity 0 < 0.7
        let store = store_with_entry(Some(vec![0.0, 1.0, 0.0]), true).await;
        let completion = Arc::new(MockCompletion::replying("Posso ajudar?"));
        let embedding = Arc::new(MockEmbedding {
            vector: vec![1.0, 0.0, 0.0],
            fail: false,
        });
        let orch = orchestrator(store, completion.clone(), embedding);

        let reply = orch.respond(&conv_stub(), "oi").await.unwrap();
        assert!(reply.sources.is_empty());
        assert_eq!(reply.answer, "Posso ajudar?");

        // No context system message: persona + user only
        let requests = completion.requests.lock().unwrap();
        assert_eq!(requests[0].messages.len(), 2);
    }

    #[tokio::test]
    async fn entries_without_embedding_are_excluded() {
        let store = store_with_entry(None, true).await;
        let completion = Arc::new(MockCompletion::replying("ok"));
        let embedding = Arc::new(MockEmbedding {
            vector: vec![1.0, 0.0, 0.0],
            fail: false,
        });
        let orch = orchestrator(store, completion, embedding);

        let reply = orch.respond(&conv_stub(), "oi").await.unwrap();
        assert!(reply.sources.is_empty());
    }

    #[tokio::test]
    async fn top_k_caps_context_entries() {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        for i in 0..8 {
            store
                .create_knowledge_entry(NewKnowledgeEntry {
                    title: format!("Entry {i}"),
                    // Descending similarity as i grows
                    content: "conteúdo".into(),
                    category: None,
                    tags: vec![],
                    embedding: Some(vec![1.0, i as f32 * 0.1]),
                    active: true,
                })
                .await
                .unwrap();
        }
        let completion = Arc::new(MockCompletion::replying("ok"));
        let embedding = Arc::new(MockEmbedding {
            vector: vec![1.0, 0.0],
            fail: false,
        });
        let orch = orchestrator(store, completion, embedding);

        let reply = orch.respond(&conv_stub(), "oi").await.unwrap();
        assert_eq!(reply.sources.len(), 5, "top-k default is 5");
        // Sources are in descending similarity order
        for pair in reply.sources.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
        }
    }

    #[tokio::test]
    async fn rag_audit_row_is_written() {
        let store = store_with_entry(Some(vec![1.0, 0.0, 0.0]), true).await;
        let completion = Arc::new(MockCompletion::replying("resposta"));
        let embedding = Arc::new(MockEmbedding {
            vector: vec![1.0, 0.0, 0.0],
            fail: false,
        });
        let orch = orchestrator(store.clone(), completion, embedding);

        orch.respond(&conv_stub(), "qual o horário?").await.unwrap();

        let logs = store.list_rag_query_logs("conv-1").await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].query, "qual o horário?");
        assert_eq!(logs[0].answer, "resposta");
        assert_eq!(logs[0].sources.len(), 1);
    }

    #[tokio::test]
    async fn embedding_failure_is_retrieval_error() {
        let store = store_with_entry(Some(vec![1.0, 0.0, 0.0]), true).await;
        let completion = Arc::new(MockCompletion::replying("x"));
        let embedding = Arc::new(MockEmbedding {
            vector: vec![],
            fail: true,
        });
        let orch = orchestrator(store, completion, embedding);

        let err = orch.respond(&conv_stub(), "oi").await.unwrap_err();
        assert!(matches!(err, PipelineError::Retrieval(_)));
    }

    #[tokio::test]
    async fn completion_failure_is_retrieval_error() {
        let store = store_with_entry(Some(vec![1.0, 0.0, 0.0]), true).await;
        let completion = Arc::new(MockCompletion::failing());
        let embedding = Arc::new(MockEmbedding {
            vector: vec![1.0, 0.0, 0.0],
            fail: false,
        });
        let orch = orchestrator(store, completion, embedding);

        let err = orch.respond(&conv_stub(), "oi").await.unwrap_err();
        assert!(matches!(err, PipelineError::Retrieval(_)));
    }

    #[tokio::test]
    async fn summary_is_passed_as_system_context() {
        let store = store_with_entry(Some(vec![0.0, 1.0, 0.0]), true).await;
        let completion = Arc::new(MockCompletion::replying("ok"));
        let embedding = Arc::new(MockEmbedding {
            vector: vec![1.0, 0.0, 0.0],
            fail: false,
        });
        let orch = orchestrator(store, completion.clone(), embedding);

        let mut conv = conv_stub();
        conv.summary = Some("Cliente perguntou sobre preços.".into());
        orch.respond(&conv, "e o horário?").await.unwrap();

        let requests = completion.requests.lock().unwrap();
        assert!(
            requests[0].messages[1]
                .content
                .contains("Cliente perguntou sobre preços.")
        );
    }
}
