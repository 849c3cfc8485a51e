//! Conversation service: runs the RAG pipeline, calls the model, and
//! records turns.
//!
//! Multi-turn context is reconstructed by replaying prior turns into the
//! model's chat interface, bounded by a token budget (newest turns kept).
//! Streaming answers are forwarded as typed frames; the completed text is
//! recorded as a turn once the stream finishes.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use crate::bus::ProgressBus;
use crate::context::Citation;
use crate::embedding::estimate_tokens;
use crate::error::{RecallError, Result};
use crate::llm::{ChatMessage, LlmProvider, StreamEvent};
use crate::models::ConversationTurn;
use crate::rag::{RagOutput, RagPipeline};
use crate::store::DocumentStore;

/// Token budget for replayed history.
const HISTORY_TOKEN_BUDGET: i64 = 4_000;

/// Turns fetched per history query.
const HISTORY_FETCH_LIMIT: i64 = 50;

/// Summary of retrieval attached to a chat response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSummary {
    pub documents_used: usize,
    pub total_documents: usize,
    pub selected_documents: usize,
}

/// Metadata attached to a chat response.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseMetadata {
    pub intent: String,
    pub tokens: i64,
    #[serde(rename = "duration")]
    pub duration_ms: u128,
    pub model: String,
}

/// A completed (non-streaming) chat exchange.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatOutcome {
    pub query_id: String,
    pub conversation_id: String,
    pub response: String,
    pub context: ContextSummary,
    pub metadata: ResponseMetadata,
    pub citations: Vec<Citation>,
}

/// One frame of a streaming chat response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub query_id: String,
    pub data: serde_json::Value,
}

pub struct ChatService {
    store: DocumentStore,
    rag: Arc<RagPipeline>,
    llm: Arc<dyn LlmProvider>,
    bus: ProgressBus,
}

impl ChatService {
    pub fn new(
        store: DocumentStore,
        rag: Arc<RagPipeline>,
        llm: Arc<dyn LlmProvider>,
        bus: ProgressBus,
    ) -> Self {
        Self {
            store,
            rag,
            llm,
            bus,
        }
    }

    /// Answer a message, blocking until the full response is ready.
    pub async fn handle_message(
        &self,
        user_id: &str,
        message: &str,
        conversation_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<ChatOutcome> {
        let query_id = Uuid::new_v4().to_string();
        let conversation_id = self.resolve_conversation(user_id, conversation_id).await?;

        let rag = match self.rag.run(user_id, &query_id, message).await {
            Ok(output) => output,
            Err(e) => {
                self.bus
                    .rag_error(&query_id, user_id, json!({ "error": e.to_string() }));
                return Err(e);
            }
        };

        let messages = self
            .messages_with_history(&conversation_id, &rag.prompt)
            .await?;
        let generation = match self.llm.chat(&messages, cancel).await {
            Ok(g) => g,
            Err(e) => {
                self.bus
                    .rag_error(&query_id, user_id, json!({ "error": e.to_string() }));
                return Err(e);
            }
        };

        self.record_turn(&conversation_id, user_id, message, &generation.text, &rag)
            .await;

        self.bus.rag_complete(
            &query_id,
            user_id,
            json!({
                "selected": rag.context.selected,
                "tokens": generation.completion_tokens,
            }),
        );

        Ok(ChatOutcome {
            query_id,
            conversation_id,
            response: generation.text,
            context: ContextSummary {
                documents_used: rag.context.selected,
                total_documents: rag.retrieval.candidates,
                selected_documents: rag.context.selected,
            },
            metadata: ResponseMetadata {
                intent: rag.processed_query.intent.as_str().to_string(),
                tokens: generation.prompt_tokens + generation.completion_tokens,
                duration_ms: generation.duration.as_millis(),
                model: generation.model,
            },
            citations: rag.citations,
        })
    }

    /// Answer a message as a frame stream: one `context` frame, then
    /// `text` frames, terminated by `done` (or a final `error`).
    pub async fn handle_message_stream(
        &self,
        user_id: &str,
        message: &str,
        conversation_id: Option<String>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamFrame>> {
        let query_id = Uuid::new_v4().to_string();
        let conversation_id = self.resolve_conversation(user_id, conversation_id).await?;

        let rag = match self.rag.run(user_id, &query_id, message).await {
            Ok(output) => output,
            Err(e) => {
                self.bus
                    .rag_error(&query_id, user_id, json!({ "error": e.to_string() }));
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(32);

        let context_frame = StreamFrame {
            frame_type: "context".to_string(),
            query_id: query_id.clone(),
            data: json!({
                "citations": &rag.citations,
                "documentsUsed": rag.context.selected,
                "totalDocuments": rag.retrieval.candidates,
            }),
        };
        let _ = tx.send(context_frame).await;

        let mut llm_rx = self.llm.generate_stream(&rag.prompt, &cancel).await?;

        let store = self.store.clone();
        let bus = self.bus.clone();
        let user = user_id.to_string();
        let question = message.to_string();
        let qid = query_id;
        tokio::spawn(async move {
            let mut answer = String::new();
            while let Some(event) = llm_rx.recv().await {
                match event {
                    StreamEvent::Text(chunk) => {
                        answer.push_str(&chunk);
                        let frame = StreamFrame {
                            frame_type: "text".to_string(),
                            query_id: qid.clone(),
                            data: json!({ "text": chunk }),
                        };
                        if tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                    StreamEvent::Done => {
                        record_turn_inner(
                            &store,
                            &conversation_id,
                            &user,
                            &question,
                            &answer,
                            &rag,
                        )
                        .await;
                        bus.rag_complete(&qid, &user, json!({ "selected": rag.context.selected }));
                        let _ = tx
                            .send(StreamFrame {
                                frame_type: "done".to_string(),
                                query_id: qid.clone(),
                                data: json!({ "conversationId": conversation_id }),
                            })
                            .await;
                        return;
                    }
                    StreamEvent::Error(message) => {
                        bus.rag_error(&qid, &user, json!({ "error": message }));
                        let _ = tx
                            .send(StreamFrame {
                                frame_type: "error".to_string(),
                                query_id: qid.clone(),
                                data: json!({ "error": message }),
                            })
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    /// Allocate a conversation id.
    pub async fn create_conversation(&self, user_id: &str) -> Result<String> {
        self.store.create_conversation(user_id).await
    }

    /// Chronological turns for a conversation.
    pub async fn history(
        &self,
        conversation_id: &str,
        limit: i64,
    ) -> Result<Vec<ConversationTurn>> {
        if !self.store.conversation_exists(conversation_id).await? {
            return Err(RecallError::not_found(format!(
                "conversation {conversation_id}"
            )));
        }
        self.store.list_turns(conversation_id, limit).await
    }

    async fn resolve_conversation(
        &self,
        user_id: &str,
        conversation_id: Option<String>,
    ) -> Result<String> {
        match conversation_id {
            Some(id) => {
                if !self.store.conversation_exists(&id).await? {
                    return Err(RecallError::not_found(format!("conversation {id}")));
                }
                Ok(id)
            }
            None => self.store.create_conversation(user_id).await,
        }
    }

    /// Replay prior turns (newest first within the token budget) ahead of
    /// the current prompt.
    async fn messages_with_history(
        &self,
        conversation_id: &str,
        prompt: &str,
    ) -> Result<Vec<ChatMessage>> {
        let turns = self
            .store
            .list_turns(conversation_id, HISTORY_FETCH_LIMIT)
            .await?;

        let mut budget = HISTORY_TOKEN_BUDGET;
        let mut replayed: Vec<ChatMessage> = Vec::new();
        for turn in turns.iter().rev() {
            let cost = estimate_tokens(&turn.query) + estimate_tokens(&turn.answer);
            if budget - cost < 0 {
                break;
            }
            budget -= cost;
            replayed.push(ChatMessage::assistant(turn.answer.clone()));
            replayed.push(ChatMessage::user(turn.query.clone()));
        }
        replayed.reverse();

        replayed.push(ChatMessage::user(prompt));
        Ok(replayed)
    }

    async fn record_turn(
        &self,
        conversation_id: &str,
        user_id: &str,
        query: &str,
        answer: &str,
        rag: &RagOutput,
    ) {
        record_turn_inner(&self.store, conversation_id, user_id, query, answer, rag).await;
    }
}

async fn record_turn_inner(
    store: &DocumentStore,
    conversation_id: &str,
    user_id: &str,
    query: &str,
    answer: &str,
    rag: &RagOutput,
) {
    let turn = ConversationTurn {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_string(),
        user_id: user_id.to_string(),
        query: query.to_string(),
        answer: answer.to_string(),
        metadata: json!({
            "intent": rag.processed_query.intent.as_str(),
            "strategy": rag.retrieval.strategy,
            "citations": rag.citations.len(),
            "fallback": rag.retrieval.fallback_used,
        }),
        created_at: Utc::now(),
    };
    if let Err(e) = store.append_turn(&turn).await {
        error!(conversation_id, error = %e, "failed to record conversation turn");
    }
    if turn.answer.is_empty() {
        warn!(conversation_id, "recorded turn with empty answer");
    }
}
