/// Composer: outbound draft and send state, one per conversation
use crate::api::MessagingBackend;
use crate::conversation_store::ConversationStore;
use crate::error::Result;
use crate::messenger_types::{Message, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Send state of one conversation's composer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ComposerStatus {
    #[default]
    Idle,
    Sending,
    /// Last send failed; the draft is kept for a manual retry
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposerState {
    pub draft: String,
    pub status: ComposerStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Server confirmed the message; it is already merged into the store
    Sent(Message),
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    EmptyDraft,
    AlreadySending,
}

#[derive(Clone)]
pub struct Composer {
    backend: Arc<dyn MessagingBackend>,
    store: ConversationStore,
    states: Arc<Mutex<HashMap<UserId, ComposerState>>>,
}

impl Composer {
    pub fn new(backend: Arc<dyn MessagingBackend>, store: ConversationStore) -> Self {
        Self {
            backend,
            store,
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn state(&self, peer_id: UserId) -> ComposerState {
        self.states
            .lock()
            .await
            .get(&peer_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace the draft. Editing acknowledges a previous failure.
    pub async fn set_draft(&self, peer_id: UserId, text: impl Into<String>) {
        let mut states = self.states.lock().await;
        let state = states.entry(peer_id).or_default();
        state.draft = text.into();
        if matches!(state.status, ComposerStatus::Failed(_)) {
            state.status = ComposerStatus::Idle;
        }
    }

    /// `Failed -> Idle` without touching the draft
    pub async fn dismiss_error(&self, peer_id: UserId) {
        let mut states = self.states.lock().await;
        if let Some(state) = states.get_mut(&peer_id) {
            if matches!(state.status, ComposerStatus::Failed(_)) {
                state.status = ComposerStatus::Idle;
            }
        }
    }

    /// Send the current draft. At most one send is in flight per conversation;
    /// failures keep the draft and are never retried automatically.
    pub async fn submit(&self, peer_id: UserId) -> Result<SubmitOutcome> {
        let content = {
            let mut states = self.states.lock().await;
            let state = states.entry(peer_id).or_default();
            if state.status == ComposerStatus::Sending {
                return Ok(SubmitOutcome::Ignored(IgnoreReason::AlreadySending));
            }
            let content = state.draft.trim().to_string();
            if content.is_empty() {
                return Ok(SubmitOutcome::Ignored(IgnoreReason::EmptyDraft));
            }
            state.status = ComposerStatus::Sending;
            content
        };
        debug!("Sending {} chars to {}", content.len(), peer_id);

        let sent = self.backend.send_message(peer_id, &content).await;

        match sent {
            Ok(message) => {
                {
                    let mut states = self.states.lock().await;
                    let state = states.entry(peer_id).or_default();
                    state.status = ComposerStatus::Idle;
                    // Keep edits made while the send was in flight.
                    if state.draft.trim() == content {
                        state.draft.clear();
                    }
                }
                self.store.merge_incoming(message.clone()).await;
                Ok(SubmitOutcome::Sent(message))
            }
            Err(e) => {
                warn!("Send to {} failed: {}", peer_id, e);
                let mut states = self.states.lock().await;
                states.entry(peer_id).or_default().status = ComposerStatus::Failed(e.to_string());
                Err(e)
            }
        }
    }
}
