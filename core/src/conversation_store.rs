/// Conversation store: one ordered, de-duplicated message sequence per peer
///
/// Two writers touch a conversation: `load_history` (replace, from REST) and
/// `merge_incoming` (insert, from push frames and send confirmations). Both go
/// through the same lock, and no lock is held across a REST await.
use crate::api::MessagingBackend;
use crate::error::{FluxError, Result};
use crate::messenger_types::{
    Actor, ConversationEvent, ConversationKey, ConversationSummary, Message, UserId,
};
use crate::peer_directory::PeerDirectory;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Result of merging one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted { index: usize },
    Duplicate,
}

/// Read-only copy of one conversation
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    pub key: ConversationKey,
    pub messages: Vec<Message>,
    pub loaded: bool,
    pub unread: usize,
}

#[derive(Default)]
struct Conversation {
    messages: Vec<Message>,
    loaded: bool,
    unread: usize,
    /// History fetches issued but not yet resolved
    in_flight: usize,
    /// Ticket of the newest fetch whose result was applied
    applied_ticket: u64,
    /// Messages merged while a fetch was in flight, re-applied on top of its result
    merged_during_fetch: Vec<Message>,
}

#[derive(Default)]
struct StoreState {
    conversations: HashMap<ConversationKey, Conversation>,
    active: Option<UserId>,
    next_ticket: u64,
}

#[derive(Clone)]
pub struct ConversationStore {
    actor: Actor,
    backend: Arc<dyn MessagingBackend>,
    directory: PeerDirectory,
    state: Arc<RwLock<StoreState>>,
    events: broadcast::Sender<ConversationEvent>,
}

impl ConversationStore {
    pub fn new(actor: Actor, backend: Arc<dyn MessagingBackend>, directory: PeerDirectory) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            actor,
            backend,
            directory,
            state: Arc::new(RwLock::new(StoreState::default())),
            events,
        }
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn key_for(&self, peer_id: UserId) -> ConversationKey {
        ConversationKey::new(self.actor.id, peer_id)
    }

    /// Fetch authoritative history for `peer_id` and replace the local sequence.
    ///
    /// Fails with `Superseded` when the selection moved to another peer (or a
    /// newer fetch for the same conversation landed) while this one was in
    /// flight; the stored sequence is left untouched in that case.
    pub async fn load_history(&self, peer_id: UserId) -> Result<Vec<Message>> {
        let key = self.key_for(peer_id);
        let ticket = {
            let mut state = self.state.write().await;
            state.next_ticket += 1;
            let ticket = state.next_ticket;
            let conv = state.conversations.entry(key).or_default();
            if conv.in_flight == 0 {
                conv.merged_during_fetch.clear();
            }
            conv.in_flight += 1;
            ticket
        };
        debug!("Loading history for {} (ticket {})", key, ticket);

        let fetched = self.backend.conversation(peer_id).await;

        let mut state = self.state.write().await;
        let active = state.active;
        let conv = state.conversations.entry(key).or_default();
        conv.in_flight = conv.in_flight.saturating_sub(1);

        let fetched = match fetched {
            Ok(messages) => messages,
            Err(e) => {
                if conv.in_flight == 0 {
                    conv.merged_during_fetch.clear();
                }
                warn!("History fetch for {} failed: {}", key, e);
                return Err(e);
            }
        };

        let selection_moved = matches!(active, Some(current) if current != peer_id);
        if selection_moved || ticket < conv.applied_ticket {
            if conv.in_flight == 0 {
                conv.merged_during_fetch.clear();
            }
            debug!(
                "Discarding stale history for {} (ticket {}, active {:?})",
                key, ticket, active
            );
            return Err(FluxError::Superseded(peer_id));
        }

        let mut sequence = Vec::with_capacity(fetched.len() + conv.merged_during_fetch.len());
        for message in fetched.into_iter().chain(conv.merged_during_fetch.iter().cloned()) {
            insert_sorted(&mut sequence, message);
        }
        if conv.in_flight == 0 {
            conv.merged_during_fetch.clear();
        }
        conv.messages = sequence;
        conv.loaded = true;
        conv.applied_ticket = ticket;
        let result = conv.messages.clone();
        drop(state);

        info!("History for {} loaded: {} messages", key, result.len());
        let _ = self.events.send(ConversationEvent::HistoryLoaded {
            key,
            len: result.len(),
        });
        Ok(result)
    }

    /// Merge one message from any source. Idempotent and order-independent.
    pub async fn merge_incoming(&self, message: Message) -> MergeOutcome {
        let key = message.conversation_key();
        self.directory.observe(&message, self.actor.id).await;

        let mut state = self.state.write().await;
        let is_active = state
            .active
            .map(|peer| self.key_for(peer) == key)
            .unwrap_or(false);
        let conv = state.conversations.entry(key).or_default();

        if conv.in_flight > 0
            && !conv
                .merged_during_fetch
                .iter()
                .any(|m| m.same_identity(&message))
        {
            conv.merged_during_fetch.push(message.clone());
        }

        let outcome = insert_sorted(&mut conv.messages, message.clone());
        let index = match outcome {
            MergeOutcome::Duplicate => {
                debug!("Duplicate message {:?} in {} ignored", message.id, key);
                return outcome;
            }
            MergeOutcome::Inserted { index } => index,
        };
        if !is_active && message.sender_id != self.actor.id {
            conv.unread += 1;
        }
        drop(state);

        debug!("Message {:?} merged into {} at {}", message.id, key, index);
        let _ = self.events.send(ConversationEvent::MessageAdded {
            key,
            index,
            message,
            active: is_active,
        });
        outcome
    }

    /// Make `peer_id` the active conversation, loading its history on first use
    pub async fn select_conversation(&self, peer_id: UserId) -> Result<()> {
        let key = self.key_for(peer_id);
        let needs_load = {
            let mut state = self.state.write().await;
            state.active = Some(peer_id);
            let conv = state.conversations.entry(key).or_default();
            conv.unread = 0;
            !conv.loaded && conv.in_flight == 0
        };
        let _ = self.events.send(ConversationEvent::SelectionChanged {
            peer_id: Some(peer_id),
        });
        debug!("Selected conversation {}", key);

        if needs_load {
            match self.load_history(peer_id).await {
                Ok(_) | Err(FluxError::Superseded(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub async fn clear_selection(&self) {
        self.state.write().await.active = None;
        let _ = self.events.send(ConversationEvent::SelectionChanged { peer_id: None });
    }

    pub async fn active(&self) -> Option<UserId> {
        self.state.read().await.active
    }

    /// Current sequence for `peer_id` (empty if never seen)
    pub async fn messages(&self, peer_id: UserId) -> Vec<Message> {
        let key = self.key_for(peer_id);
        self.state
            .read()
            .await
            .conversations
            .get(&key)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub async fn snapshot(&self, peer_id: UserId) -> Option<ConversationSnapshot> {
        let key = self.key_for(peer_id);
        let state = self.state.read().await;
        state.conversations.get(&key).map(|c| ConversationSnapshot {
            key,
            messages: c.messages.clone(),
            loaded: c.loaded,
            unread: c.unread,
        })
    }

    /// Conversations involving the actor, most recent activity first
    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        let state = self.state.read().await;
        let mut out: Vec<_> = state
            .conversations
            .iter()
            .filter_map(|(key, conv)| {
                let peer_id = key.other(self.actor.id)?;
                let last = conv.messages.last();
                Some(ConversationSummary {
                    key: *key,
                    peer_id,
                    last_preview: last.map(|m| preview(&m.content)).unwrap_or_default(),
                    last_timestamp: last.map(|m| m.created_at),
                    unread: conv.unread,
                })
            })
            .collect();
        out.sort_by(|a, b| b.last_timestamp.cmp(&a.last_timestamp).then(a.key.cmp(&b.key)));
        out
    }

    /// Change events for one conversation
    pub fn subscribe(&self, peer_id: UserId) -> ConversationSubscription {
        ConversationSubscription {
            key: Some(self.key_for(peer_id)),
            rx: self.events.subscribe(),
        }
    }

    /// Every change event, selection changes included
    pub fn subscribe_all(&self) -> ConversationSubscription {
        ConversationSubscription {
            key: None,
            rx: self.events.subscribe(),
        }
    }
}

/// Receiver side of the store's change events
pub struct ConversationSubscription {
    key: Option<ConversationKey>,
    rx: broadcast::Receiver<ConversationEvent>,
}

impl ConversationSubscription {
    /// Next event for this subscription; `None` once the store is gone
    pub async fn recv(&mut self) -> Option<ConversationEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.key.is_none() || event.key() == self.key {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Subscriber is too slow; skip what it missed
                    warn!("Conversation subscriber lagged {} events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Insert keeping `(created_at, id)` order; duplicates leave the sequence unchanged
fn insert_sorted(sequence: &mut Vec<Message>, message: Message) -> MergeOutcome {
    if sequence.iter().any(|m| m.same_identity(&message)) {
        return MergeOutcome::Duplicate;
    }
    let key = message.sort_key();
    let index = sequence.partition_point(|m| m.sort_key() <= key);
    sequence.insert(index, message);
    MergeOutcome::Inserted { index }
}

fn preview(content: &str) -> String {
    const MAX: usize = 60;
    match content.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}…", &content[..cut]),
        None => content.to_string(),
    }
}
