/// Peer directory: the follow graph projected to a flat, read-only list
use crate::api::MessagingBackend;
use crate::error::Result;
use crate::messenger_types::{Message, Peer, UserId, UserProfile};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Default)]
struct DirectoryState {
    peers: HashMap<UserId, Peer>,
    /// Followed users, in the order the backend lists them
    followed: Vec<UserId>,
    /// Ids seen in messages but not resolved yet
    pending: HashSet<UserId>,
    /// Ids a full user scan could not find
    missing: HashSet<UserId>,
}

#[derive(Clone)]
pub struct PeerDirectory {
    backend: Arc<dyn MessagingBackend>,
    state: Arc<RwLock<DirectoryState>>,
    page_limit: u32,
}

impl PeerDirectory {
    pub fn new(backend: Arc<dyn MessagingBackend>, page_limit: u32) -> Self {
        Self {
            backend,
            state: Arc::new(RwLock::new(DirectoryState::default())),
            page_limit: page_limit.max(1),
        }
    }

    /// Reload followed users from the backend
    pub async fn refresh(&self) -> Result<Vec<Peer>> {
        let peers = self.backend.following().await?;
        let mut state = self.state.write().await;
        state.followed = peers.iter().map(|p| p.id).collect();
        for peer in &peers {
            state.pending.remove(&peer.id);
            state.missing.remove(&peer.id);
            state.peers.insert(peer.id, peer.clone());
        }
        info!("Peer directory refreshed: {} followed users", peers.len());
        Ok(peers)
    }

    /// Followed users in follow order
    pub async fn list_peers(&self) -> Vec<Peer> {
        let state = self.state.read().await;
        state
            .followed
            .iter()
            .filter_map(|id| state.peers.get(id).cloned())
            .collect()
    }

    /// Known peer, or a placeholder (the id is queued for lazy resolution)
    pub async fn resolve(&self, peer_id: UserId) -> Peer {
        {
            let state = self.state.read().await;
            if let Some(peer) = state.peers.get(&peer_id) {
                return peer.clone();
            }
            if state.missing.contains(&peer_id) {
                return Peer::placeholder(peer_id);
            }
        }
        let mut state = self.state.write().await;
        if state.pending.insert(peer_id) {
            debug!("Peer {} queued for lazy resolution", peer_id);
        }
        Peer::placeholder(peer_id)
    }

    /// Learn from profiles embedded in a message; queue participants still unknown
    pub async fn observe(&self, message: &Message, me: UserId) {
        let mut state = self.state.write().await;
        for profile in [&message.sender, &message.receiver].into_iter().flatten() {
            learn_profile(&mut state, profile);
        }
        for id in [message.sender_id, message.receiver_id] {
            if id != me && id != 0 && !state.peers.contains_key(&id) && !state.missing.contains(&id) {
                state.pending.insert(id);
            }
        }
    }

    /// Ids waiting for resolution
    pub async fn pending(&self) -> Vec<UserId> {
        let mut ids: Vec<_> = self.state.read().await.pending.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Page through all users until every pending id is found; returns how many were resolved
    pub async fn resolve_pending(&self) -> Result<usize> {
        if self.state.read().await.pending.is_empty() {
            return Ok(0);
        }

        let mut resolved = 0;
        let mut page = 1;
        loop {
            let batch = self.backend.users(page, self.page_limit).await?;
            let mut state = self.state.write().await;
            for user in &batch.users {
                if state.pending.remove(&user.id) {
                    state.peers.insert(user.id, Peer::from(user.clone()));
                    resolved += 1;
                }
            }
            if state.pending.is_empty() {
                break;
            }
            if batch.users.is_empty() || u64::from(page) >= batch.total_pages {
                let unresolved: Vec<_> = state.pending.drain().collect();
                warn!("Could not resolve peers {:?}; keeping placeholders", unresolved);
                state.missing.extend(unresolved);
                break;
            }
            page += 1;
        }
        debug!("Resolved {} pending peers", resolved);
        Ok(resolved)
    }
}

fn learn_profile(state: &mut DirectoryState, profile: &UserProfile) {
    if profile.id == 0 || profile.username.is_empty() || state.peers.contains_key(&profile.id) {
        return;
    }
    state.pending.remove(&profile.id);
    state.missing.remove(&profile.id);
    state.peers.insert(profile.id, Peer::from(profile.clone()));
}
