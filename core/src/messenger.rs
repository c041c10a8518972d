/// Messenger: wires session, REST backend, push channel, directory, store and composer
use crate::api::{ApiClient, MessagingBackend};
use crate::composer::{Composer, SubmitOutcome};
use crate::config::Config;
use crate::conversation_store::ConversationStore;
use crate::error::Result;
use crate::messenger_types::{Message, Peer, PushFrame, UserId};
use crate::peer_directory::PeerDirectory;
use crate::push::{ChannelState, PushChannel, Subscription};
use crate::session::Session;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Messenger {
    session: Session,
    directory: PeerDirectory,
    store: ConversationStore,
    composer: Composer,
    channel: Option<PushChannel>,
    subscription: Option<Subscription>,
    pump: Option<JoinHandle<()>>,
}

impl Messenger {
    /// Start messaging for a signed-in session against the configured backend
    pub fn init(config: &Config, session: Session) -> Self {
        let backend: Arc<dyn MessagingBackend> = Arc::new(ApiClient::for_session(config, &session));
        Self::with_backend(config, session, backend)
    }

    /// Same as `init` with an explicit REST backend
    pub fn with_backend(
        config: &Config,
        session: Session,
        backend: Arc<dyn MessagingBackend>,
    ) -> Self {
        if session.is_expired(chrono::Utc::now()) {
            warn!("Session token for user {} has expired", session.actor().id);
        }

        let directory = PeerDirectory::new(backend.clone(), config.users_page_limit);
        let store = ConversationStore::new(session.actor().clone(), backend.clone(), directory.clone());
        let composer = Composer::new(backend, store.clone());

        let channel = PushChannel::connect(config, &session);
        let (tx, mut rx) = mpsc::unbounded_channel::<PushFrame>();
        let subscription = channel.on_message(move |frame| {
            let _ = tx.send(frame);
        });

        let pump_store = store.clone();
        let pump = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame {
                    PushFrame::NewMessage { message } => {
                        pump_store.merge_incoming(message).await;
                    }
                }
            }
            debug!("Push pump stopped");
        });

        info!(
            "Messenger started for {} ({})",
            session.actor().username,
            session.actor().id
        );

        Self {
            session,
            directory,
            store,
            composer,
            channel: Some(channel),
            subscription: Some(subscription),
            pump: Some(pump),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel
            .as_ref()
            .map(PushChannel::state)
            .unwrap_or(ChannelState::Closed)
    }

    pub fn watch_channel(&self) -> Option<watch::Receiver<ChannelState>> {
        self.channel.as_ref().map(PushChannel::watch_state)
    }

    /// Reload the followed-users list
    pub async fn refresh_peers(&self) -> Result<Vec<Peer>> {
        self.directory.refresh().await
    }

    /// Select a peer, load its history on first use and resolve unknown identities
    pub async fn open_conversation(&self, peer_id: UserId) -> Result<(Peer, Vec<Message>)> {
        self.store.select_conversation(peer_id).await?;
        let mut peer = self.directory.resolve(peer_id).await;
        if !self.directory.pending().await.is_empty() {
            match self.directory.resolve_pending().await {
                Ok(_) => peer = self.directory.resolve(peer_id).await,
                Err(e) => warn!("Peer resolution failed: {}", e),
            }
        }
        Ok((peer, self.store.messages(peer_id).await))
    }

    /// Replace the draft for `peer_id` and submit it
    pub async fn send(&self, peer_id: UserId, text: &str) -> Result<SubmitOutcome> {
        self.composer.set_draft(peer_id, text).await;
        self.composer.submit(peer_id).await
    }

    /// Detach from the push channel, close it and end the session
    pub async fn teardown(mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
        info!("Messenger for user {} stopped", self.session.actor().id);
        self.session.teardown();
    }
}
