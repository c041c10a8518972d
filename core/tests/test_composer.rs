/// Composer tests - one send in flight, failures keep the draft
mod common;

use common::{FakeBackend, ME};
use flux_core::api::MessagingBackend;
use flux_core::composer::{Composer, ComposerStatus, IgnoreReason, SubmitOutcome};
use flux_core::conversation_store::ConversationStore;
use flux_core::messenger_types::Actor;
use flux_core::peer_directory::PeerDirectory;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

fn setup() -> (Arc<FakeBackend>, ConversationStore, Composer) {
    let backend = FakeBackend::new(ME);
    let shared: Arc<dyn MessagingBackend> = backend.clone();
    let directory = PeerDirectory::new(shared.clone(), 50);
    let actor = Actor {
        id: ME,
        username: "me".to_string(),
    };
    let store = ConversationStore::new(actor, shared.clone(), directory);
    let composer = Composer::new(shared, store.clone());
    (backend, store, composer)
}

async fn wait_for_sends(backend: &FakeBackend, n: usize) {
    timeout(Duration::from_secs(2), async {
        while backend.send_calls.load(Ordering::SeqCst) < n {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("send never started");
}

#[tokio::test]
async fn test_second_submit_while_sending_is_ignored() {
    let (backend, store, composer) = setup();
    composer.set_draft(2, "hello").await;

    let release = backend.hold_send();
    let first = tokio::spawn({
        let composer = composer.clone();
        async move { composer.submit(2).await }
    });
    wait_for_sends(&backend, 1).await;

    assert_eq!(composer.state(2).await.status, ComposerStatus::Sending);
    assert_eq!(
        composer.submit(2).await.unwrap(),
        SubmitOutcome::Ignored(IgnoreReason::AlreadySending)
    );

    release.send(()).unwrap();
    assert!(matches!(first.await.unwrap().unwrap(), SubmitOutcome::Sent(_)));
    assert_eq!(backend.send_calls.load(Ordering::SeqCst), 1);

    let state = composer.state(2).await;
    assert_eq!(state.status, ComposerStatus::Idle);
    assert!(state.draft.is_empty());
    assert_eq!(store.messages(2).await.len(), 1);
}

#[tokio::test]
async fn test_failed_send_keeps_draft_and_does_not_retry() {
    let (backend, store, composer) = setup();
    backend.fail_sends(true);
    composer.set_draft(2, "are you there?").await;

    assert!(composer.submit(2).await.is_err());
    sleep(Duration::from_millis(50)).await;

    let state = composer.state(2).await;
    assert_eq!(state.draft, "are you there?");
    assert!(matches!(state.status, ComposerStatus::Failed(_)));
    assert_eq!(backend.send_calls.load(Ordering::SeqCst), 1);
    assert!(store.messages(2).await.is_empty());

    // Manual retry
    backend.fail_sends(false);
    composer.dismiss_error(2).await;
    assert_eq!(composer.state(2).await.status, ComposerStatus::Idle);
    let outcome = composer.submit(2).await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::Sent(ref m) if m.content == "are you there?"));
    assert!(composer.state(2).await.draft.is_empty());
}

#[tokio::test]
async fn test_blank_draft_is_not_sent() {
    let (backend, _store, composer) = setup();
    composer.set_draft(2, "   \n\t").await;

    assert_eq!(
        composer.submit(2).await.unwrap(),
        SubmitOutcome::Ignored(IgnoreReason::EmptyDraft)
    );
    assert_eq!(backend.send_calls.load(Ordering::SeqCst), 0);
    assert_eq!(composer.state(2).await.status, ComposerStatus::Idle);
}

#[tokio::test]
async fn test_edit_during_send_is_kept() {
    let (backend, _store, composer) = setup();
    composer.set_draft(2, "first").await;

    let release = backend.hold_send();
    let sending = tokio::spawn({
        let composer = composer.clone();
        async move { composer.submit(2).await }
    });
    wait_for_sends(&backend, 1).await;

    composer.set_draft(2, "second").await;
    release.send(()).unwrap();

    match sending.await.unwrap().unwrap() {
        SubmitOutcome::Sent(message) => assert_eq!(message.content, "first"),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(composer.state(2).await.draft, "second");
}

#[tokio::test]
async fn test_drafts_are_per_conversation() {
    let (_backend, _store, composer) = setup();
    composer.set_draft(2, "to two").await;
    composer.set_draft(3, "to three").await;

    assert_eq!(composer.state(2).await.draft, "to two");
    assert_eq!(composer.state(3).await.draft, "to three");
    assert_eq!(composer.state(4).await.draft, "");
}
