use super::*;

use serde_json::json;
use shared::protocol::Profile;

use crate::{
    memory::InMemoryBackend,
    test_support::{eventually, events, profile},
};

const EXPIRY: Duration = Duration::from_secs(3);

struct Fixture {
    backend: InMemoryBackend,
    context: SessionContext,
    typing: TypingCoordinator,
    me: Profile,
}

fn fixture() -> Fixture {
    let backend = InMemoryBackend::new();
    let me = profile("me");
    let context = SessionContext::new(me.clone());
    let typing = TypingCoordinator::new(Arc::new(backend.clone()), context.clone(), events(), EXPIRY);
    Fixture {
        backend,
        context,
        typing,
        me,
    }
}

fn signal(from: &Profile, is_typing: bool) -> serde_json::Value {
    json!({ "userId": from.id, "username": from.username, "isTyping": is_typing })
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

async fn typing_names(typing: &TypingCoordinator) -> Vec<String> {
    let mut names: Vec<String> = typing.typing_users().await.into_values().collect();
    names.sort();
    names
}

#[tokio::test(start_paused = true)]
async fn typing_entry_expires_three_seconds_after_last_signal() {
    let f = fixture();
    let room = RoomId::random();
    let bob = profile("bob");
    f.typing.bind_room(room).await.expect("bind");
    let peer = f.backend.join_broadcast(&room_topic(room)).await.expect("join");

    peer.send(TYPING_EVENT, signal(&bob, true)).await.expect("send");
    let typing = &f.typing;
    assert!(eventually(|| async move { !typing.typing_users().await.is_empty() }).await);
    assert_eq!(typing_names(typing).await, vec!["bob"]);

    time::advance(Duration::from_millis(2_900)).await;
    settle().await;
    assert_eq!(typing_names(typing).await, vec!["bob"]);

    time::advance(Duration::from_millis(200)).await;
    assert!(eventually(|| async move { typing.typing_users().await.is_empty() }).await);
}

#[tokio::test(start_paused = true)]
async fn refreshed_signal_restarts_the_timer() {
    let f = fixture();
    let room = RoomId::random();
    let bob = profile("bob");
    f.typing.bind_room(room).await.expect("bind");
    let peer = f.backend.join_broadcast(&room_topic(room)).await.expect("join");
    let typing = &f.typing;

    peer.send(TYPING_EVENT, signal(&bob, true)).await.expect("send");
    assert!(eventually(|| async move { !typing.typing_users().await.is_empty() }).await);
    time::advance(Duration::from_secs(2)).await;

    peer.send(TYPING_EVENT, signal(&bob, true)).await.expect("send");
    settle().await;
    time::advance(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(typing_names(typing).await, vec!["bob"]);

    time::advance(Duration::from_millis(1_500)).await;
    assert!(eventually(|| async move { typing.typing_users().await.is_empty() }).await);
}

#[tokio::test]
async fn stop_signal_removes_sender_immediately() {
    let f = fixture();
    let room = RoomId::random();
    let (bob, carol) = (profile("bob"), profile("carol"));
    f.typing.bind_room(room).await.expect("bind");
    let peer = f.backend.join_broadcast(&room_topic(room)).await.expect("join");
    let typing = &f.typing;

    peer.send(TYPING_EVENT, signal(&bob, true)).await.expect("send");
    peer.send(TYPING_EVENT, signal(&carol, true)).await.expect("send");
    assert!(eventually(|| async move { typing.typing_users().await.len() == 2 }).await);

    peer.send(TYPING_EVENT, signal(&bob, false)).await.expect("send");
    assert!(eventually(|| async move { typing.typing_users().await.len() == 1 }).await);
    assert_eq!(typing_names(typing).await, vec!["carol"]);
}

#[tokio::test]
async fn own_and_unrelated_broadcasts_are_ignored() {
    let f = fixture();
    let room = RoomId::random();
    let bob = profile("bob");
    f.typing.bind_room(room).await.expect("bind");
    let peer = f.backend.join_broadcast(&room_topic(room)).await.expect("join");
    let typing = &f.typing;

    peer.send(TYPING_EVENT, signal(&f.me, true)).await.expect("send");
    peer.send("reaction", signal(&bob, true)).await.expect("send");
    peer.send(TYPING_EVENT, json!({ "garbage": true })).await.expect("send");
    peer.send(TYPING_EVENT, signal(&bob, true)).await.expect("send");

    assert!(eventually(|| async move { !typing.typing_users().await.is_empty() }).await);
    assert_eq!(typing_names(typing).await, vec!["bob"]);
}

#[tokio::test]
async fn switching_rooms_clears_typing_state() {
    let f = fixture();
    let (first, second) = (RoomId::random(), RoomId::random());
    let bob = profile("bob");
    let typing = &f.typing;

    typing.bind_room(first).await.expect("bind");
    let peer = f.backend.join_broadcast(&room_topic(first)).await.expect("join");
    peer.send(TYPING_EVENT, signal(&bob, true)).await.expect("send");
    assert!(eventually(|| async move { !typing.typing_users().await.is_empty() }).await);

    typing.bind_room(second).await.expect("rebind");
    assert!(typing.typing_users().await.is_empty());
    assert_eq!(typing.bound_room().await, Some(second));
    assert_eq!(f.backend.broadcast_member_count(&room_topic(first)).await, 1);

    peer.send(TYPING_EVENT, signal(&bob, true)).await.expect("send");
    settle().await;
    assert!(typing.typing_users().await.is_empty());

    typing.unbind().await;
    assert_eq!(f.backend.broadcast_member_count(&room_topic(second)).await, 0);
    assert_eq!(typing.bound_room().await, None);
}

#[tokio::test]
async fn set_typing_without_active_room_sends_nothing() {
    let f = fixture();
    assert!(f.typing.set_typing(true).is_none());
}

#[tokio::test(start_paused = true)]
async fn set_typing_broadcasts_once_and_leaves() {
    let f = fixture();
    let room = RoomId::random();
    f.context.set_active_room(Some(room));
    let peer = f.backend.join_broadcast(&room_topic(room)).await.expect("join");
    let mut inbox = peer.subscribe();

    let task = f.typing.set_typing(true).expect("active room");
    task.await.expect("broadcast task");

    let envelope = inbox.recv().await.expect("delivered");
    assert_eq!(envelope.event, TYPING_EVENT);
    let received: TypingBroadcast = serde_json::from_value(envelope.payload).expect("payload");
    assert_eq!(received.user_id, f.me.id);
    assert_eq!(received.username, "me");
    assert!(received.is_typing);
    assert_eq!(f.backend.sent_broadcasts(&room_topic(room)).await.len(), 1);
    assert_eq!(f.backend.broadcast_member_count(&room_topic(room)).await, 1);
}
