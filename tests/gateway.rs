mod common;

use std::time::Duration;

use common::{start_app, start_pooled_app, TestApp, TestUser};
use futures_util::{future::join_all, SinkExt, StreamExt};
use postchat::realtime::ServerFrame;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use uuid::Uuid;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(app: &TestApp, token: &str) -> Socket {
    let (socket, _) = connect_async(app.ws_url(token)).await.unwrap();
    socket
}

async fn send(socket: &mut Socket, frame: Value) {
    socket.send(Message::text(frame.to_string())).await.unwrap();
}

async fn next_event(socket: &mut Socket) -> ServerFrame {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("no event within 2s")
            .expect("socket ended")
            .unwrap();
        match message {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

async fn assert_silent(socket: &mut Socket) {
    let next = tokio::time::timeout(Duration::from_millis(200), socket.next()).await;
    assert!(next.is_err(), "expected no frame, got {next:?}");
}

async fn open_room(app: &TestApp, owner: &TestUser, other: &TestUser) -> Uuid {
    let response = app
        .client
        .post(app.api("/rooms"))
        .bearer_auth(&owner.token)
        .json(&json!({ "other_user_id": other.id }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = response.json().await.unwrap();
    body["id"].as_str().unwrap().parse().unwrap()
}

async fn post_message(app: &TestApp, author: &TestUser, room_id: Uuid, content: &str) -> Value {
    let response = app
        .client
        .post(app.api(&format!("/rooms/{room_id}/messages")))
        .bearer_auth(&author.token)
        .json(&json!({ "content": content }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    response.json().await.unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let app = start_app().await;
    let response = app.client.get(app.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn rest_calls_require_a_session() {
    let app = start_app().await;

    let response = app.client.get(app.api("/rooms")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "NOT_AUTHENTICATED");

    let response = app
        .client
        .get(app.api("/rooms"))
        .bearer_auth("forged")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn rest_errors_use_the_envelope() {
    let app = start_app().await;
    let alice = app.user("alice@example.com").await;
    let bob = app.user("bob@example.com").await;
    let mallory = app.user("mallory@example.com").await;
    let room_id = open_room(&app, &alice, &bob).await;

    let response = app
        .client
        .post(app.api("/rooms"))
        .bearer_auth(&alice.token)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "MISSING_PARAM");
    assert!(body["message"].is_string());

    let response = app
        .client
        .get(app.api("/rooms?chat_type=group"))
        .bearer_auth(&alice.token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "INVALID_CHAT_TYPE");
    assert!(body["hint"].is_string());

    let response = app
        .client
        .get(app.api(&format!("/rooms/{room_id}")))
        .bearer_auth(&mallory.token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "NOT_FOUND");
    assert!(body.get("hint").is_none());

    let response = app
        .client
        .post(app.api(&format!("/rooms/{room_id}/messages")))
        .bearer_auth(&alice.token)
        .json(&json!({ "content": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "EMPTY_CONTENT");
}

#[tokio::test]
async fn rooms_and_messages_over_rest() {
    let app = start_app().await;
    let alice = app.user("alice@example.com").await;
    let bob = app.user("bob@example.com").await;

    let room_id = open_room(&app, &alice, &bob).await;
    assert_eq!(open_room(&app, &bob, &alice).await, room_id);

    post_message(&app, &alice, room_id, "first").await;
    let second = post_message(&app, &alice, room_id, "second").await;
    assert_eq!(second["room_id"], room_id.to_string());
    assert_eq!(second["user_id"], alice.id.to_string());

    let rooms: Value = app
        .client
        .get(app.api("/rooms"))
        .bearer_auth(&bob.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rooms["total"], 1);
    assert_eq!(rooms["items"][0]["id"], room_id.to_string());
    assert_eq!(rooms["items"][0]["unread_count"], 2);
    assert_eq!(rooms["items"][0]["last_message_preview"]["content"], "second");
    assert_eq!(rooms["items"][0]["other_participants"][0]["email"], alice.email);

    let history: Value = app
        .client
        .get(app.api(&format!("/rooms/{room_id}/messages?limit=1")))
        .bearer_auth(&bob.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["total"], 2);
    assert_eq!(history["total_pages"], 2);
    assert_eq!(history["items"][0]["id"], second["id"]);

    let older: Value = app
        .client
        .get(app.api(&format!(
            "/rooms/{room_id}/messages?before_id={}",
            second["id"].as_str().unwrap()
        )))
        .bearer_auth(&bob.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(older["items"].as_array().unwrap().len(), 1);
    assert_eq!(older["items"][0]["content"], "first");

    let room: Value = app
        .client
        .get(app.api(&format!("/rooms/{room_id}")))
        .bearer_auth(&bob.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(room["unread_count"], 0);
}

#[tokio::test]
async fn bad_tokens_are_closed_with_4001() {
    let app = start_app().await;

    for url in [app.ws_url("forged"), format!("ws://{}/api/v1/chat/ws", app.addr)] {
        let (mut socket, _) = connect_async(url).await.unwrap();
        let message = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match message {
            Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4001),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    assert_eq!(app.hub.registry().connection_count().await, 0);
}

#[tokio::test]
async fn subscribers_receive_each_new_message_once() {
    let app = start_app().await;
    let alice = app.user("alice@example.com").await;
    let bob = app.user("bob@example.com").await;
    let room_id = open_room(&app, &alice, &bob).await;

    let mut socket = connect(&app, &alice.token).await;
    send(&mut socket, json!({ "action": "subscribe", "room_id": room_id })).await;
    app.wait_for_subscribers(room_id, 1).await;

    let sent = post_message(&app, &bob, room_id, "hello alice").await;

    match next_event(&mut socket).await {
        ServerFrame::MessageCreated { room_id: event_room, payload } => {
            assert_eq!(event_room, room_id);
            assert_eq!(payload.id.to_string(), sent["id"].as_str().unwrap());
            assert_eq!(payload.content, "hello alice");
            assert_eq!(payload.user_id, bob.id);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_silent(&mut socket).await;

    send(&mut socket, json!({ "action": "unsubscribe", "room_id": room_id })).await;
    for _ in 0..200 {
        if app.hub.registry().subscriber_count(room_id).await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    post_message(&app, &bob, room_id, "still there?").await;
    assert_silent(&mut socket).await;
}

#[tokio::test]
async fn typing_reaches_the_other_user_but_not_the_typists_devices() {
    let app = start_app().await;
    let alice = app.user("alice@example.com").await;
    let bob = app.user("bob@example.com").await;
    let room_id = open_room(&app, &alice, &bob).await;

    let mut phone = connect(&app, &alice.token).await;
    let mut laptop = connect(&app, &alice.token).await;
    let mut bobs = connect(&app, &bob.token).await;
    for socket in [&mut phone, &mut laptop, &mut bobs] {
        send(socket, json!({ "action": "subscribe", "room_id": room_id })).await;
    }
    app.wait_for_subscribers(room_id, 3).await;

    send(&mut phone, json!({ "action": "typing", "room_id": room_id, "typing": true })).await;

    match next_event(&mut bobs).await {
        ServerFrame::UserTyping { room_id: event_room, payload } => {
            assert_eq!(event_room, room_id);
            assert_eq!(payload.user_id, alice.id);
            assert!(payload.typing);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_silent(&mut phone).await;
    assert_silent(&mut laptop).await;

    // a message does reach the author's other devices
    post_message(&app, &alice, room_id, "sent from the phone").await;
    assert!(matches!(next_event(&mut laptop).await, ServerFrame::MessageCreated { .. }));
    assert!(matches!(next_event(&mut bobs).await, ServerFrame::MessageCreated { .. }));
}

#[tokio::test]
async fn outsiders_cannot_listen_in() {
    let app = start_app().await;
    let alice = app.user("alice@example.com").await;
    let bob = app.user("bob@example.com").await;
    let mallory = app.user("mallory@example.com").await;
    let room_id = open_room(&app, &alice, &bob).await;

    let mut snoop = connect(&app, &mallory.token).await;
    send(&mut snoop, json!({ "action": "subscribe", "room_id": room_id })).await;
    send(&mut snoop, json!({ "action": "typing", "room_id": room_id, "typing": true })).await;
    send(&mut snoop, json!({ "action": "dance" })).await;
    snoop.send(Message::text("not json".to_owned())).await.unwrap();

    let mut socket = connect(&app, &alice.token).await;
    send(&mut socket, json!({ "action": "subscribe", "room_id": room_id })).await;
    app.wait_for_subscribers(room_id, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(app.hub.registry().subscriber_count(room_id).await, 1);

    post_message(&app, &bob, room_id, "private").await;
    assert!(matches!(next_event(&mut socket).await, ServerFrame::MessageCreated { .. }));
    assert_silent(&mut snoop).await;
}

#[tokio::test]
async fn closed_sockets_leave_the_registry() {
    let app = start_app().await;
    let alice = app.user("alice@example.com").await;
    let bob = app.user("bob@example.com").await;
    let room_id = open_room(&app, &alice, &bob).await;

    let mut socket = connect(&app, &alice.token).await;
    send(&mut socket, json!({ "action": "subscribe", "room_id": room_id })).await;
    app.wait_for_subscribers(room_id, 1).await;
    assert_eq!(app.hub.registry().connection_count().await, 1);

    socket.close(None).await.unwrap();
    drop(socket);

    for _ in 0..200 {
        if app.hub.registry().connection_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(app.hub.registry().connection_count().await, 0);
    assert_eq!(app.hub.registry().subscriber_count(room_id).await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn live_order_matches_history_under_concurrent_sends() {
    let app = start_pooled_app(8).await;
    let alice = app.user("alice@example.com").await;
    let bob = app.user("bob@example.com").await;
    let room_id = open_room(&app, &alice, &bob).await;

    let mut socket = connect(&app, &alice.token).await;
    send(&mut socket, json!({ "action": "subscribe", "room_id": room_id })).await;
    app.wait_for_subscribers(room_id, 1).await;

    let contents: Vec<String> = (0..40).map(|n| format!("burst {n}")).collect();
    join_all(contents.iter().map(|content| post_message(&app, &bob, room_id, content))).await;

    let mut live = Vec::new();
    while live.len() < contents.len() {
        match next_event(&mut socket).await {
            ServerFrame::MessageCreated { payload, .. } => live.push(payload.id.to_string()),
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_silent(&mut socket).await;

    let history: Value = app
        .client
        .get(app.api(&format!("/rooms/{room_id}/messages?limit=100")))
        .bearer_auth(&alice.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let mut stored: Vec<String> = history["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|message| message["id"].as_str().unwrap().to_owned())
        .collect();
    stored.reverse();

    assert_eq!(live, stored);
}
