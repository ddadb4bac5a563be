use devconnect_server::api::{build_router, AppState};
use devconnect_server::config::Config;
use reqwest::StatusCode;
use std::net::{SocketAddr, TcpListener};
use tokio::task::JoinHandle;
use uuid::Uuid;

async fn spawn_server() -> (SocketAddr, JoinHandle<()>, AppState, tempfile::TempDir) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        bind: addr.to_string(),
        data_dir: tmp.path().to_path_buf(),
        max_content_len: 5000,
        default_page_size: 50,
        typing_debounce_ms: 2000,
        notification_keep_days: 30,
        logging_enabled: false,
    };
    let state = AppState::new(config).await.unwrap();
    let app = build_router(state.clone());
    let server = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    (addr, server, state, tmp)
}

async fn register(client: &reqwest::Client, addr: SocketAddr, username: &str) -> (String, Uuid) {
    let resp = client
        .post(format!("http://{addr}/api/register"))
        .json(&serde_json::json!({
            "username": username,
            "display_name": username,
            "password": "supersecret",
            "skills": ["rust", "sql"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let v: serde_json::Value = resp.json().await.unwrap();
    let token = v["token"].as_str().unwrap().to_string();
    let id = v["user"]["id"].as_str().unwrap().parse().unwrap();
    (token, id)
}

async fn notifications(
    client: &reqwest::Client,
    addr: SocketAddr,
    token: &str,
) -> Vec<serde_json::Value> {
    client
        .get(format!("http://{addr}/api/notifications"))
        .bearer_auth(token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn duplicate_bookmark_conflicts() {
    let (addr, server, _state, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();
    let (alice, _) = register(&client, addr, "alice").await;
    let item = Uuid::new_v4();

    let resp = client
        .post(format!("http://{addr}/api/bookmarks"))
        .bearer_auth(&alice)
        .json(&serde_json::json!({ "item_kind": "post", "item_id": item }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = client
        .post(format!("http://{addr}/api/bookmarks"))
        .bearer_auth(&alice)
        .json(&serde_json::json!({ "item_kind": "post", "item_id": item }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "item already bookmarked");

    // exactly one record exists
    let listed: Vec<serde_json::Value> = client
        .get(format!("http://{addr}/api/bookmarks"))
        .bearer_auth(&alice)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    server.abort();
}

#[tokio::test]
async fn self_actions_are_rejected() {
    let (addr, server, _state, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();
    let (alice, alice_id) = register(&client, addr, "alice").await;

    let resp = client
        .post(format!("http://{addr}/api/users/{alice_id}/follow"))
        .bearer_auth(&alice)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = client
        .post(format!("http://{addr}/api/endorsements"))
        .bearer_auth(&alice)
        .json(&serde_json::json!({ "user_id": alice_id, "skill": "rust" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = client
        .post(format!("http://{addr}/api/conversations"))
        .bearer_auth(&alice)
        .json(&serde_json::json!({ "recipient_id": alice_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // none of the rejected actions left anything behind
    assert!(notifications(&client, addr, &alice).await.is_empty());

    server.abort();
}

#[tokio::test]
async fn follow_request_accept_and_notifications() {
    let (addr, server, _state, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();
    let (alice, alice_id) = register(&client, addr, "alice").await;
    let (bob, bob_id) = register(&client, addr, "bob").await;

    let resp = client
        .post(format!("http://{addr}/api/users/{bob_id}/follow"))
        .bearer_auth(&alice)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // a second request is a duplicate
    let resp = client
        .post(format!("http://{addr}/api/users/{bob_id}/follow"))
        .bearer_auth(&alice)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let bob_notifs = notifications(&client, addr, &bob).await;
    assert_eq!(bob_notifs.len(), 1);
    assert_eq!(bob_notifs[0]["kind"], "follow_request");
    assert_eq!(bob_notifs[0]["sender_id"], alice_id.to_string());
    assert_eq!(bob_notifs[0]["is_read"], false);

    let resp = client
        .post(format!(
            "http://{addr}/api/follow-requests/{alice_id}/accept"
        ))
        .bearer_auth(&bob)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let alice_notifs = notifications(&client, addr, &alice).await;
    assert_eq!(alice_notifs.len(), 1);
    assert_eq!(alice_notifs[0]["kind"], "follow_accepted");

    let followers: Vec<serde_json::Value> = client
        .get(format!("http://{addr}/api/users/{bob_id}/followers"))
        .bearer_auth(&alice)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(followers.len(), 1);
    assert_eq!(followers[0]["username"], "alice");

    server.abort();
}

#[tokio::test]
async fn likes_comments_and_mentions_notify() {
    let (addr, server, _state, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();
    let (alice, _) = register(&client, addr, "alice").await;
    let (bob, bob_id) = register(&client, addr, "bob").await;

    let post: serde_json::Value = client
        .post(format!("http://{addr}/api/posts"))
        .bearer_auth(&bob)
        .json(&serde_json::json!({ "content": "rustc is my pair programmer" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let post_id = post["id"].as_str().unwrap().to_string();

    // like then unlike
    let liked: serde_json::Value = client
        .post(format!("http://{addr}/api/posts/{post_id}/like"))
        .bearer_auth(&alice)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(liked["likes"], 1);
    assert_eq!(liked["is_liked"], true);
    let unliked: serde_json::Value = client
        .post(format!("http://{addr}/api/posts/{post_id}/like"))
        .bearer_auth(&alice)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(unliked["likes"], 0);

    // comment mentioning bob: bob gets the comment notification only,
    // not a second mention for his own post
    let resp = client
        .post(format!("http://{addr}/api/posts/{post_id}/comments"))
        .bearer_auth(&alice)
        .json(&serde_json::json!({ "content": "agreed @bob" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let bob_notifs = notifications(&client, addr, &bob).await;
    let kinds: Vec<&str> = bob_notifs
        .iter()
        .map(|n| n["kind"].as_str().unwrap())
        .collect();
    assert!(kinds.contains(&"like"));
    assert!(kinds.contains(&"comment"));
    assert!(!kinds.contains(&"mention"));

    // endorsement with a duplicate follow-up
    let resp = client
        .post(format!("http://{addr}/api/endorsements"))
        .bearer_auth(&alice)
        .json(&serde_json::json!({ "user_id": bob_id, "skill": "rust", "note": "ships" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let resp = client
        .post(format!("http://{addr}/api/endorsements"))
        .bearer_auth(&alice)
        .json(&serde_json::json!({ "user_id": bob_id, "skill": "rust" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let bob_notifs = notifications(&client, addr, &bob).await;
    assert!(bob_notifs
        .iter()
        .any(|n| n["kind"] == "endorsement" && n["body"] == "endorsed your skill: rust"));

    server.abort();
}

#[tokio::test]
async fn notification_read_and_delete_rules() {
    let (addr, server, _state, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();
    let (alice, _) = register(&client, addr, "alice").await;
    let (bob, _) = register(&client, addr, "bob").await;

    // two likes from alice on bob's posts
    for content in ["one", "two"] {
        let post: serde_json::Value = client
            .post(format!("http://{addr}/api/posts"))
            .bearer_auth(&bob)
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let post_id = post["id"].as_str().unwrap();
        client
            .post(format!("http://{addr}/api/posts/{post_id}/like"))
            .bearer_auth(&alice)
            .send()
            .await
            .unwrap();
    }

    let bob_notifs = notifications(&client, addr, &bob).await;
    assert_eq!(bob_notifs.len(), 2);
    let first_id = bob_notifs[0]["id"].as_str().unwrap().to_string();

    let read: serde_json::Value = client
        .put(format!("http://{addr}/api/notifications/{first_id}/read"))
        .bearer_auth(&bob)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(read["is_read"], true);

    let resp = client
        .put(format!("http://{addr}/api/notifications/mark/all-as-read"))
        .bearer_auth(&bob)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(notifications(&client, addr, &bob)
        .await
        .iter()
        .all(|n| n["is_read"] == true));

    // only the recipient may delete
    let resp = client
        .delete(format!("http://{addr}/api/notifications/{first_id}"))
        .bearer_auth(&alice)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let resp = client
        .delete(format!("http://{addr}/api/notifications/{first_id}"))
        .bearer_auth(&bob)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(notifications(&client, addr, &bob).await.len(), 1);

    server.abort();
}
