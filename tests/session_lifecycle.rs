use std::time::Duration;

use axum::{
    Router,
    body::{Body, Bytes},
    http::{Request, StatusCode, header},
    response::Response,
};
use futures::{StreamExt, stream};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use sendo::{app::build_router, config::Config, state::AppState};

struct TestApp {
    state: AppState,
    router: Router,
}

impl TestApp {
    fn new() -> Self {
        Self::with_config(Config::default())
    }

    fn with_config(config: Config) -> Self {
        let config = Config {
            upload_dir: std::env::temp_dir().join(format!("sendo_it_{}", Uuid::new_v4())),
            create_rate_limit: None,
            ..config
        };
        let state = AppState::new(config);
        let router = build_router(state.clone()).unwrap();
        Self { state, router }
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    async fn get(&self, uri: &str) -> Response {
        self.send(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn post_json(&self, uri: &str, body: Value) -> Response {
        self.send(
            Request::post(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn upload(&self, session_id: &str, token: &str, filename: &str, bytes: &[u8]) -> Response {
        let boundary = "sendo-test-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
                filename
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/epub+zip\r\n\r\n");
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

        self.send(
            Request::post(format!(
                "/api/upload?sessionId={}&senderToken={}",
                session_id, token
            ))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap(),
        )
        .await
    }

    /// Creates a session and connects a sender by code.
    async fn paired(&self) -> (Value, Value) {
        let created = json_body(self.post_json("/api/session", json!({"role": "receiver"})).await).await;
        let connected = json_body(
            self.post_json("/api/connect", json!({"code": created["code"]}))
                .await,
        )
        .await;
        (created, connected)
    }

    async fn status(&self, session_id: &str) -> Value {
        json_body(self.get(&format!("/api/session/{}/status", session_id)).await).await
    }

    fn session_dir(&self, session_id: &str) -> std::path::PathBuf {
        self.state.blobs.root().join(session_id)
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(self.state.blobs.root());
    }
}

async fn json_body(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn str_of<'a>(value: &'a Value, key: &str) -> &'a str {
    value[key].as_str().unwrap()
}

fn dir_is_empty(path: &std::path::Path) -> bool {
    match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

async fn wait_for_has_file(app: &TestApp, session_id: &str, expected: bool) -> Value {
    for _ in 0..100 {
        let status = app.status(session_id).await;
        if status["hasFile"] == json!(expected) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("hasFile never became {}", expected);
}

#[tokio::test]
async fn full_round_trip() {
    let app = TestApp::new();
    let (created, connected) = app.paired().await;
    let session_id = str_of(&created, "sessionId");

    assert_eq!(created["ok"], json!(true));
    assert_eq!(str_of(&created, "code").len(), 4);
    assert_eq!(created["heartbeatIntervalMs"], json!(10_000));
    assert!(str_of(&created, "joinUrl").contains(&format!("/join?sessionId={}&t=", session_id)));
    assert_eq!(connected["sessionId"], created["sessionId"]);

    let status = app.status(session_id).await;
    assert_eq!(status["status"], json!("connected"));
    assert_eq!(status["senderConnected"], json!(true));
    assert_eq!(status["hasFile"], json!(false));

    let book = b"PK\x03\x04 pretend this is an epub".to_vec();
    let response = app
        .upload(session_id, str_of(&connected, "senderToken"), "book.epub", &book)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let uploaded = json_body(response).await;
    assert_eq!(uploaded["file"]["name"], json!("book.epub"));
    assert_eq!(uploaded["file"]["size"], json!(book.len()));
    assert_eq!(uploaded["file"]["type"], json!("application/epub+zip"));

    let status = app.status(session_id).await;
    assert_eq!(status["hasFile"], json!(true));
    assert_eq!(status["file"]["name"], json!("book.epub"));
    assert!(!status.to_string().contains("Token"));

    let response = app
        .get(&format!(
            "/api/download/{}?receiverToken={}",
            session_id,
            str_of(&created, "receiverToken")
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers[header::CONTENT_TYPE], "application/epub+zip");
    assert_eq!(headers[header::CONTENT_LENGTH], book.len().to_string().as_str());
    assert_eq!(
        headers[header::CONTENT_DISPOSITION],
        "attachment; filename=\"book.epub\"; filename*=UTF-8''book.epub"
    );
    let downloaded = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(downloaded.as_ref(), book.as_slice());

    wait_for_has_file(&app, session_id, false).await;
    assert!(dir_is_empty(&app.session_dir(session_id)));

    // session stays open after the hand-off
    let status = app.status(session_id).await;
    assert_eq!(status["closed"], json!(false));
}

#[tokio::test]
async fn second_upload_replaces_the_first() {
    let app = TestApp::new();
    let (created, connected) = app.paired().await;
    let session_id = str_of(&created, "sessionId");
    let token = str_of(&connected, "senderToken");

    app.upload(session_id, token, "first.txt", b"first").await;
    app.upload(session_id, token, "second.txt", b"second!").await;

    let status = app.status(session_id).await;
    assert_eq!(status["file"]["name"], json!("second.txt"));
    assert_eq!(status["file"]["size"], json!(7));
    let blobs = std::fs::read_dir(app.session_dir(session_id)).unwrap().count();
    assert_eq!(blobs, 1);
}

#[tokio::test]
async fn create_requires_receiver_role() {
    let app = TestApp::new();
    let response = app
        .post_json("/api/session", json!({"role": "sender"}))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["ok"], json!(false));
    assert_eq!(body["error"], json!("invalid_input"));

    let response = app.get("/api/session/new").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(json_body(response).await["receiverToken"].is_string());
}

#[tokio::test]
async fn unknown_code_is_not_found() {
    let app = TestApp::new();
    let response = app.post_json("/api/connect", json!({"code": "ZZZZ"})).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"], json!("not_found"));
}

#[tokio::test]
async fn connect_falls_back_to_session_id() {
    let app = TestApp::new();
    let created = json_body(app.get("/api/session/new").await).await;
    let response = app
        .post_json(
            "/api/connect",
            json!({"code": "????", "sessionId": created["sessionId"]}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn expired_session_rejects_connect_and_heartbeat() {
    let app = TestApp::new();
    let created = json_body(app.get("/api/session/new").await).await;
    let session_id = str_of(&created, "sessionId");

    app.state
        .sessions
        .update(session_id, |s| {
            s.expires_at = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
        })
        .await
        .unwrap();

    let response = app
        .post_json("/api/connect", json!({"code": created["code"]}))
        .await;
    assert_eq!(response.status(), StatusCode::GONE);
    assert_eq!(json_body(response).await["error"], json!("expired"));

    let response = app
        .post_json(
            "/api/heartbeat",
            json!({"sessionId": session_id, "role": "receiver"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::GONE);

    let status = app.status(session_id).await;
    assert_eq!(status["closed"], json!(true));
    assert_eq!(status["secondsLeft"], json!(0));
}

#[tokio::test]
async fn bad_sender_token_writes_nothing() {
    let app = TestApp::new();
    let (created, _) = app.paired().await;
    let session_id = str_of(&created, "sessionId");

    let response = app.upload(session_id, "not-the-token", "book.epub", b"bytes").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(dir_is_empty(&app.session_dir(session_id)));
    assert_eq!(app.status(session_id).await["hasFile"], json!(false));
}

#[tokio::test]
async fn disallowed_extension_is_rejected_before_writing() {
    let app = TestApp::new();
    let (created, connected) = app.paired().await;
    let session_id = str_of(&created, "sessionId");

    let response = app
        .upload(session_id, str_of(&connected, "senderToken"), "malware.exe", b"MZ\x90\x00")
        .await;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(json_body(response).await["error"], json!("invalid_input"));
    assert!(dir_is_empty(&app.session_dir(session_id)));
}

#[tokio::test]
async fn oversize_upload_is_rejected_and_cleaned_up() {
    let app = TestApp::with_config(Config {
        max_file_bytes: 1024,
        ..Config::default()
    });
    let (created, connected) = app.paired().await;
    let session_id = str_of(&created, "sessionId");

    let response = app
        .upload(session_id, str_of(&connected, "senderToken"), "big.txt", &[b'a'; 4096])
        .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(dir_is_empty(&app.session_dir(session_id)));
    assert_eq!(app.status(session_id).await["hasFile"], json!(false));
}

#[tokio::test]
async fn upload_dropped_mid_body_leaves_no_blob() {
    let app = TestApp::new();
    let (created, connected) = app.paired().await;
    let session_id = str_of(&created, "sessionId").to_string();

    let boundary = "sendo-test-boundary";
    let mut head = format!(
        "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"book.epub\"\r\n\
         Content-Type: application/epub+zip\r\n\r\n",
        boundary
    )
    .into_bytes();
    head.extend_from_slice(&[b'a'; 300 * 1024]);
    // The client sends part of the file and then stalls forever.
    let body = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(head))])
        .chain(stream::pending());

    let request = Request::post(format!(
        "/api/upload?sessionId={}&senderToken={}",
        session_id,
        str_of(&connected, "senderToken")
    ))
    .header(
        header::CONTENT_TYPE,
        format!("multipart/form-data; boundary={}", boundary),
    )
    .body(Body::from_stream(body))
    .unwrap();

    let router = app.router.clone();
    let in_flight = tokio::spawn(async move { router.oneshot(request).await });

    let dir = app.session_dir(&session_id);
    let mut started = false;
    for _ in 0..100 {
        if !dir_is_empty(&dir) {
            started = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(started, "upload never reached the disk");

    in_flight.abort();
    let _ = in_flight.await;

    let mut cleaned = false;
    for _ in 0..100 {
        if dir_is_empty(&dir) {
            cleaned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(cleaned, "partial blob left behind");

    let status = app.status(&session_id).await;
    assert_eq!(status["hasFile"], json!(false));
    assert_eq!(status["status"], json!("connected"));
}

#[tokio::test]
async fn cancelled_download_keeps_the_file() {
    let app = TestApp::new();
    let (created, connected) = app.paired().await;
    let session_id = str_of(&created, "sessionId");
    let receiver_token = str_of(&created, "receiverToken");

    let book: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
    let response = app
        .upload(session_id, str_of(&connected, "senderToken"), "big.pdf", &book)
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let uri = format!("/api/download/{}?receiverToken={}", session_id, receiver_token);
    let response = app.get(&uri).await;
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body();
    let first = body.frame().await.unwrap().unwrap();
    assert!(first.data_ref().unwrap().len() < book.len());
    drop(body);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = app.status(session_id).await;
    assert_eq!(status["hasFile"], json!(true));

    // the retry gets every byte and releases the file
    let response = app.get(&uri).await;
    let downloaded = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(downloaded.as_ref(), book.as_slice());
    wait_for_has_file(&app, session_id, false).await;
}

#[tokio::test]
async fn download_requires_receiver_token_and_a_file() {
    let app = TestApp::new();
    let (created, _) = app.paired().await;
    let session_id = str_of(&created, "sessionId");

    let response = app
        .get(&format!("/api/download/{}?receiverToken=wrong", session_id))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .get(&format!(
            "/api/download/{}?receiverToken={}",
            session_id,
            str_of(&created, "receiverToken")
        ))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn disconnect_closes_and_deletes() {
    let app = TestApp::new();
    let (created, connected) = app.paired().await;
    let session_id = str_of(&created, "sessionId");
    app.upload(session_id, str_of(&connected, "senderToken"), "book.epub", b"data")
        .await;

    let response = app
        .post_json("/api/disconnect", json!({"sessionId": session_id, "by": "receiver"}))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"ok": true}));

    let status = app.status(session_id).await;
    assert_eq!(status["closed"], json!(true));
    assert_eq!(status["closedBy"], json!("receiver"));
    assert_eq!(status["hasFile"], json!(false));
    assert!(dir_is_empty(&app.session_dir(session_id)));

    // a second disconnect keeps the first reason
    app.post_json("/api/disconnect", json!({"sessionId": session_id}))
        .await;
    assert_eq!(app.status(session_id).await["closedBy"], json!("receiver"));

    let response = app
        .post_json("/api/heartbeat", json!({"sessionId": session_id, "role": "sender"}))
        .await;
    assert_eq!(response.status(), StatusCode::GONE);
}

#[tokio::test]
async fn heartbeat_validates_role() {
    let app = TestApp::new();
    let created = json_body(app.get("/api/session/new").await).await;

    let response = app
        .post_json(
            "/api/heartbeat",
            json!({"sessionId": created["sessionId"], "role": "spectator"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .post_json(
            "/api/heartbeat",
            json!({"sessionId": created["sessionId"], "role": "receiver"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(json_body(response).await["expiresAt"].is_i64());
}

#[tokio::test]
async fn qr_join_fails_closed() {
    let app = TestApp::new();
    let created = json_body(app.get("/api/session/new").await).await;
    let session_id = str_of(&created, "sessionId");
    let join_url = str_of(&created, "joinUrl");
    let token = join_url.rsplit("t=").next().unwrap();

    let response = app
        .get(&format!("/join?sessionId={}&t=forged", session_id))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.get("/join?sessionId=missing&t=x").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(app.status(session_id).await["senderConnected"], json!(false));

    let response = app
        .get(&format!("/join?sessionId={}&t={}", session_id, token))
        .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response.headers()[header::LOCATION],
        format!("/sender?sessionId={}&t={}", session_id, token).as_str()
    );
    assert_eq!(app.status(session_id).await["status"], json!("connected"));

    let response = app
        .post_json("/api/join", json!({"sessionId": session_id, "token": token}))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["senderToken"], json!(token));
}

#[tokio::test]
async fn qr_join_redirects_to_the_frontend_origin() {
    let app = TestApp::with_config(Config {
        frontend_base: Some("https://sendo.example".into()),
        ..Config::default()
    });
    let created = json_body(app.get("/api/session/new").await).await;
    let session_id = str_of(&created, "sessionId");
    let join_url = str_of(&created, "joinUrl");
    assert!(join_url.starts_with("https://sendo.example/join?"), "{}", join_url);
    let token = join_url.rsplit("t=").next().unwrap();

    let response = app
        .get(&format!("/join?sessionId={}&t={}", session_id, token))
        .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response.headers()[header::LOCATION],
        format!(
            "https://sendo.example/sender?sessionId={}&t={}",
            session_id, token
        )
        .as_str()
    );
}

#[tokio::test]
async fn web_pages_are_served_when_enabled() {
    let public_dir = std::env::temp_dir().join(format!("sendo_web_{}", Uuid::new_v4()));
    std::fs::create_dir_all(&public_dir).unwrap();
    std::fs::write(public_dir.join("sender.html"), "<h1>send</h1>").unwrap();
    std::fs::write(public_dir.join("receiver.html"), "<h1>receive</h1>").unwrap();

    let app = TestApp::with_config(Config {
        serve_web: true,
        public_dir: public_dir.clone(),
        ..Config::default()
    });

    for (path, expected) in [("/sender", "<h1>send</h1>"), ("/receiver", "<h1>receive</h1>")] {
        let response = app.get(path).await;
        assert_eq!(response.status(), StatusCode::OK, "{}", path);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], expected.as_bytes());
    }

    let _ = std::fs::remove_dir_all(&public_dir);
}

#[tokio::test]
async fn qr_png_is_served() {
    let app = TestApp::new();
    let created = json_body(app.get("/api/session/new").await).await;

    let response = app
        .get(&format!("/api/qr/{}.png", str_of(&created, "sessionId")))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    let png = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");

    let response = app.get(&format!("/api/qr/{}.png", Uuid::new_v4())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn api_responses_are_not_cacheable() {
    let app = TestApp::new();
    let response = app.get("/api/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CACHE_CONTROL],
        "no-store, no-cache, must-revalidate"
    );
    assert_eq!(response.headers()[header::PRAGMA], "no-cache");
    assert_eq!(response.headers()[header::EXPIRES], "0");

    let body = json_body(response).await;
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["name"], json!("Sendo"));
    assert_eq!(body["sessions"], json!(0));

    let response = app.get("/api/session/missing/status").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()[header::PRAGMA], "no-cache");
}
