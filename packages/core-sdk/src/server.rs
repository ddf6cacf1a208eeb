use anyhow::Result;
use axum::{
    extract::State,
    response::Html,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::screen::{ChatSession, Notice, ScreenEvent};

/**
 * \brief Start the local HTTP server for the chat screen.
 * \param addr listen address, e.g. "127.0.0.1:5173"
 */
pub async fn run(addr: &str, session: ChatSession) -> Result<()> {
    let app = router(session);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief Routes: the page itself, one send endpoint and a read-only view of the display.
 */
pub fn router(session: ChatSession) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/screen", get(get_screen))
        .route("/api/send", post(send))
        .with_state(session)
}

#[derive(Deserialize, Debug)]
struct SendRequest {
    /** \brief Text typed by the user. */
    text: String,
}

#[derive(Serialize, Debug)]
struct ScreenState {
    display_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    notice: Option<Notice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn get_screen(State(session): State<ChatSession>) -> Json<ScreenState> {
    Json(ScreenState {
        display_text: session.display_text(),
        notice: None,
        message: None,
    })
}

/**
 * \brief Submit one send and answer once it completes.
 * \details The display text returned is whatever the screen shows at that moment, which may
 *          come from a different, later-arriving send.
 */
async fn send(
    State(session): State<ChatSession>,
    Json(input): Json<SendRequest>,
) -> Result<Json<ScreenState>, (axum::http::StatusCode, String)> {
    let event = session.submit(input.text).await.map_err(internal_err)?;
    let notice = match event {
        ScreenEvent::Display(_) => None,
        ScreenEvent::Notice(notice) => Some(notice),
    };
    Ok(Json(ScreenState {
        display_text: session.display_text(),
        message: notice.as_ref().map(|n| n.to_string()),
        notice,
    }))
}

fn internal_err<E: std::fmt::Display>(e: E) -> (axum::http::StatusCode, String) {
    (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>PocketChat</title>
<style>
  body { font-family: sans-serif; max-width: 40rem; margin: 2rem auto; padding: 0 1rem; }
  #display { white-space: pre-wrap; min-height: 8rem; border: 1px solid #ccc; padding: .75rem; }
  #toast { position: fixed; bottom: 1rem; left: 50%; transform: translateX(-50%);
           background: #333; color: #fff; padding: .5rem 1rem; border-radius: .5rem; display: none; }
  form { display: flex; gap: .5rem; margin-top: 1rem; }
  input { flex: 1; }
</style>
</head>
<body>
<div id="display"></div>
<form id="form">
  <input id="input" autocomplete="off" placeholder="Type a message">
  <button id="send" type="submit">Send</button>
</form>
<div id="toast"></div>
<script>
  const display = document.getElementById("display");
  const input = document.getElementById("input");
  const toast = document.getElementById("toast");
  function notify(text) {
    toast.textContent = text;
    toast.style.display = "block";
    clearTimeout(notify.timer);
    notify.timer = setTimeout(() => { toast.style.display = "none"; }, 3500);
  }
  fetch("/api/screen").then(r => r.json()).then(s => { display.textContent = s.display_text; });
  document.getElementById("form").addEventListener("submit", async (ev) => {
    ev.preventDefault();
    const text = input.value;
    input.value = "";
    try {
      const resp = await fetch("/api/send", {
        method: "POST",
        headers: { "Content-Type": "application/json" },
        body: JSON.stringify({ text }),
      });
      if (!resp.ok) { notify("Failed to send message: " + await resp.text()); return; }
      const state = await resp.json();
      display.textContent = state.display_text;
      if (state.message) notify(state.message);
    } catch (err) {
      notify("Failed to send message: " + err);
    }
  });
</script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::AuthInterceptor;
    use crate::llm::ChatClient;
    use crate::secrets::MemoryCredentials;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;
    use wiremock::matchers::{body_string_contains, header as match_header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn app_for(server: &MockServer) -> Router {
        let interceptor =
            AuthInterceptor::new(Arc::new(MemoryCredentials::with_api_key("sk-web")));
        let client = ChatClient::new(&server.uri(), interceptor).unwrap();
        let (session, _events) = ChatSession::new(client);
        router(session)
    }

    async fn post_send(app: Router, text: &str) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("POST")
            .uri("/api/send")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "text": text }).to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_index_has_single_screen_controls() {
        let server = MockServer::start().await;
        let resp = app_for(&server)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let html = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(html.contains(r#"id="input""#));
        assert!(html.contains(r#"id="display""#));
        assert!(html.contains(r#"id="send""#));
    }

    #[tokio::test]
    async fn test_send_success_and_then_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(match_header("authorization", "Bearer sk-web"))
            .and(body_string_contains("hello"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-9",
                "object": "chat.completion",
                "created": 2,
                "model": "gpt-3.5-turbo",
                "choices": [{"message": {"role": "assistant", "content": "hi!"}}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("boom"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let app = app_for(&server);

        let (status, body) = post_send(app.clone(), "hello").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"display_text": "hi!"}));

        let (status, body) = post_send(app.clone(), "boom").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["display_text"], "hi!");
        assert_eq!(body["notice"], json!({"kind": "response_error", "code": 401}));
        assert_eq!(body["message"], "Response error: 401");

        let resp = app
            .oneshot(Request::builder().uri("/api/screen").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let screen: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(screen, json!({"display_text": "hi!"}));
    }
}
