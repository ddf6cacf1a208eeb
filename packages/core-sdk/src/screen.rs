use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::llm::{ChatClient, Failure, SendOutcome};

/**
 * \brief Transient user-visible notification for a send that produced no reply.
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    EmptyResponse,
    ResponseError { code: u16 },
    SendFailed { message: String },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::EmptyResponse => write!(f, "Received empty response"),
            Notice::ResponseError { code } => write!(f, "Response error: {}", code),
            Notice::SendFailed { message } => write!(f, "Failed to send message: {}", message),
        }
    }
}

/**
 * \brief Display state of the single chat screen.
 */
#[derive(Debug, Clone, Default)]
pub struct ChatScreen {
    display_text: String,
}

impl ChatScreen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn display_text(&self) -> &str {
        &self.display_text
    }

    /**
     * \brief Apply a completion. Only a successful reply touches the display text.
     */
    pub fn apply(&mut self, outcome: SendOutcome) -> Option<Notice> {
        match outcome {
            SendOutcome::Success { text } => {
                self.display_text = text;
                None
            }
            SendOutcome::EmptyResponse => Some(Notice::EmptyResponse),
            SendOutcome::Failure(Failure::Status(code)) => Some(Notice::ResponseError { code }),
            SendOutcome::Failure(Failure::Transport(message)) => {
                Some(Notice::SendFailed { message })
            }
        }
    }
}

/**
 * \brief What a completed send changed on screen.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScreenEvent {
    Display(String),
    Notice(Notice),
}

/**
 * \brief Screen plus client: every `submit` runs as its own task.
 * \details Sends are not queued or serialized and carry no sequence token, so when sends overlap
 *          the completion that arrives last owns the display.
 */
#[derive(Clone)]
pub struct ChatSession {
    client: Arc<ChatClient>,
    screen: Arc<Mutex<ChatScreen>>,
    events: mpsc::UnboundedSender<ScreenEvent>,
}

impl ChatSession {
    /**
     * \brief Create a session and the receiver for its screen events.
     */
    pub fn new(client: ChatClient) -> (Self, mpsc::UnboundedReceiver<ScreenEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            client: Arc::new(client),
            screen: Arc::new(Mutex::new(ChatScreen::new())),
            events: tx,
        };
        (session, rx)
    }

    pub fn display_text(&self) -> String {
        self.screen
            .lock()
            .map(|s| s.display_text().to_string())
            .unwrap_or_else(|poisoned| poisoned.into_inner().display_text().to_string())
    }

    /**
     * \brief Send `text` in the background. Must be called inside a tokio runtime.
     * \return Handle resolving to the event this send produced.
     */
    pub fn submit(&self, text: String) -> JoinHandle<ScreenEvent> {
        tracing::debug!(prompt_len = text.len(), "send requested");
        let session = self.clone();
        tokio::spawn(async move {
            let outcome = session.client.send(&text).await;
            session.complete(outcome)
        })
    }

    fn complete(&self, outcome: SendOutcome) -> ScreenEvent {
        let mut screen = self
            .screen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let event = match screen.apply(outcome) {
            None => ScreenEvent::Display(screen.display_text().to_string()),
            Some(notice) => ScreenEvent::Notice(notice),
        };
        // Sent under the lock so channel order matches apply order. Nobody listening is fine.
        let _ = self.events.send(event.clone());
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::AuthInterceptor;
    use crate::secrets::MemoryCredentials;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn reply(text: &str) -> serde_json::Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-3.5-turbo",
            "choices": [{"message": {"role": "assistant", "content": text}}]
        })
    }

    fn session_for(server: &MockServer) -> (ChatSession, mpsc::UnboundedReceiver<ScreenEvent>) {
        let interceptor =
            AuthInterceptor::new(Arc::new(MemoryCredentials::with_api_key("sk-test")));
        ChatSession::new(ChatClient::new(&server.uri(), interceptor).unwrap())
    }

    #[test]
    fn test_success_replaces_display() {
        let mut screen = ChatScreen::new();
        let notice = screen.apply(SendOutcome::Success {
            text: "answer".into(),
        });
        assert_eq!(notice, None);
        assert_eq!(screen.display_text(), "answer");
    }

    #[test]
    fn test_other_outcomes_keep_display() {
        let mut screen = ChatScreen::new();
        screen.apply(SendOutcome::Success {
            text: "kept".into(),
        });

        let empty = screen.apply(SendOutcome::EmptyResponse).unwrap();
        assert_eq!(empty.to_string(), "Received empty response");

        let status = screen
            .apply(SendOutcome::Failure(Failure::Status(503)))
            .unwrap();
        assert_eq!(status, Notice::ResponseError { code: 503 });
        assert!(status.to_string().contains("503"));

        let transport = screen
            .apply(SendOutcome::Failure(Failure::Transport("connection refused".into())))
            .unwrap();
        assert_eq!(
            transport.to_string(),
            "Failed to send message: connection refused"
        );

        assert_eq!(screen.display_text(), "kept");
    }

    #[test]
    fn test_notice_serializes_tagged() {
        assert_eq!(
            serde_json::to_value(Notice::ResponseError { code: 401 }).unwrap(),
            json!({"kind": "response_error", "code": 401})
        );
    }

    #[tokio::test]
    async fn test_submit_updates_screen_and_emits_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply("pong")))
            .mount(&server)
            .await;

        let (session, mut events) = session_for(&server);
        let event = session.submit("ping".into()).await.unwrap();
        assert_eq!(event, ScreenEvent::Display("pong".into()));
        assert_eq!(events.recv().await, Some(ScreenEvent::Display("pong".into())));
        assert_eq!(session.display_text(), "pong");
    }

    #[tokio::test]
    async fn test_failed_submit_leaves_display() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("good"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply("first answer")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("bad"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (session, _events) = session_for(&server);
        session.submit("good".into()).await.unwrap();
        let event = session.submit("bad".into()).await.unwrap();
        assert_eq!(event, ScreenEvent::Notice(Notice::ResponseError { code: 500 }));
        assert_eq!(session.display_text(), "first answer");
    }

    #[tokio::test]
    async fn test_overlapping_sends_last_completion_wins() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("slow"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(reply("slow reply"))
                    .set_delay(Duration::from_millis(400)),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("fast"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply("fast reply")))
            .mount(&server)
            .await;

        let (session, mut events) = session_for(&server);
        let slow = session.submit("slow".into());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let fast = session.submit("fast".into());

        fast.await.unwrap();
        slow.await.unwrap();

        assert_eq!(events.recv().await, Some(ScreenEvent::Display("fast reply".into())));
        assert_eq!(events.recv().await, Some(ScreenEvent::Display("slow reply".into())));
        // The older send arrived last and owns the display.
        assert_eq!(session.display_text(), "slow reply");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_event_order_matches_display_under_contention() {
        let server = MockServer::start().await;
        for i in 0..16u64 {
            Mock::given(method("POST"))
                .and(body_string_contains(format!("msg-{:02}", i)))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_json(reply(&format!("reply-{:02}", i)))
                        .set_delay(Duration::from_millis((i * 7) % 5)),
                )
                .mount(&server)
                .await;
        }

        for _ in 0..10 {
            let (session, mut events) = session_for(&server);
            let handles: Vec<_> = (0..16)
                .map(|i| session.submit(format!("msg-{:02}", i)))
                .collect();
            for handle in handles {
                handle.await.unwrap();
            }

            let mut last = None;
            while let Ok(event) = events.try_recv() {
                last = Some(event);
            }
            assert_eq!(last, Some(ScreenEvent::Display(session.display_text())));
        }
    }
}
