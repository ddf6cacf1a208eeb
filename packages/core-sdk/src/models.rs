use serde::{Deserialize, Serialize};

/** \brief Model identifier sent with every request. */
pub const MODEL: &str = "gpt-3.5-turbo";

/** \brief Sampling temperature sent with every request. */
pub const TEMPERATURE: f64 = 0.7;

pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";

/**
 * \brief Chat message, aligned with the OpenAI Chat message format.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /** \brief Role: system/user/assistant */
    pub role: String,
    /** \brief Content; the API may send `null` for non-text replies. */
    #[serde(default)]
    pub content: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ROLE_USER.to_string(),
            content: Some(content.into()),
        }
    }
}

/**
 * \brief Request payload for `v1/chat/completions`, built fresh per send.
 */
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f64,
}

impl ChatRequest {
    /**
     * \brief Single-turn request: the user text is the only message.
     */
    pub fn single_turn(user_text: &str) -> Self {
        Self {
            model: MODEL.to_string(),
            messages: vec![Message::user(user_text)],
            temperature: TEMPERATURE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub message: Message,
}

/**
 * \brief Response payload. Metadata is informational only, so missing fields default.
 */
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
}

impl ChatResponse {
    /**
     * \brief Content of the first choice authored by the assistant, if any.
     */
    pub fn first_assistant_content(&self) -> Option<&str> {
        self.choices
            .iter()
            .find(|c| c.message.role == ROLE_ASSISTANT)
            .map(|c| c.message.content.as_deref().unwrap_or(""))
    }
}
