use crate::error::{LlmError, Result};
use crate::types::{RunStatus, ThreadState};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";

const ASSISTANTS_BETA_HEADER: (&str, &str) = ("OpenAI-Beta", "assistants=v2");
const REPLY_PAGE_LIMIT: u32 = 20;

#[derive(Clone)]
pub struct AssistantsClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    poll_interval: Duration,
    run_timeout: Duration,
}

impl AssistantsClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_key: &str, request_timeout: Duration) -> Result<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(LlmError::InvalidInput("api key is required".to_string()));
        }
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            base_url: DEFAULT_API_BASE_URL.to_string(),
            poll_interval: Duration::from_millis(500),
            run_timeout: Duration::from_secs(120),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim().trim_end_matches('/').to_string();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Posts `text` to the conversation's thread, runs `assistant_id` on it
    /// and returns the assistant's reply for that run.
    ///
    /// A thread is created on first use and written back into `thread`.
    #[tracing::instrument(level = "info", skip_all, fields(assistant_id = %assistant_id))]
    pub async fn ask(
        &self,
        assistant_id: &str,
        text: &str,
        thread: &mut ThreadState,
    ) -> Result<String> {
        if assistant_id.trim().is_empty() {
            return Err(LlmError::InvalidInput("assistant id is required".to_string()));
        }
        if text.trim().is_empty() {
            return Err(LlmError::InvalidInput("message text is empty".to_string()));
        }

        let thread_id = match thread.thread_id.clone() {
            Some(id) => id,
            None => {
                let id = self.create_thread().await?;
                tracing::debug!(thread_id = %id, "assistants thread created");
                thread.thread_id = Some(id.clone());
                id
            }
        };

        self.add_user_message(&thread_id, text).await?;
        let run = self.create_run(&thread_id, assistant_id).await?;
        let run = self.wait_for_run(&thread_id, run).await?;
        if run.status != RunStatus::Completed {
            if run.status == RunStatus::RequiresAction {
                self.cancel_run_best_effort(&thread_id, &run.id).await;
            }
            return Err(LlmError::RunFailed {
                detail: run.failure_detail(),
                run_id: run.id,
                status: run.status.to_string(),
            });
        }

        let messages = self.run_messages(&thread_id, &run.id).await?;
        let reply = assistant_reply_text(messages);
        if reply.trim().is_empty() {
            return Err(LlmError::ResponseFormat(format!(
                "run {} completed without assistant text",
                run.id
            )));
        }
        Ok(reply)
    }

    async fn create_thread(&self) -> Result<String> {
        let created: IdObject = self
            .post_json(&format!("{}/threads", self.base_url), &serde_json::json!({}))
            .await?;
        Ok(created.id)
    }

    async fn add_user_message(&self, thread_id: &str, text: &str) -> Result<()> {
        let _: IdObject = self
            .post_json(
                &format!("{}/threads/{thread_id}/messages", self.base_url),
                &CreateMessageRequest {
                    role: "user",
                    content: text,
                },
            )
            .await?;
        Ok(())
    }

    async fn create_run(&self, thread_id: &str, assistant_id: &str) -> Result<RunObject> {
        self.post_json(
            &format!("{}/threads/{thread_id}/runs", self.base_url),
            &CreateRunRequest { assistant_id },
        )
        .await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(run_id = %run.id))]
    async fn wait_for_run(&self, thread_id: &str, mut run: RunObject) -> Result<RunObject> {
        let started = Instant::now();
        while !run.status.is_terminal() {
            if started.elapsed() >= self.run_timeout {
                self.cancel_run_best_effort(thread_id, &run.id).await;
                return Err(LlmError::Timeout {
                    run_id: run.id,
                    waited_secs: self.run_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
            run = self
                .get_json(&format!(
                    "{}/threads/{thread_id}/runs/{}",
                    self.base_url, run.id
                ))
                .await?;
            tracing::trace!(status = %run.status, "run polled");
        }
        tracing::debug!(
            status = %run.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "run finished"
        );
        Ok(run)
    }

    async fn run_messages(&self, thread_id: &str, run_id: &str) -> Result<Vec<ThreadMessage>> {
        let page: MessageList = self
            .get_json(&format!(
                "{}/threads/{thread_id}/messages?order=desc&limit={REPLY_PAGE_LIMIT}&run_id={run_id}",
                self.base_url
            ))
            .await?;
        Ok(page.data)
    }

    async fn cancel_run_best_effort(&self, thread_id: &str, run_id: &str) {
        let url = format!("{}/threads/{thread_id}/runs/{run_id}/cancel", self.base_url);
        if let Err(e) = self
            .post_json::<RunObject, _>(&url, &serde_json::json!({}))
            .await
        {
            tracing::warn!(%e, run_id, "run cancel failed");
        }
    }

    async fn post_json<T, B>(&self, url: &str, body: &B) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
        B: Serialize + ?Sized,
    {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .header(ASSISTANTS_BETA_HEADER.0, ASSISTANTS_BETA_HEADER.1)
            .json(body)
            .send()
            .await?;
        decode_response(response, url).await
    }

    async fn get_json<T>(&self, url: &str) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.api_key)
            .header(ASSISTANTS_BETA_HEADER.0, ASSISTANTS_BETA_HEADER.1)
            .send()
            .await?;
        decode_response(response, url).await
    }
}

async fn decode_response<T>(response: reqwest::Response, url: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(LlmError::Http(format!(
            "assistants request to {url} failed: status={status} body={body}"
        )));
    }
    Ok(serde_json::from_str(&body)?)
}

/// Joins the assistant text parts of one run in chronological order. The
/// listing is newest first; separate messages become separate paragraphs.
fn assistant_reply_text(mut messages: Vec<ThreadMessage>) -> String {
    messages.reverse();
    messages
        .into_iter()
        .filter(|m| m.role == "assistant")
        .flat_map(|m| m.content)
        .filter_map(|part| match part {
            MessageContent::Text { text } => Some(text.value),
            MessageContent::Other => None,
        })
        .filter(|value| !value.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[derive(Debug, Serialize)]
struct CreateMessageRequest<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateRunRequest<'a> {
    assistant_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct IdObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunObject {
    id: String,
    status: RunStatus,
    #[serde(default)]
    last_error: Option<RunError>,
    #[serde(default)]
    incomplete_details: Option<serde_json::Value>,
}

impl RunObject {
    fn failure_detail(&self) -> String {
        if let Some(err) = &self.last_error {
            return format!("{}: {}", err.code, err.message);
        }
        if let Some(details) = &self.incomplete_details {
            return details.to_string();
        }
        "no error detail".to_string()
    }
}

#[derive(Debug, Deserialize)]
struct RunError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    data: Vec<ThreadMessage>,
}

#[derive(Debug, Deserialize)]
struct ThreadMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: Vec<MessageContent>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum MessageContent {
    Text { text: TextContent },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct TextContent {
    value: String,
}
