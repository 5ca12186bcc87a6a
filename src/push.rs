//! Expo push notification delivery (spec §6.3).

const PUSH_ENDPOINT: &str = "https://exp.host/--/api/v2/push/send";

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("push endpoint request failed: {0}")]
    Transport(String),
    #[error("push endpoint reported an error: {0}")]
    Rejected(String),
}

#[derive(serde::Serialize)]
struct PushRequest<'a> {
    to: &'a str,
    title: &'a str,
    body: &'a str,
    data: serde_json::Value,
}

#[derive(serde::Deserialize, Default)]
struct PushResponseData {
    status: Option<String>,
    message: Option<String>,
}

#[derive(serde::Deserialize, Default)]
struct PushResponse {
    data: Option<PushResponseData>,
}

pub struct PushClient {
    http: reqwest::blocking::Client,
}

impl Default for PushClient {
    fn default() -> Self {
        Self::new()
    }
}

impl PushClient {
    pub fn new() -> Self {
        let http = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("building the reqwest client cannot fail with a static config");
        PushClient { http }
    }

    /// POSTs the notification. A non-2xx status *or* `data.status == "error"` in an otherwise
    /// successful response body counts as failure (spec §6.3).
    pub fn send(
        &self,
        push_token: &str,
        title: &str,
        body: &str,
        data: serde_json::Value,
    ) -> Result<(), PushError> {
        let req = PushRequest {
            to: push_token,
            title,
            body,
            data,
        };
        let resp = self
            .http
            .post(PUSH_ENDPOINT)
            .json(&req)
            .send()
            .map_err(|e| PushError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(PushError::Transport(format!(
                "HTTP status {}",
                resp.status()
            )));
        }

        let parsed: PushResponse = resp
            .json()
            .map_err(|e| PushError::Transport(e.to_string()))?;
        if let Some(data) = parsed.data {
            if data.status.as_deref() == Some("error") {
                return Err(PushError::Rejected(
                    data.message.unwrap_or_else(|| "unknown error".to_string()),
                ));
            }
        }
        Ok(())
    }
}
