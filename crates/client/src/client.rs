use protocol_core::{AgentDescriptor, AgentEntry, Event, Request, Run, Thread};
use reqwest::Client;
use uuid::Uuid;

use crate::error::{ClientError, ErrorBody, Result};
use crate::events::{EventReceiver, ReconnectPolicy};

/// Client for one agent mounted at `base_url` (for example `http://localhost:3001/echo`).
pub struct ProtocolClient {
    base_url: String,
    client: Client,
    reconnect: ReconnectPolicy,
}

impl ProtocolClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn describe(&self) -> Result<AgentDescriptor> {
        let response = self
            .client
            .get(format!("{}/describe", self.base_url))
            .send()
            .await?;

        handle_response(response).await
    }

    /// Submit a request.
    ///
    /// With `wait`, returns the event the server answers with: `run_started`
    /// for a new run, the terminal event for a cancel, the next event for a
    /// resume.
    pub async fn run(&self, request: &Request, wait: bool) -> Result<Option<Event>> {
        let response = self
            .client
            .post(format!("{}/run", self.base_url))
            .query(&[("wait", wait)])
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let body = response.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&body)?))
    }

    /// Submit a new-run request and return its `run_started` event.
    pub async fn start(&self, request: &Request) -> Result<Event> {
        self.run(request, true).await?.ok_or_else(|| {
            ClientError::InvalidResponse("server accepted the run without an event".to_string())
        })
    }

    pub async fn get_events(&self, run_id: Uuid, since: Option<u64>) -> Result<Vec<Event>> {
        let mut query = vec![
            ("run_id", run_id.to_string()),
            ("stream", "false".to_string()),
        ];
        if let Some(since) = since {
            query.push(("since", since.to_string()));
        }

        let response = self
            .client
            .get(format!("{}/get_events", self.base_url))
            .query(&query)
            .send()
            .await?;

        handle_response(response).await
    }

    /// Stream a run's events after `since`, reconnecting from the last
    /// delivered id when the connection drops.
    pub fn stream_events(&self, run_id: Uuid, since: Option<u64>) -> EventReceiver {
        let mut query = vec![
            ("run_id", run_id.to_string()),
            ("stream", "true".to_string()),
        ];
        if let Some(since) = since {
            query.push(("since", since.to_string()));
        }

        let initial = self
            .client
            .get(format!("{}/get_events", self.base_url))
            .query(&query)
            .header("Accept", "text/event-stream");

        EventReceiver::spawn(
            self.client.clone(),
            self.base_url.clone(),
            initial,
            Some(run_id),
            since,
            self.reconnect,
        )
    }

    /// Submit a request and stream the resulting run's events.
    pub fn stream_request(&self, request: &Request) -> EventReceiver {
        let initial = self
            .client
            .post(format!("{}/stream_request", self.base_url))
            .header("Accept", "text/event-stream")
            .json(request);

        EventReceiver::spawn(
            self.client.clone(),
            self.base_url.clone(),
            initial,
            request.run_id,
            None,
            self.reconnect,
        )
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Run> {
        let response = self
            .client
            .get(format!("{}/runs/{}", self.base_url, run_id))
            .send()
            .await?;

        handle_response(response).await
    }

    pub async fn list_threads(&self) -> Result<Vec<Thread>> {
        let response = self
            .client
            .get(format!("{}/threads", self.base_url))
            .send()
            .await?;

        handle_response(response).await
    }

    pub async fn create_thread(&self) -> Result<Thread> {
        let response = self
            .client
            .post(format!("{}/threads", self.base_url))
            .send()
            .await?;

        handle_response(response).await
    }

    pub async fn delete_thread(&self, thread_id: Uuid) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/threads/{}", self.base_url, thread_id))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(())
    }

    pub async fn thread_history(&self, thread_id: Uuid) -> Result<Vec<Event>> {
        let response = self
            .client
            .get(format!("{}/get_events/{}", self.base_url, thread_id))
            .send()
            .await?;

        handle_response(response).await
    }
}

/// Agents listed at the root of a server.
pub async fn list_agents(server_url: &str) -> Result<Vec<AgentEntry>> {
    let response = Client::new()
        .get(format!("{}/", server_url.trim_end_matches('/')))
        .send()
        .await?;

    handle_response(response).await
}

async fn handle_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }

    let body = response.json().await?;
    Ok(body)
}

pub(crate) async fn api_error(response: reqwest::Response) -> ClientError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) => ClientError::Api {
            status: status.as_u16(),
            kind: parsed.error,
            message: parsed.message,
        },
        Err(_) => ClientError::InvalidResponse(format!("Status {}: {}", status, body)),
    }
}
