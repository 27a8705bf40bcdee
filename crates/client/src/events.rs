use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use protocol_core::Event;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{ClientError, Result};

/// How an interrupted event stream is resumed.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry; grows linearly with each attempt.
    pub backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(500),
        }
    }
}

impl ReconnectPolicy {
    pub fn never() -> Self {
        Self {
            max_attempts: 0,
            backoff: Duration::ZERO,
        }
    }
}

/// Where a dropped stream picks up again.
struct Cursor {
    run_id: Option<Uuid>,
    last_id: Option<u64>,
}

impl Cursor {
    fn seen(&self, event: &Event) -> bool {
        self.run_id == Some(event.run_id) && self.last_id.is_some_and(|last| event.id <= last)
    }
}

/// Receiving end of a run's SSE event stream.
///
/// Ends after the terminal event, or with an error once reconnecting fails.
pub struct EventReceiver {
    rx: mpsc::Receiver<Result<Event>>,
}

impl EventReceiver {
    pub(crate) fn spawn(
        client: reqwest::Client,
        base_url: String,
        initial: reqwest::RequestBuilder,
        run_id: Option<Uuid>,
        since: Option<u64>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Result<Event>>(100);
        let cursor = Cursor {
            run_id,
            last_id: since,
        };

        tokio::spawn(pump(client, base_url, initial, cursor, policy, tx));

        Self { rx }
    }

    pub async fn next_event(&mut self) -> Option<Result<Event>> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Event>> + Send + 'static {
        futures::stream::unfold(self, |mut receiver| async move {
            receiver.next_event().await.map(|item| (item, receiver))
        })
    }

    /// Drain the stream, failing on the first error.
    pub async fn collect(mut self) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            events.push(event?);
        }
        Ok(events)
    }
}

async fn pump(
    client: reqwest::Client,
    base_url: String,
    initial: reqwest::RequestBuilder,
    mut cursor: Cursor,
    policy: ReconnectPolicy,
    tx: mpsc::Sender<Result<Event>>,
) {
    let mut next_request = Some(initial);
    let mut attempts = 0u32;

    loop {
        let request = match next_request.take() {
            Some(request) => request,
            None => {
                let Some(run_id) = cursor.run_id else {
                    let _ = tx
                        .send(Err(ClientError::EventStream(
                            "stream dropped before the run was identified".to_string(),
                        )))
                        .await;
                    return;
                };
                let mut query = vec![
                    ("run_id", run_id.to_string()),
                    ("stream", "true".to_string()),
                ];
                if let Some(last_id) = cursor.last_id {
                    query.push(("since", last_id.to_string()));
                }
                client
                    .get(format!("{}/get_events", base_url))
                    .query(&query)
                    .header("Accept", "text/event-stream")
            }
        };

        let reason = match request.send().await {
            Ok(response) if response.status().is_success() => {
                let mut frames = response.bytes_stream().eventsource();
                let mut reason = "stream closed before the terminal event".to_string();

                while let Some(frame) = frames.next().await {
                    let frame = match frame {
                        Ok(frame) => frame,
                        Err(e) => {
                            reason = e.to_string();
                            break;
                        }
                    };
                    if frame.data.is_empty() {
                        continue;
                    }

                    // Skipping a frame would move the cursor past it on the
                    // next event, so a malformed frame ends the stream.
                    let event = match serde_json::from_str::<Event>(&frame.data) {
                        Ok(event) => event,
                        Err(e) => {
                            tracing::error!("Failed to parse event: {} - data: {}", e, frame.data);
                            let _ = tx
                                .send(Err(ClientError::EventStream(format!(
                                    "malformed event after id {:?}: {}",
                                    cursor.last_id, e
                                ))))
                                .await;
                            return;
                        }
                    };

                    if cursor.seen(&event) {
                        continue;
                    }
                    attempts = 0;
                    cursor.run_id = Some(event.run_id);
                    cursor.last_id = Some(event.id);

                    let terminal = event.is_terminal();
                    if tx.send(Ok(event)).await.is_err() || terminal {
                        return;
                    }
                }
                reason
            }
            Ok(response) => {
                // A non-2xx answer will not change on retry.
                let _ = tx.send(Err(crate::client::api_error(response).await)).await;
                return;
            }
            Err(e) => e.to_string(),
        };

        attempts += 1;
        if attempts > policy.max_attempts {
            let _ = tx.send(Err(ClientError::EventStream(reason))).await;
            return;
        }

        tracing::warn!(
            run_id = ?cursor.run_id,
            since = ?cursor.last_id,
            attempt = attempts,
            "Event stream interrupted ({}), reconnecting",
            reason
        );
        tokio::time::sleep(policy.backoff * attempts).await;
    }
}
