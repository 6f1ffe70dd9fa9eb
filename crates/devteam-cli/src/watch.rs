//! Following a run: SSE push with a polling fallback.

use std::time::Duration;

use devteam_core::{ProgressEvent, RunStatusView};
use futures_util::StreamExt;

use crate::client::DevTeamClient;
use crate::error::ClientError;

const BAR_WIDTH: usize = 30;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser.
///
/// Input is buffered as bytes and decoded a whole line at a time, so a
/// multi-byte character split across chunks survives.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    /// Feed a chunk, returning every message it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();

        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() || self.event.is_some() {
                    messages.push(SseMessage {
                        event: self.event.take().unwrap_or_else(|| "message".to_string()),
                        data: std::mem::take(&mut self.data).join("\n"),
                    });
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        messages
    }
}

/// `[#####-----]  50%`
pub fn progress_bar(percent: u8, width: usize) -> String {
    let percent = percent.min(100) as usize;
    let filled = width * percent / 100;
    format!(
        "[{}{}] {percent:>3}%",
        "#".repeat(filled),
        "-".repeat(width - filled)
    )
}

/// Prints progress lines, skipping exact repeats.
#[derive(Debug, Default)]
pub struct Renderer {
    last: Option<String>,
}

impl Renderer {
    pub fn event_line(event: &ProgressEvent) -> String {
        let mut line = format!(
            "{} {:<12} {}",
            progress_bar(event.progress_percent, BAR_WIDTH),
            event.status.as_str(),
            event.message
        );
        if let Some(error) = &event.error {
            line.push_str(&format!(" (error: {error})"));
        }
        line
    }

    pub fn view_line(view: &RunStatusView) -> String {
        let mut line = format!(
            "{} {:<12} {}/{} tasks",
            progress_bar(view.progress_percent, BAR_WIDTH),
            view.status.as_str(),
            view.completed_task_ids.len(),
            view.total_tasks
        );
        if let Some(task) = &view.current_task_id {
            line.push_str(&format!(", working on {task}"));
        }
        line
    }

    fn print(&mut self, line: String) {
        if self.last.as_deref() != Some(line.as_str()) {
            println!("{line}");
            self.last = Some(line);
        }
    }
}

/// Follow a run until it reaches a terminal status, returning its final view.
pub async fn watch(
    client: &DevTeamClient,
    run_id: &str,
    interval: Duration,
) -> Result<RunStatusView, ClientError> {
    let mut renderer = Renderer::default();

    match follow_events(client, run_id, &mut renderer).await {
        Ok(true) => return client.status(run_id).await,
        Ok(false) => {
            eprintln!(
                "Live updates ended early; polling every {}s",
                interval.as_secs()
            );
        }
        Err(e) if e.is_not_found() => return Err(e),
        Err(e) => {
            tracing::debug!(error = %e, "SSE subscription failed");
            eprintln!(
                "Live updates unavailable ({e}); polling every {}s",
                interval.as_secs()
            );
        }
    }

    poll(client, run_id, interval, &mut renderer).await
}

/// Consume the SSE stream. Returns `Ok(true)` once a terminal state was seen,
/// `Ok(false)` if the stream closed before that.
async fn follow_events(
    client: &DevTeamClient,
    run_id: &str,
    renderer: &mut Renderer,
) -> Result<bool, ClientError> {
    let response = client.events(run_id).await?;
    let mut body = response.bytes_stream();
    let mut parser = SseParser::default();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| ClientError::Stream(e.to_string()))?;
        for message in parser.feed(&chunk) {
            match message.event.as_str() {
                "snapshot" => {
                    let view: RunStatusView = serde_json::from_str(&message.data)
                        .map_err(|e| ClientError::Serialization(e.to_string()))?;
                    renderer.print(Renderer::view_line(&view));
                    if view.status.is_terminal() {
                        return Ok(true);
                    }
                }
                "progress" => {
                    let event: ProgressEvent = serde_json::from_str(&message.data)
                        .map_err(|e| ClientError::Serialization(e.to_string()))?;
                    renderer.print(Renderer::event_line(&event));
                    if event.is_terminal() {
                        return Ok(true);
                    }
                }
                _ => {}
            }
        }
    }
    Ok(false)
}

async fn poll(
    client: &DevTeamClient,
    run_id: &str,
    interval: Duration,
    renderer: &mut Renderer,
) -> Result<RunStatusView, ClientError> {
    loop {
        let view = client.status(run_id).await?;
        renderer.print(Renderer::view_line(&view));
        if view.status.is_terminal() {
            return Ok(view);
        }
        tokio::time::sleep(interval).await;
    }
}
