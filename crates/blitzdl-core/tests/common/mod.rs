#![allow(dead_code)]

use async_trait::async_trait;
use blitzdl_core::{BlitzError, EventSubscriber};
use blitzdl_types::SegmentId;
use std::sync::{Arc, Mutex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Deterministic test data: each byte = (offset % 251) as u8.
pub fn test_body(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Range-aware responder: serves real slices with `206` + `Content-Range`,
/// or the whole body with `200` when no `Range` header is present.
pub struct RangeResponder {
    body: Vec<u8>,
    content_disposition: Option<String>,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            content_disposition: None,
        }
    }

    pub fn with_content_disposition(mut self, value: &str) -> Self {
        self.content_disposition = Some(value.to_string());
        self
    }
}

fn parse_range(value: &str) -> Option<(i64, Option<i64>)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.parse().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    Some((start, end))
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len() as i64;
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);

        let mut template = match range {
            Some((start, end)) => {
                let end = end.unwrap_or(total - 1).min(total - 1);
                let start = start.clamp(0, end);
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", format!("bytes {start}-{end}/{total}"))
                    .insert_header("Accept-Ranges", "bytes")
                    .set_body_bytes(self.body[start as usize..=end as usize].to_vec())
            }
            None => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        };
        template = template.insert_header("Content-Type", "application/octet-stream");
        if let Some(cd) = &self.content_disposition {
            template = template.insert_header("Content-Disposition", cd.as_str());
        }
        template
    }
}

/// Mock server answering every GET through a [`RangeResponder`].
pub async fn serve_ranged(body: Vec<u8>) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(wiremock::matchers::method("GET"))
        .respond_with(RangeResponder::new(body))
        .mount(&server)
        .await;
    server
}

/// Range headers of every request the server has seen, in arrival order.
pub async fn seen_ranges(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter_map(|req| {
            req.headers
                .get("range")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Ev {
    Spawn { ioff: i64, foff: i64 },
    Respawn { original: i64, ioff: i64, foff: i64 },
    Progress(usize),
    ResumeProgress(usize),
    Error(String),
    DownloadComplete { id: String, total: i64 },
    CompileStart,
    CompileProgress(usize),
    CompileComplete { total: i64 },
    CompileSkipped { recovered: i64 },
}

/// Subscriber that records every event for assertions.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Ev>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Ev> {
        self.events.lock().unwrap().clone()
    }

    pub fn spawns(&self) -> Vec<(i64, i64)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Ev::Spawn { ioff, foff } => Some((ioff, foff)),
                _ => None,
            })
            .collect()
    }

    fn push(&self, ev: Ev) {
        self.events.lock().unwrap().push(ev);
    }
}

#[async_trait]
impl EventSubscriber for Recorder {
    async fn on_spawn(&self, _id: &SegmentId, ioff: i64, foff: i64) {
        self.push(Ev::Spawn { ioff, foff });
    }

    async fn on_respawn(&self, _id: &SegmentId, original: i64, ioff: i64, foff: i64) {
        self.push(Ev::Respawn {
            original,
            ioff,
            foff,
        });
    }

    async fn on_download_progress(&self, _id: &SegmentId, chunk: usize) {
        self.push(Ev::Progress(chunk));
    }

    async fn on_resume_progress(&self, chunk: usize) {
        self.push(Ev::ResumeProgress(chunk));
    }

    async fn on_error(&self, _id: &SegmentId, error: &BlitzError) {
        self.push(Ev::Error(error.to_string()));
    }

    async fn on_download_complete(&self, id: &str, total: i64) {
        self.push(Ev::DownloadComplete {
            id: id.to_string(),
            total,
        });
    }

    async fn on_compile_start(&self, _id: &SegmentId) {
        self.push(Ev::CompileStart);
    }

    async fn on_compile_progress(&self, chunk: usize) {
        self.push(Ev::CompileProgress(chunk));
    }

    async fn on_compile_complete(&self, _id: &SegmentId, total: i64) {
        self.push(Ev::CompileComplete { total });
    }

    async fn on_compile_skipped(&self, _id: &SegmentId, recovered: i64) {
        self.push(Ev::CompileSkipped { recovered });
    }
}
