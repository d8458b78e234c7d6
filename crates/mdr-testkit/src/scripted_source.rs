//! Source adapter that replays a scripted sequence of fetch results.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use mdr_md::{FetchError, SourceAdapter};
use mdr_schemas::{payload_external_id, RawPayload, SourceKind};

/// One scripted fetch.
#[derive(Debug, Clone)]
pub enum Step {
    /// Return these payloads, filtered by the cursor like a real adapter.
    Batch(Vec<RawPayload>),
    Fail(FetchError),
    /// Sleep before returning the batch.
    Slow(Duration, Vec<RawPayload>),
    /// Never return.
    Hang,
}

pub struct ScriptedSource {
    label: String,
    kind: SourceKind,
    steps: Mutex<VecDeque<Step>>,
    cursors: Mutex<Vec<Option<String>>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedSource {
    pub fn new(label: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            label: label.into(),
            kind,
            steps: Mutex::new(VecDeque::new()),
            cursors: Mutex::new(Vec::new()),
        }
    }

    pub fn csv(label: impl Into<String>) -> Self {
        Self::new(label, SourceKind::Csv)
    }

    pub fn http(label: impl Into<String>) -> Self {
        Self::new(label, SourceKind::Http)
    }

    pub fn push(&self, step: Step) {
        guard(&self.steps).push_back(step);
    }

    pub fn push_ok(&self, batch: Vec<RawPayload>) {
        self.push(Step::Batch(batch));
    }

    pub fn push_err(&self, err: FetchError) {
        self.push(Step::Fail(err));
    }

    /// Cursors passed to `fetch`, in call order.
    pub fn seen_cursors(&self) -> Vec<Option<String>> {
        guard(&self.cursors).clone()
    }
}

fn after_cursor(batch: Vec<RawPayload>, since_id: Option<&str>) -> Vec<RawPayload> {
    batch
        .into_iter()
        .filter(|p| match (payload_external_id(p), since_id) {
            (Some(id), Some(cursor)) => id > cursor,
            // Payloads without an id pass through so transform can reject them.
            _ => true,
        })
        .collect()
}

#[async_trait]
impl SourceAdapter for ScriptedSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch(&self, since_id: Option<&str>) -> Result<Vec<RawPayload>, FetchError> {
        guard(&self.cursors).push(since_id.map(str::to_string));
        let step = guard(&self.steps).pop_front();
        match step {
            None => Ok(Vec::new()),
            Some(Step::Batch(b)) => Ok(after_cursor(b, since_id)),
            Some(Step::Fail(e)) => Err(e),
            Some(Step::Slow(d, b)) => {
                tokio::time::sleep(d).await;
                Ok(after_cursor(b, since_id))
            }
            Some(Step::Hang) => {
                std::future::pending::<()>().await;
                Ok(Vec::new())
            }
        }
    }
}
