//! Build stages and the progress feed.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analyzing,
    Bundling,
    SafetyScan,
    ManifestBuild,
    Persisting,
    Done,
    Failed,
}

impl Stage {
    /// Fraction of the build complete when the stage starts.
    pub fn progress(&self) -> f32 {
        match self {
            Stage::Analyzing => 0.0,
            Stage::Bundling => 0.25,
            Stage::SafetyScan => 0.55,
            Stage::ManifestBuild => 0.7,
            Stage::Persisting => 0.8,
            Stage::Done | Stage::Failed => 1.0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Analyzing => "analyzing",
            Stage::Bundling => "bundling",
            Stage::SafetyScan => "safety_scan",
            Stage::ManifestBuild => "manifest_build",
            Stage::Persisting => "persisting",
            Stage::Done => "done",
            Stage::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub progress: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Optional receiver of progress events. A consumer that went away does
/// not stop the build.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    pub async fn emit(&self, stage: Stage, detail: Option<String>) {
        self.emit_at(stage, stage.progress(), detail).await;
    }

    pub async fn emit_at(&self, stage: Stage, progress: f32, detail: Option<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx
                .send(ProgressEvent {
                    stage,
                    progress,
                    detail,
                })
                .await;
        }
    }
}
