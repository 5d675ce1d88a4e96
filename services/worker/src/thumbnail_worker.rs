//! Derives fixed-width thumbnails for uploaded images
//!
//! Each width runs as its own task. A failed width is logged and recorded in
//! the [`DerivationReport`] but never fails the job: the delivery is
//! acknowledged once every width has finished, whatever the outcome.

use anyhow::Result;
use async_trait::async_trait;
use common::repositories::EntityLookup;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::jobs::{EntityKind, JobError, ThumbnailJob};
use crate::queue::JobHandler;
use crate::thumbnail_generator::ThumbnailDeriver;

/// Thumbnail widths, in the order they are reported
pub const THUMBNAIL_WIDTHS: [u32; 3] = [500, 250, 100];

/// Where the thumbnail of `source` at `width` is written
pub fn thumbnail_path(source: &str, width: u32) -> String {
    format!("{}_{}", source, width)
}

/// Result of deriving one width
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidthOutcome {
    pub width: u32,
    pub target: String,
    pub error: Option<String>,
}

impl WidthOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-width outcomes for one file
#[derive(Debug, Clone)]
pub struct DerivationReport {
    pub file_id: Uuid,
    pub outcomes: Vec<WidthOutcome>,
}

impl DerivationReport {
    pub fn failures(&self) -> impl Iterator<Item = &WidthOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(WidthOutcome::is_success)
    }
}

#[derive(Clone)]
pub struct ThumbnailWorker {
    entities: Arc<dyn EntityLookup>,
    deriver: Arc<dyn ThumbnailDeriver>,
}

impl ThumbnailWorker {
    pub fn new(entities: Arc<dyn EntityLookup>, deriver: Arc<dyn ThumbnailDeriver>) -> Self {
        Self { entities, deriver }
    }

    /// Validate the job, resolve its file and derive every width
    pub async fn process(&self, job: &ThumbnailJob) -> Result<DerivationReport, JobError> {
        let (file_id, user_id) = job.validate()?;

        let file = self
            .entities
            .find_file(file_id, user_id)
            .await?
            .ok_or(JobError::EntityNotFound(EntityKind::File))?;

        // Folders have nothing to resize
        let Some(source) = file.local_path else {
            return Err(JobError::EntityNotFound(EntityKind::File));
        };

        info!("Generating thumbnails for file: {}", file.id);
        Ok(self.derive_all(file.id, &source).await)
    }

    async fn derive_all(&self, file_id: Uuid, source: &str) -> DerivationReport {
        let mut tasks = JoinSet::new();

        for width in THUMBNAIL_WIDTHS {
            let deriver = self.deriver.clone();
            let source = source.to_string();
            tasks.spawn(async move {
                let target = thumbnail_path(&source, width);
                let result = derive_one(deriver.as_ref(), &source, width, &target).await;
                (width, target, result)
            });
        }

        let mut outcomes = Vec::with_capacity(THUMBNAIL_WIDTHS.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((width, target, Ok(()))) => outcomes.push(WidthOutcome {
                    width,
                    target,
                    error: None,
                }),
                Ok((width, target, Err(e))) => {
                    error!(
                        "Failed to generate {}px thumbnail for file {}: {:#}",
                        width, file_id, e
                    );
                    outcomes.push(WidthOutcome {
                        width,
                        target,
                        error: Some(format!("{:#}", e)),
                    });
                }
                Err(e) => error!("Thumbnail task for file {} panicked: {}", file_id, e),
            }
        }

        // A panicked task leaves its width unreported
        for width in THUMBNAIL_WIDTHS {
            if !outcomes.iter().any(|o| o.width == width) {
                outcomes.push(WidthOutcome {
                    width,
                    target: thumbnail_path(source, width),
                    error: Some("thumbnail task aborted".to_string()),
                });
            }
        }
        outcomes.sort_by_key(|o| THUMBNAIL_WIDTHS.iter().position(|w| *w == o.width));

        DerivationReport { file_id, outcomes }
    }
}

async fn derive_one(
    deriver: &dyn ThumbnailDeriver,
    source: &str,
    width: u32,
    target: &str,
) -> Result<()> {
    let bytes = deriver.derive(Path::new(source), width).await?;
    tokio::fs::write(target, bytes).await?;
    Ok(())
}

#[async_trait]
impl JobHandler for ThumbnailWorker {
    type Job = ThumbnailJob;

    async fn handle(&self, job: ThumbnailJob) -> Result<(), JobError> {
        let report = self.process(&job).await?;

        if report.is_complete() {
            info!("Generated all thumbnails for file {}", report.file_id);
        } else {
            let failed: Vec<u32> = report.failures().map(|o| o.width).collect();
            warn!(
                "Thumbnails for file {} incomplete, failed widths: {:?}",
                report.file_id, failed
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thumbnail_path_is_sibling_of_source() {
        assert_eq!(
            thumbnail_path("/tmp/files_manager/abc", 500),
            "/tmp/files_manager/abc_500"
        );
    }

    #[test]
    fn test_report_completeness() {
        let ok = |width| WidthOutcome {
            width,
            target: thumbnail_path("f", width),
            error: None,
        };
        let mut report = DerivationReport {
            file_id: Uuid::new_v4(),
            outcomes: THUMBNAIL_WIDTHS.iter().copied().map(ok).collect(),
        };
        assert!(report.is_complete());

        report.outcomes[1].error = Some("boom".to_string());
        assert!(!report.is_complete());
        assert_eq!(report.failures().map(|o| o.width).collect::<Vec<_>>(), vec![250]);
    }
}
