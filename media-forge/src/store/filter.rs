use crate::domain::{JobStatus, PipelineKind};

const DEFAULT_PAGE_SIZE: usize = 100;

/// Filter for [`JobStore::list`](super::JobStore::list).
#[derive(Debug, Clone)]
pub struct JobFilter {
    /// Empty means any status.
    pub statuses: Vec<JobStatus>,
    pub pipeline: Option<PipelineKind>,
    /// Rows fetched per round trip while the stream is consumed.
    pub page_size: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            statuses: Vec::new(),
            pipeline: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        if !self.statuses.contains(&status) {
            self.statuses.push(status);
        }
        self
    }

    pub fn with_pipeline(mut self, pipeline: PipelineKind) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub(super) fn status_strings(&self) -> Vec<String> {
        self.statuses.iter().map(|s| s.as_str().to_string()).collect()
    }
}
