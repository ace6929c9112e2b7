//! The remote run source seam and cursor pagination over it

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::warn;

use crate::error::ConsoleError;
use crate::model::{Page, RunKind, RunRecord, StatusAttributes, StepStatus};

/// Read and update runs owned by the remote control plane
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RunSource: Send + Sync {
    /// Fetch one run. A run that no longer exists yields
    /// [`ConsoleError::NotFound`].
    async fn get_run(&self, kind: RunKind, id: &str) -> Result<RunRecord, ConsoleError>;

    /// Fetch one page of active runs after `cursor`
    async fn list_runs(
        &self,
        kind: RunKind,
        cursor: Option<String>,
        page_size: usize,
    ) -> Result<Page, ConsoleError>;

    /// Report a run's status. Identical repeated updates must be harmless.
    async fn update_run_status(
        &self,
        kind: RunKind,
        id: &str,
        attrs: StatusAttributes,
    ) -> Result<(), ConsoleError>;

    /// Set the status of one stack run step
    async fn update_run_step(&self, step_id: &str, status: StepStatus) -> Result<(), ConsoleError>;
}

/// Walks every page of [`RunSource::list_runs`] for one kind
pub struct Pager<'a> {
    source: &'a dyn RunSource,
    kind: RunKind,
    page_size: usize,
    cursor: Option<String>,
    done: bool,
}

impl<'a> Pager<'a> {
    pub fn new(source: &'a dyn RunSource, kind: RunKind, page_size: usize) -> Self {
        Self {
            source,
            kind,
            page_size,
            cursor: None,
            done: false,
        }
    }

    /// Next page of records, or `None` once the last page was returned
    pub async fn next_page(&mut self) -> Result<Option<Vec<RunRecord>>, ConsoleError> {
        if self.done {
            return Ok(None);
        }

        let page = self
            .source
            .list_runs(self.kind, self.cursor.take(), self.page_size)
            .await?;

        match (page.page_info.has_next, page.page_info.end_cursor) {
            (true, Some(cursor)) => self.cursor = Some(cursor),
            (true, None) => {
                warn!(kind = %self.kind, "console reported more pages without a cursor");
                self.done = true;
            }
            (false, _) => self.done = true,
        }

        Ok(Some(page.items))
    }

    /// Drain every page into one list
    #[cfg(test)]
    pub async fn collect_all(mut self) -> Result<Vec<RunRecord>, ConsoleError> {
        let mut all = Vec::new();
        while let Some(items) = self.next_page().await? {
            all.extend(items);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::*;

    use super::*;
    use crate::model::{PageInfo, RunState};

    fn page(ids: &[&str], next: Option<&str>) -> Page {
        Page {
            items: ids
                .iter()
                .map(|id| RunRecord::new(RunKind::Stack, *id, RunState::Pending))
                .collect(),
            page_info: PageInfo {
                has_next: next.is_some(),
                end_cursor: next.map(str::to_string),
            },
        }
    }

    #[tokio::test]
    async fn follows_cursor_until_last_page() {
        let mut source = MockRunSource::new();
        source
            .expect_list_runs()
            .with(eq(RunKind::Stack), eq(None), eq(2))
            .times(1)
            .returning(|_, _, _| Ok(page(&["1", "2"], Some("c1"))));
        source
            .expect_list_runs()
            .with(eq(RunKind::Stack), eq(Some("c1".to_string())), eq(2))
            .times(1)
            .returning(|_, _, _| Ok(page(&["3"], None)));

        let all = Pager::new(&source, RunKind::Stack, 2).collect_all().await.unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn stops_when_more_pages_have_no_cursor() {
        let mut source = MockRunSource::new();
        source.expect_list_runs().times(1).returning(|_, _, _| {
            let mut p = page(&["1"], None);
            p.page_info.has_next = true;
            Ok(p)
        });

        let all = Pager::new(&source, RunKind::Stack, 10).collect_all().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn propagates_listing_errors() {
        let mut source = MockRunSource::new();
        source
            .expect_list_runs()
            .returning(|_, _, _| Err(ConsoleError::GraphQl("boom".to_string())));

        let err = Pager::new(&source, RunKind::Gate, 10).collect_all().await.unwrap_err();
        assert!(matches!(err, ConsoleError::GraphQl(_)));
    }
}
