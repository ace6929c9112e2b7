//! Test doubles shared by the engine's unit tests

use async_trait::async_trait;
use mockall::mock;
use runsync_console::{
    ConsoleError, Page, RunKind, RunRecord, RunSource, StatusAttributes, StepStatus,
};

mock! {
    pub Source {}

    #[async_trait]
    impl RunSource for Source {
        async fn get_run(&self, kind: RunKind, id: &str) -> Result<RunRecord, ConsoleError>;
        async fn list_runs(
            &self,
            kind: RunKind,
            cursor: Option<String>,
            page_size: usize,
        ) -> Result<Page, ConsoleError>;
        async fn update_run_status(
            &self,
            kind: RunKind,
            id: &str,
            attrs: StatusAttributes,
        ) -> Result<(), ConsoleError>;
        async fn update_run_step(
            &self,
            step_id: &str,
            status: StepStatus,
        ) -> Result<(), ConsoleError>;
    }
}
