//! Run orchestration: configuration, discovery, scheduling

use std::path::PathBuf;

use crate::config::RunnerConfig;
use crate::discovery::Discovery;
use crate::error::RunnerError;
use crate::executor::TestExecutor;
use crate::loader::FileLoader;
use crate::report::{Reporter, ResultAggregator, RunSummary};
use crate::scheduler::Scheduler;

/// Runs the tests of a set of files with one configuration.
#[derive(Debug, Clone, Default)]
pub struct Runner {
    config: RunnerConfig,
    keep_results: bool,
}

impl Runner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            keep_results: false,
        }
    }

    /// Collect every result in the summary, not only failures.
    pub fn keep_results(mut self, keep: bool) -> Self {
        self.keep_results = keep;
        self
    }

    /// Discovery over the configured root.
    pub fn discovery(&self, filter: Option<String>) -> Result<Discovery, RunnerError> {
        Ok(Discovery::new(&self.config.root, &self.config.patterns, &self.config.ignore)?
            .with_filter(filter))
    }

    /// Load `files` in order and run everything they register. Files are
    /// consumed lazily; tests start running while later files still load.
    pub async fn run<I>(
        &self,
        files: I,
        loader: &dyn FileLoader,
        reporter: Box<dyn Reporter>,
    ) -> Result<RunSummary, RunnerError>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let executor = TestExecutor::new(self.config.executor_settings());
        let aggregator =
            ResultAggregator::new(self.config.max_failures).keep_results(self.keep_results);
        let scheduler = Scheduler::start(executor, reporter, aggregator);
        tracing::info!(root = %self.config.root.display(), "starting test run");

        for path in files {
            scheduler.enqueue_file(&path, loader);
            tokio::task::yield_now().await;
        }

        scheduler.wait().await
    }
}
