//! Supervised task group: every long-lived component runs as one task; the
//! first failure cancels the shared token and the group waits for the rest
//! to wind down.

use std::future::Future;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct TaskGroup {
    cancel: CancellationToken,
    tasks: JoinSet<(&'static str, anyhow::Result<()>)>,
}

impl TaskGroup {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            tasks: JoinSet::new(),
        }
    }

    /// The token tasks should watch for shutdown.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn(
        &mut self,
        name: &'static str,
        fut: impl Future<Output = anyhow::Result<()>> + Send + 'static,
    ) {
        tracing::debug!(task = name, "starting task");
        self.tasks.spawn(async move { (name, fut.await) });
    }

    /// Waits for every task. The first error (or panic) cancels the token;
    /// that error is returned once all tasks have stopped.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut first_err = None;
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    tracing::debug!(task = name, "task finished");
                }
                Ok((name, Err(err))) => {
                    let chain = format!("{err:#}");
                    tracing::error!(task = name, err = %chain, "task failed");
                    self.cancel.cancel();
                    first_err.get_or_insert(err.context(name));
                }
                Err(join_err) => {
                    tracing::error!(%join_err, "task panicked");
                    self.cancel.cancel();
                    first_err.get_or_insert(anyhow::anyhow!("task panicked: {join_err}"));
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn clean_tasks_finish_ok() {
        let mut group = TaskGroup::new(CancellationToken::new());
        group.spawn("a", async { Ok(()) });
        group.spawn("b", async { Ok(()) });
        group.run().await.unwrap();
    }

    #[tokio::test]
    async fn first_failure_cancels_the_rest() {
        let cancel = CancellationToken::new();
        let mut group = TaskGroup::new(cancel.clone());

        let watcher = cancel.clone();
        group.spawn("waits for shutdown", async move {
            watcher.cancelled().await;
            Ok(())
        });
        group.spawn("fails fast", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            anyhow::bail!("boom")
        });

        let err = tokio::time::timeout(Duration::from_secs(5), group.run())
            .await
            .expect("group should stop once cancelled")
            .unwrap_err();
        assert!(format!("{err:#}").contains("boom"));
        assert!(cancel.is_cancelled());
    }
}
