//! Process-lifetime tasks and their fail-fast coordination.

use anyhow::{Context, anyhow};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::chat::ChatSender;
use crate::commands;

/// A set of long-running tasks that live and die together: the first task to
/// fail (or panic) cancels the rest, and `wait` reports that first failure
/// once everything has wound down.
pub struct TaskGroup {
    tasks: JoinSet<(&'static str, anyhow::Result<()>)>,
    cancel: CancellationToken,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Token every member must watch to stop when a sibling fails.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.tasks.spawn(async move { (name, task.await) });
    }

    pub async fn wait(mut self) -> anyhow::Result<()> {
        let mut first_error = None;

        while let Some(joined) = self.tasks.join_next().await {
            let failure = match joined {
                Ok((name, Ok(()))) => {
                    debug!(task = name, "Task finished");
                    None
                }
                Ok((name, Err(e))) => Some(e.context(format!("{name} failed"))),
                Err(e) => Some(anyhow!("task panicked or was aborted: {e}")),
            };

            if let Some(err) = failure {
                error!("{err:#}");
                self.cancel.cancel();
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Waits for SIGINT or SIGTERM and turns it into a group-wide cancellation.
pub async fn handle_signals(cancel: CancellationToken) -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?
            .recv()
            .await;
        Ok::<(), std::io::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<std::io::Result<()>>();

    tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        result = ctrl_c => {
            result.context("failed to listen for SIGINT")?;
            info!("Received SIGINT, shutting down");
        }
        result = terminate => {
            result.context("failed to listen for SIGTERM")?;
            info!("Received SIGTERM, shutting down");
        }
    }

    cancel.cancel();
    Ok(())
}

/// Publishes the command list and the startup announcement, then finishes.
pub async fn advertise(
    chat: Arc<dyn ChatSender>,
    announcement_conv: Option<String>,
) -> anyhow::Result<()> {
    chat.advertise(&commands::advertisement())
        .await
        .context("failed to advertise commands")?;

    if let Some(conv) = announcement_conv {
        chat.send_message(&conv, "I live.")
            .await
            .context("failed to post startup announcement")?;
    }

    info!("Advertised chat commands");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::testing::RecordingChat;
    use std::time::Duration;

    #[tokio::test]
    async fn first_failure_cancels_siblings() {
        let mut group = TaskGroup::new();
        let cancel = group.cancel_token();

        group.spawn("patient", async move {
            cancel.cancelled().await;
            anyhow::Ok(())
        });
        group.spawn("doomed", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<(), _>(anyhow!("store unreachable"))
        });

        let err = tokio::time::timeout(Duration::from_secs(5), group.wait())
            .await
            .expect("group should stop once a task fails")
            .unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("doomed failed"));
        assert!(message.contains("store unreachable"));
    }

    #[tokio::test]
    async fn clean_group_returns_ok() {
        let mut group = TaskGroup::new();
        group.spawn("one-shot", async { anyhow::Ok(()) });
        let cancel = group.cancel_token();
        group.spawn("signal", async move {
            cancel.cancel();
            anyhow::Ok(())
        });
        let cancel = group.cancel_token();
        group.spawn("listener", async move {
            cancel.cancelled().await;
            anyhow::Ok(())
        });

        group.wait().await.unwrap();
    }

    fn explode() -> anyhow::Result<()> {
        panic!("boom")
    }

    #[tokio::test]
    async fn panicking_task_fails_the_group() {
        let mut group = TaskGroup::new();
        group.spawn("broken", async { explode() });
        assert!(group.wait().await.is_err());
    }

    #[tokio::test]
    async fn signal_handler_exits_on_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        handle_signals(cancel).await.unwrap();
    }

    #[tokio::test]
    async fn advertiser_publishes_commands_and_announcement() {
        let chat = Arc::new(RecordingChat::default());
        advertise(chat.clone(), Some("town-square".to_string()))
            .await
            .unwrap();

        let adverts = chat.adverts();
        assert_eq!(adverts.len(), 1);
        assert_eq!(adverts[0].commands.len(), 5);
        assert_eq!(chat.last_to("town-square").as_deref(), Some("I live."));
    }
}
