//! Launch progress on stderr using indicatif.

use indicatif::{ProgressBar, ProgressStyle};
use pyexec::model::LaunchState;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Spinner that follows one launch's state until it finishes.
pub struct LaunchProgress {
    bar: ProgressBar,
    follower: JoinHandle<()>,
}

impl LaunchProgress {
    /// Start the spinner. Must be called from within a tokio runtime.
    pub fn start(name: &str, mut state: watch::Receiver<LaunchState>) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(format!("starting {name}"));
        bar.enable_steady_tick(Duration::from_millis(100));

        let follower = {
            let bar = bar.clone();
            let name = name.to_string();
            tokio::spawn(async move {
                while state.changed().await.is_ok() {
                    let current = *state.borrow_and_update();
                    match current {
                        LaunchState::Running { pid: Some(pid) } => {
                            bar.set_message(format!("running {name} (pid {pid})"));
                        }
                        LaunchState::Running { pid: None } => {
                            bar.set_message(format!("running {name}"));
                        }
                        LaunchState::Finished { .. } => break,
                        LaunchState::Created | LaunchState::Starting => {}
                    }
                }
            })
        };
        Self { bar, follower }
    }

    pub fn finish(self) {
        self.follower.abort();
        self.bar.finish_and_clear();
    }
}
