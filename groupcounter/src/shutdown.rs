//! Module to control shutdown of the engine.
//!
//! The flush scheduler runs on its own task and must be stopped before the
//! final snapshot is persisted, so shutdown is a two-step protocol: signal
//! through the [`Controller`], then join the scheduler task. The scheduler
//! holds a [`Watcher`] and exits once its current iteration completes; no
//! flush is forced on the way out.

use tokio::sync::watch;

/// Construct a connected [`Controller`] and [`Watcher`] pair.
#[must_use]
pub fn pair() -> (Controller, Watcher) {
    let (sender, receiver) = watch::channel(false);
    (Controller { sender }, Watcher { receiver })
}

/// Mechanism to signal the scheduler that it should stop.
#[derive(Debug)]
pub struct Controller {
    sender: watch::Sender<bool>,
}

impl Controller {
    /// Send the stop signal to every derived [`Watcher`].
    pub fn signal(&self) {
        // Send only fails with no receivers, in which case there is nothing
        // left to stop.
        let _ = self.sender.send(true);
    }
}

/// Receive half of the stop signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Watcher {
    receiver: watch::Receiver<bool>,
}

impl Watcher {
    /// Wait until the stop signal is sent. Returns immediately if it already
    /// was, or if the [`Controller`] was dropped without signaling.
    pub async fn recv(&mut self) {
        // A closed channel means the controller is gone; treat that as a
        // signal rather than waiting forever.
        let _ = self.receiver.wait_for(|stopped| *stopped).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_releases_watcher() {
        let (controller, mut watcher) = pair();
        controller.signal();
        watcher.recv().await;
    }

    #[tokio::test]
    async fn dropped_controller_releases_watcher() {
        let (controller, mut watcher) = pair();
        drop(controller);
        watcher.recv().await;
    }

    #[tokio::test]
    async fn clones_all_observe_the_signal() {
        let (controller, watcher) = pair();
        let mut watchers = vec![watcher.clone(), watcher];
        controller.signal();
        for w in &mut watchers {
            w.recv().await;
        }
    }
}
