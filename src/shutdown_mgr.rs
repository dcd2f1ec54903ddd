use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Process-wide stop signal.
///
/// Every clone has its own subscription, so any holder can fire it and every
/// event loop waiting in [`ShutdownManager::recv`] wakes up. Clones made after
/// the signal fired see it too.
#[derive(Debug)]
pub struct ShutdownManager {
    shutdown: bool,
    fired: Arc<AtomicBool>,
    receiver: broadcast::Receiver<()>,
    sender: broadcast::Sender<()>,
}

impl ShutdownManager {
    pub fn new() -> ShutdownManager {
        let (sender, receiver) = broadcast::channel(1);
        ShutdownManager {
            shutdown: false,
            fired: Arc::new(AtomicBool::new(false)),
            receiver,
            sender,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown || self.fired.load(Ordering::SeqCst)
    }

    /// Wait until someone fires the signal. Returns at once if it already fired.
    pub async fn recv(&mut self) {
        if self.is_shutdown() {
            self.shutdown = true;
            return;
        }

        let _ = self.receiver.recv().await;
        self.shutdown = true;
    }

    pub fn send(&mut self) {
        debug!("shutdown requested");
        self.shutdown = true;
        self.fired.store(true, Ordering::SeqCst);
        let _ = self.sender.send(());
    }

    /// Fire the signal once `event` resolves to `true`.
    pub fn fire_when<F>(&self, event: F) -> JoinHandle<()>
    where
        F: Future<Output = bool> + Send + 'static,
    {
        let mut trigger = self.clone();
        tokio::spawn(async move {
            if event.await {
                trigger.send();
            }
        })
    }

    /// Fire the signal on Ctrl-C.
    pub fn on_ctrl_c(&self) -> JoinHandle<()> {
        self.fire_when(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupted, shutting down");
                    true
                }
                Err(e) => {
                    warn!("cannot listen for Ctrl-C: {e}");
                    false
                }
            }
        })
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ShutdownManager {
    fn clone(&self) -> ShutdownManager {
        ShutdownManager {
            shutdown: false,
            fired: Arc::clone(&self.fired),
            receiver: self.sender.subscribe(),
            sender: self.sender.clone(),
        }
    }
}
