use std::sync::Arc;
use tokio::sync::watch;

/// Cooperative cancellation shared by the suite, its waits, HTTP calls and
/// listener workers.
#[derive(Debug, Clone)]
pub struct Cancellation {
    sender: Arc<watch::Sender<bool>>,
}

impl Cancellation {
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Signal every waiter. Idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Completes once `cancel` has been called
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        if *receiver.borrow_and_update() {
            return;
        }
        while receiver.changed().await.is_ok() {
            if *receiver.borrow_and_update() {
                return;
            }
        }
        // The sender lives as long as self, so this is never reached in practice
        std::future::pending::<()>().await
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}
