//! Process-wide liveness flag.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared "keep running" flag.
///
/// Loops either poll [`Liveness::is_alive`] between queue pops or await
/// [`Liveness::stopped`] alongside a blocking read.
#[derive(Debug, Clone)]
pub struct Liveness {
    state: Arc<watch::Sender<bool>>,
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self {
            state: Arc::new(tx),
        }
    }

    pub fn is_alive(&self) -> bool {
        *self.state.borrow()
    }

    pub fn shutdown(&self) {
        self.state.send_replace(false);
    }

    /// Resolves once [`Liveness::shutdown`] has been called.
    pub async fn stopped(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|alive| !*alive).await;
    }
}
