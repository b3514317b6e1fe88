//! Cancellation handle shared between the caller and a running campaign.

use std::sync::Arc;

use tokio::sync::watch;

/// Cancellation flag for one or more campaign runs.
///
/// Starts false and can be raised exactly once. Cloning shares the flag.
#[derive(Debug, Clone)]
pub struct CampaignController {
    flag: Arc<watch::Sender<bool>>,
}

impl Default for CampaignController {
    fn default() -> Self {
        Self::new()
    }
}

impl CampaignController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { flag: Arc::new(tx) }
    }

    /// Raise the flag. Returns `true` only for the call that raised it.
    pub fn cancel(&self) -> bool {
        let raised = self.flag.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        });
        if raised {
            tracing::info!("Campaign cancellation requested");
        }
        raised
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolves once the flag is raised.
    pub async fn cancelled(&self) {
        let mut rx = self.flag.subscribe();
        // The sender lives as long as `self`, so this only returns once raised.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}
