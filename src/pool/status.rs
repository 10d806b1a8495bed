/// Tracks the latest generation of the pool.
#[derive(Clone, Copy, Debug, Default)]
struct PoolStatus {
    generation: u32,
}

/// Create a channel for publishing and observing the pool's generation.
pub(super) fn channel() -> (PoolGenerationPublisher, PoolGenerationSubscriber) {
    let (sender, receiver) = tokio::sync::watch::channel(PoolStatus::default());
    (
        PoolGenerationPublisher { sender },
        PoolGenerationSubscriber { receiver },
    )
}

#[derive(Debug)]
pub(super) struct PoolGenerationPublisher {
    sender: tokio::sync::watch::Sender<PoolStatus>,
}

impl PoolGenerationPublisher {
    pub(super) fn publish(&self, generation: u32) {
        // If nobody is subscribed this returns an error, which is fine.
        let _: std::result::Result<_, _> = self.sender.send(PoolStatus { generation });
    }
}

/// Observer for the pool's current generation.
#[derive(Clone, Debug)]
pub struct PoolGenerationSubscriber {
    receiver: tokio::sync::watch::Receiver<PoolStatus>,
}

impl PoolGenerationSubscriber {
    /// The most recently published generation.
    pub fn generation(&self) -> u32 {
        self.receiver.borrow().generation
    }

    /// Waits up to `timeout` for the generation to change, returning the new
    /// value if it did.
    pub async fn wait_for_generation_change(
        &mut self,
        timeout: std::time::Duration,
    ) -> Option<u32> {
        tokio::time::timeout(timeout, self.receiver.changed())
            .await
            .ok()
            .and_then(|changed| changed.ok())
            .map(|_| self.receiver.borrow().generation)
    }
}
