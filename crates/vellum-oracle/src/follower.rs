use tokio::sync::broadcast;
use tracing::debug;
use vellum_types::Event;

/// Notification delivered to the followers of a session.
#[derive(Clone, Debug, PartialEq)]
pub enum FollowerEvent {
    /// A truth was applied to the partition.
    Truth(Event),
    /// Queued commands were dropped because a truth conflicted with them.
    CommandsPurged(Vec<Event>),
}

/// A broadcast channel receiver for follower events.
pub type FollowerStream = broadcast::Receiver<FollowerEvent>;

/// Fan-out of applied truths to external followers.
#[derive(Debug)]
pub struct Followers {
    sender: broadcast::Sender<FollowerEvent>,
}

impl Followers {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> FollowerStream {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: FollowerEvent) {
        // Without followers the event is simply dropped.
        let delivered = self.sender.send(event).unwrap_or(0);
        debug!(delivered, "follower event published");
    }

    pub fn follower_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publishes_to_every_follower() {
        let followers = Followers::new(4);
        followers.publish(FollowerEvent::CommandsPurged(Vec::new()));

        let mut first = followers.subscribe();
        let mut second = followers.subscribe();
        assert_eq!(followers.follower_count(), 2);
        followers.publish(FollowerEvent::CommandsPurged(Vec::new()));
        assert_eq!(first.recv().await.unwrap(), FollowerEvent::CommandsPurged(Vec::new()));
        assert_eq!(second.recv().await.unwrap(), FollowerEvent::CommandsPurged(Vec::new()));
    }
}
