use crate::domain::ChannelId;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue::Key;
use tracing::{debug, info};

#[derive(Debug)]
enum ReaperCommand {
    Schedule(ChannelId, Duration),
    Cancel(ChannelId),
}

/// Single timer wheel for lifespan-based channel replacement. One task
/// owns a `DelayQueue` keyed by channel id and calls `on_expiry` when a
/// channel's lifespan runs out.
#[derive(Debug)]
pub struct Reaper {
    commands: mpsc::UnboundedSender<ReaperCommand>,
    cancel: CancellationToken,
}

impl Reaper {
    pub fn start<F>(on_expiry: F) -> Self
    where
        F: Fn(ChannelId) + Send + 'static,
    {
        let (commands, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run(rx, cancel.clone(), on_expiry));
        Self { commands, cancel }
    }

    /// Schedules (or reschedules) the channel's replacement.
    pub fn schedule(&self, channel: ChannelId, lifespan: Duration) {
        self.submit(ReaperCommand::Schedule(channel, lifespan));
    }

    pub fn cancel(&self, channel: ChannelId) {
        self.submit(ReaperCommand::Cancel(channel));
    }

    fn submit(&self, command: ReaperCommand) -> bool {
        match self.commands.send(command) {
            Ok(()) => true,
            Err(mpsc::error::SendError(command)) => {
                debug!(command = ?command, "Reaper stopped, dropping command");
                false
            }
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

async fn run<F>(
    mut commands: mpsc::UnboundedReceiver<ReaperCommand>,
    cancel: CancellationToken,
    on_expiry: F,
) where
    F: Fn(ChannelId),
{
    let mut queue: DelayQueue<ChannelId> = DelayQueue::new();
    let mut keys: HashMap<ChannelId, Key> = HashMap::new();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(ReaperCommand::Schedule(channel, lifespan)) => {
                    if let Some(key) = keys.remove(&channel) {
                        queue.remove(&key);
                    }
                    debug!(channel = %channel, lifespan = ?lifespan, "Scheduled channel replacement");
                    let key = queue.insert(channel.clone(), lifespan);
                    keys.insert(channel, key);
                }
                Some(ReaperCommand::Cancel(channel)) => {
                    if let Some(key) = keys.remove(&channel) {
                        queue.remove(&key);
                    }
                }
                None => break,
            },
            Some(expired) = queue.next() => {
                let channel = expired.into_inner();
                keys.remove(&channel);
                info!(channel = %channel, "Channel lifespan elapsed, replacing");
                on_expiry(channel);
            }
        }
    }
    debug!(scheduled = keys.len(), "Reaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recording_reaper() -> (Reaper, Arc<Mutex<Vec<ChannelId>>>) {
        let expired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&expired);
        let reaper = Reaper::start(move |channel| sink.lock().push(channel));
        (reaper, expired)
    }

    #[tokio::test]
    async fn test_expiry_fires_after_lifespan() {
        let (reaper, expired) = recording_reaper();
        let channel = ChannelId::new("localhost:8088", 0);

        reaper.schedule(channel.clone(), Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(expired.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*expired.lock(), vec![channel]);
    }

    #[tokio::test]
    async fn test_cancelled_channel_never_expires() {
        let (reaper, expired) = recording_reaper();
        let channel = ChannelId::new("localhost:8088", 1);

        reaper.schedule(channel.clone(), Duration::from_millis(30));
        reaper.cancel(channel);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(expired.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stop_ends_task() {
        let (reaper, expired) = recording_reaper();
        reaper.schedule(ChannelId::new("localhost:8088", 2), Duration::from_millis(30));
        reaper.stop();
        assert!(reaper.is_stopped());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(expired.lock().is_empty());
    }

    #[tokio::test]
    async fn test_commands_after_stop_are_dropped() {
        let (reaper, expired) = recording_reaper();
        reaper.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let channel = ChannelId::new("localhost:8088", 3);
        assert!(!reaper.submit(ReaperCommand::Schedule(channel.clone(), Duration::ZERO)));
        assert!(!reaper.submit(ReaperCommand::Cancel(channel)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(expired.lock().is_empty());
    }
}
