// Packet completion notifications delivered to the streaming framework

use crossbeam::channel::Sender;
use serde::{Deserialize, Serialize};

/// A completed packet and the performance counter value stamped on it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PacketNotification {
    pub packet_number: u64,
    pub qpc: u64,
}

pub trait PacketNotifier: Send + Sync {
    fn packet_completed(&self, notification: PacketNotification);

    /// The final partial buffer of an offloaded stream has been rendered.
    fn last_buffer_rendered(&self, _qpc: u64) {}
}

/// Discards every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl PacketNotifier for NullNotifier {
    fn packet_completed(&self, _notification: PacketNotification) {}
}

/// Events forwarded by `ChannelNotifier`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierEvent {
    PacketCompleted(PacketNotification),
    LastBufferRendered { qpc: u64 },
}

/// Forwards notifications into a crossbeam channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: Sender<NotifierEvent>,
}

impl ChannelNotifier {
    pub fn new(tx: Sender<NotifierEvent>) -> Self {
        Self { tx }
    }
}

impl PacketNotifier for ChannelNotifier {
    fn packet_completed(&self, notification: PacketNotification) {
        // Receiver gone means nobody is listening; not an engine error.
        let _ = self.tx.try_send(NotifierEvent::PacketCompleted(notification));
    }

    fn last_buffer_rendered(&self, qpc: u64) {
        let _ = self.tx.try_send(NotifierEvent::LastBufferRendered { qpc });
    }
}

impl<F> PacketNotifier for F
where
    F: Fn(PacketNotification) + Send + Sync,
{
    fn packet_completed(&self, notification: PacketNotification) {
        self(notification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_channel_notifier_forwards_events() {
        let (tx, rx) = crossbeam::channel::unbounded();
        let notifier = ChannelNotifier::new(tx);
        notifier.packet_completed(PacketNotification {
            packet_number: 3,
            qpc: 42,
        });
        notifier.last_buffer_rendered(99);

        assert_eq!(
            rx.try_recv().unwrap(),
            NotifierEvent::PacketCompleted(PacketNotification {
                packet_number: 3,
                qpc: 42
            })
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            NotifierEvent::LastBufferRendered { qpc: 99 }
        );
    }

    #[test]
    fn test_closure_notifier() {
        let last = AtomicU64::new(0);
        let notifier = |n: PacketNotification| last.store(n.packet_number, Ordering::SeqCst);
        notifier.packet_completed(PacketNotification {
            packet_number: 7,
            qpc: 0,
        });
        assert_eq!(last.load(Ordering::SeqCst), 7);
    }
}
