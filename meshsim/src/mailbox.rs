use std::collections::VecDeque;
use tokio::sync::mpsc;

const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum QoSLevel {
    Control = 0, // Highest priority - supervisor inspection
    Normal = 1,  // Protocol messages, FIFO per sender
}

/// An actor's inbox.
///
/// Protocol messages share a single FIFO lane so the order in which one sender
/// delivers messages is the order in which they are handled. Control commands
/// overtake queued protocol traffic but never reorder it.
pub(crate) struct PrioritizedMailbox<T> {
    queues: [VecDeque<T>; 2],
    rx: mpsc::UnboundedReceiver<(QoSLevel, T)>,
}

impl<T> PrioritizedMailbox<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<(QoSLevel, T)>) -> Self {
        let queues = [
            VecDeque::with_capacity(DEFAULT_QUEUE_CAPACITY),
            VecDeque::with_capacity(DEFAULT_QUEUE_CAPACITY),
        ];
        Self { queues, rx }
    }

    /// Create a connected sender and mailbox pair.
    pub fn channel() -> (MailboxSender<T>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MailboxSender::new(tx), Self::new(rx))
    }

    fn enqueue(&mut self, qos: QoSLevel, msg: T) {
        self.queues[qos as usize].push_back(msg);
    }

    fn pop(&mut self) -> Option<T> {
        self.queues.iter_mut().find_map(|queue| queue.pop_front())
    }

    /// Receive the next command, waiting when the inbox is empty.
    ///
    /// Cancel safe: anything pulled off the channel is held in the lane queues.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            // Pull whatever has already arrived so control commands can jump the queue.
            while let Ok((qos, msg)) = self.rx.try_recv() {
                self.enqueue(qos, msg);
            }

            if let Some(msg) = self.pop() {
                return Some(msg);
            }

            match self.rx.recv().await {
                Some((qos, msg)) => self.enqueue(qos, msg),
                None => return None,
            }
        }
    }

    /// Close the inbox. Further sends fail; queued messages stay readable through [`drain`].
    ///
    /// [`drain`]: PrioritizedMailbox::drain
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Take every command still queued, in handling order.
    pub fn drain(&mut self) -> Vec<T> {
        while let Ok((qos, msg)) = self.rx.try_recv() {
            self.enqueue(qos, msg);
        }
        let mut drained = Vec::new();
        while let Some(msg) = self.pop() {
            drained.push(msg);
        }
        drained
    }
}

pub(crate) struct MailboxSender<T> {
    tx: mpsc::UnboundedSender<(QoSLevel, T)>,
}

impl<T> MailboxSender<T> {
    pub fn new(tx: mpsc::UnboundedSender<(QoSLevel, T)>) -> Self {
        Self { tx }
    }

    /// Enqueue without waiting. Fails only when the mailbox has been closed.
    pub fn send(&self, qos: QoSLevel, msg: T) -> Result<(), mpsc::error::SendError<(QoSLevel, T)>> {
        self.tx.send((qos, msg))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_control_overtakes_normal() {
        let (tx, mut mailbox) = PrioritizedMailbox::channel();
        tx.send(QoSLevel::Normal, 1).unwrap();
        tx.send(QoSLevel::Normal, 2).unwrap();
        tx.send(QoSLevel::Control, 100).unwrap();
        tx.send(QoSLevel::Normal, 3).unwrap();

        assert_eq!(mailbox.recv().await, Some(100));
        assert_eq!(mailbox.recv().await, Some(1));
        assert_eq!(mailbox.recv().await, Some(2));
        assert_eq!(mailbox.recv().await, Some(3));
    }

    #[tokio::test]
    async fn test_close_rejects_sends_and_keeps_queue() {
        let (tx, mut mailbox) = PrioritizedMailbox::channel();
        tx.send(QoSLevel::Normal, "a").unwrap();
        tx.send(QoSLevel::Normal, "b").unwrap();
        mailbox.close();

        assert!(tx.send(QoSLevel::Normal, "c").is_err());
        assert!(tx.is_closed());
        assert_eq!(mailbox.drain(), vec!["a", "b"]);
        assert_eq!(mailbox.recv().await, None);
    }
}
