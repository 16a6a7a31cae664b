//! Blocking mailbox for pointer-free hand-offs between replica threads.
//!
//! Each replica owns one mailbox; its parent and children hold cloned
//! senders. Messages carry the sending replica's rank, which the receiver
//! checks against the peer it expects. Push never blocks, pop blocks until
//! a message arrives, and messages are delivered in push order - there is
//! no timeout, because a stalled peer has no recovery short of aborting
//! the run.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

pub struct Mailbox<T> {
    tx: Sender<T>,
    rx: Mutex<Receiver<T>>,
}

impl<T: Send> Mailbox<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx: Mutex::new(rx) }
    }

    /// A sender handle for a peer replica to push with.
    pub fn sender(&self) -> MailboxSender<T> {
        MailboxSender(self.tx.clone())
    }

    /// Block until a message is available and return it.
    pub fn pop(&self) -> T {
        self.rx
            .lock()
            .unwrap()
            .recv()
            .expect("mailbox sender disconnected mid-run")
    }
}

impl<T: Send> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct MailboxSender<T>(Sender<T>);

impl<T: Send> MailboxSender<T> {
    /// Enqueue a message without blocking.
    pub fn push(&self, value: T) {
        self.0
            .send(value)
            .expect("mailbox receiver dropped mid-run")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let mailbox = Mailbox::new();
        let tx = mailbox.sender();
        tx.push(1);
        tx.push(2);
        tx.push(3);
        assert_eq!(mailbox.pop(), 1);
        assert_eq!(mailbox.pop(), 2);
        assert_eq!(mailbox.pop(), 3);
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let mailbox = Mailbox::new();
        let tx = mailbox.sender();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            tx.push(42usize);
        });
        // Blocks until the spawned thread pushes.
        assert_eq!(mailbox.pop(), 42);
        handle.join().unwrap();
    }

    #[test]
    fn test_senders_from_multiple_threads() {
        let mailbox = Mailbox::new();
        let handles: Vec<_> = (0..4usize)
            .map(|i| {
                let tx = mailbox.sender();
                thread::spawn(move || tx.push(i))
            })
            .collect();
        let mut seen: Vec<usize> = (0..4).map(|_| mailbox.pop()).collect();
        for h in handles {
            h.join().unwrap();
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }
}
