//! Bounded channels used for the cooperative hand-off between the
//! replica's worker threads.

use std::time::Duration;

#[cfg(feature = "channel_flume_mpmc")]
use flume::{RecvTimeoutError, TrySendError};

use crate::bft::error::*;

/// The sending half of a bounded channel.
pub struct ChannelTx<T> {
    #[cfg(feature = "channel_flume_mpmc")]
    inner: ::flume::Sender<T>,
}

/// The receiving half of a bounded channel.
///
/// May be cloned, so a pool of workers can drain one queue.
pub struct ChannelRx<T> {
    #[cfg(feature = "channel_flume_mpmc")]
    inner: ::flume::Receiver<T>,
}

/// Creates a new bounded channel with room for `bound` messages.
pub fn new_bounded<T>(bound: usize) -> (ChannelTx<T>, ChannelRx<T>) {
    let (tx, rx) = ::flume::bounded(bound);
    (ChannelTx { inner: tx }, ChannelRx { inner: rx })
}

impl<T> ChannelTx<T> {
    /// Sends `message` over the channel, blocking while it is full.
    pub fn send(&self, message: T) -> Result<()> {
        self.inner
            .send(message)
            .simple_msg(ErrorKind::CommunicationChannel, "Channel disconnected")
    }

    /// Sends `message` over the channel, dropping it if the channel
    /// is full.
    pub fn try_send(&self, message: T) -> Result<()> {
        match self.inner.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err("Channel full").wrapped(ErrorKind::CommunicationChannel)
            }
            Err(TrySendError::Disconnected(_)) => {
                Err("Channel disconnected").wrapped(ErrorKind::CommunicationChannel)
            }
        }
    }
}

impl<T> ChannelRx<T> {
    /// Pops one message, giving up after `timeout`.
    ///
    /// Returns `None` both on an empty queue after the deadline and
    /// on a disconnected channel; loops polling this are expected to
    /// check the replica's stop flag between calls.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        match self.inner.recv_timeout(timeout) {
            Ok(message) => Some(message),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Pops one message if one is already queued.
    pub fn try_recv(&self) -> Option<T> {
        self.inner.try_recv().ok()
    }

    /// The number of messages sitting in the queue.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Checks if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<T> Clone for ChannelTx<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Clone for ChannelRx<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_send_recv() {
        let (tx, rx) = new_bounded(4);
        tx.send(17u64).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_millis(10)), Some(17));
    }

    #[test]
    fn test_recv_deadline_expires() {
        let (_tx, rx) = new_bounded::<u64>(4);
        assert_eq!(rx.recv_timeout(Duration::from_millis(1)), None);
    }

    #[test]
    fn test_try_send_full() {
        let (tx, _rx) = new_bounded(1);
        tx.try_send(1u8).unwrap();
        assert!(tx.try_send(2u8).is_err());
    }
}
