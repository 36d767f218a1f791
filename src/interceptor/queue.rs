//! Netfilter queue source.

use log::info;
use nfq::{Message, Queue, Verdict};
use std::io;

use super::PacketSource;
use crate::verdict::PacketVerdict;

pub struct NfqSource {
    queue: Queue,
    queue_num: u16,
}

impl NfqSource {
    /// Bind to `queue_num`. With `fail_open` the kernel accepts packets
    /// itself when the queue is full instead of dropping them.
    pub fn open(queue_num: u16, fail_open: bool) -> io::Result<Self> {
        let mut queue = Queue::open()?;
        queue.bind(queue_num)?;
        queue.set_fail_open(queue_num, fail_open)?;
        queue.set_nonblocking(true);
        info!("Listening on NFQUEUE {}", queue_num);
        Ok(Self { queue, queue_num })
    }

    pub fn queue_num(&self) -> u16 {
        self.queue_num
    }
}

impl PacketSource for NfqSource {
    type Held = Message;

    fn recv(&mut self) -> io::Result<Option<(Message, Vec<u8>)>> {
        match self.queue.recv() {
            Ok(msg) => {
                let payload = msg.get_payload().to_vec();
                Ok(Some((msg, payload)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn release(&mut self, mut held: Message, verdict: PacketVerdict) -> io::Result<()> {
        held.set_verdict(match verdict {
            PacketVerdict::Accept => Verdict::Accept,
            PacketVerdict::Drop => Verdict::Drop,
        });
        self.queue.verdict(held)
    }
}

impl Drop for NfqSource {
    fn drop(&mut self) {
        if let Err(e) = self.queue.unbind(self.queue_num) {
            log::debug!("Unbinding queue {}: {}", self.queue_num, e);
        }
    }
}
