//! The pollset updater: the multiplexer's own wakeup socket manager.

use std::io::Read;

use mio::unix::pipe;
use tracing::trace;
use weft_core::NetError;

use super::{MpxContext, SocketManager};

/// Reads wakeup opcodes off the internal pipe.
///
/// Every cross-thread pollset operation writes one opcode byte; the byte
/// itself only wakes the poll loop — the operation payload travels in the
/// shared pending queue, which the multiplexer drains right after dispatch.
pub(crate) struct PollsetUpdater {
    receiver: pipe::Receiver,
}

impl PollsetUpdater {
    pub(crate) fn new(receiver: pipe::Receiver) -> Self {
        PollsetUpdater { receiver }
    }
}

impl SocketManager for PollsetUpdater {
    fn source(&mut self) -> &mut dyn mio::event::Source {
        &mut self.receiver
    }

    fn handle_read_event(&mut self, _ctx: &mut MpxContext) -> bool {
        let mut buf = [0u8; 64];
        loop {
            match self.receiver.read(&mut buf) {
                Ok(0) => {
                    // All senders gone; keep the manager, the shutdown op
                    // (if any) is already queued.
                    return true;
                }
                Ok(n) => {
                    trace!(opcodes = n, "pollset updater woke");
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return true,
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::error!(?err, "pollset updater pipe failed");
                    return false;
                }
            }
        }
    }

    fn handle_write_event(&mut self, _ctx: &mut MpxContext) -> bool {
        false
    }

    fn handle_error(&mut self, err: NetError) {
        tracing::error!(%err, "pollset updater error");
    }

    fn abort(&mut self, _reason: &NetError) {}
}
