//! Stream transport: byte streams with policy-driven reads and
//! scatter-gather writes.

use std::collections::VecDeque;
use std::io::{IoSlice, Read, Write};
use std::time::Instant;

use bytes::BytesMut;
use tracing::trace;
use weft_core::{Locator, NetError, NetResult};

use crate::endpoint::OutboundMessage;
use crate::multiplexer::TimeoutTag;
use crate::proxy::ResolveListener;
use crate::transport::{
    Application, BufferPool, PacketWriter, ReceivePolicy, TimerHandle, Transport,
};

/// Reads per readiness event before yielding back to the multiplexer.
const MAX_CONSECUTIVE_READS: usize = 50;

/// Buffers per scatter-gather write.
const MAX_WRITE_BUFFERS: usize = 10;

/// Which pool a queued buffer returns to once written.
#[derive(Clone, Copy)]
enum BufKind {
    Header,
    Payload,
}

struct QueuedBuf {
    buf: BytesMut,
    kind: BufKind,
}

/// A transport over one connected byte stream.
///
/// Reads accumulate in a growable buffer until the application's
/// [`ReceivePolicy`] threshold is met. Writes keep a queue of framed
/// buffers plus a byte offset into the front buffer, so a partially
/// written packet resumes at the exact byte on the next writable event.
pub struct StreamTransport<S, A> {
    socket: S,
    app: A,
    read_buf: BytesMut,
    collected: usize,
    policy: ReceivePolicy,
    write_queue: VecDeque<QueuedBuf>,
    write_offset: usize,
    pool: BufferPool,
    timers: TimerHandle,
}

struct StreamWriter<'a> {
    pool: &'a mut BufferPool,
    queue: &'a mut VecDeque<QueuedBuf>,
    policy: &'a mut ReceivePolicy,
    timers: &'a TimerHandle,
}

impl PacketWriter for StreamWriter<'_> {
    fn next_header_buffer(&mut self) -> BytesMut {
        self.pool.next_header_buffer()
    }

    fn next_payload_buffer(&mut self) -> BytesMut {
        self.pool.next_payload_buffer()
    }

    fn write_packet(&mut self, header: BytesMut, payload: BytesMut) {
        self.queue.push_back(QueuedBuf {
            buf: header,
            kind: BufKind::Header,
        });
        if payload.is_empty() {
            self.pool.release_payload_buffer(payload);
        } else {
            self.queue.push_back(QueuedBuf {
                buf: payload,
                kind: BufKind::Payload,
            });
        }
    }

    fn configure_read(&mut self, policy: ReceivePolicy) {
        *self.policy = policy;
    }

    fn set_timeout(&mut self, deadline: Instant, tag: TimeoutTag) -> u64 {
        self.timers.set_timeout(deadline, tag)
    }

    fn cancel_timeout(&mut self, tag: TimeoutTag, id: u64) {
        self.timers.cancel_timeout(tag, id)
    }
}

impl<S, A> StreamTransport<S, A>
where
    S: Read + Write + mio::event::Source + Send,
    A: Application,
{
    /// A stream transport over `socket`, driving `app`.
    pub fn new(
        socket: S,
        app: A,
        timers: TimerHandle,
        max_header_buffers: usize,
        max_payload_buffers: usize,
    ) -> Self {
        StreamTransport {
            socket,
            app,
            read_buf: BytesMut::new(),
            collected: 0,
            policy: ReceivePolicy::AtMost(4096),
            write_queue: VecDeque::new(),
            write_offset: 0,
            pool: BufferPool::new(max_header_buffers, max_payload_buffers),
            timers,
        }
    }

    /// The application driven by this transport.
    pub fn application(&self) -> &A {
        &self.app
    }

    fn deliver(&mut self) -> NetResult<()> {
        let StreamTransport {
            app,
            read_buf,
            collected,
            policy,
            write_queue,
            pool,
            timers,
            ..
        } = self;
        let mut writer = StreamWriter {
            pool,
            queue: write_queue,
            policy,
            timers,
        };
        let result = app.handle_data(&mut writer, &read_buf[..*collected]);
        *collected = 0;
        if let Err(err) = result {
            self.app.handle_error(err.clone());
            return Err(err);
        }
        Ok(())
    }

    fn advance_write(&mut self, mut written: usize) {
        written += self.write_offset;
        self.write_offset = 0;
        while let Some(front) = self.write_queue.front() {
            if written >= front.buf.len() {
                written -= front.buf.len();
                if let Some(done) = self.write_queue.pop_front() {
                    match done.kind {
                        BufKind::Header => self.pool.release_header_buffer(done.buf),
                        BufKind::Payload => self.pool.release_payload_buffer(done.buf),
                    }
                }
            } else {
                self.write_offset = written;
                return;
            }
        }
        debug_assert_eq!(written, 0);
    }

    fn fatal(&mut self, err: NetError) -> NetError {
        self.app.handle_error(err.clone());
        err
    }
}

impl<S, A> Transport for StreamTransport<S, A>
where
    S: Read + Write + mio::event::Source + Send,
    A: Application,
{
    fn source(&mut self) -> &mut dyn mio::event::Source {
        &mut self.socket
    }

    fn init(&mut self) -> NetResult<()> {
        let StreamTransport {
            app,
            policy,
            write_queue,
            pool,
            timers,
            ..
        } = self;
        let mut writer = StreamWriter {
            pool,
            queue: write_queue,
            policy,
            timers,
        };
        app.init(&mut writer)
    }

    fn handle_read_event(&mut self) -> NetResult<()> {
        for _ in 0..MAX_CONSECUTIVE_READS {
            let want = self.policy.buffer_size();
            if self.read_buf.len() < want {
                self.read_buf.resize(want, 0);
            }
            let read = {
                let slice = &mut self.read_buf[self.collected..want];
                if slice.is_empty() {
                    // Threshold already satisfied without a fresh read.
                    self.deliver()?;
                    continue;
                }
                self.socket.read(slice)
            };
            match read {
                Ok(0) => return Err(self.fatal(NetError::Disconnected)),
                Ok(n) => {
                    trace!(bytes = n, "stream read");
                    self.collected += n;
                    if self.collected >= self.policy.threshold() {
                        self.deliver()?;
                    }
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(self.fatal(err.into())),
            }
        }
        Ok(())
    }

    fn write_message(&mut self, msg: OutboundMessage) -> NetResult<()> {
        let StreamTransport {
            app,
            policy,
            write_queue,
            pool,
            timers,
            ..
        } = self;
        let mut writer = StreamWriter {
            pool,
            queue: write_queue,
            policy,
            timers,
        };
        app.write_message(&mut writer, msg)
    }

    fn resolve(&mut self, locator: Locator, listener: Box<dyn ResolveListener>) {
        let StreamTransport {
            app,
            policy,
            write_queue,
            pool,
            timers,
            ..
        } = self;
        let mut writer = StreamWriter {
            pool,
            queue: write_queue,
            policy,
            timers,
        };
        app.resolve(&mut writer, locator, listener)
    }

    fn timeout(&mut self, tag: TimeoutTag, id: u64) {
        let StreamTransport {
            app,
            policy,
            write_queue,
            pool,
            timers,
            ..
        } = self;
        let mut writer = StreamWriter {
            pool,
            queue: write_queue,
            policy,
            timers,
        };
        app.timeout(&mut writer, tag, id)
    }

    fn write_some(&mut self) -> NetResult<bool> {
        loop {
            if self.write_queue.is_empty() {
                return Ok(false);
            }
            let written = {
                let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(MAX_WRITE_BUFFERS);
                for (index, queued) in self.write_queue.iter().take(MAX_WRITE_BUFFERS).enumerate()
                {
                    if index == 0 {
                        slices.push(IoSlice::new(&queued.buf[self.write_offset..]));
                    } else {
                        slices.push(IoSlice::new(&queued.buf));
                    }
                }
                self.socket.write_vectored(&slices)
            };
            match written {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    trace!(bytes = n, "stream write");
                    self.advance_write(n);
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(true),
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(self.fatal(err.into())),
            }
        }
    }

    fn pending_bytes(&self) -> usize {
        let queued: usize = self.write_queue.iter().map(|q| q.buf.len()).sum();
        queued - self.write_offset
    }

    fn handle_error(&mut self, err: NetError) {
        self.app.handle_error(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiplexer::Multiplexer;
    use crate::socket::stream_socket_pair;
    use std::io::ErrorKind;

    /// Captures deliveries and keeps a fixed read policy.
    struct CaptureApp {
        policy: ReceivePolicy,
        deliveries: Vec<Vec<u8>>,
    }

    impl Application for CaptureApp {
        fn init(&mut self, writer: &mut dyn PacketWriter) -> NetResult<()> {
            writer.configure_read(self.policy);
            Ok(())
        }

        fn handle_data(&mut self, _writer: &mut dyn PacketWriter, data: &[u8]) -> NetResult<()> {
            self.deliveries.push(data.to_vec());
            Ok(())
        }

        fn write_message(
            &mut self,
            _writer: &mut dyn PacketWriter,
            _msg: OutboundMessage,
        ) -> NetResult<()> {
            Ok(())
        }

        fn resolve(
            &mut self,
            _writer: &mut dyn PacketWriter,
            _locator: Locator,
            _listener: Box<dyn ResolveListener>,
        ) {
        }

        fn timeout(&mut self, _writer: &mut dyn PacketWriter, _tag: TimeoutTag, _id: u64) {}

        fn handle_error(&mut self, _err: NetError) {}
    }

    fn timer_handle() -> TimerHandle {
        let mpx = Multiplexer::new().expect("multiplexer");
        TimerHandle::new(mpx.handle(), mio::Token(42))
    }

    fn transport(
        policy: ReceivePolicy,
    ) -> (
        StreamTransport<mio::net::UnixStream, CaptureApp>,
        mio::net::UnixStream,
    ) {
        let (local, remote) = stream_socket_pair().expect("pair");
        let app = CaptureApp {
            policy,
            deliveries: Vec::new(),
        };
        let mut transport = StreamTransport::new(local, app, timer_handle(), 4, 4);
        transport.init().expect("init");
        (transport, remote)
    }

    fn write_all_blocking(socket: &mut mio::net::UnixStream, mut data: &[u8]) {
        while !data.is_empty() {
            match socket.write(data) {
                Ok(n) => data = &data[n..],
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => panic!("write failed: {e}"),
            }
        }
    }

    #[test]
    fn short_reads_are_merged_until_threshold() {
        let (mut transport, mut remote) = transport(ReceivePolicy::Exactly(8));
        write_all_blocking(&mut remote, b"1234");
        transport.handle_read_event().expect("read");
        assert!(transport.app.deliveries.is_empty());

        write_all_blocking(&mut remote, b"5678");
        transport.handle_read_event().expect("read");
        assert_eq!(transport.app.deliveries, vec![b"12345678".to_vec()]);
    }

    #[test]
    fn exactly_policy_never_overshoots() {
        let (mut transport, mut remote) = transport(ReceivePolicy::Exactly(4));
        write_all_blocking(&mut remote, b"abcdefgh");
        transport.handle_read_event().expect("read");
        assert_eq!(
            transport.app.deliveries,
            vec![b"abcd".to_vec(), b"efgh".to_vec()]
        );
    }

    #[test]
    fn eof_is_a_clean_disconnect() {
        let (mut transport, remote) = transport(ReceivePolicy::AtMost(64));
        drop(remote);
        let err = transport.handle_read_event().expect_err("eof");
        assert_eq!(err, NetError::Disconnected);
    }

    #[test]
    fn partial_writes_resume_at_offset() {
        let (mut transport, mut remote) = transport(ReceivePolicy::AtMost(64));
        // One large frame: bigger than any socket buffer.
        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
        {
            let StreamTransport {
                pool,
                write_queue,
                policy,
                timers,
                ..
            } = &mut transport;
            let mut writer = StreamWriter {
                pool,
                queue: write_queue,
                policy,
                timers,
            };
            let mut header = writer.next_header_buffer();
            header.extend_from_slice(b"HDR!");
            let mut body = writer.next_payload_buffer();
            body.extend_from_slice(&payload);
            writer.write_packet(header, body);
        }

        let mut received = Vec::new();
        let mut buf = [0u8; 16 * 1024];
        loop {
            let more = transport.write_some().expect("write");
            loop {
                match remote.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => panic!("read failed: {e}"),
                }
            }
            if !more {
                break;
            }
        }
        assert_eq!(received.len(), payload.len() + 4);
        assert_eq!(&received[..4], b"HDR!");
        assert_eq!(&received[4..], &payload[..]);
        assert_eq!(transport.pending_bytes(), 0);
    }
}
