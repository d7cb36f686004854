//! Pooled header and payload buffers.

use bytes::BytesMut;

/// Initial capacity handed out for header buffers.
const HEADER_BUFFER_CAPACITY: usize = 64;

/// Initial capacity handed out for payload buffers.
const PAYLOAD_BUFFER_CAPACITY: usize = 4 * 1024;

/// A bounded cache of reusable buffers, one per transport.
///
/// Acquire hands out a cached buffer when one is available and allocates
/// otherwise. Release clears the buffer and caches it again unless the cap
/// is reached, in which case the buffer just goes back to the heap.
pub struct BufferPool {
    headers: Vec<BytesMut>,
    payloads: Vec<BytesMut>,
    max_headers: usize,
    max_payloads: usize,
}

impl BufferPool {
    /// A pool with the given caps.
    pub fn new(max_headers: usize, max_payloads: usize) -> Self {
        BufferPool {
            headers: Vec::new(),
            payloads: Vec::new(),
            max_headers,
            max_payloads,
        }
    }

    /// Take a header buffer.
    pub fn next_header_buffer(&mut self) -> BytesMut {
        self.headers
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(HEADER_BUFFER_CAPACITY))
    }

    /// Take a payload buffer.
    pub fn next_payload_buffer(&mut self) -> BytesMut {
        self.payloads
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(PAYLOAD_BUFFER_CAPACITY))
    }

    /// Return a header buffer to the cache.
    pub fn release_header_buffer(&mut self, mut buf: BytesMut) {
        if self.headers.len() < self.max_headers {
            buf.clear();
            self.headers.push(buf);
        }
    }

    /// Return a payload buffer to the cache.
    pub fn release_payload_buffer(&mut self, mut buf: BytesMut) {
        if self.payloads.len() < self.max_payloads {
            buf.clear();
            self.payloads.push(buf);
        }
    }

    /// Number of cached buffers (headers, payloads).
    pub fn cached(&self) -> (usize, usize) {
        (self.headers.len(), self.payloads.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_respects_cap() {
        let mut pool = BufferPool::new(1, 2);
        pool.release_header_buffer(BytesMut::new());
        pool.release_header_buffer(BytesMut::new());
        pool.release_payload_buffer(BytesMut::new());
        pool.release_payload_buffer(BytesMut::new());
        pool.release_payload_buffer(BytesMut::new());
        assert_eq!(pool.cached(), (1, 2));
    }

    #[test]
    fn acquire_reuses_released() {
        let mut pool = BufferPool::new(4, 4);
        let mut buf = pool.next_payload_buffer();
        buf.extend_from_slice(b"junk");
        pool.release_payload_buffer(buf);
        let buf = pool.next_payload_buffer();
        assert!(buf.is_empty());
        assert_eq!(pool.cached(), (0, 0));
    }
}
