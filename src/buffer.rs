use std::io;
use std::ops::Index;
use std::os::fd::RawFd;

/// Initial capacity of the readable/writable region.
const DEFAULT_LEN: usize = 2048;

/// Bytes reserved in front of the readable region so a length prefix can be
/// prepended without moving data.
const RESERVE: usize = 8;

/// Size of the stack extent `read_fd` scatter-reads into next to the
/// writable region.
const EXT_BUF_LEN: usize = 8 * 1024;

/// A memory buffer used for sending and receiving data.
///
/// The buffer is one contiguous allocation with three indices,
/// `head <= tail <= capacity`: `[head, tail)` is readable, `[tail, capacity)`
/// is writable, and `[0, RESERVE)` is kept free so small front insertions
/// (typically length prefixes) are O(1). Reading advances `head`; writing
/// advances `tail`; when the writable region runs short the readable bytes
/// are either shifted back down to the reserve or the allocation grows.
///
/// Multi-byte integers are written and read in network byte order.
///
/// # Examples
///
/// ```
/// use netloop::MessageBuffer;
///
/// let mut buf = MessageBuffer::new();
/// buf.push_back(b"hello world!");
/// buf.push_front_u64(12);
///
/// assert_eq!(buf.readable_bytes(), 20);
/// assert_eq!(buf.read_u64(), 12);
/// assert_eq!(buf.read(12), b"hello world!");
/// assert_eq!(buf.readable_bytes(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct MessageBuffer {
    buffer: Vec<u8>,
    head: usize,
    tail: usize,
    // Keeps the length of the buffer stable over a suitable range, rather
    // than growing indefinitely.
    init_cap: usize,
}

impl MessageBuffer {
    /// Creates a buffer with the default initial capacity (2 KiB).
    pub fn new() -> MessageBuffer {
        MessageBuffer::with_capacity(DEFAULT_LEN)
    }

    /// Creates a buffer with `len` bytes of initial capacity.
    pub fn with_capacity(len: usize) -> MessageBuffer {
        MessageBuffer {
            buffer: vec![0; len + RESERVE],
            head: RESERVE,
            tail: RESERVE,
            init_cap: len,
        }
    }

    /// Returns the readable region.
    pub fn peek(&self) -> &[u8] {
        &self.buffer[self.head..self.tail]
    }

    /// Number of readable bytes.
    pub fn readable_bytes(&self) -> usize {
        self.tail - self.head
    }

    /// Number of bytes that can be written without reallocating.
    pub fn writable_bytes(&self) -> usize {
        self.buffer.len() - self.tail
    }

    /// Reads the first byte without consuming it.
    pub fn peek_u8(&self) -> u8 {
        assert!(self.readable_bytes() >= 1);
        self.buffer[self.head]
    }

    /// Reads a big-endian `u16` without consuming it.
    pub fn peek_u16(&self) -> u16 {
        assert!(self.readable_bytes() >= 2);
        let mut raw = [0; 2];
        raw.copy_from_slice(&self.peek()[..2]);
        u16::from_be_bytes(raw)
    }

    /// Reads a big-endian `u32` without consuming it.
    pub fn peek_u32(&self) -> u32 {
        assert!(self.readable_bytes() >= 4);
        let mut raw = [0; 4];
        raw.copy_from_slice(&self.peek()[..4]);
        u32::from_be_bytes(raw)
    }

    /// Reads a big-endian `u64` without consuming it.
    pub fn peek_u64(&self) -> u64 {
        assert!(self.readable_bytes() >= 8);
        let mut raw = [0; 8];
        raw.copy_from_slice(&self.peek()[..8]);
        u64::from_be_bytes(raw)
    }

    /// Removes and returns up to `len` bytes from the front.
    pub fn read(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.readable_bytes());
        let ret = self.peek()[..len].to_vec();
        self.retrieve(len);
        ret
    }

    /// Removes and returns all readable bytes.
    pub fn read_all(&mut self) -> Vec<u8> {
        self.read(self.readable_bytes())
    }

    /// Removes and returns the first byte.
    pub fn read_u8(&mut self) -> u8 {
        let ret = self.peek_u8();
        self.retrieve(1);
        ret
    }

    /// Removes and returns a big-endian `u16`.
    pub fn read_u16(&mut self) -> u16 {
        let ret = self.peek_u16();
        self.retrieve(2);
        ret
    }

    /// Removes and returns a big-endian `u32`.
    pub fn read_u32(&mut self) -> u32 {
        let ret = self.peek_u32();
        self.retrieve(4);
        ret
    }

    /// Removes and returns a big-endian `u64`.
    pub fn read_u64(&mut self) -> u64 {
        let ret = self.peek_u64();
        self.retrieve(8);
        ret
    }

    /// Appends bytes, growing the buffer when needed.
    pub fn push_back(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buffer[self.tail..self.tail + data.len()].copy_from_slice(data);
        self.tail += data.len();
    }

    /// Appends another buffer's readable bytes.
    pub fn push_back_buffer(&mut self, other: &MessageBuffer) {
        self.push_back(other.peek());
    }

    /// Appends one byte.
    pub fn push_back_u8(&mut self, value: u8) {
        self.push_back(&[value]);
    }

    /// Appends a `u16` in network byte order.
    pub fn push_back_u16(&mut self, value: u16) {
        self.push_back(&value.to_be_bytes());
    }

    /// Appends a `u32` in network byte order.
    pub fn push_back_u32(&mut self, value: u32) {
        self.push_back(&value.to_be_bytes());
    }

    /// Appends a `u64` in network byte order.
    pub fn push_back_u64(&mut self, value: u64) {
        self.push_back(&value.to_be_bytes());
    }

    /// Inserts bytes in front of the readable region.
    ///
    /// Short insertions land in the reserve region; longer ones shift the
    /// readable bytes right when the writable room suffices, and reallocate
    /// otherwise.
    pub fn push_front(&mut self, data: &[u8]) {
        // The reserved space is sufficient.
        if self.head >= data.len() {
            self.buffer[self.head - data.len()..self.head].copy_from_slice(data);
            self.head -= data.len();
            return;
        }
        // The writable room is sufficient: move the readable bytes back,
        // then copy in front of them.
        if data.len() <= self.writable_bytes() {
            self.buffer
                .copy_within(self.head..self.tail, self.head + data.len());
            self.buffer[self.head..self.head + data.len()].copy_from_slice(data);
            self.tail += data.len();
            return;
        }
        // Reallocate, the same way push_back grows.
        let new_len = if data.len() + self.readable_bytes() < self.init_cap {
            self.init_cap
        } else {
            data.len() + self.readable_bytes()
        };
        let mut new_buf = MessageBuffer::with_capacity(new_len);
        new_buf.push_back(data);
        new_buf.push_back(self.peek());
        new_buf.init_cap = self.init_cap;
        *self = new_buf;
    }

    /// Inserts one byte at the front.
    pub fn push_front_u8(&mut self, value: u8) {
        self.push_front(&[value]);
    }

    /// Inserts a `u16` in network byte order at the front.
    pub fn push_front_u16(&mut self, value: u16) {
        self.push_front(&value.to_be_bytes());
    }

    /// Inserts a `u32` in network byte order at the front.
    pub fn push_front_u32(&mut self, value: u32) {
        self.push_front(&value.to_be_bytes());
    }

    /// Inserts a `u64` in network byte order at the front.
    pub fn push_front_u64(&mut self, value: u64) {
        self.push_front(&value.to_be_bytes());
    }

    /// Discards `len` readable bytes.
    pub fn retrieve(&mut self, len: usize) {
        if len >= self.readable_bytes() {
            self.retrieve_all();
            return;
        }
        self.head += len;
    }

    /// Discards everything, shrinking the allocation back to the initial
    /// capacity when it had grown beyond twice that, so long-lived
    /// connections do not pin their high-water allocation.
    pub fn retrieve_all(&mut self) {
        if self.buffer.len() > self.init_cap * 2 {
            self.buffer.truncate(self.init_cap + RESERVE);
            self.buffer.shrink_to_fit();
        }
        self.head = RESERVE;
        self.tail = RESERVE;
    }

    /// Discards the readable bytes before `index` (as found by
    /// [`find_crlf`](MessageBuffer::find_crlf) and friends).
    pub fn retrieve_until(&mut self, index: usize) {
        assert!(index <= self.readable_bytes());
        self.retrieve(index);
    }

    /// Position of the first CRLF in the readable region.
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|w| w == b"\r\n")
    }

    /// Makes room for at least `len` writable bytes.
    ///
    /// Prefers shifting the readable bytes down to the reserve over growing;
    /// growth goes to `max(2 * capacity, reserve + readable + len)`.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() >= len {
            return;
        }
        if self.head + self.writable_bytes() >= len + RESERVE {
            self.buffer.copy_within(self.head..self.tail, RESERVE);
            self.tail = RESERVE + (self.tail - self.head);
            self.head = RESERVE;
            return;
        }
        let new_len = if self.buffer.len() * 2 > RESERVE + self.readable_bytes() + len {
            self.buffer.len() * 2
        } else {
            RESERVE + self.readable_bytes() + len
        };
        let mut new_buf = MessageBuffer::with_capacity(new_len - RESERVE);
        new_buf.push_back(self.peek());
        new_buf.init_cap = self.init_cap;
        *self = new_buf;
    }

    /// Marks `len` bytes of the writable region as written.
    pub fn has_written(&mut self, len: usize) {
        assert!(len <= self.writable_bytes());
        self.tail += len;
    }

    /// Drops `len` bytes off the end of the readable region.
    pub fn unwrite(&mut self, len: usize) {
        assert!(self.readable_bytes() >= len);
        self.tail -= len;
    }

    /// Reads from `fd` into the buffer.
    ///
    /// Scatter-reads into the writable region plus an 8 KiB stack extent;
    /// whatever lands in the extent is absorbed with
    /// [`push_back`](MessageBuffer::push_back). One syscall per call: the
    /// caller retries on the next readiness event.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut ext_buf = [0u8; EXT_BUF_LEN];
        let writable = self.writable_bytes();
        let mut vec = [
            libc::iovec {
                iov_base: self.buffer[self.tail..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: ext_buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: ext_buf.len(),
            },
        ];
        let iovcnt = if writable < ext_buf.len() { 2 } else { 1 };
        let n = syscall!(readv(fd, vec.as_mut_ptr(), iovcnt))? as usize;
        if n <= writable {
            self.tail += n;
        } else {
            self.tail = self.buffer.len();
            self.push_back(&ext_buf[..n - writable]);
        }
        Ok(n)
    }
}

impl Default for MessageBuffer {
    fn default() -> MessageBuffer {
        MessageBuffer::new()
    }
}

impl Index<usize> for MessageBuffer {
    type Output = u8;

    fn index(&self, offset: usize) -> &u8 {
        &self.peek()[offset]
    }
}

impl From<&[u8]> for MessageBuffer {
    fn from(data: &[u8]) -> MessageBuffer {
        let mut buf = MessageBuffer::new();
        buf.push_back(data);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::{MessageBuffer, DEFAULT_LEN, RESERVE};

    #[test]
    fn push_back_then_read_round_trips() {
        let mut buf = MessageBuffer::new();
        buf.push_back(b"hello");
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.read(5), b"hello");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn ints_round_trip_in_network_order() {
        let mut buf = MessageBuffer::new();
        buf.push_back_u16(0xbeef);
        buf.push_back_u32(0xdead_beef);
        buf.push_back_u64(0x0123_4567_89ab_cdef);
        assert_eq!(buf.peek()[0], 0xbe);
        assert_eq!(buf.read_u16(), 0xbeef);
        assert_eq!(buf.read_u32(), 0xdead_beef);
        assert_eq!(buf.read_u64(), 0x0123_4567_89ab_cdef);
    }

    #[test]
    fn push_front_uses_the_reserve() {
        let mut buf = MessageBuffer::new();
        buf.push_back(b"hello world!");
        buf.push_front_u64(12);
        assert_eq!(buf.readable_bytes(), 20);
        assert_eq!(buf.peek_u64(), 12);
        assert_eq!(buf.read_u64(), 12);
        assert_eq!(buf.read(12), b"hello world!");
    }

    #[test]
    fn push_front_larger_than_reserve() {
        let mut buf = MessageBuffer::new();
        buf.push_back(b"tail");
        let prefix = [0x55u8; 100];
        buf.push_front(&prefix);
        assert_eq!(buf.readable_bytes(), 104);
        assert_eq!(buf.read(100), prefix);
        assert_eq!(buf.read_all(), b"tail");
    }

    #[test]
    fn grows_and_shrinks_back() {
        let mut buf = MessageBuffer::new();
        let big = vec![7u8; DEFAULT_LEN * 8];
        buf.push_back(&big);
        assert_eq!(buf.peek(), &big[..]);
        buf.retrieve_all();
        assert_eq!(buf.readable_bytes(), 0);
        assert!(buf.writable_bytes() <= DEFAULT_LEN);
        // Still usable after the shrink.
        buf.push_back(b"x");
        assert_eq!(buf.read_all(), b"x");
    }

    #[test]
    fn compacts_before_growing() {
        let mut buf = MessageBuffer::with_capacity(64);
        buf.push_back(&[1u8; 60]);
        buf.retrieve(59);
        // 1 readable byte at the end; 60 more fit after compaction.
        buf.push_back(&[2u8; 60]);
        assert_eq!(buf.readable_bytes(), 61);
        assert_eq!(buf.read(1), [1]);
        assert_eq!(buf.read_all(), [2u8; 60]);
    }

    #[test]
    fn find_crlf() {
        let mut buf = MessageBuffer::new();
        buf.push_back(b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert_eq!(buf.find_crlf(), Some(14));
        let at = buf.find_crlf().unwrap();
        buf.retrieve_until(at + 2);
        assert_eq!(buf.read_all(), b"Host: x\r\n");
        assert_eq!(buf.find_crlf(), None);
    }

    #[test]
    fn random_round_trips() {
        use rand::RngCore;

        let mut rng = rand::rng();
        let mut buf = MessageBuffer::new();
        for _ in 0..32 {
            let mut data = vec![0u8; (rng.next_u32() % 4096) as usize + 1];
            rng.fill_bytes(&mut data);
            buf.push_back(&data);
            assert_eq!(buf.read(data.len()), data);
        }
    }

    #[test]
    fn reserve_is_kept_after_operations() {
        let mut buf = MessageBuffer::new();
        buf.push_back(b"abc");
        buf.retrieve_all();
        buf.push_front(b"xyz");
        // Front insertion after a reset still fits the reserve.
        assert_eq!(buf.read_all(), b"xyz");
        let _ = RESERVE;
    }
}
