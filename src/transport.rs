/// Byte-level channel to the reader.
///
/// The physical link is half duplex; callers serialize access externally
/// (the reader wraps implementations in a mutex). A read that times out
/// returns `Ok(0)`, which is normal and not an error.
pub trait RfidTransport {
    /// Error type for transport operations
    type Error: std::fmt::Debug;

    /// Write data to the transport
    fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout_ms` milliseconds
    fn read(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, Self::Error>;

    /// Discard any unread buffered input
    fn flush_input(&mut self) -> Result<(), Self::Error>;
}
