//! Transient packet buffers.
//!
//! Every send path assembles its packet in a buffer obtained here and drops it
//! once the layer below has accepted the bytes.

use crate::error::NetError;

/// Allocate a zeroed buffer of exactly `len` bytes.
///
/// Allocation failure is reported as [`NetError::OutOfMemory`] instead of
/// aborting.
pub fn alloc_packet(len: usize) -> Result<Vec<u8>, NetError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| NetError::OutOfMemory(len))?;
    buf.resize(len, 0);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_packet_is_zeroed() {
        let buf = alloc_packet(64).unwrap();
        assert_eq!(buf.len(), 64);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_alloc_packet_reports_oom() {
        match alloc_packet(usize::MAX) {
            Err(NetError::OutOfMemory(size)) => assert_eq!(size, usize::MAX),
            other => panic!("expected OutOfMemory, got {:?}", other.map(|b| b.len())),
        }
    }
}
