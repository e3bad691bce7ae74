use std::time::Duration;

use bytes::BytesMut;

use crate::{
    Packet,
    PacketType,
    Timestamp,
    MAX_PAYLOAD_SIZE,
};

/// Single-producer accumulator that rolls a byte stream into packets of
/// bounded size.
///
/// Bytes go in via [`push`](Self::push); the buffer flips to ready when the
/// payload fills, when the configured sentinel appears at the tail, or when
/// the first byte has been sitting longer than the flush timeout. A separate
/// [`tick`](Self::tick) re-evaluates only the timeout rule so quiescent
/// streams still flush. Emitted packets carry the timestamp of their first
/// byte, never the flush time.
#[derive(Debug)]
pub struct BufferedPacket {
    packet_type:     PacketType,
    max_payload:     usize,
    flush_timeout:   Duration,
    sentinel:        Option<Vec<u8>>,
    pending:         BytesMut,
    first_byte_time: Option<Timestamp>,
    ready:           bool,
}

impl BufferedPacket {
    pub fn new(packet_type: PacketType, max_payload: usize, flush_timeout: Duration) -> Self {
        Self {
            packet_type,
            max_payload: max_payload.clamp(1, MAX_PAYLOAD_SIZE),
            flush_timeout,
            sentinel: None,
            pending: BytesMut::new(),
            first_byte_time: None,
            ready: false,
        }
    }

    pub fn with_sentinel(mut self, sentinel: Vec<u8>) -> Self {
        self.sentinel = (!sentinel.is_empty()).then_some(sentinel);
        self
    }

    /// Runtime `max_packet_size` changes apply to the next packet boundary.
    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload.clamp(1, MAX_PAYLOAD_SIZE);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn push(&mut self, data: &[u8], now: Timestamp) {
        if data.is_empty() {
            return;
        }

        if self.pending.is_empty() {
            self.first_byte_time = Some(now);
        }

        self.pending.extend_from_slice(data);

        if self.pending.len() >= self.max_payload {
            self.ready = true;
        } else if self
            .sentinel
            .as_ref()
            .is_some_and(|s| self.pending.ends_with(s))
        {
            self.ready = true;
        } else {
            self.check_timeout(now);
        }
    }

    /// Evaluate only the timeout rule; called every event-loop cycle.
    pub fn tick(&mut self, now: Timestamp) {
        if !self.pending.is_empty() {
            self.check_timeout(now);
        }
    }

    fn check_timeout(&mut self, now: Timestamp) {
        if let Some(first) = self.first_byte_time {
            if now.duration_since(first) >= self.flush_timeout {
                self.ready = true;
            }
        }
    }

    /// Emit one packet if the buffer is ready. Overflow past `max_payload`
    /// stays pending for the next packet.
    pub fn drain(&mut self) -> Option<Packet> {
        if !self.ready {
            return None;
        }

        self.take_packet()
    }

    /// Emit whatever is pending regardless of readiness; used on shutdown.
    pub fn flush(&mut self) -> Option<Packet> {
        if self.pending.is_empty() {
            return None;
        }

        self.take_packet()
    }

    /// Throw away pending bytes after malformed input.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.first_byte_time = None;
        self.ready = false;
    }

    fn take_packet(&mut self) -> Option<Packet> {
        let timestamp = self.first_byte_time?;

        let take = self.pending.len().min(self.max_payload);
        let chunk = self.pending.split_to(take);

        if self.pending.is_empty() {
            self.first_byte_time = None;
            self.ready = false;
        } else {
            // Retained overflow keeps the original first-byte time, which
            // keeps packet timestamps monotonic.
            self.ready = self.pending.len() >= self.max_payload;
        }

        match Packet::new(self.packet_type, timestamp, &chunk) {
            Ok(pkt) => Some(pkt),
            Err(e) => {
                tracing::error!(error = %e, "building packet from buffered bytes");
                self.clear();
                None
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const FLUSH: Duration = Duration::from_millis(40);

    fn at(ms: u64) -> Timestamp {
        Timestamp::from_unix(Duration::from_millis(ms))
    }

    #[test]
    fn flush_by_size_retains_overflow() {
        let mut buf = BufferedPacket::new(PacketType::DataFromInstrument, 4, FLUSH);

        buf.push(&[1, 2, 3, 4, 5, 6], at(0));
        assert!(buf.is_ready());

        let pkt = buf.drain().unwrap();
        assert_eq!(pkt.payload(), &[1, 2, 3, 4]);

        // Two bytes left over, not yet ready.
        assert!(!buf.is_ready());
        assert!(!buf.is_empty());

        buf.tick(at(50));
        let rest = buf.drain().unwrap();
        assert_eq!(rest.payload(), &[5, 6]);
        assert!(buf.is_empty());
    }

    #[test]
    fn flush_by_time_keeps_first_byte_timestamp() {
        let mut buf = BufferedPacket::new(PacketType::DataFromInstrument, 4096, FLUSH);

        buf.push(&[0xff], at(100));
        assert!(!buf.is_ready());

        buf.tick(at(120));
        assert!(!buf.is_ready());

        buf.tick(at(141));
        assert!(buf.is_ready());

        let pkt = buf.drain().unwrap();
        assert_eq!(pkt.payload(), &[0xff]);
        assert_eq!(pkt.timestamp(), at(100));
    }

    #[test]
    fn flush_by_sentinel() {
        let mut buf = BufferedPacket::new(PacketType::DataFromInstrument, 4096, FLUSH)
            .with_sentinel(b"\r\n".to_vec());

        buf.push(b"K1 100", at(0));
        assert!(!buf.is_ready());

        buf.push(b"\r\n", at(1));
        assert!(buf.is_ready());
        assert_eq!(buf.drain().unwrap().payload(), b"K1 100\r\n");
    }

    #[test]
    fn push_timestamp_resets_per_packet() {
        let mut buf = BufferedPacket::new(PacketType::DataFromInstrument, 2, FLUSH);

        buf.push(&[1, 2], at(10));
        assert_eq!(buf.drain().unwrap().timestamp(), at(10));

        buf.push(&[3, 4], at(500));
        assert_eq!(buf.drain().unwrap().timestamp(), at(500));
    }

    #[test]
    fn tick_on_empty_is_inert() {
        let mut buf = BufferedPacket::new(PacketType::DataFromDriver, 16, FLUSH);

        buf.tick(at(10_000));
        assert!(!buf.is_ready());
        assert!(buf.drain().is_none());
    }

    #[test]
    fn forced_flush_emits_partial() {
        let mut buf = BufferedPacket::new(PacketType::DataFromDriver, 4096, FLUSH);

        buf.push(b"RESET\n", at(0));
        assert!(!buf.is_ready());

        let pkt = buf.flush().unwrap();
        assert_eq!(pkt.payload(), b"RESET\n");
        assert_eq!(pkt.packet_type(), PacketType::DataFromDriver);
        assert!(buf.is_empty());
    }

    #[test]
    fn clear_discards() {
        let mut buf = BufferedPacket::new(PacketType::DataFromInstrument, 16, FLUSH);

        buf.push(b"garbage", at(0));
        buf.clear();

        assert!(buf.is_empty());
        assert!(buf.flush().is_none());
    }
}
