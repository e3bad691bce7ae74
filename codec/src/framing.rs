use bytes::{
    Buf,
    Bytes,
    BytesMut,
};
use tokio_util::codec::{
    Decoder,
    Encoder,
};

use packet::{
    Packet,
    HEADER_SIZE,
    SYNC,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Packet(#[from] packet::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Framing codec for the packet wire format.
///
/// The decoder hunts for the sync series, discards any garbage in front of
/// it, and waits for `packet_size` bytes before handing the frame to the
/// packet layer. In strict mode frames are fully validated; in digi mode
/// frames from an RSN terminal server are adopted as-is (the DIGI already
/// framed them).
#[derive(Debug, Clone, Default, Hash, PartialEq, Eq)]
pub struct PacketCodec {
    digi: bool,
}

impl PacketCodec {
    pub fn strict() -> Self {
        Self {
            digi: false,
        }
    }

    pub fn digi() -> Self {
        Self {
            digi: true,
        }
    }
}

fn find_sync(buf: &[u8]) -> Option<usize> {
    buf.windows(SYNC.len()).position(|w| w == SYNC)
}

impl Decoder for PacketCodec {
    type Error = Error;
    type Item = Packet;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let start = match find_sync(src) {
            Some(pos) => pos,
            None => {
                // No sync anywhere; keep a tail that could be the front of
                // a split sync series and drop the rest.
                let keep = src.len().min(SYNC.len() - 1);
                if src.len() > keep {
                    tracing::debug!(dropped = src.len() - keep, "discarding bytes before sync");
                    src.advance(src.len() - keep);
                }
                return Ok(None);
            },
        };

        if start > 0 {
            tracing::debug!(dropped = start, "discarding bytes before sync");
            src.advance(start);
        }

        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let size = u16::from_be_bytes([src[4], src[5]]) as usize;

        if size < HEADER_SIZE {
            // Bogus size field: step past this sync series and resync.
            src.advance(SYNC.len());
            return Err(packet::Error::Malformed(format!("size field {size} below header size"))
                .into());
        }

        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        let frame: Bytes = src.split_to(size).freeze();

        let parsed = if self.digi {
            Packet::from_digi(frame)
        } else {
            Packet::from_wire(frame)
        };

        parsed.map(Some).map_err(Error::from)
    }
}

impl<T> Encoder<T> for PacketCodec
where
    T: AsRef<[u8]>,
{
    type Error = Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.as_ref());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    use packet::{
        PacketType,
        Timestamp,
    };

    use super::*;

    fn sample(payload: &[u8]) -> Packet {
        Packet::new(PacketType::DataFromInstrument, Timestamp::new(3_800_000_000, 0), payload)
            .unwrap()
    }

    #[tokio::test]
    async fn decode_single_frame() -> eyre::Result<()> {
        let pkt = sample(&[0x01, 0x02, 0x03]);

        let mut reader = FramedRead::new(pkt.as_bytes(), PacketCodec::strict());
        let decoded = reader.next().await.unwrap()?;

        assert_eq!(decoded, pkt);
        assert!(reader.next().await.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn decode_back_to_back_frames() -> eyre::Result<()> {
        let a = sample(b"one");
        let b = sample(b"two");

        let mut wire = a.as_bytes().to_vec();
        wire.extend_from_slice(b.as_bytes());

        let mut reader = FramedRead::new(&wire[..], PacketCodec::strict());

        assert_eq!(reader.next().await.unwrap()?, a);
        assert_eq!(reader.next().await.unwrap()?, b);
        assert!(reader.next().await.is_none());

        Ok(())
    }

    #[test]
    fn partial_frame_waits() {
        let pkt = sample(b"partial");
        let mut codec = PacketCodec::strict();

        let mut buf = BytesMut::from(&pkt.as_bytes()[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&pkt.as_bytes()[10..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), pkt);
    }

    #[test]
    fn resyncs_past_garbage() {
        let pkt = sample(b"data");
        let mut codec = PacketCodec::strict();

        let mut buf = BytesMut::from(&b"line noise\xa3"[..]);
        buf.extend_from_slice(pkt.as_bytes());

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), pkt);
        assert!(buf.is_empty());
    }

    #[test]
    fn corrupt_checksum_is_error_then_recovers() {
        let bad = {
            let mut raw = sample(b"aaaa").as_bytes().to_vec();
            *raw.last_mut().unwrap() ^= 0xff;
            raw
        };
        let good = sample(b"bbbb");

        let mut codec = PacketCodec::strict();
        let mut buf = BytesMut::from(&bad[..]);
        buf.extend_from_slice(good.as_bytes());

        assert!(codec.decode(&mut buf).is_err());
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), good);
    }

    #[test]
    fn digi_mode_classifies_rsn() {
        let pkt = sample(b"rsn payload");

        let mut codec = PacketCodec::digi();
        let mut buf = BytesMut::from(pkt.as_bytes());

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.packet_type(), PacketType::DataFromRsn);
        assert_eq!(decoded.as_bytes(), pkt.as_bytes());
    }

    #[test]
    fn encoder_appends_raw_frames() {
        let pkt = sample(b"x");

        let mut codec = PacketCodec::strict();
        let mut dst = BytesMut::new();

        codec.encode(&pkt, &mut dst).unwrap();
        codec.encode(&pkt, &mut dst).unwrap();

        assert_eq!(dst.len(), pkt.as_bytes().len() * 2);
    }
}
