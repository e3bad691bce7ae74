use packed_struct::prelude::*;

use crate::{
    SyncMarker,
    Timestamp,
};

lazy_static::lazy_static! {
    pub static ref SIZE_BYTES: usize = {
        use packed_struct::PackedStructInfo;

        let bit_size = Header::packed_bits();

        debug_assert_eq!(bit_size % 8, 0);
        bit_size / 8
    };
}

/// The 16-byte packet header, big-endian on the wire.
///
/// | offset | width | field |
/// |--------|-------|-------------|
/// | 0      | 3     | sync        |
/// | 3      | 1     | packet type |
/// | 4      | 2     | packet size (total bytes, header included) |
/// | 6      | 2     | checksum    |
/// | 8      | 8     | timestamp   |
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PackedStruct)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "16", endian = "msb")]
pub struct Header {
    #[packed_field(size_bytes = "3")]
    pub sync:        SyncMarker,
    #[packed_field(size_bytes = "1", ty = "enum")]
    pub packet_type: PacketType,
    #[packed_field(size_bytes = "2")]
    pub packet_size: u16,
    #[packed_field(size_bytes = "2")]
    pub checksum:    u16,
    #[packed_field(size_bytes = "8")]
    pub timestamp:   Timestamp,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PrimitiveEnum_u8)]
#[repr(u8)]
pub enum PacketType {
    Unknown            = 0,
    DataFromInstrument = 1,
    DataFromDriver     = 2,
    PortAgentCommand   = 3,
    PortAgentStatus    = 4,
    PortAgentFault     = 5,
    InstrumentCommand  = 6,
    PortAgentHeartbeat = 7,
    DataFromRsn        = 8,
}

impl PacketType {
    /// Protocol-facing name, used in the ascii packet projection.
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketType::Unknown => "UNKNOWN",
            PacketType::DataFromInstrument => "DATA_FROM_INSTRUMENT",
            PacketType::DataFromDriver => "DATA_FROM_DRIVER",
            PacketType::PortAgentCommand => "PORT_AGENT_COMMAND",
            PacketType::PortAgentStatus => "PORT_AGENT_STATUS",
            PacketType::PortAgentFault => "PORT_AGENT_FAULT",
            PacketType::InstrumentCommand => "INSTRUMENT_COMMAND",
            PacketType::PortAgentHeartbeat => "PORT_AGENT_HEARTBEAT",
            PacketType::DataFromRsn => "DATA_FROM_RSN",
        }
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn packed_size() {
        assert_eq!(*SIZE_BYTES, 16);
    }

    #[test]
    fn field_offsets() {
        let header = Header {
            sync:        SyncMarker,
            packet_type: PacketType::DataFromInstrument,
            packet_size: 0x1234,
            checksum:    0xbeef,
            timestamp:   Timestamp::new(0xdead_cafe, 0x0102_0304),
        };

        let packed = header.pack().unwrap();

        assert_eq!(&packed[0..3], &[0xa3, 0x9d, 0x7a]);
        assert_eq!(packed[3], 1);
        assert_eq!(&packed[4..6], &[0x12, 0x34]);
        assert_eq!(&packed[6..8], &[0xbe, 0xef]);
        assert_eq!(&packed[8..12], &[0xde, 0xad, 0xca, 0xfe]);
        assert_eq!(&packed[12..16], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn bad_sync_rejected() {
        let header = Header {
            sync:        SyncMarker,
            packet_type: PacketType::PortAgentHeartbeat,
            packet_size: 16,
            checksum:    0,
            timestamp:   Timestamp::default(),
        };

        let mut packed = header.pack().unwrap();
        packed[0] ^= 0x01;

        assert!(Header::unpack(&packed).is_err());
    }

    #[test]
    fn bad_type_rejected() {
        let header = Header {
            sync:        SyncMarker,
            packet_type: PacketType::DataFromRsn,
            packet_size: 16,
            checksum:    0,
            timestamp:   Timestamp::default(),
        };

        let mut packed = header.pack().unwrap();
        packed[3] = 0x2a;

        assert!(Header::unpack(&packed).is_err());
    }

    proptest! {
        #[test]
        fn pack_unpack_equivalence(header in header_strategy()) {
            let packed = header.pack().unwrap();
            let unpacked = Header::unpack(&packed).unwrap();

            prop_assert_eq!(header, unpacked);
        }

        #[test]
        fn size_field_is_big_endian(size in any::<u16>()) {
            let header = Header {
                sync: SyncMarker,
                packet_type: PacketType::DataFromInstrument,
                packet_size: size,
                checksum: 0,
                timestamp: Timestamp::default(),
            };

            let packed = header.pack().unwrap();
            prop_assert_eq!(u16::from_be_bytes([packed[4], packed[5]]), size);
        }
    }

    prop_compose! {
        fn header_strategy()(
            ty in type_strategy(),
            packet_size in any::<u16>(),
            checksum in any::<u16>(),
            seconds in any::<u32>(),
            fraction in any::<u32>(),
        ) -> Header {
            Header {
                sync: SyncMarker,
                packet_type: ty,
                packet_size,
                checksum,
                timestamp: Timestamp::new(seconds, fraction),
            }
        }
    }

    fn type_strategy() -> impl Strategy<Value = PacketType> {
        prop_oneof![
            Just(PacketType::Unknown),
            Just(PacketType::DataFromInstrument),
            Just(PacketType::DataFromDriver),
            Just(PacketType::PortAgentCommand),
            Just(PacketType::PortAgentStatus),
            Just(PacketType::PortAgentFault),
            Just(PacketType::InstrumentCommand),
            Just(PacketType::PortAgentHeartbeat),
            Just(PacketType::DataFromRsn),
        ]
    }
}
