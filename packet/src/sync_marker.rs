use packed_struct::{
    prelude::*,
    PackedStructInfo,
    PackingResult,
};

/// The three sync bytes that open every packet header.
pub const SYNC: [u8; 3] = [0xa3, 0x9d, 0x7a];

/// Zero-sized marker for the sync series. Packs to the constant bytes and
/// refuses to unpack from anything else, so header validation falls out of
/// the normal unpack path.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SyncMarker;

impl SyncMarker {
    pub const INSTANCE: Self = Self;
}

impl PackedStruct for SyncMarker {
    type ByteArray = [u8; 3];

    #[inline]
    fn pack(&self) -> PackingResult<Self::ByteArray> {
        Ok(SYNC)
    }

    fn unpack(src: &Self::ByteArray) -> PackingResult<Self> {
        if src == &SYNC {
            Ok(Self)
        } else {
            tracing::debug!(got = %hex::encode(src), "invalid sync series");
            Err(PackingError::InvalidValue)
        }
    }
}

impl PackedStructInfo for SyncMarker {
    #[inline]
    fn packed_bits() -> usize {
        SYNC.len() * 8
    }
}
