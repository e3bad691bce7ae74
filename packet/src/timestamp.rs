use std::{
    fmt,
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use packed_struct::prelude::*;

/// Seconds between the NTP epoch (1 Jan 1900) and the Unix epoch (1 Jan 1970).
pub const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// NTP-style timestamp: whole seconds since 1900 plus a binary fraction in
/// units of 1/2^32 s. Packs to 8 big-endian bytes, which is exactly how it
/// sits in the packet header.
#[derive(
    PackedStruct, Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "8", endian = "msb")]
pub struct Timestamp {
    #[packed_field(size_bytes = "4")]
    pub seconds:  u32,
    #[packed_field(size_bytes = "4")]
    pub fraction: u32,
}

impl Timestamp {
    pub fn new(seconds: u32, fraction: u32) -> Self {
        Self {
            seconds,
            fraction,
        }
    }

    pub fn now() -> Self {
        let since_unix =
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);

        Self::from_unix(since_unix)
    }

    /// Convert a duration since the Unix epoch.
    pub fn from_unix(d: Duration) -> Self {
        Self {
            seconds:  (d.as_secs() + NTP_UNIX_OFFSET) as u32,
            fraction: (((d.subsec_nanos() as u64) << 32) / 1_000_000_000) as u32,
        }
    }

    /// 64-bit fixed-point view (32.32), convenient for arithmetic.
    #[inline]
    pub fn as_fixed(&self) -> u64 {
        ((self.seconds as u64) << 32) | self.fraction as u64
    }

    /// Saturating difference between two timestamps.
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let diff = self.as_fixed().saturating_sub(earlier.as_fixed());

        let secs = diff >> 32;
        let nanos = ((diff & 0xffff_ffff) * 1_000_000_000) >> 32;

        Duration::new(secs, nanos as u32)
    }
}

impl fmt::Display for Timestamp {
    /// `seconds.frac`, the fraction scaled to four decimal digits. This is
    /// the `time` attribute format in the ascii packet projection.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:04}", self.seconds, (self.fraction as u64 * 10_000) >> 32)
    }
}

impl From<Timestamp> for chrono::DateTime<chrono::Utc> {
    fn from(ts: Timestamp) -> Self {
        let unix_secs = ts.seconds as i64 - NTP_UNIX_OFFSET as i64;
        let nanos = ((ts.fraction as u64 * 1_000_000_000) >> 32) as u32;

        chrono::DateTime::from_timestamp(unix_secs, nanos)
            .unwrap_or(chrono::DateTime::UNIX_EPOCH)
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn unix_offset() {
        let ts = Timestamp::from_unix(Duration::from_secs(0));
        assert_eq!(ts.seconds, NTP_UNIX_OFFSET as u32);
        assert_eq!(ts.fraction, 0);
    }

    #[test]
    fn half_second_fraction() {
        let ts = Timestamp::from_unix(Duration::from_millis(500));
        // 0.5 s is exactly 2^31 in 1/2^32 units, modulo integer division.
        assert!((ts.fraction as i64 - (1i64 << 31)).abs() <= 4);
    }

    #[test]
    fn display_format() {
        let ts = Timestamp::new(3_800_000_000, 0);
        assert_eq!(ts.to_string(), "3800000000.0000");

        let half = Timestamp::new(100, 1 << 31);
        assert_eq!(half.to_string(), "100.5000");
    }

    #[test]
    fn duration_since_spans_fraction_borrow() {
        let a = Timestamp::new(10, 3 << 30); // 10.75
        let b = Timestamp::new(12, 1 << 30); // 12.25
        let d = b.duration_since(a);

        assert_eq!(d.as_secs(), 1);
        assert!((d.subsec_millis() as i64 - 500).abs() <= 1);
    }

    #[test]
    fn duration_since_saturates() {
        let a = Timestamp::new(10, 0);
        let b = Timestamp::new(12, 0);
        assert_eq!(a.duration_since(b), Duration::ZERO);
    }

    proptest! {
        #[test]
        fn pack_unpack_equivalence(seconds in any::<u32>(), fraction in any::<u32>()) {
            let ts = Timestamp::new(seconds, fraction);
            let packed = ts.pack().unwrap();

            prop_assert_eq!(&packed[..4], &seconds.to_be_bytes()[..]);
            prop_assert_eq!(&packed[4..], &fraction.to_be_bytes()[..]);
            prop_assert_eq!(Timestamp::unpack(&packed).unwrap(), ts);
        }

        #[test]
        fn ordering_matches_fixed_point(a in any::<u64>(), b in any::<u64>()) {
            let ta = Timestamp::new((a >> 32) as u32, a as u32);
            let tb = Timestamp::new((b >> 32) as u32, b as u32);

            prop_assert_eq!(ta.cmp(&tb), ta.as_fixed().cmp(&tb.as_fixed()));
        }
    }
}
