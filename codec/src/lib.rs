pub use ::tokio_util::codec as tokio_codec;

mod framing;

pub use self::framing::*;
