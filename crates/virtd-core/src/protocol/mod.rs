//! Wire protocol: framing, primitive codec, typed parameters and the
//! argument records of every remote procedure.

pub mod codec;
pub mod events;
pub mod limits;
pub mod messages;
pub mod remote;
pub mod sequence;
pub mod typed_param;

pub use codec::{decode_frame, encode_frame, from_bytes, to_bytes, CodecError, WireDecode, WireEncode};
pub use messages::*;
pub use sequence::CallbackIdCounter;
pub use typed_param::TypedParamList;
