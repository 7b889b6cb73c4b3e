pub mod codec;
pub mod envelope;

pub use codec::{decode, encode, encode_into, CodecError, FrameCodec};
pub use envelope::{Envelope, MsgType};
