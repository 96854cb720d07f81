//! RESP encoder and decoder.

mod decoder;
mod encoder;

pub use decoder::Decoder;
pub use encoder::Encoder;
pub(crate) use encoder::encoded_len;
