pub mod envelope;
pub mod error;

pub use envelope::{decode, encode, DecodedEnvelope, Envelope, WrapperMetadata, SPEC_VERSION};
pub use error::CodecError;
