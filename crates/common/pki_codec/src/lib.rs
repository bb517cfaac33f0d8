//! Encodings needed to turn raw key and certificate bytes into PKCS #11 token objects.
//!
//! Nothing in this crate talks to a token. It converts PEM documents to DER, normalizes big-endian integers
//! exported with an ASN.1 sign pad, re-encodes raw ECDSA signatures, and assembles the SubjectPublicKeyInfo of
//! P-256 public keys held by a token.

pub mod der;
pub mod integer;
pub mod oid;
pub mod pem_codec;
pub mod signature;
pub mod spki;

pub use integer::normalize_unsigned;
pub use integer::sign_padded;
pub use integer::strip_sign_pad;
pub use integer::IntegerError;
pub use pem_codec::pem_to_der;
pub use pem_codec::CodecError;
pub use signature::decode_ecdsa_signature;
pub use signature::reencode_ecdsa_signature;
pub use signature::EncodeError;
pub use spki::SpkiError;
