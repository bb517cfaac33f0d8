use asn1_rs::Any;
use asn1_rs::FromDer as _;
use asn1_rs::Tag;

/// First byte of any PEM document (`-----BEGIN ...`).
pub const PEM_MARKER: u8 = b'-';

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Input is not PEM encoded: it must start with '-----BEGIN'")]
    MalformedInput,

    #[error("Failed to convert PEM to DER: {0}")]
    ConversionFailed(String),
}

/// Converts a PEM document into the DER bytes it wraps.
///
/// The input must start with the PEM marker byte. Trailing NUL bytes, as left by C string constants, are
/// ignored. The DER buffer is allocated with the capacity of the PEM input, which always suffices since
/// base64 only ever grows the payload.
///
/// The decoded payload must be exactly one DER SEQUENCE, which is true for certificates and every key format
/// we provision.
pub fn pem_to_der(input: &[u8]) -> Result<Vec<u8>, CodecError> {
    let input = trim_trailing_nul(input);
    if input.first() != Some(&PEM_MARKER) {
        return Err(CodecError::MalformedInput);
    }

    let pem = ::pem::parse(input).map_err(|err| CodecError::ConversionFailed(err.to_string()))?;

    let mut der = Vec::with_capacity(input.len());
    der.extend_from_slice(pem.contents());
    check_der_sequence(&der)?;

    Ok(der)
}

/// Returns `input` without the NUL bytes that terminate it, if any.
pub fn trim_trailing_nul(input: &[u8]) -> &[u8] {
    let end = input
        .iter()
        .rposition(|byte| *byte != 0)
        .map_or(0, |last| last + 1);
    &input[..end]
}

fn check_der_sequence(der: &[u8]) -> Result<(), CodecError> {
    let (rest, any) = Any::from_der(der)
        .map_err(|err| CodecError::ConversionFailed(format!("invalid DER payload: {err}")))?;

    if any.tag() != Tag::Sequence {
        return Err(CodecError::ConversionFailed(format!(
            "DER payload is a {:?} instead of a SEQUENCE",
            any.tag()
        )));
    }
    if !rest.is_empty() {
        return Err(CodecError::ConversionFailed(format!(
            "{} unexpected bytes after the DER SEQUENCE",
            rest.len()
        )));
    }

    Ok(())
}
