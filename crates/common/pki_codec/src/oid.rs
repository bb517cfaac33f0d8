/// DER encoding of the secp256r1 (NIST P-256) curve OID, 1.2.840.10045.3.1.7, as stored in `CKA_EC_PARAMS`.
pub const SECP256R1_OID_DER: [u8; 10] = [0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];

/// DER encoding of the id-ecPublicKey algorithm OID, 1.2.840.10045.2.1.
pub const EC_PUBLIC_KEY_OID_DER: [u8; 9] = [0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01];

/// Dotted form of the secp256r1 OID, as printed by X.509 parsers.
pub const SECP256R1_OID: &str = "1.2.840.10045.3.1.7";
