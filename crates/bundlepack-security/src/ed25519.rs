use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

pub fn verify_ed25519_signature_hex(
    payload: &[u8],
    public_key_hex: &str,
    signature_hex: &str,
) -> Result<bool> {
    let verifying_key = parse_verifying_key(public_key_hex)?;
    let signature = parse_signature(signature_hex)?;
    Ok(verifying_key.verify(payload, &signature).is_ok())
}

/// Checks `signature_hex` over `payload` against each trusted publisher key.
///
/// Returns `Ok(false)` when the signature is well formed but no trusted key
/// accepts it. An empty key list never verifies anything.
pub fn verify_signature_with_trusted_keys(
    payload: &[u8],
    signature_hex: &str,
    trusted_keys_hex: &[String],
) -> Result<bool> {
    let signature = parse_signature(signature_hex)?;
    for key_hex in trusted_keys_hex {
        let verifying_key = parse_verifying_key(key_hex)
            .with_context(|| format!("invalid trusted publisher key '{key_hex}'"))?;
        if verifying_key.verify(payload, &signature).is_ok() {
            return Ok(true);
        }
    }
    Ok(false)
}

fn parse_verifying_key(public_key_hex: &str) -> Result<VerifyingKey> {
    let public_key_bytes =
        hex::decode(public_key_hex.trim()).context("failed to decode Ed25519 public key hex")?;
    let public_key_len = public_key_bytes.len();
    let public_key_array: [u8; 32] = public_key_bytes.try_into().map_err(|_| {
        anyhow!("invalid Ed25519 public key length: expected 32 bytes, got {public_key_len}")
    })?;
    VerifyingKey::from_bytes(&public_key_array).context("invalid Ed25519 public key bytes")
}

fn parse_signature(signature_hex: &str) -> Result<Signature> {
    let signature_bytes =
        hex::decode(signature_hex.trim()).context("failed to decode Ed25519 signature hex")?;
    let signature_len = signature_bytes.len();
    let signature_array: [u8; 64] = signature_bytes.try_into().map_err(|_| {
        anyhow!("invalid Ed25519 signature length: expected 64 bytes, got {signature_len}")
    })?;
    Ok(Signature::from_bytes(&signature_array))
}
