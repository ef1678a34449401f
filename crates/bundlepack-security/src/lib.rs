mod checksum;
mod ed25519;

pub use checksum::{
    sha256_digest_file, sha256_hex, verify_sha256, verify_sha256_file, verify_sha256_reader,
};
pub use ed25519::{verify_ed25519_signature_hex, verify_signature_with_trusted_keys};
