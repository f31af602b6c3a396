//! Program-text version digest exchanged during the handshake. Two peers
//! built from the same source agree; anything else is rejected before a
//! single frame is dispatched.
//!
//! The digest is computed by `build.rs` over every `.rs` file under `src/`
//! (sorted for determinism) and baked into the binary as a constant, so a
//! source change anywhere in the crate changes the digest, not just a bump
//! of the `Cargo.toml` version.

include!(concat!(env!("OUT_DIR"), "/program_digest.rs"));

/// Length in bytes of the digest this module produces.
pub const DIGEST_LEN: usize = PROGRAM_DIGEST.len();

/// Returns the build-time digest of this crate's source tree.
pub fn digest() -> &'static [u8; DIGEST_LEN] {
  &PROGRAM_DIGEST
}
