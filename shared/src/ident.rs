//! Random identifier generation for subdomain labels and request ids.

use rand::rngs::OsRng;
use rand::RngCore;

/// A fresh bare subdomain label: 8 lowercase hex characters from 4 bytes of
/// OS randomness. Collisions are possible; the registry checks availability.
pub fn subdomain_label() -> String {
    let mut bytes = [0u8; 4];
    OsRng.fill_bytes(&mut bytes);
    to_hex(&bytes)
}

/// A fresh request id: 16 lowercase hex characters from 8 bytes of OS
/// randomness. Wide enough that the pending table can treat a duplicate as
/// an insert error rather than a silent mis-delivery.
pub fn request_id() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    to_hex(&bytes)
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
