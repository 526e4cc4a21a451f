use sha1::{Digest, Sha1};

pub const SHA1_LEN: usize = 20;

pub fn sha1(data: &[u8]) -> [u8; SHA1_LEN] {
    let mut h = Sha1::new();
    h.update(data);
    let out = h.finalize();
    let mut arr = [0u8; SHA1_LEN];
    arr.copy_from_slice(&out);
    arr
}

/// Stretch a SHA-1 digest to `N` bytes by repeating it from the start.
///
/// The agreed-key and digest-block layouts both take the 20-byte digest
/// followed by its own leading bytes.
pub fn stretch_digest<const N: usize>(digest: &[u8; SHA1_LEN]) -> [u8; N] {
    let mut out = [0u8; N];
    for (i, b) in out.iter_mut().enumerate() {
        *b = digest[i % SHA1_LEN];
    }
    out
}
