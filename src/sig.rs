//! The 16-bit running signature shared by the serial packet protocol
//! and the proxy tunnel.
//!
//! The signature is seeded with `0xAAAA` and folded over every byte of
//! the body. A two-byte nullifier can be derived for any signature value
//! such that feeding the nullifier through the algorithm drives the
//! running signature to zero; serial frames end with that nullifier so a
//! receiver only has to check for a zero result.

/// Default signature seed.
pub const SIG_SEED: u16 = 0xAAAA;

/// Folds `buf` into a running signature starting from `seed`.
#[must_use]
pub fn sig_for(buf: &[u8], seed: u16) -> u16 {
    let mut sig = seed;
    for &byte in buf {
        let prev = sig;
        let mut rot = (sig << 1) & 0x01FF;
        if rot >= 0x0100 {
            rot += 1;
        }
        sig = ((rot.wrapping_add(prev >> 8).wrapping_add(u16::from(byte))) & 0x00FF) | (prev << 8);
    }
    sig
}

/// Folds `buf` into a signature starting from the default seed.
#[must_use]
pub fn sig(buf: &[u8]) -> u16 {
    sig_for(buf, SIG_SEED)
}

/// Derives the two bytes that drive `sig` to zero when appended to the
/// signed body. The first byte zeroes the low half, the second zeroes
/// what remains.
#[must_use]
pub fn sig_nullifier(sig: u16) -> [u8; 2] {
    let first = null_byte(sig);
    let mid = sig_for(&[first], sig);
    let second = null_byte(mid);
    [first, second]
}

fn null_byte(sig: u16) -> u8 {
    let mut rot = (sig << 1) & 0x01FF;
    if rot >= 0x0100 {
        rot += 1;
    }
    0x0100u16.wrapping_sub(rot.wrapping_add(sig >> 8)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_body_keeps_seed() {
        assert_eq!(sig(&[]), SIG_SEED);
    }

    #[test]
    fn signature_is_order_sensitive() {
        assert_ne!(sig(b"ab"), sig(b"ba"));
    }

    #[test]
    fn nullifier_zeroes_known_bodies() {
        for body in [&b""[..], b"\x00", b"hello world", b"\xbd\xbc\xff\x00\x01"] {
            let body_sig = sig(body);
            let null = sig_nullifier(body_sig);
            assert_eq!(sig_for(&null, body_sig), 0, "body {body:02x?}");
        }
    }

    #[test]
    fn incremental_matches_whole() {
        let body = b"0123456789abcdef";
        let split = sig_for(&body[8..], sig(&body[..8]));
        assert_eq!(split, sig(body));
    }

    proptest! {
        #[test]
        fn nullifier_always_zeroes(body in proptest::collection::vec(any::<u8>(), 0..256)) {
            let body_sig = sig(&body);
            let null = sig_nullifier(body_sig);
            let mut framed = body.clone();
            framed.extend_from_slice(&null);
            prop_assert_eq!(sig(&framed), 0);
        }
    }
}
