//! Stream signature sniffing.

/// First two bytes of a bare codestream.
pub const CODESTREAM_MAGIC: [u8; 2] = [0xFF, 0x0A];

/// The complete 12-byte container signature box.
pub const CONTAINER_SIGNATURE: [u8; 12] = [
    0x00, 0x00, 0x00, 0x0C, b'J', b'X', b'L', b' ', 0x0D, 0x0A, 0x87, 0x0A,
];

/// Classification of a byte prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    /// The prefix is shorter than the minimum discriminating length.
    /// This is the only classification that can change with more bytes.
    NotEnoughBytes,
    /// The prefix matches no known stream form.
    Invalid,
    /// A bare codestream.
    Codestream,
    /// A boxed container.
    Container,
}

/// Classify a byte prefix. Pure and stateless; never guesses.
///
/// Once a prefix has been classified as anything other than
/// [`Signature::NotEnoughBytes`], growing it never changes the answer.
pub fn sniff(prefix: &[u8]) -> Signature {
    if prefix.is_empty() {
        return Signature::NotEnoughBytes;
    }
    match prefix[0] {
        0xFF => {
            if prefix.len() < 2 {
                Signature::NotEnoughBytes
            } else if prefix[1] == CODESTREAM_MAGIC[1] {
                Signature::Codestream
            } else {
                Signature::Invalid
            }
        }
        0x00 => {
            let n = prefix.len().min(CONTAINER_SIGNATURE.len());
            if prefix[..n] != CONTAINER_SIGNATURE[..n] {
                Signature::Invalid
            } else if prefix.len() >= CONTAINER_SIGNATURE.len() {
                Signature::Container
            } else {
                Signature::NotEnoughBytes
            }
        }
        _ => Signature::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_prefixes() {
        assert_eq!(sniff(&[]), Signature::NotEnoughBytes);
        assert_eq!(sniff(&[0xFF]), Signature::NotEnoughBytes);
        assert_eq!(sniff(&[0xFF, 0x0A]), Signature::Codestream);
        assert_eq!(sniff(&[0xFF, 0xD8]), Signature::Invalid);
        assert_eq!(sniff(&[0x89, b'P', b'N', b'G']), Signature::Invalid);
        assert_eq!(sniff(&CONTAINER_SIGNATURE), Signature::Container);
        assert_eq!(sniff(&CONTAINER_SIGNATURE[..7]), Signature::NotEnoughBytes);
        // Diverges from the container signature at byte 4
        assert_eq!(sniff(&[0x00, 0x00, 0x00, 0x0C, b'f']), Signature::Invalid);
    }

    #[test]
    fn growing_prefix_never_revokes_a_classification() {
        let mut stream = Vec::from(CONTAINER_SIGNATURE);
        stream.extend_from_slice(b"\x00\x00\x00\x14ftypjxl \x00\x00\x00\x00");
        let mut last = Signature::NotEnoughBytes;
        for len in 0..stream.len() {
            let got = sniff(&stream[..len]);
            if last != Signature::NotEnoughBytes {
                assert_eq!(got, last, "classification flipped at prefix length {len}");
            }
            last = got;
        }
        assert_eq!(last, Signature::Container);
    }
}
