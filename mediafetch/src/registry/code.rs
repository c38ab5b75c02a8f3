//! Pairing code generation.

/// Uppercase letters and digits without `0 O 1 I`.
pub const CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Random code of `length` characters from [`CODE_ALPHABET`].
///
/// The alphabet has 32 symbols, so taking a `u32` modulo its size is unbiased.
pub fn generate_code(length: usize) -> String {
    (0..length)
        .map(|_| {
            let idx = (rand::random::<u32>() % CODE_ALPHABET.len() as u32) as usize;
            CODE_ALPHABET[idx] as char
        })
        .collect()
}

/// Canonical form of a code typed by a person: trimmed, uppercase, without
/// spaces or dashes.
pub fn normalize_code(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .flat_map(char::to_uppercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_alphabet_excludes_ambiguous_characters() {
        for c in [b'0', b'O', b'1', b'I'] {
            assert!(!CODE_ALPHABET.contains(&c));
        }
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code(" ab12-cd "), "AB12CD");
        assert_eq!(normalize_code("XY Z9"), "XYZ9");
    }

    proptest! {
        #[test]
        fn prop_generated_codes_use_alphabet(length in 1usize..32) {
            let code = generate_code(length);
            prop_assert_eq!(code.len(), length);
            prop_assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
        }
    }
}
