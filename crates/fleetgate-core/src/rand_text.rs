use rand::Rng;

/// Base32 alphabet used for generated secrets (tokens, sessions, salts).
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Returns a random text string of `len` characters drawn from a base32
/// alphabet. 26 characters carry 130 bits of entropy, which is what token
/// and session identifiers use.
#[must_use]
pub fn random_text(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_requested_length() {
        assert_eq!(random_text(26).len(), 26);
        assert_eq!(random_text(10).len(), 10);
    }

    #[test]
    fn output_is_alphabet_only() {
        let text = random_text(64);
        assert!(text.chars().all(|c| ALPHABET.contains(&(c as u8))));
    }

    #[test]
    fn consecutive_values_differ() {
        assert_ne!(random_text(26), random_text(26));
    }
}
