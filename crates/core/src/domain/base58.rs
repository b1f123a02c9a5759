// Base58 codec for scope uids
//
// Only the digits are borrowed from Bitcoin's alphabet; this is a plain
// positional encoding of an integer, no checksums and no leading-zero bytes.

pub const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

const BASE: u64 = 58;

/// Encode an integer, most significant digit first
pub fn encode(mut num: u64) -> String {
    let alphabet = BASE58_ALPHABET.as_bytes();
    if num == 0 {
        return (alphabet[0] as char).to_string();
    }

    let mut digits = Vec::new();
    while num > 0 {
        digits.push(alphabet[(num % BASE) as usize]);
        num /= BASE;
    }
    digits.reverse();

    // Every byte comes from the ASCII alphabet above
    digits.into_iter().map(char::from).collect()
}

/// Decode a base58 string, `None` on foreign characters or overflow
pub fn decode(s: &str) -> Option<u64> {
    if s.is_empty() {
        return None;
    }

    s.chars().try_fold(0u64, |acc, c| {
        let digit = BASE58_ALPHABET.find(c)? as u64;
        acc.checked_mul(BASE)?.checked_add(digit)
    })
}

/// True if every character belongs to the alphabet
pub fn is_base58(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| BASE58_ALPHABET.contains(c))
}
