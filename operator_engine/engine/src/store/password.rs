use rand::Rng;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

pub const PASSWORD_LENGTH: usize = 20;
pub const SPECIAL_CHARS: &str = "!@#$%^&*()_";

fn alphabet() -> Vec<u8> {
    let mut chars: Vec<u8> = (b'a'..=b'z').chain(b'A'..=b'Z').chain(b'0'..=b'9').collect();
    chars.extend_from_slice(SPECIAL_CHARS.as_bytes());
    chars
}

/// Random keystore password with at least one lowercase, uppercase, digit and special character.
pub fn generate_password() -> Zeroizing<String> {
    let alphabet = alphabet();
    let mut rng = OsRng;
    loop {
        let candidate: Zeroizing<String> = Zeroizing::new(
            (0..PASSWORD_LENGTH)
                .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
                .collect(),
        );
        if is_strong(&candidate) {
            return candidate;
        }
    }
}

fn is_strong(password: &str) -> bool {
    password.chars().any(|c| c.is_ascii_lowercase())
        && password.chars().any(|c| c.is_ascii_uppercase())
        && password.chars().any(|c| c.is_ascii_digit())
        && password.chars().any(|c| SPECIAL_CHARS.contains(c))
}
