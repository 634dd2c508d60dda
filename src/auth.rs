use rand::RngCore;
use sha2::{Digest, Sha256};

const SCHEME: &str = "sha256";
const SALT_LEN: usize = 16;

/// Stored form: `sha256$<rounds>$<salt hex>$<digest hex>`.
pub fn hash_password(password: &str, rounds: u32) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let rounds = rounds.max(1);
    let digest = stretch(&salt, password, rounds);
    format!("{}${}${}${}", SCHEME, rounds, to_hex(&salt), to_hex(&digest))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let parts: Vec<&str> = stored.split('$').collect();
    if parts.len() != 4 || parts[0] != SCHEME {
        return false;
    }
    let Ok(rounds) = parts[1].parse::<u32>() else {
        return false;
    };
    if rounds == 0 {
        return false;
    }
    let Some(salt) = from_hex(parts[2]) else {
        return false;
    };
    let Some(expected) = from_hex(parts[3]) else {
        return false;
    };
    let actual = stretch(&salt, password, rounds);
    constant_time_eq(&actual, &expected)
}

fn stretch(salt: &[u8], password: &str, rounds: u32) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    let mut digest = hasher.finalize();
    for _ in 1..rounds {
        digest = Sha256::digest(digest);
    }
    digest.to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.is_empty() || s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}
