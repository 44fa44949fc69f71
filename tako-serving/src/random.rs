//! Injected randomness for serial numbers and loopback tokens.
//!
//! Generation code takes a `&dyn RandomSource` instead of reaching for a
//! process-wide generator, so tests can pin the bytes they get.

/// Source of random bytes used during certificate generation.
pub trait RandomSource: Send + Sync {
    fn fill(&self, dest: &mut [u8]) -> Result<(), String>;
}

/// Operating system randomness.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill(&self, dest: &mut [u8]) -> Result<(), String> {
        getrandom::fill(dest).map_err(|e| format!("OS random source unavailable: {e}"))
    }
}

/// Fills every request with the same repeating byte pattern.
#[derive(Debug, Clone)]
pub struct FixedRandom {
    pattern: Vec<u8>,
}

impl FixedRandom {
    pub fn new(pattern: impl Into<Vec<u8>>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }
}

impl RandomSource for FixedRandom {
    fn fill(&self, dest: &mut [u8]) -> Result<(), String> {
        if self.pattern.is_empty() {
            return Err("fixed random pattern is empty".to_string());
        }
        for (slot, byte) in dest.iter_mut().zip(self.pattern.iter().cycle()) {
            *slot = *byte;
        }
        Ok(())
    }
}

/// Random token rendered as lowercase hex.
pub fn hex_token(rng: &dyn RandomSource, len: usize) -> Result<String, String> {
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf)?;
    Ok(hex::encode(buf))
}
