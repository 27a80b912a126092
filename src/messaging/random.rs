use ring::rand::{SecureRandom, SystemRandom};

use super::error::ProtocolError;

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Cryptographically secure random bytes.
pub trait RandomSource: Send + Sync {
    fn fill(&self, dest: &mut [u8]) -> Result<(), ProtocolError>;

    fn bytes(&self, len: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut out = vec![0u8; len];
        self.fill(&mut out)?;
        Ok(out)
    }

    /// Random string over `[A-Za-z0-9]`.
    fn alphanumeric(&self, len: usize) -> Result<String, ProtocolError> {
        // 248 is the largest multiple of 62 below 256; higher bytes are redrawn.
        let mut out = String::with_capacity(len);
        let mut buf = [0u8; 32];
        while out.len() < len {
            self.fill(&mut buf)?;
            for byte in buf.iter().filter(|b| **b < 248) {
                if out.len() == len {
                    break;
                }
                out.push(ALPHANUMERIC[(*byte % 62) as usize] as char);
            }
        }
        Ok(out)
    }
}

/// Operating system randomness through `ring`.
#[derive(Debug)]
pub struct SystemRandomSource {
    rng: SystemRandom,
}

impl Default for SystemRandomSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemRandomSource {
    pub fn new() -> Self {
        Self { rng: SystemRandom::new() }
    }
}

impl RandomSource for SystemRandomSource {
    fn fill(&self, dest: &mut [u8]) -> Result<(), ProtocolError> {
        self.rng
            .fill(dest)
            .map_err(|_| ProtocolError::Host("system random source failed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alphanumeric_has_requested_length() {
        let rng: &dyn RandomSource = &SystemRandomSource::new();
        let s = rng.alphanumeric(40).unwrap();
        assert_eq!(s.len(), 40);
        assert!(s.bytes().all(|b| b.is_ascii_alphanumeric()));
    }
}
