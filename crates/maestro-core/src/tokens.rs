use serde::{Deserialize, Serialize};

/// Token usage reported by the backend for one run (or one step of a run).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self { input_tokens, output_tokens }
    }

    /// Fold another step's usage into this accumulator.
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_sums() {
        let mut total = TokenUsage::default();
        total.accumulate(&TokenUsage::new(100, 50));
        total.accumulate(&TokenUsage::new(20, 5));
        assert_eq!(total, TokenUsage::new(120, 55));
    }

    #[test]
    fn empty_detection() {
        assert!(TokenUsage::default().is_empty());
        assert!(!TokenUsage::new(1, 0).is_empty());
    }

    #[test]
    fn serde_roundtrip() {
        let usage = TokenUsage::new(1234, 567);
        let json = serde_json::to_string(&usage).unwrap();
        let parsed: TokenUsage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, usage);
    }
}
