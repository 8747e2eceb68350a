use steward_core::domain::message::Message;

/// Estimates the token footprint of a message buffer.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, messages: &[Message]) -> usize;
}

/// Character-count proxy: one token per `chars_per_token` characters.
#[derive(Clone, Copy, Debug)]
pub struct CharRatioEstimator {
    chars_per_token: usize,
}

impl CharRatioEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self { chars_per_token: chars_per_token.max(1) }
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(3)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, messages: &[Message]) -> usize {
        let chars: usize = messages.iter().map(|message| message.content.chars().count()).sum();
        chars / self.chars_per_token
    }
}

#[cfg(test)]
mod tests {
    use steward_core::domain::message::Message;

    use super::{CharRatioEstimator, TokenEstimator};

    #[test]
    fn counts_characters_not_bytes() {
        let estimator = CharRatioEstimator::default();
        let messages = vec![Message::user("订单状态查询"), Message::assistant("abc")];

        assert_eq!(estimator.estimate(&messages), 3);
    }

    #[test]
    fn zero_ratio_is_clamped() {
        let estimator = CharRatioEstimator::new(0);
        assert_eq!(estimator.estimate(&[Message::user("abcd")]), 4);
    }
}
