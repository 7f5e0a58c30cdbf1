//! Transport configuration.

use std::sync::Arc;

use anyhow::bail;

use crate::crypto::{Aes128BlockCrypt, BlockCrypt};

/// Configuration shared by sessions and listeners.
///
/// The default configuration runs without forward error correction and without
/// encryption - both are opt-in because they trade bandwidth respectively CPU for
/// resilience, and the right trade-off depends on the link.
#[derive(Clone, Debug, Default)]
pub struct BraidConfig {
    /// Number of data shards per FEC group. A group of `data_shards` outbound
    ///  packets is followed by `parity_shards` parity packets, allowing the receiver
    ///  to reconstruct any `data_shards` of the group. Zero disables FEC.
    pub data_shards: usize,

    /// Number of parity shards per FEC group. Zero disables FEC.
    pub parity_shards: usize,

    /// Symmetric key for packet encryption. `None` sends packets in the clear,
    ///  without the 20-byte nonce/checksum prefix.
    pub key: Option<[u8; 16]>,
}

impl BraidConfig {
    pub fn with_fec(mut self, data_shards: usize, parity_shards: usize) -> BraidConfig {
        self.data_shards = data_shards;
        self.parity_shards = parity_shards;
        self
    }

    pub fn with_encryption(mut self, key: [u8; 16]) -> BraidConfig {
        self.key = Some(key);
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if (self.data_shards == 0) != (self.parity_shards == 0) {
            bail!("forward error correction needs both data and parity shard counts, or neither");
        }
        if self.data_shards + self.parity_shards > 256 {
            bail!("shard group exceeds the field size of the erasure code");
        }
        Ok(())
    }

    pub(crate) fn fec_enabled(&self) -> bool {
        self.data_shards > 0 && self.parity_shards > 0
    }

    pub(crate) fn block(&self) -> Option<Arc<dyn BlockCrypt>> {
        self.key
            .as_ref()
            .map(|key| Arc::new(Aes128BlockCrypt::new(key)) as Arc<dyn BlockCrypt>)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::default(BraidConfig::default(), true)]
    #[case::fec(BraidConfig::default().with_fec(10, 3), true)]
    #[case::encrypted(BraidConfig::default().with_encryption([1; 16]), true)]
    #[case::data_without_parity(BraidConfig::default().with_fec(10, 0), false)]
    #[case::parity_without_data(BraidConfig::default().with_fec(0, 3), false)]
    #[case::oversized_group(BraidConfig::default().with_fec(200, 100), false)]
    fn test_validate(#[case] config: BraidConfig, #[case] valid: bool) {
        assert_eq!(config.validate().is_ok(), valid);
    }

    #[test]
    fn test_fec_enabled() {
        assert!(!BraidConfig::default().fec_enabled());
        assert!(BraidConfig::default().with_fec(10, 3).fec_enabled());
    }
}
