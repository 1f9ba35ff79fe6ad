//! Chain specification and hardfork activation logic.
//!
//! The recovery stage only needs to know which protocol rules were live at a
//! given height, so the schedule is a sorted array of block-number
//! activations resolved with a binary search per block.

use alloy_genesis::Genesis;
use alloy_hardforks::EthereumHardfork;
use alloy_primitives::BlockNumber;

/// Fork schedule of the chain the node follows.
///
/// The schedule lists every activated fork with its activation block, in
/// activation order. Timestamp-scheduled forks carry no entry and are treated
/// as inactive; chains that need them (for blob or set-code transactions)
/// must configure explicit activation blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSpec {
    /// EIP-155 chain identifier
    pub chain_id: u64,
    /// `(activation_block, fork)` entries sorted by activation block
    fork_blocks: Vec<(BlockNumber, EthereumHardfork)>,
}

/// Protocol-rule flags active at one block height, as consumed by
/// transaction validation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForkRules {
    /// EIP-2 signature malleability bound applies
    pub homestead: bool,
    /// EIP-155 replay-protected signatures are allowed
    pub spurious_dragon: bool,
    /// EIP-2930 access-list transactions are allowed
    pub berlin: bool,
    /// EIP-1559 dynamic-fee transactions are allowed
    pub london: bool,
    /// EIP-4844 blob transactions are allowed
    pub cancun: bool,
    /// EIP-7702 set-code transactions are allowed
    pub prague: bool,
}

impl ChainSpec {
    /// Build a spec from an unsorted fork list.
    pub fn new(
        chain_id: u64,
        forks: impl IntoIterator<Item = (EthereumHardfork, BlockNumber)>,
    ) -> Self {
        let mut fork_blocks: Vec<(BlockNumber, EthereumHardfork)> =
            forks.into_iter().map(|(fork, block)| (block, fork)).collect();
        fork_blocks.sort_by_key(|(block, _)| *block);
        Self {
            chain_id,
            fork_blocks,
        }
    }

    /// Ethereum mainnet activation history.
    pub fn mainnet() -> Self {
        use EthereumHardfork::*;
        Self::new(
            1,
            [
                (Frontier, 0),
                (Homestead, 1_150_000),
                (Dao, 1_920_000),
                (Tangerine, 2_463_000),
                (SpuriousDragon, 2_675_000),
                (Byzantium, 4_370_000),
                (Constantinople, 7_280_000),
                (Petersburg, 7_280_000),
                (Istanbul, 9_069_000),
                (MuirGlacier, 9_200_000),
                (Berlin, 12_244_000),
                (London, 12_965_000),
                (ArrowGlacier, 13_773_000),
                (GrayGlacier, 15_050_000),
                (Paris, 15_537_394),
            ],
        )
    }

    /// Sepolia testnet activation history.
    pub fn sepolia() -> Self {
        use EthereumHardfork::*;
        Self::new(
            11_155_111,
            [
                (Frontier, 0),
                (Homestead, 0),
                (Tangerine, 0),
                (SpuriousDragon, 0),
                (Byzantium, 0),
                (Constantinople, 0),
                (Petersburg, 0),
                (Istanbul, 0),
                (MuirGlacier, 0),
                (Berlin, 0),
                (London, 0),
                (Paris, 1_735_371),
            ],
        )
    }

    /// Look up a known chain by its configuration name.
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "mainnet" => Some(Self::mainnet()),
            "sepolia" => Some(Self::sepolia()),
            _ => None,
        }
    }

    /// Build a spec from a genesis file's chain config.
    ///
    /// Only block-number scheduled forks are mapped; the time-scheduled
    /// fields of the config are ignored.
    pub fn from_genesis(genesis: &Genesis) -> Self {
        use EthereumHardfork::*;
        let config = &genesis.config;
        let schedule = [
            (Homestead, config.homestead_block),
            (Dao, config.dao_fork_block),
            (Tangerine, config.eip150_block),
            (SpuriousDragon, config.eip155_block),
            (Byzantium, config.byzantium_block),
            (Constantinople, config.constantinople_block),
            (Petersburg, config.petersburg_block),
            (Istanbul, config.istanbul_block),
            (MuirGlacier, config.muir_glacier_block),
            (Berlin, config.berlin_block),
            (London, config.london_block),
            (ArrowGlacier, config.arrow_glacier_block),
            (GrayGlacier, config.gray_glacier_block),
            (Paris, config.merge_netsplit_block),
        ];
        Self::new(
            config.chain_id,
            schedule
                .into_iter()
                .filter_map(|(fork, block)| block.map(|block| (fork, block))),
        )
    }

    /// Activation block of a fork, if the chain schedules it.
    pub fn activation_block(&self, fork: EthereumHardfork) -> Option<BlockNumber> {
        self.fork_blocks
            .iter()
            .find(|(_, scheduled)| *scheduled == fork)
            .map(|(block, _)| *block)
    }

    /// Latest fork active at the given height, for display purposes.
    pub fn revision(&self, block_num: BlockNumber) -> EthereumHardfork {
        match self.active_prefix(block_num) {
            [] => EthereumHardfork::Frontier,
            active => active[active.len() - 1].1,
        }
    }

    /// Resolve the protocol-rule flags live at the given height.
    pub fn rules_at(&self, block_num: BlockNumber) -> ForkRules {
        use EthereumHardfork::*;
        let mut rules = ForkRules::default();
        for (_, fork) in self.active_prefix(block_num) {
            match fork {
                Homestead => rules.homestead = true,
                SpuriousDragon => rules.spurious_dragon = true,
                Berlin => rules.berlin = true,
                London => rules.london = true,
                Cancun => rules.cancun = true,
                Prague => rules.prague = true,
                _ => {}
            }
        }
        rules
    }

    fn active_prefix(&self, block_num: BlockNumber) -> &[(BlockNumber, EthereumHardfork)] {
        let active = self
            .fork_blocks
            .partition_point(|(block, _)| *block <= block_num);
        &self.fork_blocks[..active]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_activation_boundaries() {
        let spec = ChainSpec::mainnet();

        assert!(!spec.rules_at(1_149_999).homestead);
        assert!(spec.rules_at(1_150_000).homestead);

        assert!(!spec.rules_at(2_674_999).spurious_dragon);
        assert!(spec.rules_at(2_675_000).spurious_dragon);

        assert!(!spec.rules_at(12_243_999).berlin);
        assert!(spec.rules_at(12_244_000).berlin);

        assert!(!spec.rules_at(12_964_999).london);
        assert!(spec.rules_at(12_965_000).london);
    }

    #[test]
    fn revision_reports_latest_active_fork() {
        let spec = ChainSpec::mainnet();
        assert_eq!(spec.revision(0), EthereumHardfork::Frontier);
        assert_eq!(spec.revision(46_147), EthereumHardfork::Frontier);
        assert_eq!(spec.revision(12_244_000), EthereumHardfork::Berlin);
        assert_eq!(spec.revision(20_000_000), EthereumHardfork::Paris);
    }

    #[test]
    fn unscheduled_forks_stay_inactive() {
        let spec = ChainSpec::new(
            1337,
            [
                (EthereumHardfork::Homestead, 0),
                (EthereumHardfork::SpuriousDragon, 0),
            ],
        );
        let rules = spec.rules_at(1_000_000);
        assert!(rules.homestead && rules.spurious_dragon);
        assert!(!rules.berlin && !rules.london && !rules.cancun && !rules.prague);
        assert_eq!(spec.activation_block(EthereumHardfork::London), None);
    }

    #[test]
    fn genesis_config_maps_block_forks() {
        let genesis: Genesis = serde_json::from_str(
            r#"{
                "config": {
                    "chainId": 1337,
                    "homesteadBlock": 10,
                    "eip150Block": 10,
                    "eip155Block": 20,
                    "eip158Block": 20,
                    "byzantiumBlock": 30,
                    "berlinBlock": 40,
                    "londonBlock": 50
                },
                "difficulty": "0x1",
                "gasLimit": "0x1c9c380",
                "alloc": {}
            }"#,
        )
        .unwrap();

        let spec = ChainSpec::from_genesis(&genesis);
        assert_eq!(spec.chain_id, 1337);
        assert_eq!(spec.activation_block(EthereumHardfork::Berlin), Some(40));
        assert!(!spec.rules_at(49).london);
        assert!(spec.rules_at(50).london);
    }
}
