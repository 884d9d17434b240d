// Program configuration account
use arrayref::{array_mut_ref, array_ref, array_refs, mut_array_refs};
use borsh::{BorshDeserialize, BorshSerialize};
use solana_program::{
    program_error::ProgramError,
    program_pack::{IsInitialized, Pack, Sealed},
    pubkey::Pubkey,
};
use std::convert::TryFrom;

use crate::{
    error::SettlementError,
    ledger::BASIS_POINTS,
    price::StalePricePolicy,
    tier::{DEFAULT_TIER_WEIGHTS, TIER_COUNT},
};

pub const DEFAULT_MAX_PRICE_AGE: i64 = 3_600;
/// Three days
pub const DEFAULT_CLAIM_WINDOW: i64 = 3 * 86_400;
pub const DEFAULT_OPERATOR_BPS: u16 = 4_000;
pub const DEFAULT_OPERATIONS_BPS: u16 = 2_000;
pub const DEFAULT_POOL_BPS: u16 = 3_000;
/// $1.00 with 6 decimals
pub const DEFAULT_TICKET_PRICE_USD: u64 = 1_000_000;

/// Settings supplied to `InitializeConfig`. Wallets and authorities come in
/// as accounts, not here.
#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq)]
pub struct ConfigParams {
    /// Ticket price in USD with 6 decimals
    pub ticket_price_usd: u64,
    pub max_price_age: i64,
    /// 0 = reject stale prices, 1 = warn and proceed
    pub stale_price_policy: u8,
    /// Highest compute-unit price a ticket purchase may carry, 0 for no limit
    pub max_compute_unit_price: u64,
    pub claim_window: i64,
    pub operator_bps: u16,
    pub operations_bps: u16,
    pub pool_bps: u16,
    pub tier_weights: [u64; TIER_COUNT],
}

impl Default for ConfigParams {
    fn default() -> Self {
        Self {
            ticket_price_usd: DEFAULT_TICKET_PRICE_USD,
            max_price_age: DEFAULT_MAX_PRICE_AGE,
            stale_price_policy: StalePricePolicy::Reject.into(),
            max_compute_unit_price: 0,
            claim_window: DEFAULT_CLAIM_WINDOW,
            operator_bps: DEFAULT_OPERATOR_BPS,
            operations_bps: DEFAULT_OPERATIONS_BPS,
            pool_bps: DEFAULT_POOL_BPS,
            tier_weights: DEFAULT_TIER_WEIGHTS,
        }
    }
}

/// Program configuration account
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    pub is_initialized: bool,
    pub bump: u8,
    /// Admin authority that can update config
    pub admin: Pubkey,
    /// Receives the operator share of revenue immediately
    pub operator_wallet: Pubkey,
    /// Receives the operations share of revenue immediately
    pub operations_wallet: Pubkey,
    /// Destination of treasury withdrawals
    pub treasury_wallet: Pubkey,
    /// Destination of emergency sweeps and raffle surplus
    pub recovery_wallet: Pubkey,
    /// Only signer accepted for randomness fulfillment
    pub randomness_authority: Pubkey,
    pub price_feed: Pubkey,
    pub ticket_price_usd: u64,
    pub max_price_age: i64,
    pub stale_price_policy: StalePricePolicy,
    pub max_compute_unit_price: u64,
    pub claim_window: i64,
    pub operator_bps: u16,
    pub operations_bps: u16,
    pub pool_bps: u16,
    pub tier_weights: [u64; TIER_COUNT],
    /// Counter for sequential raffle IDs
    pub next_raffle_index: u64,
    /// Counter for randomness request IDs
    pub next_request_id: u64,
}

/// Wallets and authorities fixed at initialization
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfigAuthorities {
    pub admin: Pubkey,
    pub operator_wallet: Pubkey,
    pub operations_wallet: Pubkey,
    pub treasury_wallet: Pubkey,
    pub recovery_wallet: Pubkey,
    pub randomness_authority: Pubkey,
    pub price_feed: Pubkey,
}

impl Config {
    pub fn new(
        bump: u8,
        authorities: ConfigAuthorities,
        params: &ConfigParams,
    ) -> Result<Self, SettlementError> {
        let mut config = Self {
            is_initialized: true,
            bump,
            admin: authorities.admin,
            operator_wallet: authorities.operator_wallet,
            operations_wallet: authorities.operations_wallet,
            treasury_wallet: authorities.treasury_wallet,
            recovery_wallet: authorities.recovery_wallet,
            randomness_authority: authorities.randomness_authority,
            price_feed: authorities.price_feed,
            ticket_price_usd: 0,
            max_price_age: 0,
            stale_price_policy: StalePricePolicy::Reject,
            max_compute_unit_price: 0,
            claim_window: 0,
            operator_bps: 0,
            operations_bps: 0,
            pool_bps: 0,
            tier_weights: [0; TIER_COUNT],
            next_raffle_index: 1,
            next_request_id: 1,
        };
        config.apply_params(params)?;
        Ok(config)
    }

    /// Validate and store every tunable in `params`
    pub fn apply_params(&mut self, params: &ConfigParams) -> Result<(), SettlementError> {
        self.set_split(params.operator_bps, params.operations_bps, params.pool_bps)?;
        self.set_tier_weights(params.tier_weights)?;
        self.set_oracle_settings(
            params.max_price_age,
            params.stale_price_policy,
            params.max_compute_unit_price,
        )?;
        if params.claim_window <= 0 {
            return Err(SettlementError::InvalidState);
        }
        self.ticket_price_usd = params.ticket_price_usd;
        self.claim_window = params.claim_window;
        Ok(())
    }

    pub fn set_split(
        &mut self,
        operator_bps: u16,
        operations_bps: u16,
        pool_bps: u16,
    ) -> Result<(), SettlementError> {
        let total = operator_bps as u32 + operations_bps as u32 + pool_bps as u32;
        if total > BASIS_POINTS as u32 {
            return Err(SettlementError::InvalidSplit);
        }
        self.operator_bps = operator_bps;
        self.operations_bps = operations_bps;
        self.pool_bps = pool_bps;
        Ok(())
    }

    /// Tier weights must rise strictly from NONE to GOLD
    pub fn set_tier_weights(&mut self, weights: [u64; TIER_COUNT]) -> Result<(), SettlementError> {
        if weights.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(SettlementError::InvalidTier);
        }
        self.tier_weights = weights;
        Ok(())
    }

    pub fn set_oracle_settings(
        &mut self,
        max_price_age: i64,
        stale_price_policy: u8,
        max_compute_unit_price: u64,
    ) -> Result<(), SettlementError> {
        if max_price_age <= 0 {
            return Err(SettlementError::InvalidPriceFeed);
        }
        self.stale_price_policy = StalePricePolicy::try_from(stale_price_policy)
            .map_err(|_| SettlementError::InvalidPriceFeed)?;
        self.max_price_age = max_price_age;
        self.max_compute_unit_price = max_compute_unit_price;
        Ok(())
    }

    /// Hand out the next raffle index
    pub fn take_raffle_index(&mut self) -> Result<u64, SettlementError> {
        let index = self.next_raffle_index;
        self.next_raffle_index = index.checked_add(1).ok_or(SettlementError::MathOverflow)?;
        Ok(index)
    }

    /// Hand out the next randomness request id
    pub fn take_request_id(&mut self) -> Result<u64, SettlementError> {
        let id = self.next_request_id;
        self.next_request_id = id.checked_add(1).ok_or(SettlementError::MathOverflow)?;
        Ok(id)
    }
}

impl Sealed for Config {}

impl IsInitialized for Config {
    fn is_initialized(&self) -> bool {
        self.is_initialized
    }
}

impl Pack for Config {
    const LEN: usize = 1 + 1 + 32 * 7 + 8 + 8 + 1 + 8 + 8 + 2 + 2 + 2 + 8 * TIER_COUNT + 8 + 8;

    fn unpack_from_slice(src: &[u8]) -> Result<Self, ProgramError> {
        let src = array_ref![src, 0, Config::LEN];
        let (
            is_initialized,
            bump,
            admin,
            operator_wallet,
            operations_wallet,
            treasury_wallet,
            recovery_wallet,
            randomness_authority,
            price_feed,
            ticket_price_usd,
            max_price_age,
            stale_price_policy,
            max_compute_unit_price,
            claim_window,
            operator_bps,
            operations_bps,
            pool_bps,
            tier_weights,
            next_raffle_index,
            next_request_id,
        ) = array_refs![src, 1, 1, 32, 32, 32, 32, 32, 32, 32, 8, 8, 1, 8, 8, 2, 2, 2, 32, 8, 8];

        let stale_price_policy = StalePricePolicy::try_from(stale_price_policy[0])
            .map_err(|_| ProgramError::InvalidAccountData)?;
        let mut weights = [0u64; TIER_COUNT];
        for (weight, chunk) in weights.iter_mut().zip(tier_weights.chunks_exact(8)) {
            *weight = u64::from_le_bytes(*array_ref![chunk, 0, 8]);
        }

        Ok(Config {
            is_initialized: is_initialized[0] != 0,
            bump: bump[0],
            admin: Pubkey::new_from_array(*admin),
            operator_wallet: Pubkey::new_from_array(*operator_wallet),
            operations_wallet: Pubkey::new_from_array(*operations_wallet),
            treasury_wallet: Pubkey::new_from_array(*treasury_wallet),
            recovery_wallet: Pubkey::new_from_array(*recovery_wallet),
            randomness_authority: Pubkey::new_from_array(*randomness_authority),
            price_feed: Pubkey::new_from_array(*price_feed),
            ticket_price_usd: u64::from_le_bytes(*ticket_price_usd),
            max_price_age: i64::from_le_bytes(*max_price_age),
            stale_price_policy,
            max_compute_unit_price: u64::from_le_bytes(*max_compute_unit_price),
            claim_window: i64::from_le_bytes(*claim_window),
            operator_bps: u16::from_le_bytes(*operator_bps),
            operations_bps: u16::from_le_bytes(*operations_bps),
            pool_bps: u16::from_le_bytes(*pool_bps),
            tier_weights: weights,
            next_raffle_index: u64::from_le_bytes(*next_raffle_index),
            next_request_id: u64::from_le_bytes(*next_request_id),
        })
    }

    fn pack_into_slice(&self, dst: &mut [u8]) {
        let dst = array_mut_ref![dst, 0, Config::LEN];
        let (
            is_initialized_dst,
            bump_dst,
            admin_dst,
            operator_wallet_dst,
            operations_wallet_dst,
            treasury_wallet_dst,
            recovery_wallet_dst,
            randomness_authority_dst,
            price_feed_dst,
            ticket_price_usd_dst,
            max_price_age_dst,
            stale_price_policy_dst,
            max_compute_unit_price_dst,
            claim_window_dst,
            operator_bps_dst,
            operations_bps_dst,
            pool_bps_dst,
            tier_weights_dst,
            next_raffle_index_dst,
            next_request_id_dst,
        ) = mut_array_refs![dst, 1, 1, 32, 32, 32, 32, 32, 32, 32, 8, 8, 1, 8, 8, 2, 2, 2, 32, 8, 8];

        is_initialized_dst[0] = self.is_initialized as u8;
        bump_dst[0] = self.bump;
        admin_dst.copy_from_slice(self.admin.as_ref());
        operator_wallet_dst.copy_from_slice(self.operator_wallet.as_ref());
        operations_wallet_dst.copy_from_slice(self.operations_wallet.as_ref());
        treasury_wallet_dst.copy_from_slice(self.treasury_wallet.as_ref());
        recovery_wallet_dst.copy_from_slice(self.recovery_wallet.as_ref());
        randomness_authority_dst.copy_from_slice(self.randomness_authority.as_ref());
        price_feed_dst.copy_from_slice(self.price_feed.as_ref());
        *ticket_price_usd_dst = self.ticket_price_usd.to_le_bytes();
        *max_price_age_dst = self.max_price_age.to_le_bytes();
        stale_price_policy_dst[0] = self.stale_price_policy.into();
        *max_compute_unit_price_dst = self.max_compute_unit_price.to_le_bytes();
        *claim_window_dst = self.claim_window.to_le_bytes();
        *operator_bps_dst = self.operator_bps.to_le_bytes();
        *operations_bps_dst = self.operations_bps.to_le_bytes();
        *pool_bps_dst = self.pool_bps.to_le_bytes();
        for (chunk, weight) in tier_weights_dst.chunks_exact_mut(8).zip(self.tier_weights.iter()) {
            chunk.copy_from_slice(&weight.to_le_bytes());
        }
        *next_raffle_index_dst = self.next_raffle_index.to_le_bytes();
        *next_request_id_dst = self.next_request_id.to_le_bytes();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authorities() -> ConfigAuthorities {
        ConfigAuthorities {
            admin: Pubkey::new_unique(),
            operator_wallet: Pubkey::new_unique(),
            operations_wallet: Pubkey::new_unique(),
            treasury_wallet: Pubkey::new_unique(),
            recovery_wallet: Pubkey::new_unique(),
            randomness_authority: Pubkey::new_unique(),
            price_feed: Pubkey::new_unique(),
        }
    }

    #[test]
    fn defaults() {
        let config = Config::new(255, authorities(), &ConfigParams::default()).unwrap();
        assert_eq!(config.max_price_age, 3_600);
        assert_eq!(config.stale_price_policy, StalePricePolicy::Reject);
        assert_eq!(config.claim_window, 259_200);
        assert_eq!(
            (config.operator_bps, config.operations_bps, config.pool_bps),
            (4_000, 2_000, 3_000)
        );
        assert_eq!(config.tier_weights, [0, 10, 25, 50]);
        assert_eq!(config.next_raffle_index, 1);
        assert_eq!(config.next_request_id, 1);
    }

    #[test]
    fn rejects_bad_params() {
        let mut params = ConfigParams::default();
        params.pool_bps = 4_001;
        assert_eq!(
            Config::new(0, authorities(), &params),
            Err(SettlementError::InvalidSplit)
        );

        let mut params = ConfigParams::default();
        params.tier_weights = [0, 10, 10, 50];
        assert_eq!(
            Config::new(0, authorities(), &params),
            Err(SettlementError::InvalidTier)
        );

        let mut params = ConfigParams::default();
        params.stale_price_policy = 7;
        assert_eq!(
            Config::new(0, authorities(), &params),
            Err(SettlementError::InvalidPriceFeed)
        );
    }

    #[test]
    fn counters_advance() {
        let mut config = Config::new(0, authorities(), &ConfigParams::default()).unwrap();
        assert_eq!(config.take_raffle_index().unwrap(), 1);
        assert_eq!(config.take_raffle_index().unwrap(), 2);
        assert_eq!(config.take_request_id().unwrap(), 1);
        assert_eq!(config.next_request_id, 2);
    }

    #[test]
    fn pack_round_trip() {
        let mut params = ConfigParams::default();
        params.stale_price_policy = 1;
        params.max_compute_unit_price = 5_000;
        let config = Config::new(3, authorities(), &params).unwrap();
        let mut buf = vec![0u8; Config::LEN];
        Config::pack(config, &mut buf).unwrap();
        assert_eq!(Config::unpack(&buf).unwrap(), config);
    }
}
