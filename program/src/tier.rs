// Membership tiers, per-tier holder counts and the participant account
use arrayref::{array_mut_ref, array_ref, array_refs, mut_array_refs};
use solana_program::{
    program_error::ProgramError,
    program_pack::{IsInitialized, Pack, Sealed},
    pubkey::Pubkey,
};
use std::convert::TryFrom;

use crate::error::SettlementError;

pub const TIER_COUNT: usize = 4;

/// Default reward weight per tier, indexed by `Tier as usize`
pub const DEFAULT_TIER_WEIGHTS: [u64; TIER_COUNT] = [0, 10, 25, 50];

/// Membership tier, ordered by weight
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    None,
    Bronze,
    Silver,
    Gold,
}

impl Tier {
    pub const ALL: [Tier; TIER_COUNT] = [Tier::None, Tier::Bronze, Tier::Silver, Tier::Gold];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for Tier {
    type Error = SettlementError;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        match val {
            0 => Ok(Tier::None),
            1 => Ok(Tier::Bronze),
            2 => Ok(Tier::Silver),
            3 => Ok(Tier::Gold),
            _ => Err(SettlementError::InvalidTier),
        }
    }
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> Self {
        tier as u8
    }
}

/// Holder count per tier. Kept inside the ledger account so every tier
/// change updates counts and accumulators in the same write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TierRegistry {
    pub holder_count: [u64; TIER_COUNT],
}

impl TierRegistry {
    pub fn holders(&self, tier: Tier) -> u64 {
        self.holder_count[tier.index()]
    }

    /// Count a newly registered participant under `tier`
    pub fn enroll(&mut self, tier: Tier) -> Result<(), SettlementError> {
        let slot = &mut self.holder_count[tier.index()];
        *slot = slot.checked_add(1).ok_or(SettlementError::MathOverflow)?;
        Ok(())
    }

    /// Move one holder from `from` to `to`
    pub fn reassign(&mut self, from: Tier, to: Tier) -> Result<(), SettlementError> {
        let old = self.holder_count[from.index()]
            .checked_sub(1)
            .ok_or(SettlementError::ConservationViolation)?;
        let new = self.holder_count[to.index()]
            .checked_add(1)
            .ok_or(SettlementError::MathOverflow)?;
        self.holder_count[from.index()] = old;
        self.holder_count[to.index()] = new;
        Ok(())
    }

    /// Per-tier distribution weight (`holders × tier weight`) and their sum
    pub fn weights(
        &self,
        tier_weights: &[u64; TIER_COUNT],
    ) -> Result<([u128; TIER_COUNT], u128), SettlementError> {
        let mut per_tier = [0u128; TIER_COUNT];
        let mut total: u128 = 0;
        for tier in Tier::ALL.iter() {
            let i = tier.index();
            let weight = (self.holder_count[i] as u128)
                .checked_mul(tier_weights[i] as u128)
                .ok_or(SettlementError::MathOverflow)?;
            per_tier[i] = weight;
            total = total.checked_add(weight).ok_or(SettlementError::MathOverflow)?;
        }
        Ok((per_tier, total))
    }
}

/// Participant account data
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Participant {
    pub is_initialized: bool,
    pub bump: u8,
    /// Wallet this record belongs to
    pub owner: Pubkey,
    pub tier: Tier,
    /// Scaled accumulator value already settled for this participant
    pub reward_debt: u128,
    /// Lifetime lamports paid out to this participant
    pub total_claimed: u64,
}

impl Participant {
    pub fn new(owner: Pubkey, bump: u8, tier: Tier, reward_debt: u128) -> Self {
        Self {
            is_initialized: true,
            bump,
            owner,
            tier,
            reward_debt,
            total_claimed: 0,
        }
    }
}

impl Sealed for Participant {}

impl IsInitialized for Participant {
    fn is_initialized(&self) -> bool {
        self.is_initialized
    }
}

impl Pack for Participant {
    const LEN: usize = 1 + 1 + 32 + 1 + 16 + 8;

    fn unpack_from_slice(src: &[u8]) -> Result<Self, ProgramError> {
        let src = array_ref![src, 0, Participant::LEN];
        let (is_initialized, bump, owner, tier, reward_debt, total_claimed) =
            array_refs![src, 1, 1, 32, 1, 16, 8];

        let tier = Tier::try_from(tier[0]).map_err(|_| ProgramError::InvalidAccountData)?;

        Ok(Participant {
            is_initialized: is_initialized[0] != 0,
            bump: bump[0],
            owner: Pubkey::new_from_array(*owner),
            tier,
            reward_debt: u128::from_le_bytes(*reward_debt),
            total_claimed: u64::from_le_bytes(*total_claimed),
        })
    }

    fn pack_into_slice(&self, dst: &mut [u8]) {
        let dst = array_mut_ref![dst, 0, Participant::LEN];
        let (is_initialized_dst, bump_dst, owner_dst, tier_dst, reward_debt_dst, total_claimed_dst) =
            mut_array_refs![dst, 1, 1, 32, 1, 16, 8];

        is_initialized_dst[0] = self.is_initialized as u8;
        bump_dst[0] = self.bump;
        owner_dst.copy_from_slice(self.owner.as_ref());
        tier_dst[0] = self.tier.into();
        *reward_debt_dst = self.reward_debt.to_le_bytes();
        *total_claimed_dst = self.total_claimed.to_le_bytes();
    }
}
