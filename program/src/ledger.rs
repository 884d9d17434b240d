// Tiered revenue distribution ledger (accumulator-per-share)
use arrayref::{array_mut_ref, array_ref, array_refs, mut_array_refs};
use solana_program::{
    msg,
    program_error::ProgramError,
    program_pack::{IsInitialized, Pack, Sealed},
};
use std::convert::TryFrom;

use crate::error::SettlementError;
use crate::guard;
use crate::tier::{Participant, Tier, TierRegistry, TIER_COUNT};

/// Fixed-point scale applied to `acc_reward_per_share`
pub const PRECISION: u128 = 1_000_000_000_000;

pub const BASIS_POINTS: u64 = 10_000;

/// Partition of one inbound transfer. The four shares always sum to `total`;
/// truncation remainder lands in `treasury`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevenueSplit {
    pub total: u64,
    pub operator: u64,
    pub operations: u64,
    pub pool: u64,
    pub treasury: u64,
}

impl RevenueSplit {
    pub fn compute(
        amount: u64,
        operator_bps: u16,
        operations_bps: u16,
        pool_bps: u16,
    ) -> Result<Self, SettlementError> {
        let bps_total = operator_bps as u64 + operations_bps as u64 + pool_bps as u64;
        if bps_total > BASIS_POINTS {
            return Err(SettlementError::InvalidSplit);
        }

        let share = |bps: u16| -> u64 {
            // bps <= 10_000 so the quotient never exceeds amount
            ((amount as u128 * bps as u128) / BASIS_POINTS as u128) as u64
        };
        let operator = share(operator_bps);
        let operations = share(operations_bps);
        let pool = share(pool_bps);
        let treasury = amount - operator - operations - pool;

        Ok(Self {
            total: amount,
            operator,
            operations,
            pool,
            treasury,
        })
    }

    pub fn immediate(&self) -> u64 {
        self.operator + self.operations
    }

    /// Portion that stays in the ledger vault
    pub fn retained(&self) -> u64 {
        self.pool + self.treasury
    }
}

/// Revenue ledger account data. The same account is the vault holding the
/// pool reserve, locked rewards and treasury float.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RevenueLedger {
    pub is_initialized: bool,
    pub bump: u8,
    pub total_received: u64,
    /// Operator and operations shares paid out on receipt
    pub total_immediate: u64,
    /// Received but not yet distributed into accumulators
    pub pool_reserve: u64,
    /// Distributed into accumulators but not yet claimed
    pub locked_rewards: u64,
    pub total_claimed: u64,
    pub treasury_float: u64,
    /// Treasury float that left the vault, by withdrawal or sweep
    pub float_released: u64,
    /// Everything removed by emergency sweeps, float or not
    pub total_swept: u64,
    pub distribution_count: u64,
    pub acc_reward_per_share: [u128; TIER_COUNT],
    pub tiers: TierRegistry,
}

impl RevenueLedger {
    pub fn new(bump: u8) -> Self {
        Self {
            is_initialized: true,
            bump,
            ..Self::default()
        }
    }

    /// Lamports the vault owes: locked rewards plus the pending pool reserve
    pub fn reserved(&self) -> u64 {
        self.locked_rewards.saturating_add(self.pool_reserve)
    }

    /// Record an inbound transfer. No claimable rights are created yet.
    pub fn receive(
        &mut self,
        amount: u64,
        operator_bps: u16,
        operations_bps: u16,
        pool_bps: u16,
    ) -> Result<RevenueSplit, SettlementError> {
        if amount == 0 {
            return Err(SettlementError::InsufficientFunds);
        }
        let split = RevenueSplit::compute(amount, operator_bps, operations_bps, pool_bps)?;

        let total_received = self
            .total_received
            .checked_add(amount)
            .ok_or(SettlementError::MathOverflow)?;
        let total_immediate = self
            .total_immediate
            .checked_add(split.immediate())
            .ok_or(SettlementError::MathOverflow)?;
        let pool_reserve = self
            .pool_reserve
            .checked_add(split.pool)
            .ok_or(SettlementError::MathOverflow)?;
        let treasury_float = self
            .treasury_float
            .checked_add(split.treasury)
            .ok_or(SettlementError::MathOverflow)?;

        self.total_received = total_received;
        self.total_immediate = total_immediate;
        self.pool_reserve = pool_reserve;
        self.treasury_float = treasury_float;
        Ok(split)
    }

    /// Move the pool reserve into the tier accumulators. Returns the amount
    /// distributed; zero when there is nothing to distribute or no weighted
    /// holder, in which case the reserve stays pending.
    pub fn distribute_pool(
        &mut self,
        tier_weights: &[u64; TIER_COUNT],
    ) -> Result<u64, SettlementError> {
        if self.pool_reserve == 0 {
            return Ok(0);
        }
        let (per_tier, total_weight) = self.tiers.weights(tier_weights)?;
        if total_weight == 0 {
            msg!("No weighted holders, pool reserve {} stays pending", self.pool_reserve);
            return Ok(0);
        }

        let pool = self.pool_reserve as u128;
        let mut acc = self.acc_reward_per_share;
        for tier in Tier::ALL.iter() {
            let i = tier.index();
            if per_tier[i] == 0 {
                continue;
            }
            let tier_share = pool
                .checked_mul(per_tier[i])
                .ok_or(SettlementError::MathOverflow)?
                / total_weight;
            let increment = tier_share
                .checked_mul(PRECISION)
                .ok_or(SettlementError::MathOverflow)?
                / self.tiers.holders(*tier) as u128;
            acc[i] = acc[i]
                .checked_add(increment)
                .ok_or(SettlementError::MathOverflow)?;
        }

        let locked_rewards = self
            .locked_rewards
            .checked_add(self.pool_reserve)
            .ok_or(SettlementError::MathOverflow)?;
        let distributed = self.pool_reserve;

        self.acc_reward_per_share = acc;
        self.locked_rewards = locked_rewards;
        self.pool_reserve = 0;
        self.distribution_count = self.distribution_count.saturating_add(1);
        Ok(distributed)
    }

    pub fn pending_reward(&self, participant: &Participant) -> Result<u64, SettlementError> {
        let acc = self.acc_reward_per_share[participant.tier.index()];
        let owed = acc.saturating_sub(participant.reward_debt) / PRECISION;
        u64::try_from(owed).map_err(|_| SettlementError::MathOverflow)
    }

    /// Enroll a new participant under NONE and return its record
    pub fn register(
        &mut self,
        owner: solana_program::pubkey::Pubkey,
        bump: u8,
    ) -> Result<Participant, SettlementError> {
        self.tiers.enroll(Tier::None)?;
        Ok(Participant::new(
            owner,
            bump,
            Tier::None,
            self.acc_reward_per_share[Tier::None.index()],
        ))
    }

    /// Settle whatever is pending for `participant` under its current tier.
    /// Returns the lamports owed, which may be zero.
    fn settle(&mut self, participant: &mut Participant) -> Result<u64, SettlementError> {
        let amount = self.pending_reward(participant)?;
        let locked_rewards = self
            .locked_rewards
            .checked_sub(amount)
            .ok_or(SettlementError::ConservationViolation)?;
        let total_claimed = self
            .total_claimed
            .checked_add(amount)
            .ok_or(SettlementError::MathOverflow)?;
        let participant_claimed = participant
            .total_claimed
            .checked_add(amount)
            .ok_or(SettlementError::MathOverflow)?;

        self.locked_rewards = locked_rewards;
        self.total_claimed = total_claimed;
        participant.reward_debt = self.acc_reward_per_share[participant.tier.index()];
        participant.total_claimed = participant_claimed;
        Ok(amount)
    }

    /// Explicit claim; rejects when nothing is pending so repeats are visible
    pub fn claim(&mut self, participant: &mut Participant) -> Result<u64, SettlementError> {
        if self.pending_reward(participant)? == 0 {
            return Err(SettlementError::NothingToClaim);
        }
        self.settle(participant)
    }

    /// Settle under the current tier, then switch. Returns the settled payout.
    pub fn update_tier(
        &mut self,
        participant: &mut Participant,
        new_tier: Tier,
    ) -> Result<u64, SettlementError> {
        if participant.tier == new_tier {
            return Err(SettlementError::InvalidState);
        }
        let mut tiers = self.tiers;
        tiers.reassign(participant.tier, new_tier)?;
        // Counts are committed only once the settlement succeeded
        let mut settled = *participant;
        let payout = self.settle(&mut settled)?;

        self.tiers = tiers;
        settled.tier = new_tier;
        settled.reward_debt = self.acc_reward_per_share[new_tier.index()];
        *participant = settled;
        Ok(payout)
    }

    /// Book an emergency sweep of everything above `reserved()`. The float is
    /// drawn down first; any excess came from outside `receive`.
    ///
    /// The treasury float is not part of `reserved()`, so a sweep can take it.
    /// Only locked rewards and the undistributed pool are protected here;
    /// `WithdrawTreasury` stays the governed way to move the float on purpose.
    pub fn sweep(&mut self, available: u64) -> Result<u64, SettlementError> {
        let amount = guard::sweepable(available, self.reserved());
        if amount == 0 {
            return Ok(0);
        }
        let from_float = amount.min(self.treasury_float);
        let float_released = self
            .float_released
            .checked_add(from_float)
            .ok_or(SettlementError::MathOverflow)?;
        let total_swept = self
            .total_swept
            .checked_add(amount)
            .ok_or(SettlementError::MathOverflow)?;

        self.treasury_float -= from_float;
        self.float_released = float_released;
        self.total_swept = total_swept;
        Ok(amount)
    }

    /// Governed withdrawal of treasury float, bounded by both the float and
    /// the vault surplus
    pub fn withdraw_treasury(
        &mut self,
        amount: u64,
        available: u64,
    ) -> Result<u64, SettlementError> {
        if amount == 0 {
            return Err(SettlementError::InsufficientFunds);
        }
        if amount > self.treasury_float || amount > guard::sweepable(available, self.reserved()) {
            return Err(SettlementError::InsufficientFunds);
        }
        let float_released = self
            .float_released
            .checked_add(amount)
            .ok_or(SettlementError::MathOverflow)?;
        self.treasury_float -= amount;
        self.float_released = float_released;
        Ok(amount)
    }

    pub fn ensure_conserved(&self) -> Result<(), SettlementError> {
        guard::ensure_conserved(
            self.total_received,
            &[
                self.total_immediate,
                self.pool_reserve,
                self.locked_rewards,
                self.total_claimed,
                self.treasury_float,
                self.float_released,
            ],
        )
    }
}

impl Sealed for RevenueLedger {}

impl IsInitialized for RevenueLedger {
    fn is_initialized(&self) -> bool {
        self.is_initialized
    }
}

impl Pack for RevenueLedger {
    const LEN: usize = 1 + 1 + 8 * 9 + 16 * TIER_COUNT + 8 * TIER_COUNT;

    fn unpack_from_slice(src: &[u8]) -> Result<Self, ProgramError> {
        let src = array_ref![src, 0, RevenueLedger::LEN];
        let (
            is_initialized,
            bump,
            total_received,
            total_immediate,
            pool_reserve,
            locked_rewards,
            total_claimed,
            treasury_float,
            float_released,
            total_swept,
            distribution_count,
            acc,
            holders,
        ) = array_refs![src, 1, 1, 8, 8, 8, 8, 8, 8, 8, 8, 8, 64, 32];

        let mut acc_reward_per_share = [0u128; TIER_COUNT];
        for (i, chunk) in acc.chunks_exact(16).enumerate() {
            acc_reward_per_share[i] = u128::from_le_bytes(*array_ref![chunk, 0, 16]);
        }
        let mut tiers = TierRegistry::default();
        for (i, chunk) in holders.chunks_exact(8).enumerate() {
            tiers.holder_count[i] = u64::from_le_bytes(*array_ref![chunk, 0, 8]);
        }

        Ok(RevenueLedger {
            is_initialized: is_initialized[0] != 0,
            bump: bump[0],
            total_received: u64::from_le_bytes(*total_received),
            total_immediate: u64::from_le_bytes(*total_immediate),
            pool_reserve: u64::from_le_bytes(*pool_reserve),
            locked_rewards: u64::from_le_bytes(*locked_rewards),
            total_claimed: u64::from_le_bytes(*total_claimed),
            treasury_float: u64::from_le_bytes(*treasury_float),
            float_released: u64::from_le_bytes(*float_released),
            total_swept: u64::from_le_bytes(*total_swept),
            distribution_count: u64::from_le_bytes(*distribution_count),
            acc_reward_per_share,
            tiers,
        })
    }

    fn pack_into_slice(&self, dst: &mut [u8]) {
        let dst = array_mut_ref![dst, 0, RevenueLedger::LEN];
        let (
            is_initialized_dst,
            bump_dst,
            total_received_dst,
            total_immediate_dst,
            pool_reserve_dst,
            locked_rewards_dst,
            total_claimed_dst,
            treasury_float_dst,
            float_released_dst,
            total_swept_dst,
            distribution_count_dst,
            acc_dst,
            holders_dst,
        ) = mut_array_refs![dst, 1, 1, 8, 8, 8, 8, 8, 8, 8, 8, 8, 64, 32];

        is_initialized_dst[0] = self.is_initialized as u8;
        bump_dst[0] = self.bump;
        *total_received_dst = self.total_received.to_le_bytes();
        *total_immediate_dst = self.total_immediate.to_le_bytes();
        *pool_reserve_dst = self.pool_reserve.to_le_bytes();
        *locked_rewards_dst = self.locked_rewards.to_le_bytes();
        *total_claimed_dst = self.total_claimed.to_le_bytes();
        *treasury_float_dst = self.treasury_float.to_le_bytes();
        *float_released_dst = self.float_released.to_le_bytes();
        *total_swept_dst = self.total_swept.to_le_bytes();
        *distribution_count_dst = self.distribution_count.to_le_bytes();
        for (i, chunk) in acc_dst.chunks_exact_mut(16).enumerate() {
            chunk.copy_from_slice(&self.acc_reward_per_share[i].to_le_bytes());
        }
        for (i, chunk) in holders_dst.chunks_exact_mut(8).enumerate() {
            chunk.copy_from_slice(&self.tiers.holder_count[i].to_le_bytes());
        }
    }
}
