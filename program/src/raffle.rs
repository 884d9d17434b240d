// Raffle lifecycle engine: ticket sales, draw, claim and reroll
use arrayref::{array_mut_ref, array_ref, array_refs, mut_array_refs};
use solana_program::{
    clock::UnixTimestamp,
    msg,
    program_error::ProgramError,
    program_pack::{IsInitialized, Pack, Sealed},
    pubkey::Pubkey,
    system_instruction::MAX_PERMITTED_DATA_LENGTH,
};
use std::convert::TryFrom;

use crate::error::SettlementError;
use crate::vrf;

/// Ranges a ticket book has room for when its raffle is created
pub const INITIAL_TICKET_RANGES: usize = 16;

/// Ranges added each time a full ticket book is grown
pub const TICKET_RANGE_GROWTH: usize = 16;

/// Ranges that fit in the largest account the runtime allows
pub const MAX_TICKET_RANGES: usize =
    (MAX_PERMITTED_DATA_LENGTH as usize - TicketBook::HEADER_LEN) / TicketBook::RANGE_LEN;

/// Status of a raffle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaffleStatus {
    /// Created with a start time still in the future
    Created,
    /// Accepting ticket purchases until the end time
    Open,
    /// Closed explicitly; waiting for a randomness request
    Closed,
    /// Randomness requested, waiting for the oracle callback
    RandomnessRequested,
    /// Winner resolved, claim window running
    Resolved,
    /// Prize paid to the winner
    Claimed,
    /// Ended without a paid winner (cancelled or no eligible ticket left)
    Archived,
}

impl TryFrom<u8> for RaffleStatus {
    type Error = &'static str;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        match val {
            0 => Ok(RaffleStatus::Created),
            1 => Ok(RaffleStatus::Open),
            2 => Ok(RaffleStatus::Closed),
            3 => Ok(RaffleStatus::RandomnessRequested),
            4 => Ok(RaffleStatus::Resolved),
            5 => Ok(RaffleStatus::Claimed),
            6 => Ok(RaffleStatus::Archived),
            _ => Err("Invalid raffle status"),
        }
    }
}

impl From<RaffleStatus> for u8 {
    fn from(status: RaffleStatus) -> Self {
        match status {
            RaffleStatus::Created => 0,
            RaffleStatus::Open => 1,
            RaffleStatus::Closed => 2,
            RaffleStatus::RandomnessRequested => 3,
            RaffleStatus::Resolved => 4,
            RaffleStatus::Claimed => 5,
            RaffleStatus::Archived => 6,
        }
    }
}

/// Result of a reroll
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RerollOutcome {
    /// A fresh randomness request was issued under this id
    Requested(u64),
    /// Every remaining ticket belonged to a lapsed winner; raffle archived
    Exhausted,
}

/// Raffle account data. The account also holds the escrowed prize.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Raffle {
    pub is_initialized: bool,
    pub bump: u8,
    /// Sequential ID number for this raffle (1, 2, 3, etc.)
    pub raffle_index: u64,
    pub creator: Pubkey,
    /// Title of the raffle (max 32 chars)
    pub title: [u8; 32],
    pub start_time: UnixTimestamp,
    pub end_time: UnixTimestamp,
    /// Ticket cap
    pub total_tickets: u64,
    /// Paid and free tickets issued so far
    pub tickets_sold: u64,
    pub paid_tickets_sold: u64,
    /// Prize in lamports escrowed at creation
    pub prize_amount: u64,
    pub status: RaffleStatus,
    /// Randomness request currently awaited
    pub pending_request: Option<u64>,
    pub winner: Option<Pubkey>,
    /// Zero until a winner is resolved
    pub claim_deadline: UnixTimestamp,
    pub reroll_count: u16,
}

impl Raffle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        raffle_index: u64,
        bump: u8,
        creator: Pubkey,
        title: [u8; 32],
        start_time: UnixTimestamp,
        end_time: UnixTimestamp,
        total_tickets: u64,
        prize_amount: u64,
        now: UnixTimestamp,
    ) -> Result<Self, SettlementError> {
        if end_time <= start_time || end_time <= now || total_tickets == 0 {
            return Err(SettlementError::InvalidState);
        }
        let status = if start_time > now {
            RaffleStatus::Created
        } else {
            RaffleStatus::Open
        };
        Ok(Self {
            is_initialized: true,
            bump,
            raffle_index,
            creator,
            title,
            start_time,
            end_time,
            total_tickets,
            tickets_sold: 0,
            paid_tickets_sold: 0,
            prize_amount,
            status,
            pending_request: None,
            winner: None,
            claim_deadline: 0,
            reroll_count: 0,
        })
    }

    /// Accepting ticket purchases at `now`
    pub fn is_active(&self, now: UnixTimestamp) -> bool {
        matches!(self.status, RaffleStatus::Created | RaffleStatus::Open)
            && now >= self.start_time
            && now < self.end_time
    }

    /// No longer selling tickets, either explicitly or because time ran out
    pub fn has_closed(&self, now: UnixTimestamp) -> bool {
        match self.status {
            RaffleStatus::Created | RaffleStatus::Open => now >= self.end_time,
            _ => true,
        }
    }

    /// A winner is currently resolved or has been paid
    pub fn is_completed(&self) -> bool {
        matches!(self.status, RaffleStatus::Resolved | RaffleStatus::Claimed)
    }

    pub fn is_expired(&self, now: UnixTimestamp) -> bool {
        self.status == RaffleStatus::Resolved && now > self.claim_deadline
    }

    /// Prize lamports the vault must keep until the raffle settles
    pub fn locked_prize(&self) -> u64 {
        match self.status {
            RaffleStatus::Claimed | RaffleStatus::Archived => 0,
            _ => self.prize_amount,
        }
    }

    pub fn remaining_tickets(&self) -> u64 {
        self.total_tickets.saturating_sub(self.tickets_sold)
    }

    /// Record `count` tickets for `buyer`
    pub fn add_tickets(
        &mut self,
        book: &mut TicketBook,
        buyer: Pubkey,
        count: u64,
        paid: bool,
        now: UnixTimestamp,
    ) -> Result<(), SettlementError> {
        if !self.is_active(now) {
            return Err(SettlementError::InvalidState);
        }
        if count == 0 || count > self.remaining_tickets() {
            return Err(SettlementError::TicketsUnavailable);
        }
        let tickets_sold = self
            .tickets_sold
            .checked_add(count)
            .ok_or(SettlementError::MathOverflow)?;
        let paid_tickets_sold = if paid {
            self.paid_tickets_sold
                .checked_add(count)
                .ok_or(SettlementError::MathOverflow)?
        } else {
            self.paid_tickets_sold
        };

        book.push(buyer, count)?;

        self.tickets_sold = tickets_sold;
        self.paid_tickets_sold = paid_tickets_sold;
        self.status = RaffleStatus::Open;
        Ok(())
    }

    /// Stop ticket sales. Before the end time only the creator or admin may.
    pub fn close(&mut self, privileged: bool, now: UnixTimestamp) -> Result<(), SettlementError> {
        if !matches!(self.status, RaffleStatus::Created | RaffleStatus::Open) {
            return Err(SettlementError::InvalidState);
        }
        if !privileged && now < self.end_time {
            return Err(SettlementError::Unauthorized);
        }
        self.status = RaffleStatus::Closed;
        Ok(())
    }

    /// Record the randomness request that will pick the winner
    pub fn begin_draw(&mut self, request_id: u64, now: UnixTimestamp) -> Result<(), SettlementError> {
        if self.pending_request.is_some() || self.winner.is_some() {
            return Err(SettlementError::InvalidState);
        }
        match self.status {
            RaffleStatus::Created | RaffleStatus::Open | RaffleStatus::Closed => {}
            _ => return Err(SettlementError::InvalidState),
        }
        if !self.has_closed(now) {
            return Err(SettlementError::InvalidState);
        }
        if self.tickets_sold == 0 {
            return Err(SettlementError::NoTicketsSold);
        }
        self.pending_request = Some(request_id);
        self.status = RaffleStatus::RandomnessRequested;
        Ok(())
    }

    /// Consume the randomness for `request_id` and resolve a winner
    pub fn resolve(
        &mut self,
        book: &TicketBook,
        request_id: u64,
        randomness: &[u8; 32],
        now: UnixTimestamp,
        claim_window: i64,
    ) -> Result<Pubkey, SettlementError> {
        if self.status != RaffleStatus::RandomnessRequested
            || self.pending_request != Some(request_id)
        {
            return Err(SettlementError::DuplicateCallback);
        }
        let winner = book.select(randomness)?;
        let claim_deadline = now
            .checked_add(claim_window)
            .ok_or(SettlementError::MathOverflow)?;

        self.winner = Some(winner);
        self.claim_deadline = claim_deadline;
        self.pending_request = None;
        self.status = RaffleStatus::Resolved;
        Ok(winner)
    }

    /// Mark the prize claimed by `caller` and return its amount
    pub fn claim_prize(&mut self, caller: &Pubkey, now: UnixTimestamp) -> Result<u64, SettlementError> {
        if self.status != RaffleStatus::Resolved {
            return Err(SettlementError::InvalidState);
        }
        if self.winner != Some(*caller) {
            return Err(SettlementError::Unauthorized);
        }
        if now > self.claim_deadline {
            return Err(SettlementError::DeadlineViolation);
        }
        self.status = RaffleStatus::Claimed;
        Ok(self.prize_amount)
    }

    /// Reroll eligibility: resolved, unclaimed, past the deadline.
    /// Returns the lapsed winner.
    pub fn check_reroll(&self, now: UnixTimestamp) -> Result<Pubkey, SettlementError> {
        if self.status != RaffleStatus::Resolved {
            return Err(SettlementError::InvalidState);
        }
        let winner = self.winner.ok_or(SettlementError::InvalidState)?;
        if now <= self.claim_deadline {
            return Err(SettlementError::DeadlineViolation);
        }
        Ok(winner)
    }

    /// Drop the lapsed winner's tickets and ask for fresh randomness, or
    /// archive the raffle when nobody else holds a ticket.
    pub fn reroll(
        &mut self,
        book: &mut TicketBook,
        next_request_id: u64,
        now: UnixTimestamp,
    ) -> Result<RerollOutcome, SettlementError> {
        let lapsed = self.check_reroll(now)?;
        let reroll_count = self
            .reroll_count
            .checked_add(1)
            .ok_or(SettlementError::MathOverflow)?;

        let removed = book.exclude(&lapsed);
        msg!("Excluded {} tickets held by lapsed winner {}", removed, lapsed);

        self.winner = None;
        self.claim_deadline = 0;
        self.reroll_count = reroll_count;

        if book.eligible_tickets == 0 {
            self.status = RaffleStatus::Archived;
            return Ok(RerollOutcome::Exhausted);
        }
        self.pending_request = Some(next_request_id);
        self.status = RaffleStatus::RandomnessRequested;
        Ok(RerollOutcome::Requested(next_request_id))
    }

    /// Archive a raffle that sold nothing and return the prize to refund
    pub fn cancel(&mut self, privileged: bool) -> Result<u64, SettlementError> {
        if !privileged {
            return Err(SettlementError::Unauthorized);
        }
        if !matches!(
            self.status,
            RaffleStatus::Created | RaffleStatus::Open | RaffleStatus::Closed
        ) || self.tickets_sold > 0
        {
            return Err(SettlementError::InvalidState);
        }
        self.status = RaffleStatus::Archived;
        Ok(self.prize_amount)
    }
}

impl Sealed for Raffle {}

impl IsInitialized for Raffle {
    fn is_initialized(&self) -> bool {
        self.is_initialized
    }
}

impl Pack for Raffle {
    const LEN: usize = 1 + 1 + 8 + 32 + 32 + 8 + 8 + 8 + 8 + 8 + 8 + 1 + 9 + 33 + 8 + 2;

    fn unpack_from_slice(src: &[u8]) -> Result<Self, ProgramError> {
        let src = array_ref![src, 0, Raffle::LEN];
        let (
            is_initialized,
            bump,
            raffle_index,
            creator,
            title,
            start_time,
            end_time,
            total_tickets,
            tickets_sold,
            paid_tickets_sold,
            prize_amount,
            status,
            pending_request,
            winner,
            claim_deadline,
            reroll_count,
        ) = array_refs![src, 1, 1, 8, 32, 32, 8, 8, 8, 8, 8, 8, 1, 9, 33, 8, 2];

        let status =
            RaffleStatus::try_from(status[0]).map_err(|_| ProgramError::InvalidAccountData)?;
        let (has_request, request_id) = array_refs![pending_request, 1, 8];
        let (has_winner, winner_key) = array_refs![winner, 1, 32];

        Ok(Raffle {
            is_initialized: is_initialized[0] != 0,
            bump: bump[0],
            raffle_index: u64::from_le_bytes(*raffle_index),
            creator: Pubkey::new_from_array(*creator),
            title: *title,
            start_time: UnixTimestamp::from_le_bytes(*start_time),
            end_time: UnixTimestamp::from_le_bytes(*end_time),
            total_tickets: u64::from_le_bytes(*total_tickets),
            tickets_sold: u64::from_le_bytes(*tickets_sold),
            paid_tickets_sold: u64::from_le_bytes(*paid_tickets_sold),
            prize_amount: u64::from_le_bytes(*prize_amount),
            status,
            pending_request: if has_request[0] != 0 {
                Some(u64::from_le_bytes(*request_id))
            } else {
                None
            },
            winner: if has_winner[0] != 0 {
                Some(Pubkey::new_from_array(*winner_key))
            } else {
                None
            },
            claim_deadline: UnixTimestamp::from_le_bytes(*claim_deadline),
            reroll_count: u16::from_le_bytes(*reroll_count),
        })
    }

    fn pack_into_slice(&self, dst: &mut [u8]) {
        let dst = array_mut_ref![dst, 0, Raffle::LEN];
        let (
            is_initialized_dst,
            bump_dst,
            raffle_index_dst,
            creator_dst,
            title_dst,
            start_time_dst,
            end_time_dst,
            total_tickets_dst,
            tickets_sold_dst,
            paid_tickets_sold_dst,
            prize_amount_dst,
            status_dst,
            pending_request_dst,
            winner_dst,
            claim_deadline_dst,
            reroll_count_dst,
        ) = mut_array_refs![dst, 1, 1, 8, 32, 32, 8, 8, 8, 8, 8, 8, 1, 9, 33, 8, 2];

        is_initialized_dst[0] = self.is_initialized as u8;
        bump_dst[0] = self.bump;
        *raffle_index_dst = self.raffle_index.to_le_bytes();
        creator_dst.copy_from_slice(self.creator.as_ref());
        title_dst.copy_from_slice(&self.title);
        *start_time_dst = self.start_time.to_le_bytes();
        *end_time_dst = self.end_time.to_le_bytes();
        *total_tickets_dst = self.total_tickets.to_le_bytes();
        *tickets_sold_dst = self.tickets_sold.to_le_bytes();
        *paid_tickets_sold_dst = self.paid_tickets_sold.to_le_bytes();
        *prize_amount_dst = self.prize_amount.to_le_bytes();
        status_dst[0] = self.status.into();

        let (has_request_dst, request_id_dst) = mut_array_refs![pending_request_dst, 1, 8];
        has_request_dst[0] = self.pending_request.is_some() as u8;
        *request_id_dst = self.pending_request.unwrap_or(0).to_le_bytes();

        let (has_winner_dst, winner_key_dst) = mut_array_refs![winner_dst, 1, 32];
        has_winner_dst[0] = self.winner.is_some() as u8;
        winner_key_dst.copy_from_slice(self.winner.unwrap_or_default().as_ref());

        *claim_deadline_dst = self.claim_deadline.to_le_bytes();
        *reroll_count_dst = self.reroll_count.to_le_bytes();
    }
}

/// One contiguous run of tickets owned by the same wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicketRange {
    pub owner: Pubkey,
    /// Cumulative ticket count up to and including this range
    pub end: u64,
    /// Owner lapsed as a winner; these tickets no longer draw
    pub excluded: bool,
}

/// Cumulative-sum index of ticket ownership for one raffle.
///
/// The account is a fixed header followed by one record per range. It starts
/// with room for `INITIAL_TICKET_RANGES` and is reallocated as sales add runs.
#[derive(Debug, Clone, PartialEq)]
pub struct TicketBook {
    pub is_initialized: bool,
    pub bump: u8,
    /// Raffle account this book indexes
    pub raffle: Pubkey,
    /// Tickets not held by an excluded owner
    pub eligible_tickets: u64,
    pub ranges: Vec<TicketRange>,
}

impl TicketBook {
    pub const HEADER_LEN: usize = 1 + 1 + 32 + 8 + 4;
    pub const RANGE_LEN: usize = 32 + 8 + 1;

    /// Account size holding `ranges` ranges
    pub const fn space(ranges: usize) -> usize {
        Self::HEADER_LEN + ranges * Self::RANGE_LEN
    }

    /// Account size this book needs, rounded up to the next growth step
    pub fn required_space(&self, current_len: usize) -> usize {
        let needed = Self::space(self.ranges.len());
        if needed <= current_len {
            return current_len;
        }
        let ranges = (self.ranges.len() + TICKET_RANGE_GROWTH - 1).min(MAX_TICKET_RANGES);
        Self::space(ranges).max(needed)
    }

    pub fn new(raffle: Pubkey, bump: u8) -> Self {
        Self {
            is_initialized: true,
            bump,
            raffle,
            eligible_tickets: 0,
            ranges: Vec::new(),
        }
    }

    pub fn total(&self) -> u64 {
        self.ranges.last().map(|r| r.end).unwrap_or(0)
    }

    fn range_start(&self, index: usize) -> u64 {
        if index == 0 {
            0
        } else {
            self.ranges[index - 1].end
        }
    }

    /// Append `count` tickets for `owner`, extending its range when it made
    /// the previous purchase too
    pub fn push(&mut self, owner: Pubkey, count: u64) -> Result<(), SettlementError> {
        let end = self
            .total()
            .checked_add(count)
            .ok_or(SettlementError::MathOverflow)?;
        let eligible_tickets = self
            .eligible_tickets
            .checked_add(count)
            .ok_or(SettlementError::MathOverflow)?;

        match self.ranges.last_mut() {
            Some(last) if last.owner == owner && !last.excluded => last.end = end,
            _ => {
                if self.ranges.len() >= MAX_TICKET_RANGES {
                    return Err(SettlementError::TicketBookFull);
                }
                self.ranges.push(TicketRange {
                    owner,
                    end,
                    excluded: false,
                });
            }
        }
        self.eligible_tickets = eligible_tickets;
        Ok(())
    }

    /// Tickets held by `owner`, excluded or not
    pub fn tickets_of(&self, owner: &Pubkey) -> u64 {
        (0..self.ranges.len())
            .filter(|i| self.ranges[*i].owner == *owner)
            .map(|i| self.ranges[i].end - self.range_start(i))
            .sum()
    }

    /// Exclude every ticket held by `owner`; returns how many were removed
    pub fn exclude(&mut self, owner: &Pubkey) -> u64 {
        let mut removed = 0;
        for i in 0..self.ranges.len() {
            if self.ranges[i].owner == *owner && !self.ranges[i].excluded {
                removed += self.ranges[i].end - self.range_start(i);
                self.ranges[i].excluded = true;
            }
        }
        self.eligible_tickets = self.eligible_tickets.saturating_sub(removed);
        removed
    }

    /// Owner of the ticket chosen by `randomness` among eligible tickets
    pub fn select(&self, randomness: &[u8; 32]) -> Result<Pubkey, SettlementError> {
        if self.eligible_tickets == 0 {
            return Err(SettlementError::NoTicketsSold);
        }
        let mut index = vrf::winner_index(randomness, self.eligible_tickets);

        if self.eligible_tickets == self.total() {
            let slot = self.ranges.partition_point(|r| r.end <= index);
            return Ok(self.ranges[slot].owner);
        }

        for i in 0..self.ranges.len() {
            let range = &self.ranges[i];
            if range.excluded {
                continue;
            }
            let size = range.end - self.range_start(i);
            if index < size {
                return Ok(range.owner);
            }
            index -= size;
        }
        Err(SettlementError::ConservationViolation)
    }
}

impl IsInitialized for TicketBook {
    fn is_initialized(&self) -> bool {
        self.is_initialized
    }
}

impl TicketBook {
    pub fn unpack(src: &[u8]) -> Result<Self, ProgramError> {
        if src.len() < TicketBook::HEADER_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let header = array_ref![src, 0, TicketBook::HEADER_LEN];
        let (is_initialized, bump, raffle, eligible_tickets, range_count) =
            array_refs![header, 1, 1, 32, 8, 4];

        let range_count = u32::from_le_bytes(*range_count) as usize;
        if src.len() < TicketBook::space(range_count) {
            msg!("Ticket book holds {} ranges in {} bytes", range_count, src.len());
            return Err(ProgramError::InvalidAccountData);
        }

        let ranges = src[TicketBook::HEADER_LEN..]
            .chunks_exact(TicketBook::RANGE_LEN)
            .take(range_count)
            .map(|chunk| {
                let chunk = array_ref![chunk, 0, TicketBook::RANGE_LEN];
                let (owner, end, excluded) = array_refs![chunk, 32, 8, 1];
                TicketRange {
                    owner: Pubkey::new_from_array(*owner),
                    end: u64::from_le_bytes(*end),
                    excluded: excluded[0] != 0,
                }
            })
            .collect();

        Ok(TicketBook {
            is_initialized: is_initialized[0] != 0,
            bump: bump[0],
            raffle: Pubkey::new_from_array(*raffle),
            eligible_tickets: u64::from_le_bytes(*eligible_tickets),
            ranges,
        })
    }

    /// Write the book into `dst`, which must already be large enough
    pub fn pack(&self, dst: &mut [u8]) -> Result<(), ProgramError> {
        if dst.len() < TicketBook::space(self.ranges.len()) {
            return Err(ProgramError::AccountDataTooSmall);
        }
        let (header, body) = dst.split_at_mut(TicketBook::HEADER_LEN);
        let header = array_mut_ref![header, 0, TicketBook::HEADER_LEN];
        let (is_initialized_dst, bump_dst, raffle_dst, eligible_dst, range_count_dst) =
            mut_array_refs![header, 1, 1, 32, 8, 4];

        is_initialized_dst[0] = self.is_initialized as u8;
        bump_dst[0] = self.bump;
        raffle_dst.copy_from_slice(self.raffle.as_ref());
        *eligible_dst = self.eligible_tickets.to_le_bytes();
        *range_count_dst = (self.ranges.len() as u32).to_le_bytes();

        for (chunk, range) in body
            .chunks_exact_mut(TicketBook::RANGE_LEN)
            .zip(self.ranges.iter())
        {
            let chunk = array_mut_ref![chunk, 0, TicketBook::RANGE_LEN];
            let (owner_dst, end_dst, excluded_dst) = mut_array_refs![chunk, 32, 8, 1];
            owner_dst.copy_from_slice(range.owner.as_ref());
            *end_dst = range.end.to_le_bytes();
            excluded_dst[0] = range.excluded as u8;
        }
        Ok(())
    }
}
