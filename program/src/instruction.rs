// Instruction set and client-side builders
use borsh::{BorshDeserialize, BorshSerialize};
use solana_program::{
    instruction::{AccountMeta, Instruction},
    program_error::ProgramError,
    pubkey::Pubkey,
    system_program, sysvar,
};

use crate::{
    state::ConfigParams,
    tier::{Tier, TIER_COUNT},
    utils::{
        find_config_address, find_ledger_address, find_participant_address, find_raffle_address,
        find_request_address, find_ticket_book_address,
    },
    vrf::{SignedSeed, ED25519_PROGRAM_ID, SIGNATURE_LEN},
};

#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq)]
pub enum SettlementInstruction {
    /// Create the config and ledger accounts
    ///
    /// Accounts expected:
    /// 0. `[signer, writable]` Admin, pays for both accounts
    /// 1. `[writable]` Config account (PDA)
    /// 2. `[writable]` Ledger account (PDA)
    /// 3. `[]` Operator wallet
    /// 4. `[]` Operations wallet
    /// 5. `[]` Treasury wallet
    /// 6. `[]` Recovery wallet
    /// 7. `[]` Randomness authority
    /// 8. `[]` Price feed
    /// 9. `[]` The system program
    InitializeConfig { params: ConfigParams },

    /// Hand the admin role to another key
    ///
    /// Accounts expected:
    /// 0. `[signer]` Current admin
    /// 1. `[writable]` Config account
    /// 2. `[]` New admin
    UpdateAdmin,

    /// Accounts expected:
    /// 0. `[signer]` Admin
    /// 1. `[writable]` Config account
    UpdateTicketPrice {
        /// USD with 6 decimals
        ticket_price_usd: u64,
    },

    /// Accounts expected:
    /// 0. `[signer]` Admin
    /// 1. `[writable]` Config account
    UpdateTierWeights { tier_weights: [u64; TIER_COUNT] },

    /// Accounts expected:
    /// 0. `[signer]` Admin
    /// 1. `[writable]` Config account
    /// 2. `[]` Price feed to use from now on
    UpdateOracleSettings {
        max_price_age: i64,
        stale_price_policy: u8,
        max_compute_unit_price: u64,
    },

    /// Split an inbound payment between the immediate wallets and the vault
    ///
    /// Accounts expected:
    /// 0. `[signer, writable]` Payer
    /// 1. `[]` Config account
    /// 2. `[writable]` Ledger account
    /// 3. `[writable]` Operator wallet
    /// 4. `[writable]` Operations wallet
    /// 5. `[]` The system program
    Receive { amount: u64 },

    /// Move the pool reserve into the tier accumulators. Anyone may call.
    ///
    /// Accounts expected:
    /// 0. `[]` Config account
    /// 1. `[writable]` Ledger account
    DistributePool,

    /// Accounts expected:
    /// 0. `[signer, writable]` Owner, pays for the participant account
    /// 1. `[writable]` Participant account (PDA)
    /// 2. `[writable]` Ledger account
    /// 3. `[]` The system program
    RegisterParticipant,

    /// Settle the member's pending reward, then move it to `new_tier` (admin only).
    /// Registers the member first when needed.
    ///
    /// Accounts expected:
    /// 0. `[signer, writable]` Admin
    /// 1. `[]` Config account
    /// 2. `[writable]` Ledger account
    /// 3. `[writable]` Participant account (PDA)
    /// 4. `[writable]` Member wallet, receives the settled reward
    /// 5. `[]` The system program
    UpdateTier { new_tier: u8 },

    /// Accounts expected:
    /// 0. `[signer, writable]` Owner
    /// 1. `[writable]` Participant account
    /// 2. `[writable]` Ledger account
    ClaimRewards,

    /// Send everything above the reserved funds to the recovery wallet
    ///
    /// Accounts expected:
    /// 0. `[signer]` Admin
    /// 1. `[]` Config account
    /// 2. `[writable]` Ledger account
    /// 3. `[writable]` Recovery wallet
    EmergencySweep,

    /// Accounts expected:
    /// 0. `[signer]` Admin
    /// 1. `[]` Config account
    /// 2. `[writable]` Ledger account
    /// 3. `[writable]` Treasury wallet
    WithdrawTreasury { amount: u64 },

    /// Create a raffle and escrow its prize
    ///
    /// Accounts expected:
    /// 0. `[signer, writable]` Admin, pays the prize and the accounts
    /// 1. `[writable]` Config account
    /// 2. `[writable]` Raffle account (PDA for the next raffle index)
    /// 3. `[writable]` Ticket book account (PDA)
    /// 4. `[]` The system program
    CreateRaffle {
        /// Title of the raffle (max 32 chars)
        title: [u8; 32],
        start_time: i64,
        end_time: i64,
        total_tickets: u64,
        prize_amount: u64,
    },

    /// Accounts expected:
    /// 0. `[signer, writable]` Buyer
    /// 1. `[]` Config account
    /// 2. `[writable]` Raffle account
    /// 3. `[writable]` Ticket book account
    /// 4. `[writable]` Ledger account
    /// 5. `[writable]` Operator wallet
    /// 6. `[writable]` Operations wallet
    /// 7. `[]` Price feed
    /// 8. `[]` Instructions sysvar
    /// 9. `[]` The system program
    BuyTickets {
        count: u64,
        /// Lamports the buyer agrees to pay; must equal the quoted total
        payment: u64,
    },

    /// Accounts expected:
    /// 0. `[writable, signer]` Admin, pays for ticket book growth
    /// 1. `[]` Config account
    /// 2. `[writable]` Raffle account
    /// 3. `[writable]` Ticket book account
    /// 4. `[]` Recipient
    /// 5. `[]` System program
    GrantFreeTickets { count: u64 },

    /// Accounts expected:
    /// 0. `[signer]` Any user; only the creator or admin before the end time
    /// 1. `[]` Config account
    /// 2. `[writable]` Raffle account
    CloseRaffle,

    /// Accounts expected:
    /// 0. `[signer, writable]` Any user, pays for the request account
    /// 1. `[writable]` Config account
    /// 2. `[writable]` Raffle account
    /// 3. `[writable]` Randomness request account (PDA for the next request id)
    /// 4. `[]` The system program
    RequestWinner,

    /// Must directly follow an Ed25519 verify instruction in which the
    /// randomness authority signs the request seed; `randomness` is the hash
    /// of that signature.
    ///
    /// Accounts expected:
    /// 0. `[signer]` Randomness authority
    /// 1. `[]` Config account
    /// 2. `[writable]` Raffle account
    /// 3. `[]` Ticket book account
    /// 4. `[writable]` Randomness request account
    /// 5. `[]` Instructions sysvar
    FulfillRandomness {
        request_id: u64,
        randomness: [u8; 32],
    },

    /// Accounts expected:
    /// 0. `[signer, writable]` Winner
    /// 1. `[writable]` Raffle account
    ClaimPrize,

    /// Replace a winner whose claim window lapsed. Anyone may call.
    ///
    /// Accounts expected:
    /// 0. `[signer, writable]` Any user, pays for the request account
    /// 1. `[writable]` Config account
    /// 2. `[writable]` Raffle account
    /// 3. `[writable]` Ticket book account
    /// 4. `[writable]` Randomness request account (PDA for the next request id)
    /// 5. `[]` The system program
    RerollWinner,

    /// Accounts expected:
    /// 0. `[signer]` Creator or admin
    /// 1. `[]` Config account
    /// 2. `[writable]` Raffle account
    /// 3. `[writable]` Creator wallet, receives the prize back
    CancelRaffle,

    /// Accounts expected:
    /// 0. `[signer]` Admin
    /// 1. `[]` Config account
    /// 2. `[writable]` Raffle account
    /// 3. `[writable]` Recovery wallet
    RecoverRaffleSurplus,
}

impl SettlementInstruction {
    pub fn unpack(input: &[u8]) -> Result<Self, ProgramError> {
        Self::try_from_slice(input).map_err(|_| ProgramError::InvalidInstructionData)
    }

    pub fn pack(&self) -> Result<Vec<u8>, ProgramError> {
        self.try_to_vec()
            .map_err(|e| ProgramError::BorshIoError(e.to_string()))
    }
}

fn build(
    program_id: &Pubkey,
    accounts: Vec<AccountMeta>,
    instruction: SettlementInstruction,
) -> Result<Instruction, ProgramError> {
    Ok(Instruction {
        program_id: *program_id,
        accounts,
        data: instruction.pack()?,
    })
}

/// Wallets and authorities named at initialization
#[derive(Clone, Copy, Debug)]
pub struct InitializeAccounts {
    pub operator_wallet: Pubkey,
    pub operations_wallet: Pubkey,
    pub treasury_wallet: Pubkey,
    pub recovery_wallet: Pubkey,
    pub randomness_authority: Pubkey,
    pub price_feed: Pubkey,
}

pub fn initialize_config(
    program_id: &Pubkey,
    admin: &Pubkey,
    wallets: &InitializeAccounts,
    params: ConfigParams,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new(*admin, true),
        AccountMeta::new(find_config_address(program_id).0, false),
        AccountMeta::new(find_ledger_address(program_id).0, false),
        AccountMeta::new_readonly(wallets.operator_wallet, false),
        AccountMeta::new_readonly(wallets.operations_wallet, false),
        AccountMeta::new_readonly(wallets.treasury_wallet, false),
        AccountMeta::new_readonly(wallets.recovery_wallet, false),
        AccountMeta::new_readonly(wallets.randomness_authority, false),
        AccountMeta::new_readonly(wallets.price_feed, false),
        AccountMeta::new_readonly(system_program::id(), false),
    ];
    build(program_id, accounts, SettlementInstruction::InitializeConfig { params })
}

pub fn update_admin(
    program_id: &Pubkey,
    admin: &Pubkey,
    new_admin: &Pubkey,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new_readonly(*admin, true),
        AccountMeta::new(find_config_address(program_id).0, false),
        AccountMeta::new_readonly(*new_admin, false),
    ];
    build(program_id, accounts, SettlementInstruction::UpdateAdmin)
}

pub fn update_ticket_price(
    program_id: &Pubkey,
    admin: &Pubkey,
    ticket_price_usd: u64,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new_readonly(*admin, true),
        AccountMeta::new(find_config_address(program_id).0, false),
    ];
    build(
        program_id,
        accounts,
        SettlementInstruction::UpdateTicketPrice { ticket_price_usd },
    )
}

pub fn update_tier_weights(
    program_id: &Pubkey,
    admin: &Pubkey,
    tier_weights: [u64; TIER_COUNT],
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new_readonly(*admin, true),
        AccountMeta::new(find_config_address(program_id).0, false),
    ];
    build(
        program_id,
        accounts,
        SettlementInstruction::UpdateTierWeights { tier_weights },
    )
}

pub fn update_oracle_settings(
    program_id: &Pubkey,
    admin: &Pubkey,
    price_feed: &Pubkey,
    max_price_age: i64,
    stale_price_policy: u8,
    max_compute_unit_price: u64,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new_readonly(*admin, true),
        AccountMeta::new(find_config_address(program_id).0, false),
        AccountMeta::new_readonly(*price_feed, false),
    ];
    build(
        program_id,
        accounts,
        SettlementInstruction::UpdateOracleSettings {
            max_price_age,
            stale_price_policy,
            max_compute_unit_price,
        },
    )
}

pub fn receive(
    program_id: &Pubkey,
    payer: &Pubkey,
    operator_wallet: &Pubkey,
    operations_wallet: &Pubkey,
    amount: u64,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new(*payer, true),
        AccountMeta::new_readonly(find_config_address(program_id).0, false),
        AccountMeta::new(find_ledger_address(program_id).0, false),
        AccountMeta::new(*operator_wallet, false),
        AccountMeta::new(*operations_wallet, false),
        AccountMeta::new_readonly(system_program::id(), false),
    ];
    build(program_id, accounts, SettlementInstruction::Receive { amount })
}

pub fn distribute_pool(program_id: &Pubkey) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new_readonly(find_config_address(program_id).0, false),
        AccountMeta::new(find_ledger_address(program_id).0, false),
    ];
    build(program_id, accounts, SettlementInstruction::DistributePool)
}

pub fn register_participant(
    program_id: &Pubkey,
    owner: &Pubkey,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new(*owner, true),
        AccountMeta::new(find_participant_address(program_id, owner).0, false),
        AccountMeta::new(find_ledger_address(program_id).0, false),
        AccountMeta::new_readonly(system_program::id(), false),
    ];
    build(program_id, accounts, SettlementInstruction::RegisterParticipant)
}

pub fn update_tier(
    program_id: &Pubkey,
    admin: &Pubkey,
    member: &Pubkey,
    new_tier: Tier,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new(*admin, true),
        AccountMeta::new_readonly(find_config_address(program_id).0, false),
        AccountMeta::new(find_ledger_address(program_id).0, false),
        AccountMeta::new(find_participant_address(program_id, member).0, false),
        AccountMeta::new(*member, false),
        AccountMeta::new_readonly(system_program::id(), false),
    ];
    build(
        program_id,
        accounts,
        SettlementInstruction::UpdateTier {
            new_tier: new_tier.into(),
        },
    )
}

pub fn claim_rewards(program_id: &Pubkey, owner: &Pubkey) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new(*owner, true),
        AccountMeta::new(find_participant_address(program_id, owner).0, false),
        AccountMeta::new(find_ledger_address(program_id).0, false),
    ];
    build(program_id, accounts, SettlementInstruction::ClaimRewards)
}

pub fn emergency_sweep(
    program_id: &Pubkey,
    admin: &Pubkey,
    recovery_wallet: &Pubkey,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new_readonly(*admin, true),
        AccountMeta::new_readonly(find_config_address(program_id).0, false),
        AccountMeta::new(find_ledger_address(program_id).0, false),
        AccountMeta::new(*recovery_wallet, false),
    ];
    build(program_id, accounts, SettlementInstruction::EmergencySweep)
}

pub fn withdraw_treasury(
    program_id: &Pubkey,
    admin: &Pubkey,
    treasury_wallet: &Pubkey,
    amount: u64,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new_readonly(*admin, true),
        AccountMeta::new_readonly(find_config_address(program_id).0, false),
        AccountMeta::new(find_ledger_address(program_id).0, false),
        AccountMeta::new(*treasury_wallet, false),
    ];
    build(
        program_id,
        accounts,
        SettlementInstruction::WithdrawTreasury { amount },
    )
}

#[allow(clippy::too_many_arguments)]
pub fn create_raffle(
    program_id: &Pubkey,
    admin: &Pubkey,
    raffle_index: u64,
    title: [u8; 32],
    start_time: i64,
    end_time: i64,
    total_tickets: u64,
    prize_amount: u64,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new(*admin, true),
        AccountMeta::new(find_config_address(program_id).0, false),
        AccountMeta::new(find_raffle_address(program_id, raffle_index).0, false),
        AccountMeta::new(find_ticket_book_address(program_id, raffle_index).0, false),
        AccountMeta::new_readonly(system_program::id(), false),
    ];
    build(
        program_id,
        accounts,
        SettlementInstruction::CreateRaffle {
            title,
            start_time,
            end_time,
            total_tickets,
            prize_amount,
        },
    )
}

/// Revenue wallets and price feed a ticket purchase touches
#[derive(Clone, Copy, Debug)]
pub struct PurchaseAccounts {
    pub operator_wallet: Pubkey,
    pub operations_wallet: Pubkey,
    pub price_feed: Pubkey,
}

pub fn buy_tickets(
    program_id: &Pubkey,
    buyer: &Pubkey,
    raffle_index: u64,
    purchase: &PurchaseAccounts,
    count: u64,
    payment: u64,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new(*buyer, true),
        AccountMeta::new_readonly(find_config_address(program_id).0, false),
        AccountMeta::new(find_raffle_address(program_id, raffle_index).0, false),
        AccountMeta::new(find_ticket_book_address(program_id, raffle_index).0, false),
        AccountMeta::new(find_ledger_address(program_id).0, false),
        AccountMeta::new(purchase.operator_wallet, false),
        AccountMeta::new(purchase.operations_wallet, false),
        AccountMeta::new_readonly(purchase.price_feed, false),
        AccountMeta::new_readonly(sysvar::instructions::id(), false),
        AccountMeta::new_readonly(system_program::id(), false),
    ];
    build(
        program_id,
        accounts,
        SettlementInstruction::BuyTickets { count, payment },
    )
}

pub fn grant_free_tickets(
    program_id: &Pubkey,
    admin: &Pubkey,
    raffle_index: u64,
    recipient: &Pubkey,
    count: u64,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new(*admin, true),
        AccountMeta::new_readonly(find_config_address(program_id).0, false),
        AccountMeta::new(find_raffle_address(program_id, raffle_index).0, false),
        AccountMeta::new(find_ticket_book_address(program_id, raffle_index).0, false),
        AccountMeta::new_readonly(*recipient, false),
        AccountMeta::new_readonly(system_program::id(), false),
    ];
    build(
        program_id,
        accounts,
        SettlementInstruction::GrantFreeTickets { count },
    )
}

pub fn close_raffle(
    program_id: &Pubkey,
    caller: &Pubkey,
    raffle_index: u64,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new_readonly(*caller, true),
        AccountMeta::new_readonly(find_config_address(program_id).0, false),
        AccountMeta::new(find_raffle_address(program_id, raffle_index).0, false),
    ];
    build(program_id, accounts, SettlementInstruction::CloseRaffle)
}

pub fn request_winner(
    program_id: &Pubkey,
    requester: &Pubkey,
    raffle_index: u64,
    request_id: u64,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new(*requester, true),
        AccountMeta::new(find_config_address(program_id).0, false),
        AccountMeta::new(find_raffle_address(program_id, raffle_index).0, false),
        AccountMeta::new(find_request_address(program_id, request_id).0, false),
        AccountMeta::new_readonly(system_program::id(), false),
    ];
    build(program_id, accounts, SettlementInstruction::RequestWinner)
}

pub fn fulfill_randomness(
    program_id: &Pubkey,
    randomness_authority: &Pubkey,
    raffle_index: u64,
    request_id: u64,
    randomness: [u8; 32],
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new_readonly(*randomness_authority, true),
        AccountMeta::new_readonly(find_config_address(program_id).0, false),
        AccountMeta::new(find_raffle_address(program_id, raffle_index).0, false),
        AccountMeta::new_readonly(find_ticket_book_address(program_id, raffle_index).0, false),
        AccountMeta::new(find_request_address(program_id, request_id).0, false),
        AccountMeta::new_readonly(sysvar::instructions::id(), false),
    ];
    build(
        program_id,
        accounts,
        SettlementInstruction::FulfillRandomness {
            request_id,
            randomness,
        },
    )
}

/// Ed25519 verify instruction proving `signature` is `authority`'s signature
/// over a request seed. Send it immediately before `fulfill_randomness`.
pub fn randomness_proof(
    authority: &Pubkey,
    signature: [u8; SIGNATURE_LEN],
    seed: [u8; 32],
) -> Instruction {
    let proof = SignedSeed {
        signer: *authority,
        signature,
        message: seed.to_vec(),
    };
    Instruction {
        program_id: ED25519_PROGRAM_ID,
        accounts: vec![],
        data: proof.to_instruction_data(),
    }
}

pub fn claim_prize(
    program_id: &Pubkey,
    winner: &Pubkey,
    raffle_index: u64,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new(*winner, true),
        AccountMeta::new(find_raffle_address(program_id, raffle_index).0, false),
    ];
    build(program_id, accounts, SettlementInstruction::ClaimPrize)
}

pub fn reroll_winner(
    program_id: &Pubkey,
    caller: &Pubkey,
    raffle_index: u64,
    next_request_id: u64,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new(*caller, true),
        AccountMeta::new(find_config_address(program_id).0, false),
        AccountMeta::new(find_raffle_address(program_id, raffle_index).0, false),
        AccountMeta::new(find_ticket_book_address(program_id, raffle_index).0, false),
        AccountMeta::new(find_request_address(program_id, next_request_id).0, false),
        AccountMeta::new_readonly(system_program::id(), false),
    ];
    build(program_id, accounts, SettlementInstruction::RerollWinner)
}

pub fn cancel_raffle(
    program_id: &Pubkey,
    caller: &Pubkey,
    raffle_index: u64,
    creator: &Pubkey,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new_readonly(*caller, true),
        AccountMeta::new_readonly(find_config_address(program_id).0, false),
        AccountMeta::new(find_raffle_address(program_id, raffle_index).0, false),
        AccountMeta::new(*creator, false),
    ];
    build(program_id, accounts, SettlementInstruction::CancelRaffle)
}

pub fn recover_raffle_surplus(
    program_id: &Pubkey,
    admin: &Pubkey,
    raffle_index: u64,
    recovery_wallet: &Pubkey,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new_readonly(*admin, true),
        AccountMeta::new_readonly(find_config_address(program_id).0, false),
        AccountMeta::new(find_raffle_address(program_id, raffle_index).0, false),
        AccountMeta::new(*recovery_wallet, false),
    ];
    build(program_id, accounts, SettlementInstruction::RecoverRaffleSurplus)
}
