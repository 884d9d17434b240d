use solana_program::{
    account_info::{next_account_info, AccountInfo},
    clock::Clock,
    entrypoint::ProgramResult,
    msg,
    program_error::ProgramError,
    program_pack::{IsInitialized, Pack},
    pubkey::Pubkey,
    rent::Rent,
    sysvar::{
        self,
        instructions::{load_current_index_checked, load_instruction_at_checked},
        Sysvar,
    },
};
use std::convert::TryFrom;

use crate::{
    error::SettlementError,
    guard,
    instruction::SettlementInstruction,
    ledger::{RevenueLedger, RevenueSplit},
    price,
    raffle::{Raffle, RerollOutcome, TicketBook, INITIAL_TICKET_RANGES},
    state::{Config, ConfigAuthorities, ConfigParams},
    tier::{Participant, Tier, TIER_COUNT},
    utils::{
        assert_address, assert_owned_by, assert_signer, check_congestion, create_pda_account,
        find_config_address, find_ledger_address, find_participant_address, find_raffle_address,
        find_request_address, find_ticket_book_address, grow_program_account,
        transfer_from_program_account,
        transfer_from_wallet, CONFIG_SEED, LEDGER_SEED, PARTICIPANT_SEED, RAFFLE_SEED,
        REQUEST_SEED, TICKETS_SEED,
    },
    vrf::{RandomnessRequest, SignedSeed},
};

pub struct Processor;

impl Processor {
    pub fn process(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = SettlementInstruction::unpack(instruction_data)?;

        match instruction {
            SettlementInstruction::InitializeConfig { params } => {
                msg!("Instruction: Initialize Config");
                Self::process_initialize_config(program_id, accounts, params)
            }
            SettlementInstruction::UpdateAdmin => {
                msg!("Instruction: Update Admin");
                Self::process_update_admin(program_id, accounts)
            }
            SettlementInstruction::UpdateTicketPrice { ticket_price_usd } => {
                msg!("Instruction: Update Ticket Price");
                Self::process_update_ticket_price(program_id, accounts, ticket_price_usd)
            }
            SettlementInstruction::UpdateTierWeights { tier_weights } => {
                msg!("Instruction: Update Tier Weights");
                Self::process_update_tier_weights(program_id, accounts, tier_weights)
            }
            SettlementInstruction::UpdateOracleSettings {
                max_price_age,
                stale_price_policy,
                max_compute_unit_price,
            } => {
                msg!("Instruction: Update Oracle Settings");
                Self::process_update_oracle_settings(
                    program_id,
                    accounts,
                    max_price_age,
                    stale_price_policy,
                    max_compute_unit_price,
                )
            }
            SettlementInstruction::Receive { amount } => {
                msg!("Instruction: Receive");
                Self::process_receive(program_id, accounts, amount)
            }
            SettlementInstruction::DistributePool => {
                msg!("Instruction: Distribute Pool");
                Self::process_distribute_pool(program_id, accounts)
            }
            SettlementInstruction::RegisterParticipant => {
                msg!("Instruction: Register Participant");
                Self::process_register_participant(program_id, accounts)
            }
            SettlementInstruction::UpdateTier { new_tier } => {
                msg!("Instruction: Update Tier");
                Self::process_update_tier(program_id, accounts, new_tier)
            }
            SettlementInstruction::ClaimRewards => {
                msg!("Instruction: Claim Rewards");
                Self::process_claim_rewards(program_id, accounts)
            }
            SettlementInstruction::EmergencySweep => {
                msg!("Instruction: Emergency Sweep");
                Self::process_emergency_sweep(program_id, accounts)
            }
            SettlementInstruction::WithdrawTreasury { amount } => {
                msg!("Instruction: Withdraw Treasury");
                Self::process_withdraw_treasury(program_id, accounts, amount)
            }
            SettlementInstruction::CreateRaffle {
                title,
                start_time,
                end_time,
                total_tickets,
                prize_amount,
            } => {
                msg!("Instruction: Create Raffle");
                Self::process_create_raffle(
                    program_id,
                    accounts,
                    title,
                    start_time,
                    end_time,
                    total_tickets,
                    prize_amount,
                )
            }
            SettlementInstruction::BuyTickets { count, payment } => {
                msg!("Instruction: Buy Tickets");
                Self::process_buy_tickets(program_id, accounts, count, payment)
            }
            SettlementInstruction::GrantFreeTickets { count } => {
                msg!("Instruction: Grant Free Tickets");
                Self::process_grant_free_tickets(program_id, accounts, count)
            }
            SettlementInstruction::CloseRaffle => {
                msg!("Instruction: Close Raffle");
                Self::process_close_raffle(program_id, accounts)
            }
            SettlementInstruction::RequestWinner => {
                msg!("Instruction: Request Winner");
                Self::process_request_winner(program_id, accounts)
            }
            SettlementInstruction::FulfillRandomness {
                request_id,
                randomness,
            } => {
                msg!("Instruction: Fulfill Randomness");
                Self::process_fulfill_randomness(program_id, accounts, request_id, randomness)
            }
            SettlementInstruction::ClaimPrize => {
                msg!("Instruction: Claim Prize");
                Self::process_claim_prize(program_id, accounts)
            }
            SettlementInstruction::RerollWinner => {
                msg!("Instruction: Reroll Winner");
                Self::process_reroll_winner(program_id, accounts)
            }
            SettlementInstruction::CancelRaffle => {
                msg!("Instruction: Cancel Raffle");
                Self::process_cancel_raffle(program_id, accounts)
            }
            SettlementInstruction::RecoverRaffleSurplus => {
                msg!("Instruction: Recover Raffle Surplus");
                Self::process_recover_raffle_surplus(program_id, accounts)
            }
        }
    }

    /// Unpack an initialized program account of type `T`
    fn load<T: Pack + IsInitialized>(
        program_id: &Pubkey,
        info: &AccountInfo,
        name: &str,
    ) -> Result<T, ProgramError> {
        assert_owned_by(info, program_id, name)?;
        let data = T::unpack_unchecked(&info.data.borrow())?;
        if !data.is_initialized() {
            msg!("{} account is not initialized", name);
            return Err(SettlementError::NotInitialized.into());
        }
        Ok(data)
    }

    fn load_config(program_id: &Pubkey, config_info: &AccountInfo) -> Result<Config, ProgramError> {
        assert_address(config_info, &find_config_address(program_id).0, "config")?;
        Self::load(program_id, config_info, "Config")
    }

    fn load_ledger(
        program_id: &Pubkey,
        ledger_info: &AccountInfo,
    ) -> Result<RevenueLedger, ProgramError> {
        assert_address(ledger_info, &find_ledger_address(program_id).0, "ledger")?;
        Self::load(program_id, ledger_info, "Ledger")
    }

    /// Ticket book belonging to `raffle_info`
    fn load_ticket_book(
        program_id: &Pubkey,
        book_info: &AccountInfo,
        raffle_info: &AccountInfo,
    ) -> Result<TicketBook, ProgramError> {
        assert_owned_by(book_info, program_id, "Ticket book")?;
        let book = TicketBook::unpack(&book_info.data.borrow())?;
        if !book.is_initialized() {
            msg!("Ticket book account is not initialized");
            return Err(SettlementError::NotInitialized.into());
        }
        if book.raffle != *raffle_info.key {
            msg!("Ticket book does not belong to raffle {}", raffle_info.key);
            return Err(SettlementError::AccountMismatch.into());
        }
        Ok(book)
    }

    /// Write `book` back, growing its account at `payer`'s expense when a new
    /// range no longer fits
    fn store_ticket_book<'a>(
        book: &TicketBook,
        book_info: &AccountInfo<'a>,
        payer_info: &AccountInfo<'a>,
        system_program_info: &AccountInfo<'a>,
    ) -> ProgramResult {
        let new_len = book.required_space(book_info.data_len());
        if new_len > book_info.data_len() {
            msg!("Ticket book grows to {} bytes", new_len);
            grow_program_account(payer_info, book_info, system_program_info, new_len)?;
        }
        book.pack(&mut book_info.data.borrow_mut())
    }

    fn require_admin(config: &Config, admin_info: &AccountInfo) -> ProgramResult {
        assert_signer(admin_info, "Admin")?;
        if config.admin != *admin_info.key {
            msg!("Only the admin can perform this action");
            return Err(SettlementError::Unauthorized.into());
        }
        Ok(())
    }

    /// Ledger post-conditions ahead of an outflow of `outflow` lamports
    fn check_vault(ledger: &RevenueLedger, ledger_info: &AccountInfo, outflow: u64) -> ProgramResult {
        ledger.ensure_conserved()?;
        let rent = Rent::get()?;
        let remaining = guard::available_balance(ledger_info, &rent)
            .checked_sub(outflow)
            .ok_or(SettlementError::ConservationViolation)?;
        guard::ensure_solvent(remaining, ledger.reserved())?;
        Ok(())
    }

    /// Split `amount` paid by `payer`: the immediate shares go straight to the
    /// operator and operations wallets, the rest into the ledger vault
    #[allow(clippy::too_many_arguments)]
    fn route_revenue<'a>(
        program_id: &Pubkey,
        config: &Config,
        payer_info: &AccountInfo<'a>,
        ledger_info: &AccountInfo<'a>,
        operator_info: &AccountInfo<'a>,
        operations_info: &AccountInfo<'a>,
        system_program_info: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<RevenueSplit, ProgramError> {
        assert_address(operator_info, &config.operator_wallet, "operator wallet")?;
        assert_address(operations_info, &config.operations_wallet, "operations wallet")?;

        let mut ledger = Self::load_ledger(program_id, ledger_info)?;
        let split = ledger.receive(
            amount,
            config.operator_bps,
            config.operations_bps,
            config.pool_bps,
        )?;
        ledger.ensure_conserved()?;
        RevenueLedger::pack(ledger, &mut ledger_info.data.borrow_mut())?;

        transfer_from_wallet(payer_info, operator_info, system_program_info, split.operator)?;
        transfer_from_wallet(payer_info, operations_info, system_program_info, split.operations)?;
        transfer_from_wallet(payer_info, ledger_info, system_program_info, split.retained())?;

        msg!(
            "Revenue {}: operator={}, operations={}, pool={}, treasury={}",
            split.total,
            split.operator,
            split.operations,
            split.pool,
            split.treasury
        );
        Ok(split)
    }

    fn process_initialize_config(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        params: ConfigParams,
    ) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        let admin_info = next_account_info(account_info_iter)?;
        let config_info = next_account_info(account_info_iter)?;
        let ledger_info = next_account_info(account_info_iter)?;
        let operator_info = next_account_info(account_info_iter)?;
        let operations_info = next_account_info(account_info_iter)?;
        let treasury_info = next_account_info(account_info_iter)?;
        let recovery_info = next_account_info(account_info_iter)?;
        let randomness_authority_info = next_account_info(account_info_iter)?;
        let price_feed_info = next_account_info(account_info_iter)?;
        let system_program_info = next_account_info(account_info_iter)?;

        assert_signer(admin_info, "Admin")?;

        let (config_key, config_bump) = find_config_address(program_id);
        let (ledger_key, ledger_bump) = find_ledger_address(program_id);
        assert_address(config_info, &config_key, "config")?;
        assert_address(ledger_info, &ledger_key, "ledger")?;

        let authorities = ConfigAuthorities {
            admin: *admin_info.key,
            operator_wallet: *operator_info.key,
            operations_wallet: *operations_info.key,
            treasury_wallet: *treasury_info.key,
            recovery_wallet: *recovery_info.key,
            randomness_authority: *randomness_authority_info.key,
            price_feed: *price_feed_info.key,
        };
        let config = Config::new(config_bump, authorities, &params)?;

        create_pda_account(
            admin_info,
            config_info,
            system_program_info,
            program_id,
            Config::LEN,
            &[CONFIG_SEED, &[config_bump]],
        )?;
        create_pda_account(
            admin_info,
            ledger_info,
            system_program_info,
            program_id,
            RevenueLedger::LEN,
            &[LEDGER_SEED, &[ledger_bump]],
        )?;

        Config::pack(config, &mut config_info.data.borrow_mut())?;
        RevenueLedger::pack(RevenueLedger::new(ledger_bump), &mut ledger_info.data.borrow_mut())?;

        msg!(
            "Config initialized: Admin={}, Split={}/{}/{}, ClaimWindow={}s",
            admin_info.key,
            config.operator_bps,
            config.operations_bps,
            config.pool_bps,
            config.claim_window
        );
        Ok(())
    }

    fn process_update_admin(program_id: &Pubkey, accounts: &[AccountInfo]) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        let admin_info = next_account_info(account_info_iter)?;
        let config_info = next_account_info(account_info_iter)?;
        let new_admin_info = next_account_info(account_info_iter)?;

        let mut config = Self::load_config(program_id, config_info)?;
        Self::require_admin(&config, admin_info)?;

        config.admin = *new_admin_info.key;
        Config::pack(config, &mut config_info.data.borrow_mut())?;

        msg!("Admin updated to: {}", new_admin_info.key);
        Ok(())
    }

    fn process_update_ticket_price(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        ticket_price_usd: u64,
    ) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        let admin_info = next_account_info(account_info_iter)?;
        let config_info = next_account_info(account_info_iter)?;

        let mut config = Self::load_config(program_id, config_info)?;
        Self::require_admin(&config, admin_info)?;

        if ticket_price_usd == 0 {
            msg!("Ticket price must be positive");
            return Err(ProgramError::InvalidArgument);
        }
        config.ticket_price_usd = ticket_price_usd;
        Config::pack(config, &mut config_info.data.borrow_mut())?;

        msg!("Ticket price updated to: {} micro-USD", ticket_price_usd);
        Ok(())
    }

    fn process_update_tier_weights(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        tier_weights: [u64; TIER_COUNT],
    ) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        let admin_info = next_account_info(account_info_iter)?;
        let config_info = next_account_info(account_info_iter)?;

        let mut config = Self::load_config(program_id, config_info)?;
        Self::require_admin(&config, admin_info)?;

        config.set_tier_weights(tier_weights)?;
        Config::pack(config, &mut config_info.data.borrow_mut())?;

        msg!("Tier weights updated to: {:?}", tier_weights);
        Ok(())
    }

    fn process_update_oracle_settings(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        max_price_age: i64,
        stale_price_policy: u8,
        max_compute_unit_price: u64,
    ) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        let admin_info = next_account_info(account_info_iter)?;
        let config_info = next_account_info(account_info_iter)?;
        let price_feed_info = next_account_info(account_info_iter)?;

        let mut config = Self::load_config(program_id, config_info)?;
        Self::require_admin(&config, admin_info)?;

        config.set_oracle_settings(max_price_age, stale_price_policy, max_compute_unit_price)?;
        config.price_feed = *price_feed_info.key;
        Config::pack(config, &mut config_info.data.borrow_mut())?;

        msg!(
            "Oracle settings updated: Feed={}, MaxAge={}s, Policy={:?}, MaxCuPrice={}",
            price_feed_info.key,
            max_price_age,
            config.stale_price_policy,
            max_compute_unit_price
        );
        Ok(())
    }

    fn process_receive(program_id: &Pubkey, accounts: &[AccountInfo], amount: u64) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        let payer_info = next_account_info(account_info_iter)?;
        let config_info = next_account_info(account_info_iter)?;
        let ledger_info = next_account_info(account_info_iter)?;
        let operator_info = next_account_info(account_info_iter)?;
        let operations_info = next_account_info(account_info_iter)?;
        let system_program_info = next_account_info(account_info_iter)?;

        assert_signer(payer_info, "Payer")?;
        let config = Self::load_config(program_id, config_info)?;

        Self::route_revenue(
            program_id,
            &config,
            payer_info,
            ledger_info,
            operator_info,
            operations_info,
            system_program_info,
            amount,
        )?;
        Ok(())
    }

    fn process_distribute_pool(program_id: &Pubkey, accounts: &[AccountInfo]) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        let config_info = next_account_info(account_info_iter)?;
        let ledger_info = next_account_info(account_info_iter)?;

        let config = Self::load_config(program_id, config_info)?;
        let mut ledger = Self::load_ledger(program_id, ledger_info)?;

        let distributed = ledger.distribute_pool(&config.tier_weights)?;
        if distributed == 0 {
            msg!("Nothing distributed");
            return Ok(());
        }
        ledger.ensure_conserved()?;
        RevenueLedger::pack(ledger, &mut ledger_info.data.borrow_mut())?;

        msg!(
            "Distributed {} lamports, accumulators: {:?}",
            distributed,
            ledger.acc_reward_per_share
        );
        Ok(())
    }

    fn process_register_participant(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
    ) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        let owner_info = next_account_info(account_info_iter)?;
        let participant_info = next_account_info(account_info_iter)?;
        let ledger_info = next_account_info(account_info_iter)?;
        let system_program_info = next_account_info(account_info_iter)?;

        assert_signer(owner_info, "Owner")?;
        let mut ledger = Self::load_ledger(program_id, ledger_info)?;

        Self::register(
            program_id,
            &mut ledger,
            owner_info,
            owner_info,
            participant_info,
            system_program_info,
        )?;
        RevenueLedger::pack(ledger, &mut ledger_info.data.borrow_mut())?;
        Ok(())
    }

    /// Create and enroll the participant account of `owner_info`
    fn register<'a>(
        program_id: &Pubkey,
        ledger: &mut RevenueLedger,
        payer_info: &AccountInfo<'a>,
        owner_info: &AccountInfo<'a>,
        participant_info: &AccountInfo<'a>,
        system_program_info: &AccountInfo<'a>,
    ) -> Result<Participant, ProgramError> {
        let (participant_key, bump) = find_participant_address(program_id, owner_info.key);
        assert_address(participant_info, &participant_key, "participant")?;

        let participant = ledger.register(*owner_info.key, bump)?;
        create_pda_account(
            payer_info,
            participant_info,
            system_program_info,
            program_id,
            Participant::LEN,
            &[PARTICIPANT_SEED, owner_info.key.as_ref(), &[bump]],
        )?;
        Participant::pack(participant, &mut participant_info.data.borrow_mut())?;

        msg!("Participant registered: {}", owner_info.key);
        Ok(participant)
    }

    fn process_update_tier(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        new_tier: u8,
    ) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        let admin_info = next_account_info(account_info_iter)?;
        let config_info = next_account_info(account_info_iter)?;
        let ledger_info = next_account_info(account_info_iter)?;
        let participant_info = next_account_info(account_info_iter)?;
        let member_info = next_account_info(account_info_iter)?;
        let system_program_info = next_account_info(account_info_iter)?;

        let config = Self::load_config(program_id, config_info)?;
        Self::require_admin(&config, admin_info)?;
        let new_tier = Tier::try_from(new_tier)?;

        let mut ledger = Self::load_ledger(program_id, ledger_info)?;
        let mut participant = if participant_info.owner == program_id {
            Self::load::<Participant>(program_id, participant_info, "Participant")?
        } else {
            Self::register(
                program_id,
                &mut ledger,
                admin_info,
                member_info,
                participant_info,
                system_program_info,
            )?
        };
        if participant.owner != *member_info.key {
            msg!("Participant record does not belong to {}", member_info.key);
            return Err(SettlementError::AccountMismatch.into());
        }

        let old_tier = participant.tier;
        let payout = ledger.update_tier(&mut participant, new_tier)?;
        Self::check_vault(&ledger, ledger_info, payout)?;

        RevenueLedger::pack(ledger, &mut ledger_info.data.borrow_mut())?;
        Participant::pack(participant, &mut participant_info.data.borrow_mut())?;
        if payout > 0 {
            transfer_from_program_account(ledger_info, member_info, payout)?;
        }

        msg!(
            "Tier of {} changed {:?} -> {:?}, settled {}",
            member_info.key,
            old_tier,
            new_tier,
            payout
        );
        Ok(())
    }

    fn process_claim_rewards(program_id: &Pubkey, accounts: &[AccountInfo]) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        let owner_info = next_account_info(account_info_iter)?;
        let participant_info = next_account_info(account_info_iter)?;
        let ledger_info = next_account_info(account_info_iter)?;

        assert_signer(owner_info, "Owner")?;
        let mut participant: Participant = Self::load(program_id, participant_info, "Participant")?;
        if participant.owner != *owner_info.key {
            msg!("Only the participant can claim its rewards");
            return Err(SettlementError::Unauthorized.into());
        }
        let mut ledger = Self::load_ledger(program_id, ledger_info)?;

        let amount = ledger.claim(&mut participant)?;
        Self::check_vault(&ledger, ledger_info, amount)?;

        RevenueLedger::pack(ledger, &mut ledger_info.data.borrow_mut())?;
        Participant::pack(participant, &mut participant_info.data.borrow_mut())?;
        transfer_from_program_account(ledger_info, owner_info, amount)?;

        msg!("Rewards claimed: {} by {}", amount, owner_info.key);
        Ok(())
    }

    fn process_emergency_sweep(program_id: &Pubkey, accounts: &[AccountInfo]) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        let admin_info = next_account_info(account_info_iter)?;
        let config_info = next_account_info(account_info_iter)?;
        let ledger_info = next_account_info(account_info_iter)?;
        let recovery_info = next_account_info(account_info_iter)?;

        let config = Self::load_config(program_id, config_info)?;
        Self::require_admin(&config, admin_info)?;
        assert_address(recovery_info, &config.recovery_wallet, "recovery wallet")?;
        let mut ledger = Self::load_ledger(program_id, ledger_info)?;

        let rent = Rent::get()?;
        let available = guard::available_balance(ledger_info, &rent);
        let amount = ledger.sweep(available)?;
        if amount == 0 {
            msg!("Nothing to sweep: available {}, reserved {}", available, ledger.reserved());
            return Ok(());
        }
        Self::check_vault(&ledger, ledger_info, amount)?;

        RevenueLedger::pack(ledger, &mut ledger_info.data.borrow_mut())?;
        transfer_from_program_account(ledger_info, recovery_info, amount)?;

        msg!("Swept {} lamports to {}", amount, recovery_info.key);
        Ok(())
    }

    fn process_withdraw_treasury(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        amount: u64,
    ) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        let admin_info = next_account_info(account_info_iter)?;
        let config_info = next_account_info(account_info_iter)?;
        let ledger_info = next_account_info(account_info_iter)?;
        let treasury_info = next_account_info(account_info_iter)?;

        let config = Self::load_config(program_id, config_info)?;
        Self::require_admin(&config, admin_info)?;
        assert_address(treasury_info, &config.treasury_wallet, "treasury wallet")?;
        let mut ledger = Self::load_ledger(program_id, ledger_info)?;

        let rent = Rent::get()?;
        let available = guard::available_balance(ledger_info, &rent);
        let amount = ledger.withdraw_treasury(amount, available)?;
        Self::check_vault(&ledger, ledger_info, amount)?;

        RevenueLedger::pack(ledger, &mut ledger_info.data.borrow_mut())?;
        transfer_from_program_account(ledger_info, treasury_info, amount)?;

        msg!("Treasury withdrawal: {} to {}", amount, treasury_info.key);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn process_create_raffle(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        title: [u8; 32],
        start_time: i64,
        end_time: i64,
        total_tickets: u64,
        prize_amount: u64,
    ) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        let admin_info = next_account_info(account_info_iter)?;
        let config_info = next_account_info(account_info_iter)?;
        let raffle_info = next_account_info(account_info_iter)?;
        let book_info = next_account_info(account_info_iter)?;
        let system_program_info = next_account_info(account_info_iter)?;

        let mut config = Self::load_config(program_id, config_info)?;
        Self::require_admin(&config, admin_info)?;
        if prize_amount == 0 {
            msg!("Prize must be positive");
            return Err(ProgramError::InvalidArgument);
        }

        let raffle_index = config.take_raffle_index()?;
        let (raffle_key, raffle_bump) = find_raffle_address(program_id, raffle_index);
        let (book_key, book_bump) = find_ticket_book_address(program_id, raffle_index);
        assert_address(raffle_info, &raffle_key, "raffle")?;
        assert_address(book_info, &book_key, "ticket book")?;

        let now = Clock::get()?.unix_timestamp;
        let raffle = Raffle::new(
            raffle_index,
            raffle_bump,
            *admin_info.key,
            title,
            start_time,
            end_time,
            total_tickets,
            prize_amount,
            now,
        )?;
        let book = TicketBook::new(raffle_key, book_bump);

        let index_bytes = raffle_index.to_le_bytes();
        create_pda_account(
            admin_info,
            raffle_info,
            system_program_info,
            program_id,
            Raffle::LEN,
            &[RAFFLE_SEED, &index_bytes, &[raffle_bump]],
        )?;
        create_pda_account(
            admin_info,
            book_info,
            system_program_info,
            program_id,
            TicketBook::space(INITIAL_TICKET_RANGES),
            &[TICKETS_SEED, &index_bytes, &[book_bump]],
        )?;

        Raffle::pack(raffle, &mut raffle_info.data.borrow_mut())?;
        book.pack(&mut book_info.data.borrow_mut())?;
        Config::pack(config, &mut config_info.data.borrow_mut())?;
        transfer_from_wallet(admin_info, raffle_info, system_program_info, prize_amount)?;

        msg!(
            "Raffle {} created: Start={}, End={}, Tickets={}, Prize={}",
            raffle_index,
            start_time,
            end_time,
            total_tickets,
            prize_amount
        );
        Ok(())
    }

    fn process_buy_tickets(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        count: u64,
        payment: u64,
    ) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        let buyer_info = next_account_info(account_info_iter)?;
        let config_info = next_account_info(account_info_iter)?;
        let raffle_info = next_account_info(account_info_iter)?;
        let book_info = next_account_info(account_info_iter)?;
        let ledger_info = next_account_info(account_info_iter)?;
        let operator_info = next_account_info(account_info_iter)?;
        let operations_info = next_account_info(account_info_iter)?;
        let price_feed_info = next_account_info(account_info_iter)?;
        let instructions_info = next_account_info(account_info_iter)?;
        let system_program_info = next_account_info(account_info_iter)?;

        assert_signer(buyer_info, "Buyer")?;
        let config = Self::load_config(program_id, config_info)?;
        let mut raffle: Raffle = Self::load(program_id, raffle_info, "Raffle")?;
        let mut book = Self::load_ticket_book(program_id, book_info, raffle_info)?;
        assert_address(price_feed_info, &config.price_feed, "price feed")?;

        check_congestion(instructions_info, config.max_compute_unit_price)?;

        let now = Clock::get()?.unix_timestamp;
        let unit_price = price::ticket_price_lamports(
            &price_feed_info.data.borrow(),
            config.ticket_price_usd,
            now,
            config.max_price_age,
            config.stale_price_policy,
        )?;
        let total = unit_price
            .checked_mul(count)
            .ok_or(SettlementError::MathOverflow)?;
        if payment != total {
            msg!("Payment {} does not match price {} x {}", payment, unit_price, count);
            return Err(SettlementError::PriceMismatch.into());
        }

        raffle.add_tickets(&mut book, *buyer_info.key, count, true, now)?;
        if raffle.tickets_sold != book.total() {
            return Err(SettlementError::ConservationViolation.into());
        }
        Raffle::pack(raffle, &mut raffle_info.data.borrow_mut())?;
        Self::store_ticket_book(&book, book_info, buyer_info, system_program_info)?;

        Self::route_revenue(
            program_id,
            &config,
            buyer_info,
            ledger_info,
            operator_info,
            operations_info,
            system_program_info,
            total,
        )?;

        msg!(
            "Tickets purchased: {} by {} for {} lamports",
            count,
            buyer_info.key,
            total
        );
        Ok(())
    }

    fn process_grant_free_tickets(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        count: u64,
    ) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        let admin_info = next_account_info(account_info_iter)?;
        let config_info = next_account_info(account_info_iter)?;
        let raffle_info = next_account_info(account_info_iter)?;
        let book_info = next_account_info(account_info_iter)?;
        let recipient_info = next_account_info(account_info_iter)?;
        let system_program_info = next_account_info(account_info_iter)?;

        let config = Self::load_config(program_id, config_info)?;
        Self::require_admin(&config, admin_info)?;
        let mut raffle: Raffle = Self::load(program_id, raffle_info, "Raffle")?;
        let mut book = Self::load_ticket_book(program_id, book_info, raffle_info)?;

        let now = Clock::get()?.unix_timestamp;
        raffle.add_tickets(&mut book, *recipient_info.key, count, false, now)?;
        if raffle.tickets_sold != book.total() {
            return Err(SettlementError::ConservationViolation.into());
        }
        Raffle::pack(raffle, &mut raffle_info.data.borrow_mut())?;
        Self::store_ticket_book(&book, book_info, admin_info, system_program_info)?;

        msg!("Free tickets granted: {} to {}", count, recipient_info.key);
        Ok(())
    }

    fn process_close_raffle(program_id: &Pubkey, accounts: &[AccountInfo]) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        let caller_info = next_account_info(account_info_iter)?;
        let config_info = next_account_info(account_info_iter)?;
        let raffle_info = next_account_info(account_info_iter)?;

        assert_signer(caller_info, "Caller")?;
        let config = Self::load_config(program_id, config_info)?;
        let mut raffle: Raffle = Self::load(program_id, raffle_info, "Raffle")?;

        let privileged = *caller_info.key == raffle.creator || *caller_info.key == config.admin;
        let now = Clock::get()?.unix_timestamp;
        raffle.close(privileged, now)?;
        Raffle::pack(raffle, &mut raffle_info.data.borrow_mut())?;

        msg!("Raffle {} closed with {} tickets", raffle.raffle_index, raffle.tickets_sold);
        Ok(())
    }

    /// Create the request account for the id just taken from the config
    fn open_randomness_request<'a>(
        program_id: &Pubkey,
        request_id: u64,
        payer_info: &AccountInfo<'a>,
        raffle_info: &AccountInfo<'a>,
        request_info: &AccountInfo<'a>,
        system_program_info: &AccountInfo<'a>,
        clock: &Clock,
    ) -> ProgramResult {
        let (request_key, request_bump) = find_request_address(program_id, request_id);
        assert_address(request_info, &request_key, "randomness request")?;

        create_pda_account(
            payer_info,
            request_info,
            system_program_info,
            program_id,
            RandomnessRequest::LEN,
            &[REQUEST_SEED, &request_id.to_le_bytes(), &[request_bump]],
        )?;
        let request = RandomnessRequest::new(
            request_id,
            request_bump,
            *raffle_info.key,
            *payer_info.key,
            clock.unix_timestamp,
            clock.slot,
        );
        RandomnessRequest::pack(request, &mut request_info.data.borrow_mut())?;

        msg!("Randomness requested: id {} for raffle {}", request_id, raffle_info.key);
        Ok(())
    }

    /// Ed25519 verify instruction placed right before this one
    fn load_randomness_proof(instructions_info: &AccountInfo) -> Result<SignedSeed, ProgramError> {
        assert_address(instructions_info, &sysvar::instructions::id(), "instructions sysvar")?;
        let current = load_current_index_checked(instructions_info)?;
        if current == 0 {
            msg!("Missing Ed25519 verify instruction");
            return Err(SettlementError::InvalidRandomnessProof.into());
        }
        let verify_ix = load_instruction_at_checked(current as usize - 1, instructions_info)?;
        Ok(SignedSeed::from_instruction(&verify_ix)?)
    }

    fn process_request_winner(program_id: &Pubkey, accounts: &[AccountInfo]) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        let requester_info = next_account_info(account_info_iter)?;
        let config_info = next_account_info(account_info_iter)?;
        let raffle_info = next_account_info(account_info_iter)?;
        let request_info = next_account_info(account_info_iter)?;
        let system_program_info = next_account_info(account_info_iter)?;

        assert_signer(requester_info, "Requester")?;
        let mut config = Self::load_config(program_id, config_info)?;
        let mut raffle: Raffle = Self::load(program_id, raffle_info, "Raffle")?;

        let clock = Clock::get()?;
        let request_id = config.take_request_id()?;
        raffle.begin_draw(request_id, clock.unix_timestamp)?;

        Self::open_randomness_request(
            program_id,
            request_id,
            requester_info,
            raffle_info,
            request_info,
            system_program_info,
            &clock,
        )?;
        Raffle::pack(raffle, &mut raffle_info.data.borrow_mut())?;
        Config::pack(config, &mut config_info.data.borrow_mut())?;
        Ok(())
    }

    fn process_fulfill_randomness(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        request_id: u64,
        randomness: [u8; 32],
    ) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        let authority_info = next_account_info(account_info_iter)?;
        let config_info = next_account_info(account_info_iter)?;
        let raffle_info = next_account_info(account_info_iter)?;
        let book_info = next_account_info(account_info_iter)?;
        let request_info = next_account_info(account_info_iter)?;
        let instructions_info = next_account_info(account_info_iter)?;

        assert_signer(authority_info, "Randomness authority")?;
        let config = Self::load_config(program_id, config_info)?;
        if *authority_info.key != config.randomness_authority {
            msg!("Only the randomness authority can fulfill requests");
            return Err(SettlementError::Unauthorized.into());
        }

        assert_address(
            request_info,
            &find_request_address(program_id, request_id).0,
            "randomness request",
        )?;
        if request_info.owner != program_id {
            msg!("Unknown randomness request {}", request_id);
            return Err(SettlementError::DuplicateCallback.into());
        }
        let mut request: RandomnessRequest =
            Self::load(program_id, request_info, "Randomness request")?;
        let mut raffle: Raffle = Self::load(program_id, raffle_info, "Raffle")?;
        let book = Self::load_ticket_book(program_id, book_info, raffle_info)?;

        let proof = Self::load_randomness_proof(instructions_info)?;
        request.check_proof(&proof, &config.randomness_authority, &randomness)?;

        let now = Clock::get()?.unix_timestamp;
        request.fulfill(request_id, raffle_info.key, randomness, now)?;
        let winner = raffle.resolve(&book, request_id, &randomness, now, config.claim_window)?;

        RandomnessRequest::pack(request, &mut request_info.data.borrow_mut())?;
        Raffle::pack(raffle, &mut raffle_info.data.borrow_mut())?;

        msg!(
            "Raffle {} winner: {}, claim deadline {}",
            raffle.raffle_index,
            winner,
            raffle.claim_deadline
        );
        Ok(())
    }

    fn process_claim_prize(program_id: &Pubkey, accounts: &[AccountInfo]) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        let winner_info = next_account_info(account_info_iter)?;
        let raffle_info = next_account_info(account_info_iter)?;

        assert_signer(winner_info, "Winner")?;
        let mut raffle: Raffle = Self::load(program_id, raffle_info, "Raffle")?;

        let now = Clock::get()?.unix_timestamp;
        let prize = raffle.claim_prize(winner_info.key, now)?;
        let rent = Rent::get()?;
        guard::ensure_solvent(guard::available_balance(raffle_info, &rent), prize)?;

        Raffle::pack(raffle, &mut raffle_info.data.borrow_mut())?;
        transfer_from_program_account(raffle_info, winner_info, prize)?;

        msg!("Prize claimed: {} by {}", prize, winner_info.key);
        Ok(())
    }

    fn process_reroll_winner(program_id: &Pubkey, accounts: &[AccountInfo]) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        let caller_info = next_account_info(account_info_iter)?;
        let config_info = next_account_info(account_info_iter)?;
        let raffle_info = next_account_info(account_info_iter)?;
        let book_info = next_account_info(account_info_iter)?;
        let request_info = next_account_info(account_info_iter)?;
        let system_program_info = next_account_info(account_info_iter)?;

        assert_signer(caller_info, "Caller")?;
        let mut config = Self::load_config(program_id, config_info)?;
        let mut raffle: Raffle = Self::load(program_id, raffle_info, "Raffle")?;
        let mut book = Self::load_ticket_book(program_id, book_info, raffle_info)?;

        let clock = Clock::get()?;
        let next_request_id = config.next_request_id;
        match raffle.reroll(&mut book, next_request_id, clock.unix_timestamp)? {
            RerollOutcome::Requested(request_id) => {
                config.take_request_id()?;
                Self::open_randomness_request(
                    program_id,
                    request_id,
                    caller_info,
                    raffle_info,
                    request_info,
                    system_program_info,
                    &clock,
                )?;
                Config::pack(config, &mut config_info.data.borrow_mut())?;
                msg!("Raffle {} rerolled ({})", raffle.raffle_index, raffle.reroll_count);
            }
            RerollOutcome::Exhausted => {
                msg!(
                    "Raffle {} archived: no eligible tickets remain, prize {} released",
                    raffle.raffle_index,
                    raffle.prize_amount
                );
            }
        }

        Raffle::pack(raffle, &mut raffle_info.data.borrow_mut())?;
        book.pack(&mut book_info.data.borrow_mut())?;
        Ok(())
    }

    fn process_cancel_raffle(program_id: &Pubkey, accounts: &[AccountInfo]) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        let caller_info = next_account_info(account_info_iter)?;
        let config_info = next_account_info(account_info_iter)?;
        let raffle_info = next_account_info(account_info_iter)?;
        let creator_info = next_account_info(account_info_iter)?;

        assert_signer(caller_info, "Caller")?;
        let config = Self::load_config(program_id, config_info)?;
        let mut raffle: Raffle = Self::load(program_id, raffle_info, "Raffle")?;
        assert_address(creator_info, &raffle.creator, "creator")?;

        let privileged = *caller_info.key == raffle.creator || *caller_info.key == config.admin;
        let refund = raffle.cancel(privileged)?;
        let rent = Rent::get()?;
        guard::ensure_solvent(guard::available_balance(raffle_info, &rent), refund)?;

        Raffle::pack(raffle, &mut raffle_info.data.borrow_mut())?;
        transfer_from_program_account(raffle_info, creator_info, refund)?;

        msg!("Raffle {} cancelled, {} refunded", raffle.raffle_index, refund);
        Ok(())
    }

    fn process_recover_raffle_surplus(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
    ) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        let admin_info = next_account_info(account_info_iter)?;
        let config_info = next_account_info(account_info_iter)?;
        let raffle_info = next_account_info(account_info_iter)?;
        let recovery_info = next_account_info(account_info_iter)?;

        let config = Self::load_config(program_id, config_info)?;
        Self::require_admin(&config, admin_info)?;
        assert_address(recovery_info, &config.recovery_wallet, "recovery wallet")?;
        let raffle: Raffle = Self::load(program_id, raffle_info, "Raffle")?;

        let rent = Rent::get()?;
        let available = guard::available_balance(raffle_info, &rent);
        let amount = guard::sweepable(available, raffle.locked_prize());
        if amount == 0 {
            msg!("Nothing to recover from raffle {}", raffle.raffle_index);
            return Ok(());
        }
        transfer_from_program_account(raffle_info, recovery_info, amount)?;

        msg!(
            "Recovered {} lamports from raffle {} to {}",
            amount,
            raffle.raffle_index,
            recovery_info.key
        );
        Ok(())
    }
}
