// Program address derivation, account creation, lamport movement and the
// compute-unit price guard
use solana_program::{
    account_info::AccountInfo,
    entrypoint::ProgramResult,
    instruction::Instruction,
    msg,
    program::{invoke, invoke_signed},
    program_error::ProgramError,
    pubkey::Pubkey,
    rent::Rent,
    system_instruction,
    sysvar::{self, instructions::load_instruction_at_checked, Sysvar},
};

use crate::error::SettlementError;

pub const CONFIG_SEED: &[u8] = b"config";
pub const LEDGER_SEED: &[u8] = b"ledger";
pub const PARTICIPANT_SEED: &[u8] = b"participant";
pub const RAFFLE_SEED: &[u8] = b"raffle";
pub const TICKETS_SEED: &[u8] = b"tickets";
pub const REQUEST_SEED: &[u8] = b"request";

/// Compute budget program
pub const COMPUTE_BUDGET_PROGRAM_ID: Pubkey =
    solana_program::pubkey!("ComputeBudget111111111111111111111111111111");

/// Tag of `ComputeBudgetInstruction::SetComputeUnitPrice`
const SET_COMPUTE_UNIT_PRICE_TAG: u8 = 3;

pub fn find_config_address(program_id: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[CONFIG_SEED], program_id)
}

pub fn find_ledger_address(program_id: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[LEDGER_SEED], program_id)
}

pub fn find_participant_address(program_id: &Pubkey, owner: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[PARTICIPANT_SEED, owner.as_ref()], program_id)
}

/// Find a program derived address for a raffle
pub fn find_raffle_address(program_id: &Pubkey, raffle_index: u64) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[RAFFLE_SEED, &raffle_index.to_le_bytes()], program_id)
}

pub fn find_ticket_book_address(program_id: &Pubkey, raffle_index: u64) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[TICKETS_SEED, &raffle_index.to_le_bytes()], program_id)
}

pub fn find_request_address(program_id: &Pubkey, request_id: u64) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[REQUEST_SEED, &request_id.to_le_bytes()], program_id)
}

/// Fails unless `info` sits at `expected`
pub fn assert_address(info: &AccountInfo, expected: &Pubkey, name: &str) -> ProgramResult {
    if info.key != expected {
        msg!("Invalid {} account address", name);
        return Err(SettlementError::AccountMismatch.into());
    }
    Ok(())
}

/// Fails unless `info` is owned by this program
pub fn assert_owned_by(info: &AccountInfo, program_id: &Pubkey, name: &str) -> ProgramResult {
    if info.owner != program_id {
        msg!("{} account must be owned by this program", name);
        return Err(ProgramError::IncorrectProgramId);
    }
    Ok(())
}

pub fn assert_signer(info: &AccountInfo, name: &str) -> ProgramResult {
    if !info.is_signer {
        msg!("{} must sign the transaction", name);
        return Err(ProgramError::MissingRequiredSignature);
    }
    Ok(())
}

/// Create a rent-exempt program account at a PDA, paid by `payer`.
/// Lamports already sitting at the address count toward rent.
pub fn create_pda_account<'a>(
    payer: &AccountInfo<'a>,
    target: &AccountInfo<'a>,
    system_program: &AccountInfo<'a>,
    program_id: &Pubkey,
    space: usize,
    seeds: &[&[u8]],
) -> ProgramResult {
    if target.owner == program_id {
        msg!("Account {} already exists", target.key);
        return Err(ProgramError::AccountAlreadyInitialized);
    }
    let rent = Rent::get()?;
    let required = rent.minimum_balance(space);

    if target.lamports() == 0 {
        return invoke_signed(
            &system_instruction::create_account(
                payer.key,
                target.key,
                required,
                space as u64,
                program_id,
            ),
            &[payer.clone(), target.clone(), system_program.clone()],
            &[seeds],
        );
    }

    // create_account refuses funded addresses, so build the account in steps
    if !solana_program::system_program::check_id(target.owner) || !target.data_is_empty() {
        msg!("Account {} is held by another program", target.key);
        return Err(ProgramError::AccountAlreadyInitialized);
    }
    msg!("Account {} was pre-funded with {} lamports", target.key, target.lamports());
    let shortfall = required.saturating_sub(target.lamports());
    transfer_from_wallet(payer, target, system_program, shortfall)?;
    invoke_signed(
        &system_instruction::allocate(target.key, space as u64),
        &[target.clone(), system_program.clone()],
        &[seeds],
    )?;
    invoke_signed(
        &system_instruction::assign(target.key, program_id),
        &[target.clone(), system_program.clone()],
        &[seeds],
    )
}

/// Grow a program account to `new_len` bytes, topping up rent from `payer`
pub fn grow_program_account<'a>(
    payer: &AccountInfo<'a>,
    target: &AccountInfo<'a>,
    system_program: &AccountInfo<'a>,
    new_len: usize,
) -> ProgramResult {
    if new_len <= target.data_len() {
        return Ok(());
    }
    let rent = Rent::get()?;
    let shortfall = rent
        .minimum_balance(new_len)
        .saturating_sub(target.lamports());
    transfer_from_wallet(payer, target, system_program, shortfall)?;
    target.realloc(new_len, true)
}

/// Move lamports from a signer wallet through the system program
pub fn transfer_from_wallet<'a>(
    from: &AccountInfo<'a>,
    to: &AccountInfo<'a>,
    system_program: &AccountInfo<'a>,
    amount: u64,
) -> ProgramResult {
    if amount == 0 {
        return Ok(());
    }
    invoke(
        &system_instruction::transfer(from.key, to.key, amount),
        &[from.clone(), to.clone(), system_program.clone()],
    )
}

/// Move lamports out of an account owned by this program
pub fn transfer_from_program_account(
    from: &AccountInfo,
    to: &AccountInfo,
    amount: u64,
) -> ProgramResult {
    let from_balance = from
        .lamports()
        .checked_sub(amount)
        .ok_or(SettlementError::InsufficientFunds)?;
    let to_balance = to
        .lamports()
        .checked_add(amount)
        .ok_or(SettlementError::MathOverflow)?;
    **from.try_borrow_mut_lamports()? = from_balance;
    **to.try_borrow_mut_lamports()? = to_balance;
    Ok(())
}

/// Compute-unit price set by `ix`, if it is a SetComputeUnitPrice instruction
pub fn compute_unit_price_of(ix: &Instruction) -> Option<u64> {
    if ix.program_id != COMPUTE_BUDGET_PROGRAM_ID {
        return None;
    }
    match ix.data.split_first() {
        Some((&SET_COMPUTE_UNIT_PRICE_TAG, rest)) if rest.len() >= 8 => {
            let mut price = [0u8; 8];
            price.copy_from_slice(&rest[..8]);
            Some(u64::from_le_bytes(price))
        }
        _ => None,
    }
}

/// Reject the transaction when its compute-unit price exceeds `ceiling`.
/// A ceiling of zero disables the check, but the account must still be
/// the instructions sysvar.
pub fn check_congestion(instructions_sysvar: &AccountInfo, ceiling: u64) -> ProgramResult {
    assert_address(instructions_sysvar, &sysvar::instructions::id(), "instructions sysvar")?;
    if ceiling == 0 {
        return Ok(());
    }
    let mut index = 0;
    loop {
        let ix = match load_instruction_at_checked(index, instructions_sysvar) {
            Ok(ix) => ix,
            // Past the last instruction
            Err(ProgramError::InvalidArgument) => break,
            Err(err) => return Err(err),
        };
        if let Some(price) = compute_unit_price_of(&ix) {
            if price > ceiling {
                msg!("Compute unit price {} above limit {}", price, ceiling);
                return Err(SettlementError::CongestionLimit.into());
            }
        }
        index += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_price_ix(price: u64) -> Instruction {
        let mut data = vec![SET_COMPUTE_UNIT_PRICE_TAG];
        data.extend_from_slice(&price.to_le_bytes());
        Instruction {
            program_id: COMPUTE_BUDGET_PROGRAM_ID,
            accounts: vec![],
            data,
        }
    }

    #[test]
    fn reads_compute_unit_price() {
        assert_eq!(compute_unit_price_of(&set_price_ix(7_500)), Some(7_500));

        // Unit limit instruction from the same program
        let limit = Instruction {
            program_id: COMPUTE_BUDGET_PROGRAM_ID,
            accounts: vec![],
            data: vec![2, 0, 0, 1, 0],
        };
        assert_eq!(compute_unit_price_of(&limit), None);

        let mut other = set_price_ix(7_500);
        other.program_id = Pubkey::new_unique();
        assert_eq!(compute_unit_price_of(&other), None);
    }

    #[test]
    fn congestion_check_requires_instructions_sysvar() {
        let key = Pubkey::new_unique();
        let owner = Pubkey::new_unique();
        let mut lamports = 0u64;
        let mut data = vec![0u8; 16];
        let fake = AccountInfo::new(&key, false, false, &mut lamports, &mut data, &owner, false, 0);

        assert_eq!(
            check_congestion(&fake, 1),
            Err(SettlementError::AccountMismatch.into())
        );
        assert_eq!(
            check_congestion(&fake, 0),
            Err(SettlementError::AccountMismatch.into())
        );
    }

    #[test]
    fn transfers_between_program_accounts() {
        let owner = Pubkey::new_unique();
        let (from_key, to_key) = (Pubkey::new_unique(), Pubkey::new_unique());
        let (mut from_lamports, mut to_lamports) = (100u64, 5u64);
        let (mut from_data, mut to_data) = (vec![], vec![]);
        let from = AccountInfo::new(&from_key, false, true, &mut from_lamports, &mut from_data, &owner, false, 0);
        let to = AccountInfo::new(&to_key, false, true, &mut to_lamports, &mut to_data, &owner, false, 0);

        transfer_from_program_account(&from, &to, 40).unwrap();
        assert_eq!(from.lamports(), 60);
        assert_eq!(to.lamports(), 45);

        assert_eq!(
            transfer_from_program_account(&from, &to, 61),
            Err(SettlementError::InsufficientFunds.into())
        );
        assert_eq!(from.lamports(), 60);
    }

    #[test]
    fn pda_seeds_are_distinct() {
        let program_id = Pubkey::new_unique();
        assert_ne!(find_raffle_address(&program_id, 1).0, find_ticket_book_address(&program_id, 1).0);
        assert_ne!(find_raffle_address(&program_id, 1).0, find_raffle_address(&program_id, 2).0);
        assert_ne!(find_config_address(&program_id).0, find_ledger_address(&program_id).0);
    }
}
