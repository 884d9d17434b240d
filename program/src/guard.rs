// Surplus recovery guard shared by the revenue ledger and the raffle vaults
use solana_program::{account_info::AccountInfo, msg, rent::Rent};

use crate::error::SettlementError;

/// Lamports held by a program account beyond its rent-exempt minimum.
/// Always read from the account, never cached.
pub fn available_balance(account: &AccountInfo, rent: &Rent) -> u64 {
    account
        .lamports()
        .saturating_sub(rent.minimum_balance(account.data_len()))
}

/// Amount an administrative sweep may remove: everything above `reserved`
pub fn sweepable(available: u64, reserved: u64) -> u64 {
    available.saturating_sub(reserved)
}

/// Fails when the vault no longer covers what it owes
pub fn ensure_solvent(available: u64, reserved: u64) -> Result<(), SettlementError> {
    if available < reserved {
        msg!(
            "Vault balance {} below reserved {}",
            available,
            reserved
        );
        return Err(SettlementError::ConservationViolation);
    }
    Ok(())
}

/// Fails when the bucket totals do not add back up to what was received
pub fn ensure_conserved(received: u64, buckets: &[u64]) -> Result<(), SettlementError> {
    let accounted = buckets
        .iter()
        .try_fold(0u128, |acc, v| acc.checked_add(*v as u128))
        .ok_or(SettlementError::MathOverflow)?;
    if accounted != received as u128 {
        msg!("Accounted {} != received {}", accounted, received);
        return Err(SettlementError::ConservationViolation);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_never_touches_reserved_funds() {
        assert_eq!(sweepable(40, 30), 10);
        assert_eq!(sweepable(30, 30), 0);
        assert_eq!(sweepable(20, 30), 0);
    }

    #[test]
    fn solvency_and_conservation_checks() {
        assert!(ensure_solvent(30, 30).is_ok());
        assert_eq!(
            ensure_solvent(29, 30),
            Err(SettlementError::ConservationViolation)
        );
        assert!(ensure_conserved(100, &[40, 20, 30, 10]).is_ok());
        assert_eq!(
            ensure_conserved(100, &[40, 20, 30, 9]),
            Err(SettlementError::ConservationViolation)
        );
    }
}
