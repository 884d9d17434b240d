// Reroll driver. Polls recent raffles, dry-runs RerollWinner for the ones
// whose claim window lapsed and submits only what simulated cleanly.
use solana_sdk::{
    clock::UnixTimestamp, instruction::Instruction, program_error::ProgramError, pubkey::Pubkey,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use tierdraw::{instruction::reroll_winner, raffle::Raffle};

/// How many of the newest raffles one tick looks at by default
pub const DEFAULT_LOOKBACK: usize = 20;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CrankError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Simulation failed: {0}")]
    Simulation(String),

    #[error("Submission failed: {0}")]
    Submission(String),

    #[error("Could not build instruction: {0}")]
    Program(#[from] ProgramError),
}

/// Chain access the crank needs
pub trait RerollClient {
    fn now(&mut self) -> Result<UnixTimestamp, CrankError>;

    /// Request id the next randomness request will take
    fn next_request_id(&mut self) -> Result<u64, CrankError>;

    /// Up to `limit` raffles, newest first
    fn recent_raffles(&mut self, limit: usize) -> Result<Vec<Raffle>, CrankError>;

    fn simulate(&mut self, instruction: &Instruction) -> Result<(), CrankError>;

    fn submit(&mut self, instruction: &Instruction) -> Result<(), CrankError>;
}

/// Outcome of one crank tick
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CrankReport {
    pub scanned: usize,
    /// Passed the public-state pre-filter
    pub eligible: usize,
    /// Raffle indexes whose reroll was submitted
    pub submitted: Vec<u64>,
    /// Eligible but the simulation failed
    pub skipped: usize,
    pub failed: usize,
}

pub struct RerollCrank {
    pub program_id: Pubkey,
    /// Signs and pays for the reroll transactions
    pub payer: Pubkey,
    pub lookback: usize,
}

impl RerollCrank {
    pub fn new(program_id: Pubkey, payer: Pubkey) -> Self {
        Self {
            program_id,
            payer,
            lookback: DEFAULT_LOOKBACK,
        }
    }

    /// Cheap check on public state before spending a simulation
    pub fn is_candidate(raffle: &Raffle, now: UnixTimestamp) -> bool {
        raffle.is_completed() && raffle.winner.is_some() && raffle.is_expired(now)
    }

    /// One pass over recent raffles. Only failing to read the chain aborts
    /// the tick; per-raffle failures are counted.
    pub fn tick<C: RerollClient>(&self, client: &mut C) -> Result<CrankReport, CrankError> {
        let now = client.now()?;
        let raffles = client.recent_raffles(self.lookback)?;
        let mut report = CrankReport {
            scanned: raffles.len(),
            ..CrankReport::default()
        };

        for raffle in raffles.iter().filter(|r| Self::is_candidate(r, now)) {
            report.eligible += 1;

            let next_request_id = client.next_request_id()?;
            let ix = reroll_winner(
                &self.program_id,
                &self.payer,
                raffle.raffle_index,
                next_request_id,
            )?;

            if let Err(err) = client.simulate(&ix) {
                debug!("Skipping raffle {}: {}", raffle.raffle_index, err);
                report.skipped += 1;
                continue;
            }

            match client.submit(&ix) {
                Ok(()) => {
                    info!("Reroll submitted for raffle {}", raffle.raffle_index);
                    report.submitted.push(raffle.raffle_index);
                }
                Err(err) => {
                    warn!("Reroll for raffle {} failed: {}", raffle.raffle_index, err);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierdraw::{
        instruction::SettlementInstruction,
        raffle::{RaffleStatus, TicketBook},
        utils::find_raffle_address,
    };
    use std::collections::HashSet;

    const NOW: i64 = 1_000_000;

    struct MockClient {
        raffles: Vec<Raffle>,
        next_request_id: u64,
        simulation_fails: HashSet<u64>,
        submission_fails: HashSet<u64>,
        simulated: Vec<u64>,
        submitted: Vec<u64>,
        rpc_down: bool,
    }

    impl MockClient {
        fn new(raffles: Vec<Raffle>) -> Self {
            Self {
                raffles,
                next_request_id: 10,
                simulation_fails: HashSet::new(),
                submission_fails: HashSet::new(),
                simulated: vec![],
                submitted: vec![],
                rpc_down: false,
            }
        }

        /// Raffle index targeted by a reroll instruction, via its raffle account
        fn raffle_index(&self, ix: &Instruction) -> u64 {
            assert_eq!(
                SettlementInstruction::unpack(&ix.data).unwrap(),
                SettlementInstruction::RerollWinner
            );
            let program_id = ix.program_id;
            self.raffles
                .iter()
                .map(|r| r.raffle_index)
                .find(|i| find_raffle_address(&program_id, *i).0 == ix.accounts[2].pubkey)
                .unwrap()
        }
    }

    impl RerollClient for MockClient {
        fn now(&mut self) -> Result<UnixTimestamp, CrankError> {
            Ok(NOW)
        }

        fn next_request_id(&mut self) -> Result<u64, CrankError> {
            Ok(self.next_request_id)
        }

        fn recent_raffles(&mut self, limit: usize) -> Result<Vec<Raffle>, CrankError> {
            if self.rpc_down {
                return Err(CrankError::Rpc("connection refused".to_string()));
            }
            Ok(self.raffles.iter().take(limit).copied().collect())
        }

        fn simulate(&mut self, instruction: &Instruction) -> Result<(), CrankError> {
            let index = self.raffle_index(instruction);
            self.simulated.push(index);
            if self.simulation_fails.contains(&index) {
                return Err(CrankError::Simulation("custom program error: 0x5".to_string()));
            }
            Ok(())
        }

        fn submit(&mut self, instruction: &Instruction) -> Result<(), CrankError> {
            let index = self.raffle_index(instruction);
            if self.submission_fails.contains(&index) {
                return Err(CrankError::Submission("blockhash not found".to_string()));
            }
            self.submitted.push(index);
            self.next_request_id += 1;
            Ok(())
        }
    }

    fn raffle(index: u64) -> Raffle {
        Raffle::new(index, 0, Pubkey::new_unique(), [0u8; 32], 0, 100, 10, 1_000, 0).unwrap()
    }

    fn resolved(index: u64, claim_deadline: i64) -> Raffle {
        let mut raffle = raffle(index);
        let mut book = TicketBook::new(Pubkey::new_unique(), 0);
        raffle.add_tickets(&mut book, Pubkey::new_unique(), 1, true, 10).unwrap();
        raffle.begin_draw(index, 100).unwrap();
        raffle.resolve(&book, index, &[0u8; 32], 100, 1).unwrap();
        raffle.claim_deadline = claim_deadline;
        raffle
    }

    fn crank() -> RerollCrank {
        RerollCrank::new(Pubkey::new_unique(), Pubkey::new_unique())
    }

    #[test]
    fn only_expired_unclaimed_raffles_are_candidates() {
        let open = raffle(1);
        let fresh = resolved(2, NOW);
        let expired = resolved(3, NOW - 1);
        let mut claimed = resolved(4, NOW - 1);
        claimed.status = RaffleStatus::Claimed;

        assert!(!RerollCrank::is_candidate(&open, NOW));
        assert!(!RerollCrank::is_candidate(&fresh, NOW));
        assert!(RerollCrank::is_candidate(&expired, NOW));
        assert!(!RerollCrank::is_candidate(&claimed, NOW));
    }

    #[test]
    fn submits_after_successful_simulation() {
        let mut client = MockClient::new(vec![raffle(1), resolved(2, NOW - 5), resolved(3, NOW + 5)]);
        let report = crank().tick(&mut client).unwrap();

        assert_eq!(report.scanned, 3);
        assert_eq!(report.eligible, 1);
        assert_eq!(report.submitted, vec![2]);
        assert_eq!(client.simulated, vec![2]);
        assert_eq!(client.submitted, vec![2]);
    }

    #[test]
    fn simulation_failure_is_a_silent_skip() {
        let mut client = MockClient::new(vec![resolved(1, NOW - 5), resolved(2, NOW - 5)]);
        client.simulation_fails.insert(1);

        let report = crank().tick(&mut client).unwrap();
        assert_eq!(report.eligible, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.submitted, vec![2]);
        assert_eq!(client.submitted, vec![2]);
    }

    #[test]
    fn submission_failure_is_counted_not_fatal() {
        let mut client = MockClient::new(vec![resolved(1, NOW - 5), resolved(2, NOW - 5)]);
        client.submission_fails.insert(1);

        let report = crank().tick(&mut client).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.submitted, vec![2]);
    }

    #[test]
    fn lookback_limits_the_scan() {
        let mut client = MockClient::new(vec![resolved(1, NOW - 5), resolved(2, NOW - 5)]);
        let mut crank = crank();
        crank.lookback = 1;

        let report = crank.tick(&mut client).unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.submitted, vec![1]);
    }

    #[test]
    fn rpc_failure_aborts_the_tick() {
        let mut client = MockClient::new(vec![resolved(1, NOW - 5)]);
        client.rpc_down = true;
        assert!(matches!(crank().tick(&mut client), Err(CrankError::Rpc(_))));
    }
}
