// RerollClient backed by a JSON-RPC node
use solana_client::{rpc_client::RpcClient, rpc_request::MAX_MULTIPLE_ACCOUNTS};
use solana_sdk::{
    account::from_account,
    clock::{Clock, UnixTimestamp},
    commitment_config::CommitmentConfig,
    instruction::Instruction,
    program_pack::Pack,
    pubkey::Pubkey,
    signature::{Keypair, Signer},
    sysvar,
    transaction::Transaction,
};
use tracing::debug;

use tierdraw::{
    raffle::Raffle,
    state::Config,
    utils::{find_config_address, find_raffle_address},
};

use crate::crank::{CrankError, RerollClient};

fn rpc_error(err: impl std::fmt::Display) -> CrankError {
    CrankError::Rpc(err.to_string())
}

pub struct RpcRerollClient {
    client: RpcClient,
    program_id: Pubkey,
    payer: Keypair,
}

impl RpcRerollClient {
    pub fn new(url: String, commitment: CommitmentConfig, program_id: Pubkey, payer: Keypair) -> Self {
        Self {
            client: RpcClient::new_with_commitment(url, commitment),
            program_id,
            payer,
        }
    }

    pub fn payer(&self) -> Pubkey {
        self.payer.pubkey()
    }

    fn config(&self) -> Result<Config, CrankError> {
        let key = find_config_address(&self.program_id).0;
        let account = self.client.get_account(&key).map_err(rpc_error)?;
        Ok(Config::unpack(&account.data)?)
    }

    fn transaction(&self, instruction: &Instruction) -> Result<Transaction, CrankError> {
        let blockhash = self.client.get_latest_blockhash().map_err(rpc_error)?;
        Ok(Transaction::new_signed_with_payer(
            &[instruction.clone()],
            Some(&self.payer.pubkey()),
            &[&self.payer],
            blockhash,
        ))
    }
}

impl RerollClient for RpcRerollClient {
    fn now(&mut self) -> Result<UnixTimestamp, CrankError> {
        let account = self
            .client
            .get_account(&sysvar::clock::id())
            .map_err(rpc_error)?;
        let clock: Clock =
            from_account(&account).ok_or_else(|| rpc_error("unreadable clock sysvar"))?;
        Ok(clock.unix_timestamp)
    }

    fn next_request_id(&mut self) -> Result<u64, CrankError> {
        Ok(self.config()?.next_request_id)
    }

    fn recent_raffles(&mut self, limit: usize) -> Result<Vec<Raffle>, CrankError> {
        let next_raffle_index = self.config()?.next_raffle_index;
        let keys: Vec<Pubkey> = (1..next_raffle_index)
            .rev()
            .take(limit)
            .map(|index| find_raffle_address(&self.program_id, index).0)
            .collect();

        let mut raffles = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(MAX_MULTIPLE_ACCOUNTS) {
            let accounts = self.client.get_multiple_accounts(chunk).map_err(rpc_error)?;
            for (key, account) in chunk.iter().zip(accounts) {
                match account.map(|account| Raffle::unpack(&account.data)) {
                    Some(Ok(raffle)) => raffles.push(raffle),
                    Some(Err(err)) => debug!("Raffle {} unreadable: {}", key, err),
                    None => debug!("Raffle {} not found", key),
                }
            }
        }
        Ok(raffles)
    }

    fn simulate(&mut self, instruction: &Instruction) -> Result<(), CrankError> {
        let transaction = self.transaction(instruction)?;
        let result = self
            .client
            .simulate_transaction(&transaction)
            .map_err(rpc_error)?
            .value;
        match result.err {
            Some(err) => Err(CrankError::Simulation(err.to_string())),
            None => Ok(()),
        }
    }

    fn submit(&mut self, instruction: &Instruction) -> Result<(), CrankError> {
        let transaction = self.transaction(instruction)?;
        let signature = self
            .client
            .send_and_confirm_transaction(&transaction)
            .map_err(|err| CrankError::Submission(err.to_string()))?;
        debug!("Confirmed {}", signature);
        Ok(())
    }
}
