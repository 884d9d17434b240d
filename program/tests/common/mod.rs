#![allow(dead_code)]

use solana_program::{
    instruction::Instruction,
    program_pack::{IsInitialized, Pack},
};
use solana_program_test::*;
use solana_sdk::{
    account::{Account, AccountSharedData},
    instruction::InstructionError,
    pubkey::Pubkey,
    signature::{Keypair, Signer},
    system_program,
    sysvar::clock::Clock,
    transaction::{Transaction, TransactionError},
};

use tierdraw::{
    error::SettlementError,
    instruction::{self, InitializeAccounts, PurchaseAccounts},
    ledger::RevenueLedger,
    price::{
        AGGREGATE_PRICE_OFFSET, AGGREGATE_PUB_SLOT_OFFSET, AGGREGATE_STATUS_OFFSET,
        EXPONENT_OFFSET, PRICE_STATUS_TRADING, PUBLISH_TIME_OFFSET, PYTH_MAGIC,
    },
    process_instruction,
    raffle::{Raffle, TicketBook},
    state::{Config, ConfigParams},
    tier::Participant,
    utils::{
        find_config_address, find_ledger_address, find_participant_address, find_raffle_address,
        find_request_address, find_ticket_book_address,
    },
    vrf::{randomness_from_signature, RandomnessRequest, SIGNATURE_LEN},
};

pub const SOL: u64 = 1_000_000_000;

/// Clock time every test starts from
pub const T0: i64 = 1_700_000_000;

/// $100.00000000 per SOL
pub const SOL_PRICE: i64 = 10_000_000_000;
pub const SOL_PRICE_EXPO: i32 = -8;

/// One $1 ticket at `SOL_PRICE`
pub const TICKET_LAMPORTS: u64 = 10_000_000;

pub const USER_COUNT: usize = 3;

pub struct TestEnv {
    pub context: ProgramTestContext,
    pub program_id: Pubkey,
    pub admin: Keypair,
    pub randomness_authority: Keypair,
    pub users: Vec<Keypair>,
    pub operator: Pubkey,
    pub operations: Pubkey,
    pub treasury: Pubkey,
    pub recovery: Pubkey,
    pub price_feed: Pubkey,
}

fn wallet(lamports: u64) -> Account {
    Account::new(lamports, 0, &system_program::id())
}

/// Size of a live Pyth v2 price account
pub const PRICE_ACCOUNT_SIZE: usize = 3312;

/// Slot a mainnet aggregate would carry next to `T0`
pub const FEED_PUB_SLOT: u64 = 250_000_000;

fn put(data: &mut [u8], offset: usize, bytes: &[u8]) {
    data[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// Pyth v2 price account with a trading aggregate
pub fn price_feed_data(price: i64, expo: i32, publish_time: i64) -> Vec<u8> {
    let mut data = vec![0u8; PRICE_ACCOUNT_SIZE];
    put(&mut data, 0, &PYTH_MAGIC.to_le_bytes());
    put(&mut data, 4, &2u32.to_le_bytes());
    put(&mut data, 8, &3u32.to_le_bytes());
    put(&mut data, 12, &(PRICE_ACCOUNT_SIZE as u32).to_le_bytes());
    put(&mut data, EXPONENT_OFFSET, &expo.to_le_bytes());
    put(&mut data, 48, &price.to_le_bytes());
    put(&mut data, PUBLISH_TIME_OFFSET, &publish_time.to_le_bytes());
    put(&mut data, AGGREGATE_PRICE_OFFSET, &price.to_le_bytes());
    put(&mut data, AGGREGATE_STATUS_OFFSET, &PRICE_STATUS_TRADING.to_le_bytes());
    put(&mut data, AGGREGATE_PUB_SLOT_OFFSET, &FEED_PUB_SLOT.to_le_bytes());
    data
}

fn price_feed_account(price: i64, expo: i32, publish_time: i64) -> Account {
    Account {
        lamports: SOL,
        data: price_feed_data(price, expo, publish_time),
        owner: Pubkey::new_unique(),
        executable: false,
        rent_epoch: 0,
    }
}

/// Sign with the context payer plus `signers` and process on a fresh blockhash
pub async fn process(
    context: &mut ProgramTestContext,
    instructions: &[Instruction],
    signers: &[&Keypair],
) -> Result<(), BanksClientError> {
    let blockhash = context
        .banks_client
        .get_new_latest_blockhash(&context.last_blockhash)
        .await
        .unwrap();
    context.last_blockhash = blockhash;
    let mut all_signers = vec![&context.payer];
    all_signers.extend_from_slice(signers);
    let transaction = Transaction::new_signed_with_payer(
        instructions,
        Some(&context.payer.pubkey()),
        &all_signers,
        blockhash,
    );
    context.banks_client.process_transaction(transaction).await
}

pub async fn set_time(context: &mut ProgramTestContext, unix_timestamp: i64) {
    let mut clock: Clock = context.banks_client.get_sysvar().await.unwrap();
    clock.unix_timestamp = unix_timestamp;
    context.set_sysvar(&clock);
}

pub fn set_price(context: &mut ProgramTestContext, feed: &Pubkey, price: i64, publish_time: i64) {
    let account = price_feed_account(price, SOL_PRICE_EXPO, publish_time);
    context.set_account(feed, &AccountSharedData::from(account));
}

pub async fn get_state<T: Pack + IsInitialized>(context: &mut ProgramTestContext, key: &Pubkey) -> T {
    let account = context
        .banks_client
        .get_account(*key)
        .await
        .unwrap()
        .expect("account not found");
    T::unpack(&account.data).unwrap()
}

pub async fn balance(context: &mut ProgramTestContext, key: &Pubkey) -> u64 {
    context.banks_client.get_balance(*key).await.unwrap()
}

/// Custom program error code carried by a failed transaction
pub fn custom_code(err: BanksClientError) -> Option<u32> {
    match err {
        BanksClientError::TransactionError(TransactionError::InstructionError(
            _,
            InstructionError::Custom(code),
        ))
        | BanksClientError::SimulationError {
            err: TransactionError::InstructionError(_, InstructionError::Custom(code)),
            ..
        } => Some(code),
        _ => None,
    }
}

pub fn assert_error(result: Result<(), BanksClientError>, expected: SettlementError) {
    let err = result.expect_err("transaction should have failed");
    assert_eq!(custom_code(err), Some(expected as u32), "expected {:?}", expected);
}

pub fn title(text: &str) -> [u8; 32] {
    let mut padded = [0u8; 32];
    padded[..text.len()].copy_from_slice(text.as_bytes());
    padded
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_params(ConfigParams::default()).await
    }

    /// Program with funded wallets, a fresh price feed and an initialized config
    pub async fn with_params(params: ConfigParams) -> Self {
        let program_id = Pubkey::new_unique();
        let mut program_test =
            ProgramTest::new("tierdraw", program_id, processor!(process_instruction));

        let admin = Keypair::new();
        let randomness_authority = Keypair::new();
        let users: Vec<Keypair> = (0..USER_COUNT).map(|_| Keypair::new()).collect();
        let (operator, operations, treasury, recovery) = (
            Pubkey::new_unique(),
            Pubkey::new_unique(),
            Pubkey::new_unique(),
            Pubkey::new_unique(),
        );
        let price_feed = Pubkey::new_unique();

        program_test.add_account(admin.pubkey(), wallet(1_000 * SOL));
        program_test.add_account(randomness_authority.pubkey(), wallet(SOL));
        for user in users.iter() {
            program_test.add_account(user.pubkey(), wallet(100 * SOL));
        }
        for key in [operator, operations, treasury, recovery].iter() {
            program_test.add_account(*key, wallet(SOL));
        }
        program_test.add_account(price_feed, price_feed_account(SOL_PRICE, SOL_PRICE_EXPO, T0));

        let mut context = program_test.start_with_context().await;
        set_time(&mut context, T0).await;

        let mut env = TestEnv {
            context,
            program_id,
            admin,
            randomness_authority,
            users,
            operator,
            operations,
            treasury,
            recovery,
            price_feed,
        };

        let wallets = InitializeAccounts {
            operator_wallet: env.operator,
            operations_wallet: env.operations,
            treasury_wallet: env.treasury,
            recovery_wallet: env.recovery,
            randomness_authority: env.randomness_authority.pubkey(),
            price_feed: env.price_feed,
        };
        let ix = instruction::initialize_config(&env.program_id, &env.admin.pubkey(), &wallets, params)
            .unwrap();
        process(&mut env.context, &[ix], &[&env.admin]).await.unwrap();
        env
    }

    pub fn user(&self, i: usize) -> Pubkey {
        self.users[i].pubkey()
    }

    pub fn purchase_accounts(&self) -> PurchaseAccounts {
        PurchaseAccounts {
            operator_wallet: self.operator,
            operations_wallet: self.operations,
            price_feed: self.price_feed,
        }
    }

    pub async fn set_time(&mut self, unix_timestamp: i64) {
        set_time(&mut self.context, unix_timestamp).await
    }

    pub fn set_price(&mut self, price: i64, publish_time: i64) {
        let feed = self.price_feed;
        set_price(&mut self.context, &feed, price, publish_time)
    }

    pub async fn balance(&mut self, key: &Pubkey) -> u64 {
        balance(&mut self.context, key).await
    }

    pub async fn config(&mut self) -> Config {
        let key = find_config_address(&self.program_id).0;
        get_state(&mut self.context, &key).await
    }

    pub async fn ledger(&mut self) -> RevenueLedger {
        let key = find_ledger_address(&self.program_id).0;
        get_state(&mut self.context, &key).await
    }

    pub async fn participant(&mut self, owner: &Pubkey) -> Participant {
        let key = find_participant_address(&self.program_id, owner).0;
        get_state(&mut self.context, &key).await
    }

    pub async fn raffle(&mut self, raffle_index: u64) -> Raffle {
        let key = find_raffle_address(&self.program_id, raffle_index).0;
        get_state(&mut self.context, &key).await
    }

    pub async fn ticket_book(&mut self, raffle_index: u64) -> TicketBook {
        let key = find_ticket_book_address(&self.program_id, raffle_index).0;
        let account = self
            .context
            .banks_client
            .get_account(key)
            .await
            .unwrap()
            .expect("ticket book not found");
        TicketBook::unpack(&account.data).unwrap()
    }

    /// Run `instructions` signed by the admin
    pub async fn as_admin(&mut self, instructions: &[Instruction]) -> Result<(), BanksClientError> {
        process(&mut self.context, instructions, &[&self.admin]).await
    }

    /// Run `instructions` signed by user `i`
    pub async fn as_user(
        &mut self,
        i: usize,
        instructions: &[Instruction],
    ) -> Result<(), BanksClientError> {
        process(&mut self.context, instructions, &[&self.users[i]]).await
    }

    /// Run `instructions` signed only by the context payer
    pub async fn as_payer(&mut self, instructions: &[Instruction]) -> Result<(), BanksClientError> {
        process(&mut self.context, instructions, &[]).await
    }

    pub async fn create_raffle(
        &mut self,
        start_time: i64,
        end_time: i64,
        total_tickets: u64,
        prize_amount: u64,
    ) -> Result<u64, BanksClientError> {
        let raffle_index = self.config().await.next_raffle_index;
        let ix = instruction::create_raffle(
            &self.program_id,
            &self.admin.pubkey(),
            raffle_index,
            title("Weekly draw"),
            start_time,
            end_time,
            total_tickets,
            prize_amount,
        )
        .unwrap();
        self.as_admin(&[ix]).await?;
        Ok(raffle_index)
    }

    pub fn buy_ix(&self, i: usize, raffle_index: u64, count: u64, payment: u64) -> Instruction {
        instruction::buy_tickets(
            &self.program_id,
            &self.user(i),
            raffle_index,
            &self.purchase_accounts(),
            count,
            payment,
        )
        .unwrap()
    }

    /// User `i` buys `count` tickets at the default price
    pub async fn buy(
        &mut self,
        i: usize,
        raffle_index: u64,
        count: u64,
    ) -> Result<(), BanksClientError> {
        let ix = self.buy_ix(i, raffle_index, count, count * TICKET_LAMPORTS);
        self.as_user(i, &[ix]).await
    }

    /// User `i` opens the draw for `raffle_index` with the next request id
    pub async fn request_winner(&mut self, i: usize, raffle_index: u64) -> Result<u64, BanksClientError> {
        let request_id = self.config().await.next_request_id;
        let ix = instruction::request_winner(&self.program_id, &self.user(i), raffle_index, request_id)
            .unwrap();
        self.as_user(i, &[ix]).await?;
        Ok(request_id)
    }

    /// Seed stored on `request_id`, zeroes when no such request exists
    pub async fn request_seed(&mut self, request_id: u64) -> [u8; 32] {
        let key = find_request_address(&self.program_id, request_id).0;
        match self.context.banks_client.get_account(key).await.unwrap() {
            Some(account) => RandomnessRequest::unpack(&account.data).unwrap().seed,
            None => [0u8; 32],
        }
    }

    /// The randomness authority signs the request seed and fulfills it
    pub async fn fulfill(&mut self, raffle_index: u64, request_id: u64) -> Result<(), BanksClientError> {
        let seed = self.request_seed(request_id).await;
        let (proof, randomness) = sign_seed(&self.randomness_authority, seed);
        let ix = instruction::fulfill_randomness(
            &self.program_id,
            &self.randomness_authority.pubkey(),
            raffle_index,
            request_id,
            randomness,
        )
        .unwrap();
        process(&mut self.context, &[proof, ix], &[&self.randomness_authority]).await
    }

    /// Index into `users` of the wallet `key`
    pub fn user_index(&self, key: &Pubkey) -> usize {
        self.users
            .iter()
            .position(|user| user.pubkey() == *key)
            .expect("not a test user")
    }

    pub async fn reroll(&mut self, i: usize, raffle_index: u64) -> Result<(), BanksClientError> {
        let next_request_id = self.config().await.next_request_id;
        let ix = instruction::reroll_winner(&self.program_id, &self.user(i), raffle_index, next_request_id)
            .unwrap();
        self.as_user(i, &[ix]).await
    }
}

/// Ed25519 verify instruction for `signer`'s signature over `seed`, and the
/// randomness that signature yields
pub fn sign_seed(signer: &Keypair, seed: [u8; 32]) -> (Instruction, [u8; 32]) {
    let signature = signer.sign_message(&seed);
    let mut bytes = [0u8; SIGNATURE_LEN];
    bytes.copy_from_slice(signature.as_ref());
    (
        instruction::randomness_proof(&signer.pubkey(), bytes, seed),
        randomness_from_signature(&bytes),
    )
}
