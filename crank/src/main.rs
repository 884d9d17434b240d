//! Reroll crank
//!
//! Every interval, looks at the newest raffles and rerolls the ones whose
//! winner let the claim window lapse.

use anyhow::anyhow;
use clap::Parser;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    pubkey::Pubkey,
    signature::{read_keypair_file, Signer},
};
use std::{env, path::PathBuf, time::Duration};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use tierdraw_crank::{RerollCrank, RpcRerollClient, DEFAULT_LOOKBACK};

#[derive(Parser, Debug)]
#[command(name = "tierdraw-crank", version, about)]
struct Args {
    /// JSON-RPC endpoint
    #[arg(short, long, default_value = "http://127.0.0.1:8899", env = "TIERDRAW_RPC_URL")]
    url: String,

    #[arg(short, long, env = "TIERDRAW_PROGRAM_ID")]
    program_id: Pubkey,

    /// Keypair that signs and pays for rerolls
    #[arg(short, long, env = "TIERDRAW_KEYPAIR")]
    keypair: PathBuf,

    /// Seconds between ticks
    #[arg(long, default_value_t = 30)]
    interval: u64,

    /// Newest raffles looked at per tick
    #[arg(long, default_value_t = DEFAULT_LOOKBACK)]
    lookback: usize,

    /// Run a single tick and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let payer = read_keypair_file(&args.keypair)
        .map_err(|err| anyhow!("reading {}: {}", args.keypair.display(), err))?;

    let mut crank = RerollCrank::new(args.program_id, payer.pubkey());
    crank.lookback = args.lookback;
    let mut client =
        RpcRerollClient::new(args.url.clone(), CommitmentConfig::confirmed(), args.program_id, payer);
    info!(
        "Crank for program {} on {}, payer {}, every {}s",
        args.program_id,
        args.url,
        client.payer(),
        args.interval
    );

    let mut interval = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        // The RPC client blocks
        match tokio::task::block_in_place(|| crank.tick(&mut client)) {
            Ok(report) => info!(
                "Tick: scanned={}, eligible={}, submitted={:?}, skipped={}, failed={}",
                report.scanned, report.eligible, report.submitted, report.skipped, report.failed
            ),
            Err(err) => warn!("Tick aborted: {}", err),
        }
        if args.once {
            return Ok(());
        }
    }
}
