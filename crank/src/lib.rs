// Off-chain reroll crank for the tierdraw program
pub mod crank;
pub mod rpc;

pub use crank::{CrankError, CrankReport, RerollClient, RerollCrank, DEFAULT_LOOKBACK};
pub use rpc::RpcRerollClient;
