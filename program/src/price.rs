// Price feed adapter: USD ticket price to lamports
use arrayref::array_ref;
use solana_program::{clock::UnixTimestamp, msg};
use std::convert::TryFrom;

use crate::error::SettlementError;

/// Magic number at the start of every Pyth v2 price account
pub const PYTH_MAGIC: u32 = 0xa1b2c3d4;

// Byte offsets into a Pyth v2 price account
pub const EXPONENT_OFFSET: usize = 20;
pub const PUBLISH_TIME_OFFSET: usize = 96;
pub const PREV_PRICE_OFFSET: usize = 184;
pub const PREV_PUBLISH_TIME_OFFSET: usize = 200;
pub const AGGREGATE_PRICE_OFFSET: usize = 208;
pub const AGGREGATE_STATUS_OFFSET: usize = 224;
/// Slot of the aggregate, not a timestamp
pub const AGGREGATE_PUB_SLOT_OFFSET: usize = 232;

/// Shortest price account that still holds the whole aggregate
pub const MIN_PRICE_ACCOUNT_LEN: usize = AGGREGATE_PUB_SLOT_OFFSET + 8;

/// Aggregate status of a feed that is currently publishing
pub const PRICE_STATUS_TRADING: u32 = 1;

/// Lamports per SOL is 10^9 and USD amounts carry 6 decimals
const LAMPORT_USD_SCALE_EXP: u32 = 3;

/// What to do with a price older than the configured maximum age
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StalePricePolicy {
    /// Fail with `StaleOracleData`
    Reject,
    /// Log the age and use the price anyway
    Warn,
}

impl Default for StalePricePolicy {
    fn default() -> Self {
        StalePricePolicy::Reject
    }
}

impl TryFrom<u8> for StalePricePolicy {
    type Error = &'static str;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        match val {
            0 => Ok(StalePricePolicy::Reject),
            1 => Ok(StalePricePolicy::Warn),
            _ => Err("Invalid stale price policy"),
        }
    }
}

impl From<StalePricePolicy> for u8 {
    fn from(policy: StalePricePolicy) -> Self {
        match policy {
            StalePricePolicy::Reject => 0,
            StalePricePolicy::Warn => 1,
        }
    }
}

/// Aggregate SOL/USD price read from a feed account
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PriceReading {
    pub price: i64,
    pub expo: i32,
    pub publish_time: UnixTimestamp,
}

impl PriceReading {
    pub fn parse(data: &[u8]) -> Result<Self, SettlementError> {
        if data.len() < MIN_PRICE_ACCOUNT_LEN {
            msg!("Price account too short: {} bytes", data.len());
            return Err(SettlementError::InvalidPriceFeed);
        }
        let magic = u32::from_le_bytes(*array_ref![data, 0, 4]);
        if magic != PYTH_MAGIC {
            msg!("Price account has wrong magic {:#x}", magic);
            return Err(SettlementError::InvalidPriceFeed);
        }

        let expo = i32::from_le_bytes(*array_ref![data, EXPONENT_OFFSET, 4]);
        let status = u32::from_le_bytes(*array_ref![data, AGGREGATE_STATUS_OFFSET, 4]);
        // Outside trading the aggregate is not current; fall back to the last good one
        let reading = if status == PRICE_STATUS_TRADING {
            PriceReading {
                price: i64::from_le_bytes(*array_ref![data, AGGREGATE_PRICE_OFFSET, 8]),
                expo,
                publish_time: i64::from_le_bytes(*array_ref![data, PUBLISH_TIME_OFFSET, 8]),
            }
        } else {
            PriceReading {
                price: i64::from_le_bytes(*array_ref![data, PREV_PRICE_OFFSET, 8]),
                expo,
                publish_time: i64::from_le_bytes(*array_ref![data, PREV_PUBLISH_TIME_OFFSET, 8]),
            }
        };
        if reading.price <= 0 || reading.expo > 0 {
            msg!("Unusable price {} expo {}", reading.price, reading.expo);
            return Err(SettlementError::InvalidPriceFeed);
        }
        Ok(reading)
    }

    /// Seconds since publication; a publish time ahead of `now` counts as fresh
    pub fn age(&self, now: UnixTimestamp) -> i64 {
        now.saturating_sub(self.publish_time).max(0)
    }

    pub fn check_freshness(
        &self,
        now: UnixTimestamp,
        max_age: i64,
        policy: StalePricePolicy,
    ) -> Result<(), SettlementError> {
        let age = self.age(now);
        if age <= max_age {
            return Ok(());
        }
        match policy {
            StalePricePolicy::Reject => {
                msg!("Price is {}s old, max {}s", age, max_age);
                Err(SettlementError::StaleOracleData)
            }
            StalePricePolicy::Warn => {
                msg!("Warning: using price {}s old, max {}s", age, max_age);
                Ok(())
            }
        }
    }

    /// Convert a 6-decimal USD amount into lamports at this price
    pub fn usd_to_lamports(&self, usd_micro: u64) -> Result<u64, SettlementError> {
        let decimals = self.expo.unsigned_abs();
        let scale = 10u128
            .checked_pow(LAMPORT_USD_SCALE_EXP + decimals)
            .ok_or(SettlementError::InvalidPriceFeed)?;
        let lamports = (usd_micro as u128)
            .checked_mul(scale)
            .ok_or(SettlementError::MathOverflow)?
            / self.price as u128;
        u64::try_from(lamports).map_err(|_| SettlementError::MathOverflow)
    }
}

/// Current ticket price in lamports
pub fn ticket_price_lamports(
    feed_data: &[u8],
    usd_micro: u64,
    now: UnixTimestamp,
    max_age: i64,
    policy: StalePricePolicy,
) -> Result<u64, SettlementError> {
    let reading = PriceReading::parse(feed_data)?;
    reading.check_freshness(now, max_age, policy)?;
    reading.usd_to_lamports(usd_micro)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUB_SLOT: u64 = 250_000_000;

    fn write(data: &mut [u8], offset: usize, bytes: &[u8]) {
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Pyth v2 price account with a trading aggregate, sized like a live feed
    fn price_account(price: i64, expo: i32, publish_time: i64) -> Vec<u8> {
        let mut data = vec![0u8; 3312];
        write(&mut data, 0, &PYTH_MAGIC.to_le_bytes());
        write(&mut data, 4, &2u32.to_le_bytes());
        write(&mut data, 8, &3u32.to_le_bytes());
        write(&mut data, EXPONENT_OFFSET, &expo.to_le_bytes());
        // ema price and confidence sit between the header and the timestamp
        write(&mut data, 48, &(price - 7).to_le_bytes());
        write(&mut data, 72, &1_000i64.to_le_bytes());
        write(&mut data, PUBLISH_TIME_OFFSET, &publish_time.to_le_bytes());
        write(&mut data, PREV_PRICE_OFFSET, &(price / 2).to_le_bytes());
        write(&mut data, PREV_PUBLISH_TIME_OFFSET, &(publish_time - 400).to_le_bytes());
        write(&mut data, AGGREGATE_PRICE_OFFSET, &price.to_le_bytes());
        write(&mut data, AGGREGATE_STATUS_OFFSET, &PRICE_STATUS_TRADING.to_le_bytes());
        write(&mut data, AGGREGATE_PUB_SLOT_OFFSET, &PUB_SLOT.to_le_bytes());
        data
    }

    #[test]
    fn converts_usd_to_lamports() {
        // SOL at $150.00000000, ticket at $3.00
        let data = price_account(15_000_000_000, -8, 1_000);
        let lamports = ticket_price_lamports(&data, 3_000_000, 1_000, 60, StalePricePolicy::Reject)
            .unwrap();
        assert_eq!(lamports, 20_000_000);

        // SOL at $200.00, ticket at $1.00
        let reading = PriceReading::parse(&price_account(20_000, -2, 0)).unwrap();
        assert_eq!(reading.usd_to_lamports(1_000_000).unwrap(), 5_000_000);
    }

    #[test]
    fn rejects_malformed_feeds() {
        let mut data = price_account(15_000_000_000, -8, 0);
        data[0] = 0;
        assert_eq!(PriceReading::parse(&data), Err(SettlementError::InvalidPriceFeed));

        let data = price_account(15_000_000_000, -8, 0);
        assert_eq!(
            PriceReading::parse(&data[..MIN_PRICE_ACCOUNT_LEN - 1]),
            Err(SettlementError::InvalidPriceFeed)
        );
        assert_eq!(
            PriceReading::parse(&price_account(0, -8, 0)),
            Err(SettlementError::InvalidPriceFeed)
        );
        assert_eq!(
            PriceReading::parse(&price_account(-5, -8, 0)),
            Err(SettlementError::InvalidPriceFeed)
        );
        assert_eq!(
            PriceReading::parse(&price_account(5, 2, 0)),
            Err(SettlementError::InvalidPriceFeed)
        );
    }

    #[test]
    fn staleness_policy() {
        let data = price_account(15_000_000_000, -8, 1_000);

        assert!(ticket_price_lamports(&data, 1_000_000, 4_600, 3_600, StalePricePolicy::Reject).is_ok());
        assert_eq!(
            ticket_price_lamports(&data, 1_000_000, 4_601, 3_600, StalePricePolicy::Reject),
            Err(SettlementError::StaleOracleData)
        );
        assert!(ticket_price_lamports(&data, 1_000_000, 4_601, 3_600, StalePricePolicy::Warn).is_ok());

        let reading = PriceReading::parse(&data).unwrap();
        assert_eq!(reading.age(900), 0);
    }

    #[test]
    fn publish_time_comes_from_timestamp_not_slot() {
        let now = 1_700_000_000;
        let data = price_account(15_000_000_000, -8, now - 5);

        let reading = PriceReading::parse(&data).unwrap();
        assert_eq!(reading.publish_time, now - 5);
        assert_eq!(reading.age(now), 5);
        assert!(ticket_price_lamports(&data, 1_000_000, now, 3_600, StalePricePolicy::Reject).is_ok());
    }

    #[test]
    fn halted_feed_uses_previous_aggregate() {
        let mut data = price_account(15_000_000_000, -8, 5_000);
        write(&mut data, AGGREGATE_STATUS_OFFSET, &0u32.to_le_bytes());

        let reading = PriceReading::parse(&data).unwrap();
        assert_eq!(reading.price, 7_500_000_000);
        assert_eq!(reading.publish_time, 4_600);
        assert_eq!(
            ticket_price_lamports(&data, 1_000_000, 4_600 + 3_601, 3_600, StalePricePolicy::Reject),
            Err(SettlementError::StaleOracleData)
        );
    }

    #[test]
    fn policy_codes() {
        assert_eq!(StalePricePolicy::default(), StalePricePolicy::Reject);
        assert_eq!(StalePricePolicy::try_from(1u8), Ok(StalePricePolicy::Warn));
        assert!(StalePricePolicy::try_from(2u8).is_err());
    }
}
