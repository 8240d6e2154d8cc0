// SPDX-License-Identifier: AGPL-3.0

//! JSON scenario files: block context, accounts and one transaction
//!
//! Numeric fields are decimal or `0x`-prefixed hex strings. A field written
//! as `$name` becomes a fresh symbol named `name`; symbols are unconstrained
//! unless the scenario pins them in `assume`.

use anyhow::{bail, Context, Result};
use evmsym_bitvec::SymBitVec;
use evmsym_bytevec::ByteVec;
use evmsym_config::Config;
use evmsym_sevm::{Address, BlockContext, CallKind, EvmWorld, TxRequest};
use evmsym_solver::ConstraintSet;
use num_bigint::BigUint;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub block: BlockSpec,

    #[serde(default)]
    pub accounts: BTreeMap<String, AccountSpec>,

    pub transaction: TransactionSpec,

    /// `name -> value` pins for symbols introduced with `$name`
    #[serde(default)]
    pub assume: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockSpec {
    pub number: Option<String>,
    pub timestamp: Option<String>,
    pub difficulty: Option<String>,
    pub coinbase: Option<String>,
    pub gaslimit: Option<String>,
    pub chain_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountSpec {
    #[serde(default)]
    pub balance: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub storage: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxMode {
    /// Nonce, intrinsic gas, value transfer and fee settlement
    #[default]
    Full,
    /// Bare context as used by VM test vectors
    Raw,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransactionSpec {
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub mode: TxMode,
    pub caller: String,
    /// Target of a call; for a raw creation, where the contract is installed
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub data: String,
    /// Number of fresh symbolic bytes appended to `data`
    #[serde(default)]
    pub symbolic_data: usize,
    pub gas: String,
    #[serde(default)]
    pub price: Option<String>,
}

fn default_kind() -> String {
    "call".to_string()
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("Invalid scenario {}", path.display()))
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Failed to parse scenario")
    }

    /// Build the world, open the transaction, and return the constraints
    /// gathered from symbolic fields
    pub fn prepare(&self, config: Config) -> Result<(EvmWorld, ConstraintSet)> {
        let mut symbols = Symbols::default();
        let block = self.block.build(&mut symbols)?;
        let mut world = EvmWorld::new(block, config);

        for (at, account) in &self.accounts {
            let address = parse_address(at)?;
            let balance = symbols.word(account.balance.as_deref(), "balance")?;
            let nonce = symbols.word(account.nonce.as_deref(), "nonce")?;
            let code = parse_hex(&account.code)
                .with_context(|| format!("Invalid code for {}", at))?;
            world.create_account(address, balance, nonce, code)?;
            for (key, value) in &account.storage {
                let key = symbols.word(Some(key.as_str()), "key")?;
                let value = symbols.word(Some(value.as_str()), "value")?;
                world.world_mut().set_storage_data(&address, key, value);
            }
        }

        self.transaction.open(&mut world, &mut symbols)?;

        for (name, value) in &self.assume {
            let Some(symbol) = symbols.named.get(name) else {
                bail!("assumption for unknown symbol ${}", name);
            };
            let value = parse_u256(value)?;
            symbols
                .constraints
                .add(symbol.equals(&SymBitVec::from_biguint(value, 256)));
        }
        Ok((world, symbols.constraints))
    }
}

impl BlockSpec {
    fn build(&self, symbols: &mut Symbols) -> Result<BlockContext> {
        let defaults = BlockContext::default();
        let field = |symbols: &mut Symbols, text: &Option<String>, default: SymBitVec| {
            match text {
                Some(text) => symbols.word(Some(text.as_str()), "block"),
                None => Ok(default),
            }
        };
        let coinbase = match &self.coinbase {
            Some(text) if !text.starts_with('$') => parse_address(text)?.to_word(),
            other => field(symbols, other, defaults.coinbase)?,
        };
        Ok(BlockContext {
            number: field(symbols, &self.number, defaults.number)?,
            timestamp: field(symbols, &self.timestamp, defaults.timestamp)?,
            difficulty: field(symbols, &self.difficulty, defaults.difficulty)?,
            coinbase,
            gaslimit: field(symbols, &self.gaslimit, defaults.gaslimit)?,
            chain_id: field(symbols, &self.chain_id, defaults.chain_id)?,
        })
    }
}

impl TransactionSpec {
    fn kind(&self) -> Result<CallKind> {
        match self.kind.to_ascii_lowercase().as_str() {
            "call" => Ok(CallKind::Call),
            "create" => Ok(CallKind::Create),
            "callcode" if self.mode == TxMode::Raw => Ok(CallKind::CallCode),
            "delegatecall" if self.mode == TxMode::Raw => Ok(CallKind::DelegateCall),
            "staticcall" if self.mode == TxMode::Raw => Ok(CallKind::StaticCall),
            other => bail!("unsupported {:?} transaction kind {}", self.mode, other),
        }
    }

    fn open(&self, world: &mut EvmWorld, symbols: &mut Symbols) -> Result<()> {
        let kind = self.kind()?;
        let caller = parse_address(&self.caller)?;
        let address = match &self.address {
            Some(text) => parse_address(text)?,
            None if kind.is_create() && self.mode == TxMode::Full => Address::default(),
            None => bail!("transaction needs an address"),
        };
        let value = symbols.word(self.value.as_deref(), "value")?;
        let gas = symbols.word(Some(self.gas.as_str()), "gas")?;
        let price = symbols.word(self.price.as_deref(), "price")?;

        let mut data = ByteVec::from_bytes(&parse_hex(&self.data).context("Invalid data")?);
        if self.symbolic_data > 0 {
            let tail = symbols.constraints.new_bytes(self.symbolic_data, "data");
            let offset = data.len();
            data.write(offset, &tail);
        }

        match self.mode {
            TxMode::Raw => world.open_transaction(kind, address, price, data, caller, value, gas)?,
            TxMode::Full => world.start_transaction(TxRequest {
                kind,
                caller,
                address,
                value,
                data,
                gas,
                price,
            })?,
        }
        Ok(())
    }
}

/// Symbols introduced while reading a scenario
#[derive(Default)]
struct Symbols {
    constraints: ConstraintSet,
    named: BTreeMap<String, SymBitVec>,
}

impl Symbols {
    /// A concrete word, a `$name` symbol, or zero when absent
    fn word(&mut self, text: Option<&str>, hint: &str) -> Result<SymBitVec> {
        let Some(text) = text else {
            return Ok(SymBitVec::zero(256));
        };
        let Some(name) = text.strip_prefix('$') else {
            return Ok(SymBitVec::from_biguint(parse_u256(text)?, 256));
        };
        if let Some(symbol) = self.named.get(name) {
            return Ok(symbol.clone());
        }
        let name = if name.is_empty() { hint } else { name };
        let symbol = self.constraints.new_bitvec(256, name);
        self.named.insert(name.to_string(), symbol.clone());
        Ok(symbol)
    }
}

pub fn parse_u256(text: &str) -> Result<BigUint> {
    let text = text.trim();
    let value = match text.strip_prefix("0x") {
        Some(digits) if digits.is_empty() => Some(BigUint::default()),
        Some(digits) => BigUint::parse_bytes(digits.as_bytes(), 16),
        None => BigUint::parse_bytes(text.as_bytes(), 10),
    };
    let Some(value) = value else {
        bail!("invalid number {:?}", text);
    };
    if value.bits() > 256 {
        bail!("{} does not fit in 256 bits", text);
    }
    Ok(value)
}

fn parse_address(text: &str) -> Result<Address> {
    Ok(Address::from_hex(text)?)
}

fn parse_hex(text: &str) -> Result<Vec<u8>> {
    Ok(hex::decode(text.trim().trim_start_matches("0x"))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use evmsym_sevm::RunState;
    use pretty_assertions::assert_eq;

    const SCENARIO: &str = r#"{
        "block": { "coinbase": "0x2adc25665018aa1fe0e6bc666dac8fc2697ff9ba" },
        "accounts": {
            "0x1000": { "balance": "1000000", "code": "0x00" },
            "0x2000": { "code": "0x", "storage": { "0x0": "0x1" } }
        },
        "transaction": {
            "caller": "0x1000",
            "address": "0x2000",
            "value": "$value",
            "gas": "21000"
        },
        "assume": { "value": "5" }
    }"#;

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse_u256("0x10").unwrap(), BigUint::from(16u8));
        assert_eq!(parse_u256("10").unwrap(), BigUint::from(10u8));
        assert_eq!(parse_u256("0x").unwrap(), BigUint::default());
        assert!(parse_u256("0xzz").is_err());
        assert!(parse_u256(&format!("0x1{}", "0".repeat(64))).is_err());
    }

    #[test]
    fn test_prepare_pins_assumed_symbols() {
        let scenario = Scenario::from_json_str(SCENARIO).unwrap();
        let (mut world, constraints) = scenario.prepare(Config::default()).unwrap();
        assert_eq!(constraints.len(), 1);
        let storage = world.get_storage_data(
            &Address::from_low_u64(0x2000),
            &SymBitVec::word(0),
        );
        assert_eq!(storage, SymBitVec::word(1));
        assert!(world.is_running());
        // the upfront cost depends on the symbolic value
        assert!(matches!(world.run().unwrap(), RunState::Suspended(_)));
    }

    #[test]
    fn test_unknown_assumption_is_rejected() {
        let text = SCENARIO.replace(r#""assume": { "value": "5" }"#, r#""assume": { "x": "5" }"#);
        let scenario = Scenario::from_json_str(&text).unwrap();
        assert!(scenario.prepare(Config::default()).is_err());
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let text = SCENARIO.replace("\"gas\"", "\"gass\"");
        assert!(Scenario::from_json_str(&text).is_err());
    }
}
