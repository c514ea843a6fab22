//! Attribute resolution for policy conditions.
//!
//! [`BalanceLedger`] is a file-backed token balance table standing in for a
//! chain RPC endpoint.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AccessError;

/// Looks up on-chain attributes of a subject.
#[async_trait]
pub trait AttributeResolver: Send + Sync {
    /// `balanceOf(holder[, token_id])` on `contract`, as a decimal string.
    async fn balance_of(
        &self,
        chain: &str,
        contract: &str,
        holder: &str,
        token_id: Option<&str>,
    ) -> Result<String, AccessError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub chain: String,
    pub contract_address: String,
    #[serde(default)]
    pub token_id: String,
    pub holder: String,
    pub balance: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    balances: Vec<LedgerEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LedgerKey {
    chain: String,
    contract: String,
    token_id: String,
    holder: String,
}

impl LedgerKey {
    fn new(chain: &str, contract: &str, token_id: &str, holder: &str) -> Self {
        Self {
            chain: chain.to_ascii_lowercase(),
            contract: contract.to_ascii_lowercase(),
            token_id: token_id.to_string(),
            holder: holder.to_ascii_lowercase(),
        }
    }
}

/// In-memory balance table. Unknown holders have balance 0.
#[derive(Debug, Default)]
pub struct BalanceLedger {
    balances: RwLock<HashMap<LedgerKey, String>>,
}

impl BalanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `{"balances": [...]}` from `path`. A missing file is an empty ledger.
    pub async fn load(path: &Path) -> Result<Self, AccessError> {
        let ledger = Self::new();
        if !path.exists() {
            tracing::warn!(path = %path.display(), "ledger file not found, all balances are 0");
            return Ok(ledger);
        }
        let raw = tokio::fs::read(path)
            .await
            .map_err(|e| AccessError::Service(format!("reading ledger {}: {e}", path.display())))?;
        let file: LedgerFile = serde_json::from_slice(&raw)
            .map_err(|e| AccessError::Service(format!("parsing ledger {}: {e}", path.display())))?;
        for entry in file.balances {
            ledger.set_balance(
                &entry.chain,
                &entry.contract_address,
                &entry.token_id,
                &entry.holder,
                entry.balance,
            );
        }
        Ok(ledger)
    }

    pub fn set_balance(
        &self,
        chain: &str,
        contract: &str,
        token_id: &str,
        holder: &str,
        balance: impl Into<String>,
    ) {
        self.balances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(LedgerKey::new(chain, contract, token_id, holder), balance.into());
    }

    pub fn len(&self) -> usize {
        self.balances.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AttributeResolver for BalanceLedger {
    async fn balance_of(
        &self,
        chain: &str,
        contract: &str,
        holder: &str,
        token_id: Option<&str>,
    ) -> Result<String, AccessError> {
        let key = LedgerKey::new(chain, contract, token_id.unwrap_or(""), holder);
        Ok(self
            .balances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
            .unwrap_or_else(|| "0".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTRACT: &str = "0xABCDEFabcdefABCDEFabcdefABCDEFabcdefABCD";
    const HOLDER: &str = "0x1111111111111111111111111111111111111111";

    #[tokio::test]
    async fn unknown_holder_has_zero_balance() {
        let ledger = BalanceLedger::new();
        let balance = ledger
            .balance_of("ethereum", CONTRACT, HOLDER, Some("7"))
            .await
            .unwrap();
        assert_eq!(balance, "0");
    }

    #[tokio::test]
    async fn lookup_is_case_insensitive_on_addresses() {
        let ledger = BalanceLedger::new();
        ledger.set_balance("ethereum", CONTRACT, "7", HOLDER, "3");
        let balance = ledger
            .balance_of("Ethereum", &CONTRACT.to_lowercase(), HOLDER, Some("7"))
            .await
            .unwrap();
        assert_eq!(balance, "3");
    }

    #[tokio::test]
    async fn token_ids_are_distinct() {
        let ledger = BalanceLedger::new();
        ledger.set_balance("ethereum", CONTRACT, "7", HOLDER, "1");
        let other = ledger
            .balance_of("ethereum", CONTRACT, HOLDER, Some("8"))
            .await
            .unwrap();
        assert_eq!(other, "0");
    }

    #[tokio::test]
    async fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(
            &path,
            format!(
                r#"{{"balances":[{{"chain":"ethereum","contractAddress":"{CONTRACT}","tokenId":"1","holder":"{HOLDER}","balance":"2"}}]}}"#
            ),
        )
        .unwrap();

        let ledger = BalanceLedger::load(&path).await.unwrap();
        assert_eq!(ledger.len(), 1);
        let balance = ledger
            .balance_of("ethereum", CONTRACT, HOLDER, Some("1"))
            .await
            .unwrap();
        assert_eq!(balance, "2");
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = BalanceLedger::load(&dir.path().join("none.json")).await.unwrap();
        assert!(ledger.is_empty());
    }
}
