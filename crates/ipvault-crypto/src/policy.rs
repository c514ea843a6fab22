//! Access-policy descriptors
//!
//! A policy is an ordered list of conditions joined by boolean operators,
//! serialized in the unified access-control-condition JSON shape:
//!
//! ```json
//! [
//!   {"conditionType":"evmBasic","contractAddress":"0x..","standardContractType":"ERC1155",
//!    "chain":"ethereum","method":"balanceOf","parameters":[":userAddress","7"],
//!    "returnValueTest":{"comparator":">","value":"0"}},
//!   {"operator":"or"},
//!   {"conditionType":"evmBasic","contractAddress":"","standardContractType":"",
//!    "chain":"ethereum","method":"","parameters":[":userAddress"],
//!    "returnValueTest":{"comparator":"=","value":"0x.."}}
//! ]
//! ```
//!
//! Policies are validated when built or parsed: conditions and operators
//! must alternate, starting and ending with a condition.

use ipvault_core::types::is_evm_address;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use thiserror::Error;

/// Placeholder the evaluator replaces with the caller's address.
pub const USER_ADDRESS: &str = ":userAddress";

pub const EVM_BASIC: &str = "evmBasic";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("policy has no conditions")]
    Empty,

    #[error("operator at position {position} lacks a condition on both sides")]
    DanglingOperator { position: usize },

    #[error("condition at position {position} follows another condition without an operator")]
    MissingOperator { position: usize },

    #[error("condition at position {position} is invalid: {reason}")]
    InvalidCondition { position: usize, reason: String },

    #[error("invalid address {0:?}")]
    InvalidAddress(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Comparator {
    /// Compare a resolved value against the expected one.
    ///
    /// Unsigned decimal strings of any length compare numerically; anything
    /// else only supports (case-insensitive) equality.
    pub fn test(self, actual: &str, expected: &str) -> bool {
        let ordering = match (as_decimal(actual), as_decimal(expected)) {
            (Some(a), Some(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            _ => {
                let equal = actual.eq_ignore_ascii_case(expected);
                return match self {
                    Comparator::Eq => equal,
                    Comparator::Ne => !equal,
                    _ => false,
                };
            }
        };
        match self {
            Comparator::Gt => ordering == Ordering::Greater,
            Comparator::Ge => ordering != Ordering::Less,
            Comparator::Lt => ordering == Ordering::Less,
            Comparator::Le => ordering != Ordering::Greater,
            Comparator::Eq => ordering == Ordering::Equal,
            Comparator::Ne => ordering != Ordering::Equal,
        }
    }
}

/// Digits with leading zeros stripped, or None if `s` is not a decimal.
fn as_decimal(s: &str) -> Option<&str> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let trimmed = s.trim_start_matches('0');
    Some(if trimmed.is_empty() { "0" } else { trimmed })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnValueTest {
    pub comparator: Comparator,
    pub value: String,
}

/// One attribute check against the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub condition_type: String,
    pub contract_address: String,
    pub standard_contract_type: String,
    pub chain: String,
    pub method: String,
    pub parameters: Vec<String>,
    pub return_value_test: ReturnValueTest,
}

/// The token a protected document is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetTarget {
    pub contract_address: String,
    pub chain: String,
    pub token_id: String,
}

impl AssetTarget {
    pub fn new(
        contract_address: impl Into<String>,
        chain: impl Into<String>,
        token_id: impl Into<String>,
    ) -> Result<Self, PolicyError> {
        let contract_address = contract_address.into();
        if !is_evm_address(&contract_address) {
            return Err(PolicyError::InvalidAddress(contract_address));
        }
        Ok(Self {
            contract_address: contract_address.to_ascii_lowercase(),
            chain: chain.into(),
            token_id: token_id.into(),
        })
    }
}

impl Condition {
    /// `balanceOf(:userAddress, tokenId) > 0` on an ERC-1155 contract.
    pub fn token_balance(target: &AssetTarget) -> Self {
        Self::balance_at_least(target, Comparator::Gt)
    }

    /// `balanceOf(:userAddress, tokenId) >= 0`: any wallet passes.
    pub fn any_wallet(target: &AssetTarget) -> Self {
        Self::balance_at_least(target, Comparator::Ge)
    }

    fn balance_at_least(target: &AssetTarget, comparator: Comparator) -> Self {
        Self {
            condition_type: EVM_BASIC.into(),
            contract_address: target.contract_address.clone(),
            standard_contract_type: "ERC1155".into(),
            chain: target.chain.clone(),
            method: "balanceOf".into(),
            parameters: vec![USER_ADDRESS.into(), target.token_id.clone()],
            return_value_test: ReturnValueTest {
                comparator,
                value: "0".into(),
            },
        }
    }

    /// `:userAddress = address`.
    pub fn address_equals(chain: &str, address: &str) -> Self {
        Self {
            condition_type: EVM_BASIC.into(),
            contract_address: String::new(),
            standard_contract_type: String::new(),
            chain: chain.into(),
            method: String::new(),
            parameters: vec![USER_ADDRESS.into()],
            return_value_test: ReturnValueTest {
                comparator: Comparator::Eq,
                value: address.to_ascii_lowercase(),
            },
        }
    }

    fn check(&self, position: usize) -> Result<(), PolicyError> {
        let invalid = |reason: &str| PolicyError::InvalidCondition {
            position,
            reason: reason.into(),
        };
        if self.condition_type.is_empty() {
            return Err(invalid("empty conditionType"));
        }
        if self.chain.is_empty() {
            return Err(invalid("empty chain"));
        }
        if self.parameters.is_empty() {
            return Err(invalid("no parameters"));
        }
        if !self.method.is_empty() && !is_evm_address(&self.contract_address) {
            return Err(invalid("method call without a contract address"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PolicyNode {
    Operator { operator: BoolOp },
    Condition(Condition),
}

/// A validated policy. Reduces to exactly one boolean.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<PolicyNode>", into = "Vec<PolicyNode>")]
pub struct AccessPolicy {
    nodes: Vec<PolicyNode>,
}

impl AccessPolicy {
    pub fn new(nodes: Vec<PolicyNode>) -> Result<Self, PolicyError> {
        validate(&nodes)?;
        Ok(Self { nodes })
    }

    /// Full-content profile: the caller holds the document's token.
    pub fn full_content(target: &AssetTarget) -> Self {
        Self {
            nodes: vec![PolicyNode::Condition(Condition::token_balance(target))],
        }
    }

    /// Preview profile: any wallet, or a holder of the token. Never stricter
    /// than [`AccessPolicy::full_content`].
    pub fn preview(target: &AssetTarget) -> Self {
        Self {
            nodes: vec![
                PolicyNode::Condition(Condition::any_wallet(target)),
                PolicyNode::Operator {
                    operator: BoolOp::Or,
                },
                PolicyNode::Condition(Condition::token_balance(target)),
            ],
        }
    }

    /// Also grant access to `recipient`.
    pub fn with_recipient(mut self, recipient: &str) -> Result<Self, PolicyError> {
        if !is_evm_address(recipient) {
            return Err(PolicyError::InvalidAddress(recipient.to_string()));
        }
        let chain = self
            .conditions()
            .next()
            .map(|c| c.chain.clone())
            .unwrap_or_default();
        self.nodes.push(PolicyNode::Operator {
            operator: BoolOp::Or,
        });
        self.nodes
            .push(PolicyNode::Condition(Condition::address_equals(&chain, recipient)));
        Ok(self)
    }

    pub fn nodes(&self) -> &[PolicyNode] {
        &self.nodes
    }

    pub fn conditions(&self) -> impl Iterator<Item = &Condition> {
        self.nodes.iter().filter_map(|n| match n {
            PolicyNode::Condition(c) => Some(c),
            PolicyNode::Operator { .. } => None,
        })
    }

    /// Evaluate with `and` binding tighter than `or`.
    ///
    /// `check` is called for conditions in order; evaluation short-circuits
    /// within an `and` group once it is false.
    pub fn evaluate<E>(
        &self,
        mut check: impl FnMut(&Condition) -> Result<bool, E>,
    ) -> Result<bool, E> {
        let mut any_group = false;
        let mut group = true;
        for node in &self.nodes {
            match node {
                PolicyNode::Condition(c) => {
                    if group {
                        group = check(c)?;
                    }
                }
                PolicyNode::Operator {
                    operator: BoolOp::And,
                } => {}
                PolicyNode::Operator {
                    operator: BoolOp::Or,
                } => {
                    any_group |= group;
                    group = true;
                }
            }
        }
        Ok(any_group || group)
    }

    /// SHA-256 over the canonical JSON form; binds ciphertexts to a policy.
    pub fn digest(&self) -> Result<[u8; 32], serde_json::Error> {
        let bytes = serde_json::to_vec(&self.nodes)?;
        Ok(Sha256::digest(bytes).into())
    }
}

impl TryFrom<Vec<PolicyNode>> for AccessPolicy {
    type Error = PolicyError;

    fn try_from(nodes: Vec<PolicyNode>) -> Result<Self, Self::Error> {
        Self::new(nodes)
    }
}

impl From<AccessPolicy> for Vec<PolicyNode> {
    fn from(policy: AccessPolicy) -> Self {
        policy.nodes
    }
}

fn validate(nodes: &[PolicyNode]) -> Result<(), PolicyError> {
    if nodes.is_empty() {
        return Err(PolicyError::Empty);
    }
    for (position, node) in nodes.iter().enumerate() {
        let expect_condition = position % 2 == 0;
        match (node, expect_condition) {
            (PolicyNode::Condition(c), true) => c.check(position)?,
            (PolicyNode::Operator { .. }, false) => {}
            (PolicyNode::Operator { .. }, true) => {
                return Err(PolicyError::DanglingOperator { position })
            }
            (PolicyNode::Condition(_), false) => {
                return Err(PolicyError::MissingOperator { position })
            }
        }
    }
    if nodes.len() % 2 == 0 {
        return Err(PolicyError::DanglingOperator {
            position: nodes.len() - 1,
        });
    }
    Ok(())
}

/// Incremental builder; validation happens in [`PolicyBuilder::build`].
#[derive(Debug, Default)]
pub struct PolicyBuilder {
    nodes: Vec<PolicyNode>,
}

impl PolicyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.nodes.push(PolicyNode::Condition(condition));
        self
    }

    pub fn and(mut self) -> Self {
        self.nodes.push(PolicyNode::Operator {
            operator: BoolOp::And,
        });
        self
    }

    pub fn or(mut self) -> Self {
        self.nodes.push(PolicyNode::Operator {
            operator: BoolOp::Or,
        });
        self
    }

    pub fn build(self) -> Result<AccessPolicy, PolicyError> {
        AccessPolicy::new(self.nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    const CONTRACT: &str = "0x00000000000000000000000000000000000000c0";
    const BOB: &str = "0x000000000000000000000000000000000000b0b0";

    fn target() -> AssetTarget {
        AssetTarget::new(CONTRACT, "ethereum", "7").unwrap()
    }

    fn eval(policy: &AccessPolicy, outcomes: &[bool]) -> bool {
        let mut it = outcomes.iter().copied();
        policy
            .evaluate(|_| Ok::<_, Infallible>(it.next().unwrap_or(false)))
            .unwrap()
    }

    #[test]
    fn test_or_with_single_operand_rejected() {
        let result = PolicyBuilder::new()
            .condition(Condition::token_balance(&target()))
            .or()
            .build();
        assert_eq!(result, Err(PolicyError::DanglingOperator { position: 1 }));

        let result = PolicyBuilder::new()
            .or()
            .condition(Condition::token_balance(&target()))
            .build();
        assert_eq!(result, Err(PolicyError::DanglingOperator { position: 0 }));
    }

    #[test]
    fn test_adjacent_conditions_rejected() {
        let result = PolicyBuilder::new()
            .condition(Condition::token_balance(&target()))
            .condition(Condition::any_wallet(&target()))
            .build();
        assert_eq!(result, Err(PolicyError::MissingOperator { position: 1 }));
    }

    #[test]
    fn test_empty_rejected() {
        assert_eq!(PolicyBuilder::new().build(), Err(PolicyError::Empty));
    }

    #[test]
    fn test_deserialize_validates() {
        let json = r#"[{"operator":"or"}]"#;
        assert!(serde_json::from_str::<AccessPolicy>(json).is_err());
    }

    #[test]
    fn test_full_content_json_shape() {
        let json = serde_json::to_value(AccessPolicy::full_content(&target())).unwrap();
        let cond = &json[0];
        assert_eq!(cond["conditionType"], "evmBasic");
        assert_eq!(cond["standardContractType"], "ERC1155");
        assert_eq!(cond["method"], "balanceOf");
        assert_eq!(cond["parameters"][0], ":userAddress");
        assert_eq!(cond["parameters"][1], "7");
        assert_eq!(cond["returnValueTest"]["comparator"], ">");
        assert_eq!(cond["returnValueTest"]["value"], "0");
    }

    #[test]
    fn test_json_roundtrip_with_operator() {
        let policy = AccessPolicy::preview(&target()).with_recipient(BOB).unwrap();
        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains(r#"{"operator":"or"}"#));
        let back: AccessPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let t = target();
        // a and b or c
        let policy = PolicyBuilder::new()
            .condition(Condition::token_balance(&t))
            .and()
            .condition(Condition::any_wallet(&t))
            .or()
            .condition(Condition::address_equals("ethereum", BOB))
            .build()
            .unwrap();

        assert!(eval(&policy, &[true, true, false]));
        assert!(!eval(&policy, &[true, false, false]));
        // false and _ short-circuits, so the next outcome feeds c
        assert!(eval(&policy, &[false, true]));
        assert!(!eval(&policy, &[false, false]));
    }

    #[test]
    fn test_preview_is_looser_than_full() {
        let t = target();
        let full = AccessPolicy::full_content(&t);
        let preview = AccessPolicy::preview(&t);
        for owns in [false, true] {
            let check = |c: &Condition| {
                let balance = if owns { "1" } else { "0" };
                Ok::<_, Infallible>(c.return_value_test.comparator.test(balance, "0"))
            };
            let full_ok = full.evaluate(check).unwrap();
            let preview_ok = preview.evaluate(check).unwrap();
            assert!(!full_ok || preview_ok);
        }
    }

    #[test]
    fn test_with_recipient_rejects_bad_address() {
        assert_eq!(
            AccessPolicy::full_content(&target()).with_recipient("bob"),
            Err(PolicyError::InvalidAddress("bob".into()))
        );
    }

    #[test]
    fn test_comparator_numeric_and_string() {
        assert!(Comparator::Gt.test("1", "0"));
        assert!(!Comparator::Gt.test("0", "0"));
        assert!(Comparator::Ge.test("0", "0"));
        assert!(Comparator::Lt.test("9", "10"));
        assert!(Comparator::Gt.test(
            "115792089237316195423570985008687907853269984665640564039457584007913129639935",
            "1"
        ));
        assert!(Comparator::Eq.test("007", "7"));
        assert!(Comparator::Eq.test(&BOB.to_uppercase().replace("0X", "0x"), BOB));
        assert!(Comparator::Ne.test(CONTRACT, BOB));
        assert!(!Comparator::Gt.test(CONTRACT, BOB));
    }

    #[test]
    fn test_digest_changes_with_policy() {
        let t = target();
        let a = AccessPolicy::full_content(&t).digest().unwrap();
        let b = AccessPolicy::preview(&t).digest().unwrap();
        assert_ne!(a, b);
        assert_eq!(a, AccessPolicy::full_content(&t).digest().unwrap());
    }

    #[test]
    fn test_asset_target_requires_address() {
        assert!(AssetTarget::new("nope", "ethereum", "1").is_err());
    }
}
