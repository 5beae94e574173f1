//! Firewall rule data structures, rule sets, and canonical content hashing
//!
//! This module defines the data model shared by every other component:
//!
//! - [`Rule`]: a stored rule (id, [`RuleDefinition`], status, timestamps)
//! - [`RuleDefinition`]: the typed, validated content of a rule
//! - [`RuleSpec`] / [`RulePatch`]: the untyped wire shapes callers submit
//! - [`RuleSet`]: rules keyed by id, iterated in evaluation order
//!
//! # Evaluation Order
//!
//! Rules are evaluated by priority ascending, ties broken by id ascending.
//!
//! # Content Hash
//!
//! [`RuleSet::content_hash`] is the SHA-256 of the canonical JSON form: rules in
//! evaluation order, each reduced to its id and definition. Status and
//! timestamps are excluded, so two rule sets with the same rules always hash
//! identically regardless of where they are in their lifecycle.
//!
//! # Example
//!
//! ```
//! use fwvault::core::firewall::{RuleSet, RuleSpec};
//! use fwvault::validators::validate;
//!
//! let spec = RuleSpec {
//!     table_name: "filter".to_string(),
//!     chain: "INPUT".to_string(),
//!     action: "DROP".to_string(),
//!     src_ip: Some("10.0.0.0/24".to_string()),
//!     ..RuleSpec::default()
//! };
//! let definition = validate(&spec).expect("valid rule");
//! assert_eq!(definition.priority, 100);
//!
//! let empty = RuleSet::new();
//! assert_eq!(empty.content_hash().len(), 64);
//! ```

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use strum::IntoEnumIterator;

/// Rule identifier, assigned monotonically by the rule store
pub type RuleId = u64;

/// Priority used when a rule does not specify one
pub const DEFAULT_PRIORITY: i32 = 100;

/// Maximum number of rules allowed in a single rule set
///
/// Limit prevents memory exhaustion from malformed/malicious state files.
pub const MAX_RULES: usize = 1000;

/// Packet-filter table
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Table {
    Filter,
    Nat,
    Mangle,
}

impl Table {
    pub const fn as_str(self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
            Table::Mangle => "mangle",
        }
    }
}

/// Built-in chain a rule is attached to
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Chain {
    Prerouting,
    Input,
    Forward,
    Output,
    Postrouting,
}

impl Chain {
    pub const fn as_str(self) -> &'static str {
        match self {
            Chain::Prerouting => "PREROUTING",
            Chain::Input => "INPUT",
            Chain::Forward => "FORWARD",
            Chain::Output => "OUTPUT",
            Chain::Postrouting => "POSTROUTING",
        }
    }
}

/// Transport protocol matched by a rule
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    /// Match every protocol
    #[default]
    All,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::All => "all",
        }
    }
}

/// Rule target
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Action {
    Accept,
    Drop,
    Reject,
    Snat,
    Dnat,
    Masquerade,
}

impl Action {
    pub const fn as_str(self) -> &'static str {
        match self {
            Action::Accept => "ACCEPT",
            Action::Drop => "DROP",
            Action::Reject => "REJECT",
            Action::Snat => "SNAT",
            Action::Dnat => "DNAT",
            Action::Masquerade => "MASQUERADE",
        }
    }
}

/// Lifecycle status of a rule in the working set
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum RuleStatus {
    /// Edited since the last deploy attempt
    #[default]
    Draft,
    /// Included in a deploy attempt that has not succeeded
    Pending,
    /// Confirmed by the backend
    Applied,
}

/// Source or destination match: a concrete network or the literal `any`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Address {
    #[default]
    Any,
    Network(IpNetwork),
}

impl Address {
    pub fn network(&self) -> Option<IpNetwork> {
        match self {
            Address::Any => None,
            Address::Network(net) => Some(*net),
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Address::Any)
    }
}

impl FromStr for Address {
    type Err = String;

    /// Parses `any` (case-insensitive), a bare address, or CIDR notation.
    /// A blank string means "no constraint" and maps to [`Address::Any`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("any") {
            return Ok(Address::Any);
        }
        trimmed
            .parse::<IpNetwork>()
            .map(Address::Network)
            .map_err(|e| format!("'{trimmed}' is not a CIDR network or \"any\" ({e})"))
    }
}

impl TryFrom<String> for Address {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Any => write!(f, "any"),
            Address::Network(net) => write!(f, "{net}"),
        }
    }
}

/// Typed content of a rule, as accepted by the validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub priority: i32,
    #[serde(rename = "table_name")]
    pub table: Table,
    pub chain: Chain,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_interface: Option<String>,
    #[serde(default)]
    pub src_ip: Address,
    #[serde(default)]
    pub dst_ip: Address,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<u16>,
    pub action: Action,
    /// Free-text comment, also used as the log prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_prefix: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// A rule in the working set or inside a version snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    #[serde(flatten)]
    pub definition: RuleDefinition,
    #[serde(default)]
    pub status: RuleStatus,
    pub created_at: DateTime<Utc>,
    /// Optimistic-concurrency token
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    /// Returns the token an editor must echo back to update this rule.
    pub fn token(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Evaluation-order key: priority ascending, then id ascending.
    pub fn sort_key(&self) -> (i32, RuleId) {
        (self.definition.priority, self.id)
    }

    /// Case-insensitive free-text match over addresses, ports, interfaces,
    /// protocol and comment. `needle` must already be lowercase.
    pub fn matches_text(&self, needle: &str) -> bool {
        let d = &self.definition;
        let port_hit = |p: Option<u16>| p.is_some_and(|p| p.to_string().contains(needle));
        let opt_hit = |s: &Option<String>| {
            s.as_ref()
                .is_some_and(|s| s.to_lowercase().contains(needle))
        };

        d.src_ip.to_string().to_lowercase().contains(needle)
            || d.dst_ip.to_string().to_lowercase().contains(needle)
            || port_hit(d.src_port)
            || port_hit(d.dst_port)
            || opt_hit(&d.log_prefix)
            || opt_hit(&d.in_interface)
            || opt_hit(&d.out_interface)
            || d.protocol.as_str().contains(needle)
    }
}

/// Untyped rule content as submitted by the presentation layer
///
/// Field names follow the rule wire contract. Every value is checked by
/// [`crate::validators::validate`], which turns it into a [`RuleDefinition`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSpec {
    pub priority: Option<i64>,
    pub table_name: String,
    pub chain: String,
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
    pub src_ip: Option<String>,
    pub dst_ip: Option<String>,
    /// Defaults to `all` when absent
    pub protocol: Option<String>,
    pub src_port: Option<i64>,
    pub dst_port: Option<i64>,
    pub action: String,
    pub log_prefix: Option<String>,
    pub enabled: Option<bool>,
}

impl RuleSpec {
    /// Shorthand for the three fields every rule needs.
    pub fn new(table: &str, chain: &str, action: &str) -> Self {
        Self {
            table_name: table.to_string(),
            chain: chain.to_string(),
            action: action.to_string(),
            ..Self::default()
        }
    }
}

impl From<&RuleDefinition> for RuleSpec {
    fn from(d: &RuleDefinition) -> Self {
        let addr = |a: Address| (!a.is_any()).then(|| a.to_string());
        Self {
            priority: Some(i64::from(d.priority)),
            table_name: d.table.as_str().to_string(),
            chain: d.chain.as_str().to_string(),
            in_interface: d.in_interface.clone(),
            out_interface: d.out_interface.clone(),
            src_ip: addr(d.src_ip),
            dst_ip: addr(d.dst_ip),
            protocol: Some(d.protocol.as_str().to_string()),
            src_port: d.src_port.map(i64::from),
            dst_port: d.dst_port.map(i64::from),
            action: d.action.as_str().to_string(),
            log_prefix: d.log_prefix.clone(),
            enabled: Some(d.enabled),
        }
    }
}

/// Deserializes a present-but-null field as `Some(None)` so patches can
/// distinguish "clear this field" from "leave it alone".
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Partial update of a rule
///
/// `None` leaves a field unchanged. For optional wire fields, `Some(None)`
/// clears the field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulePatch {
    pub priority: Option<i64>,
    pub table_name: Option<String>,
    pub chain: Option<String>,
    #[serde(deserialize_with = "double_option")]
    pub in_interface: Option<Option<String>>,
    #[serde(deserialize_with = "double_option")]
    pub out_interface: Option<Option<String>>,
    #[serde(deserialize_with = "double_option")]
    pub src_ip: Option<Option<String>>,
    #[serde(deserialize_with = "double_option")]
    pub dst_ip: Option<Option<String>>,
    pub protocol: Option<String>,
    #[serde(deserialize_with = "double_option")]
    pub src_port: Option<Option<i64>>,
    #[serde(deserialize_with = "double_option")]
    pub dst_port: Option<Option<i64>>,
    pub action: Option<String>,
    #[serde(deserialize_with = "double_option")]
    pub log_prefix: Option<Option<String>>,
    pub enabled: Option<bool>,
}

impl RulePatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merges the patch over an existing spec.
    pub fn apply_to(&self, spec: &mut RuleSpec) {
        if let Some(p) = self.priority {
            spec.priority = Some(p);
        }
        if let Some(t) = &self.table_name {
            spec.table_name.clone_from(t);
        }
        if let Some(c) = &self.chain {
            spec.chain.clone_from(c);
        }
        if let Some(v) = &self.in_interface {
            spec.in_interface.clone_from(v);
        }
        if let Some(v) = &self.out_interface {
            spec.out_interface.clone_from(v);
        }
        if let Some(v) = &self.src_ip {
            spec.src_ip.clone_from(v);
        }
        if let Some(v) = &self.dst_ip {
            spec.dst_ip.clone_from(v);
        }
        if let Some(p) = &self.protocol {
            spec.protocol = Some(p.clone());
        }
        if let Some(v) = self.src_port {
            spec.src_port = v;
        }
        if let Some(v) = self.dst_port {
            spec.dst_port = v;
        }
        if let Some(a) = &self.action {
            spec.action.clone_from(a);
        }
        if let Some(v) = &self.log_prefix {
            spec.log_prefix.clone_from(v);
        }
        if let Some(e) = self.enabled {
            spec.enabled = Some(e);
        }
    }
}

/// Duplicate id found while building a [`RuleSet`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("duplicate rule id {0} in rule set")]
pub struct DuplicateRuleId(pub RuleId);

/// Canonical hash input for one rule
#[derive(Serialize)]
struct CanonicalRule<'a> {
    id: RuleId,
    #[serde(flatten)]
    definition: &'a RuleDefinition,
}

/// Rules keyed by id (ids are unique), iterated in evaluation order
///
/// Serializes as a JSON array in evaluation order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Rule>", into = "Vec<Rule>")]
pub struct RuleSet {
    rules: BTreeMap<RuleId, Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a rule set, rejecting duplicate ids.
    pub fn from_rules(rules: impl IntoIterator<Item = Rule>) -> Result<Self, DuplicateRuleId> {
        let mut set = Self::new();
        for rule in rules {
            let id = rule.id;
            if set.rules.insert(id, rule).is_some() {
                return Err(DuplicateRuleId(id));
            }
        }
        Ok(set)
    }

    /// Inserts or replaces a rule, returning the previous rule with that id.
    pub fn insert(&mut self, rule: Rule) -> Option<Rule> {
        self.rules.insert(rule.id, rule)
    }

    pub fn remove(&mut self, id: RuleId) -> Option<Rule> {
        self.rules.remove(&id)
    }

    pub fn get(&self, id: RuleId) -> Option<&Rule> {
        self.rules.get(&id)
    }

    pub fn get_mut(&mut self, id: RuleId) -> Option<&mut Rule> {
        self.rules.get_mut(&id)
    }

    pub fn contains(&self, id: RuleId) -> bool {
        self.rules.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Ids in ascending order (not evaluation order)
    pub fn ids(&self) -> impl Iterator<Item = RuleId> + '_ {
        self.rules.keys().copied()
    }

    /// Mutable access in id order, for bulk status changes
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Rule> {
        self.rules.values_mut()
    }

    /// Rules in evaluation order: priority ascending, ties by id ascending.
    pub fn ordered(&self) -> Vec<&Rule> {
        let mut rules: Vec<&Rule> = self.rules.values().collect();
        rules.sort_by_key(|r| r.sort_key());
        rules
    }

    /// Rules of one table/chain in evaluation order
    pub fn chain_rules(&self, table: Table, chain: Chain) -> Vec<&Rule> {
        self.ordered()
            .into_iter()
            .filter(|r| r.definition.table == table && r.definition.chain == chain)
            .collect()
    }

    /// Canonical JSON used as the content-hash input.
    pub fn canonical_json(&self) -> String {
        let canonical: Vec<CanonicalRule<'_>> = self
            .ordered()
            .into_iter()
            .map(|r| CanonicalRule {
                id: r.id,
                definition: &r.definition,
            })
            .collect();
        // Serializing plain structs, strings and integers cannot fail
        serde_json::to_string(&canonical).unwrap_or_default()
    }

    /// SHA-256 (lowercase hex) of [`Self::canonical_json`].
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Renders an `iptables-save` style listing, grouped by table and chain.
    ///
    /// Only tables that carry rules are emitted. Disabled rules appear as
    /// comments so listings of two versions diff cleanly.
    pub fn to_iptables_text(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();

        for table in Table::iter() {
            let chains: Vec<Chain> = Chain::iter()
                .filter(|c| crate::core::rule_constraints::chain_valid_for_table(table, *c))
                .collect();
            let has_rules = chains
                .iter()
                .any(|c| !self.chain_rules(table, *c).is_empty());
            if !has_rules {
                continue;
            }

            let _ = writeln!(out, "*{}", table.as_str());
            for chain in &chains {
                let _ = writeln!(out, ":{} ACCEPT [0:0]", chain.as_str());
            }
            for chain in &chains {
                for rule in self.chain_rules(table, *chain) {
                    let line = Self::rule_line(rule);
                    if rule.definition.enabled {
                        let _ = writeln!(out, "{line}");
                    } else {
                        let _ = writeln!(out, "# disabled: {line}");
                    }
                }
            }
            let _ = writeln!(out, "COMMIT");
        }

        out
    }

    fn rule_line(rule: &Rule) -> String {
        use std::fmt::Write;

        let d = &rule.definition;
        let mut line = format!("-A {}", d.chain.as_str());

        if let Some(iface) = &d.in_interface {
            let _ = write!(line, " -i {iface}");
        }
        if let Some(iface) = &d.out_interface {
            let _ = write!(line, " -o {iface}");
        }
        if let Address::Network(net) = d.src_ip {
            let _ = write!(line, " -s {net}");
        }
        if let Address::Network(net) = d.dst_ip {
            let _ = write!(line, " -d {net}");
        }
        if d.protocol != Protocol::All {
            let _ = write!(line, " -p {}", d.protocol.as_str());
        }
        if let Some(port) = d.src_port {
            let _ = write!(line, " --sport {port}");
        }
        if let Some(port) = d.dst_port {
            let _ = write!(line, " --dport {port}");
        }
        let _ = write!(
            line,
            " -m comment --comment \"fwvault:{}:p{}\"",
            rule.id, d.priority
        );
        if let Some(prefix) = &d.log_prefix {
            let _ = write!(line, " -m comment --comment \"{prefix}\"");
        }
        let _ = write!(line, " -j {}", d.action.as_str());
        line
    }
}

impl TryFrom<Vec<Rule>> for RuleSet {
    type Error = DuplicateRuleId;

    fn try_from(rules: Vec<Rule>) -> Result<Self, Self::Error> {
        Self::from_rules(rules)
    }
}

impl From<RuleSet> for Vec<Rule> {
    fn from(set: RuleSet) -> Self {
        let mut rules: Vec<Rule> = set.rules.into_values().collect();
        rules.sort_by_key(Rule::sort_key);
        rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{definition, rule_with};

    #[test]
    fn test_enum_parsing_is_case_insensitive() {
        assert_eq!("FILTER".parse::<Table>().unwrap(), Table::Filter);
        assert_eq!("nat".parse::<Table>().unwrap(), Table::Nat);
        assert_eq!("postrouting".parse::<Chain>().unwrap(), Chain::Postrouting);
        assert_eq!("Masquerade".parse::<Action>().unwrap(), Action::Masquerade);
        assert_eq!("ALL".parse::<Protocol>().unwrap(), Protocol::All);
        assert!("sctp".parse::<Protocol>().is_err());
        assert!("RAW".parse::<Table>().is_err());
    }

    #[test]
    fn test_wire_spelling() {
        assert_eq!(serde_json::to_string(&Table::Mangle).unwrap(), "\"mangle\"");
        assert_eq!(serde_json::to_string(&Chain::Prerouting).unwrap(), "\"PREROUTING\"");
        assert_eq!(serde_json::to_string(&Action::Dnat).unwrap(), "\"DNAT\"");
        assert_eq!(serde_json::to_string(&RuleStatus::Pending).unwrap(), "\"PENDING\"");
        assert_eq!(Chain::Forward.to_string(), "FORWARD");
    }

    #[test]
    fn test_address_parsing() {
        assert_eq!("any".parse::<Address>().unwrap(), Address::Any);
        assert_eq!("ANY".parse::<Address>().unwrap(), Address::Any);
        assert_eq!("".parse::<Address>().unwrap(), Address::Any);
        assert!(matches!(
            "10.0.0.0/24".parse::<Address>().unwrap(),
            Address::Network(_)
        ));
        assert!(matches!(
            "2001:db8::/32".parse::<Address>().unwrap(),
            Address::Network(_)
        ));
        assert!("10.0.0.0/33".parse::<Address>().is_err());
        assert!("not-an-ip".parse::<Address>().is_err());
    }

    #[test]
    fn test_rule_wire_contract_fields() {
        let mut d = definition("filter", "INPUT", "DROP");
        d.src_ip = "10.0.0.0/24".parse().unwrap();
        d.dst_port = Some(22);
        d.protocol = Protocol::Tcp;
        let rule = rule_with(3, d);

        let json = serde_json::to_value(&rule).unwrap();
        for field in [
            "id",
            "priority",
            "table_name",
            "chain",
            "src_ip",
            "dst_ip",
            "protocol",
            "dst_port",
            "action",
            "status",
            "created_at",
            "updated_at",
        ] {
            assert!(json.get(field).is_some(), "missing wire field {field}");
        }
        assert_eq!(json["table_name"], "filter");
        assert_eq!(json["src_ip"], "10.0.0.0/24");
        assert_eq!(json["dst_ip"], "any");

        let back: Rule = serde_json::from_value(json).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn test_evaluation_order_priority_then_id() {
        let mut p100 = definition("filter", "INPUT", "ACCEPT");
        p100.priority = 100;
        let mut p50 = definition("filter", "INPUT", "DROP");
        p50.priority = 50;

        let set = RuleSet::from_rules([
            rule_with(1, p100.clone()),
            rule_with(2, p50),
            rule_with(3, p100),
        ])
        .unwrap();

        let order: Vec<RuleId> = set.ordered().iter().map(|r| r.id).collect();
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let d = definition("filter", "INPUT", "ACCEPT");
        let err = RuleSet::from_rules([rule_with(1, d.clone()), rule_with(1, d)]).unwrap_err();
        assert_eq!(err, DuplicateRuleId(1));

        let json = serde_json::json!([
            serde_json::to_value(rule_with(4, definition("filter", "INPUT", "ACCEPT"))).unwrap(),
            serde_json::to_value(rule_with(4, definition("filter", "INPUT", "DROP"))).unwrap(),
        ]);
        assert!(serde_json::from_value::<RuleSet>(json).is_err());
    }

    #[test]
    fn test_hash_ignores_status_and_timestamps() {
        let d = definition("filter", "INPUT", "ACCEPT");
        let a = rule_with(1, d.clone());
        let mut b = rule_with(1, d);
        b.status = RuleStatus::Applied;
        b.updated_at = b.updated_at + chrono::Duration::seconds(90);

        let set_a = RuleSet::from_rules([a]).unwrap();
        let set_b = RuleSet::from_rules([b]).unwrap();
        assert_eq!(set_a.content_hash(), set_b.content_hash());
    }

    #[test]
    fn test_hash_changes_with_content() {
        let d = definition("filter", "INPUT", "ACCEPT");
        let mut other = d.clone();
        other.enabled = false;

        let a = RuleSet::from_rules([rule_with(1, d)]).unwrap();
        let b = RuleSet::from_rules([rule_with(1, other)]).unwrap();
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_snapshot_roundtrip_keeps_hash() {
        let mut d = definition("nat", "POSTROUTING", "MASQUERADE");
        d.out_interface = Some("eth0".to_string());
        let mut drop = definition("filter", "INPUT", "DROP");
        drop.src_ip = "192.168.0.0/16".parse().unwrap();
        drop.priority = 10;

        let set = RuleSet::from_rules([rule_with(1, d), rule_with(2, drop)]).unwrap();
        let json = serde_json::to_string(&set).unwrap();
        let back: RuleSet = serde_json::from_str(&json).unwrap();

        assert_eq!(back, set);
        assert_eq!(back.content_hash(), set.content_hash());
    }

    #[test]
    fn test_patch_merges_and_clears() {
        let mut d = definition("filter", "INPUT", "DROP");
        d.src_ip = "10.0.0.0/8".parse().unwrap();
        d.log_prefix = Some("old".to_string());
        let mut spec = RuleSpec::from(&d);

        let patch: RulePatch =
            serde_json::from_str(r#"{"action":"ACCEPT","log_prefix":null,"priority":5}"#).unwrap();
        assert_eq!(patch.log_prefix, Some(None));
        assert!(patch.src_ip.is_none());
        patch.apply_to(&mut spec);

        assert_eq!(spec.action, "ACCEPT");
        assert_eq!(spec.priority, Some(5));
        assert_eq!(spec.log_prefix, None);
        assert_eq!(spec.src_ip.as_deref(), Some("10.0.0.0/8"));
        assert!(RulePatch::default().is_empty());
    }

    #[test]
    fn test_text_match() {
        let mut d = definition("filter", "INPUT", "DROP");
        d.src_ip = "10.1.2.0/24".parse().unwrap();
        d.protocol = Protocol::Tcp;
        d.dst_port = Some(8443);
        d.log_prefix = Some("Block-Lab".to_string());
        let rule = rule_with(1, d);

        assert!(rule.matches_text("10.1.2"));
        assert!(rule.matches_text("844"));
        assert!(rule.matches_text("block-lab"));
        assert!(rule.matches_text("tcp"));
        assert!(!rule.matches_text("udp"));
    }

    #[test]
    fn test_iptables_listing() {
        let mut drop = definition("filter", "INPUT", "DROP");
        drop.src_ip = "10.0.0.0/24".parse().unwrap();
        drop.priority = 50;
        let mut off = definition("filter", "INPUT", "ACCEPT");
        off.enabled = false;

        let set = RuleSet::from_rules([rule_with(1, drop), rule_with(2, off)]).unwrap();
        let text = set.to_iptables_text();

        assert!(text.starts_with("*filter\n"));
        assert!(text.contains(":INPUT ACCEPT [0:0]"));
        assert!(text.contains("-A INPUT -s 10.0.0.0/24"));
        assert!(text.contains("# disabled: -A INPUT"));
        assert!(text.trim_end().ends_with("COMMIT"));
        assert!(!text.contains("*nat"));
    }
}
