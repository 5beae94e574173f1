//! Rule constraint functions for firewall rules
//!
//! This module centralizes knowledge about valid field combinations: which
//! chains exist in which table, where NAT targets may appear, which protocols
//! carry ports, and which chains see an input or output interface. The
//! validator builds its cross-field checks from these predicates.
//!
//! # Examples
//!
//! ```
//! use fwvault::core::firewall::{Action, Chain, Protocol, Table};
//! use fwvault::core::rule_constraints::*;
//!
//! assert!(chain_valid_for_table(Table::Nat, Chain::Postrouting));
//! assert!(!chain_valid_for_table(Table::Nat, Chain::Input));
//!
//! assert!(action_valid_for_chain(Action::Snat, Chain::Postrouting));
//! assert!(!action_valid_for_chain(Action::Snat, Chain::Input));
//!
//! assert!(protocol_supports_ports(Protocol::Tcp));
//! assert!(!protocol_supports_ports(Protocol::Icmp));
//! ```

use super::firewall::{Action, Address, Chain, Protocol, Table};

// ═══════════════════════════════════════════════════════════════════════════
// Table / Chain Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Chains available in each table, in listing order.
pub const fn chains_for_table(table: Table) -> &'static [Chain] {
    match table {
        Table::Filter => &[Chain::Input, Chain::Forward, Chain::Output],
        Table::Nat => &[Chain::Prerouting, Chain::Output, Chain::Postrouting],
        Table::Mangle => &[
            Chain::Prerouting,
            Chain::Input,
            Chain::Forward,
            Chain::Output,
            Chain::Postrouting,
        ],
    }
}

/// Returns `true` if `chain` exists in `table`.
///
/// # Examples
///
/// ```
/// use fwvault::core::firewall::{Chain, Table};
/// use fwvault::core::rule_constraints::chain_valid_for_table;
///
/// assert!(chain_valid_for_table(Table::Filter, Chain::Forward));
/// assert!(!chain_valid_for_table(Table::Filter, Chain::Prerouting));
/// assert!(chain_valid_for_table(Table::Mangle, Chain::Prerouting));
/// ```
#[inline]
pub fn chain_valid_for_table(table: Table, chain: Chain) -> bool {
    chains_for_table(table).contains(&chain)
}

// ═══════════════════════════════════════════════════════════════════════════
// Action Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `true` for address-translation targets.
#[inline]
pub fn action_is_nat(action: Action) -> bool {
    matches!(action, Action::Snat | Action::Dnat | Action::Masquerade)
}

/// Returns `true` if `action` may be used in `table`.
///
/// NAT targets only live in the `nat` table. The `nat` table only does
/// translation (plus `ACCEPT`), so `DROP` and `REJECT` are refused there.
///
/// # Examples
///
/// ```
/// use fwvault::core::firewall::{Action, Table};
/// use fwvault::core::rule_constraints::action_valid_for_table;
///
/// assert!(action_valid_for_table(Action::Drop, Table::Filter));
/// assert!(!action_valid_for_table(Action::Drop, Table::Nat));
/// assert!(!action_valid_for_table(Action::Masquerade, Table::Filter));
/// assert!(action_valid_for_table(Action::Accept, Table::Nat));
/// ```
#[inline]
pub fn action_valid_for_table(action: Action, table: Table) -> bool {
    match table {
        Table::Nat => !matches!(action, Action::Drop | Action::Reject),
        Table::Filter | Table::Mangle => !action_is_nat(action),
    }
}

/// Returns `true` if `action` may be used in `chain`.
///
/// Source translation happens after routing, destination translation
/// before it. Non-NAT targets are accepted in every chain.
#[inline]
pub fn action_valid_for_chain(action: Action, chain: Chain) -> bool {
    match action {
        Action::Snat | Action::Masquerade => chain == Chain::Postrouting,
        Action::Dnat => matches!(chain, Chain::Prerouting | Chain::Output),
        Action::Accept | Action::Drop | Action::Reject => true,
    }
}

/// Chains where `action` is allowed, for error messages.
pub const fn chains_for_action(action: Action) -> &'static [Chain] {
    match action {
        Action::Snat | Action::Masquerade => &[Chain::Postrouting],
        Action::Dnat => &[Chain::Prerouting, Chain::Output],
        Action::Accept | Action::Drop | Action::Reject => &[
            Chain::Prerouting,
            Chain::Input,
            Chain::Forward,
            Chain::Output,
            Chain::Postrouting,
        ],
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Protocol Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `true` if the protocol supports port matching.
///
/// # Examples
///
/// ```
/// use fwvault::core::firewall::Protocol;
/// use fwvault::core::rule_constraints::protocol_supports_ports;
///
/// assert!(protocol_supports_ports(Protocol::Tcp));
/// assert!(protocol_supports_ports(Protocol::Udp));
/// assert!(!protocol_supports_ports(Protocol::All));
/// assert!(!protocol_supports_ports(Protocol::Icmp));
/// ```
#[inline]
pub fn protocol_supports_ports(protocol: Protocol) -> bool {
    matches!(protocol, Protocol::Tcp | Protocol::Udp)
}

// ═══════════════════════════════════════════════════════════════════════════
// Interface Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `true` if packets in `chain` have an input interface.
///
/// Locally generated packets (`OUTPUT`, and `POSTROUTING` which also sees
/// them) carry no input interface.
#[inline]
pub fn chain_has_input_interface(chain: Chain) -> bool {
    matches!(chain, Chain::Prerouting | Chain::Input | Chain::Forward)
}

/// Returns `true` if packets in `chain` have an output interface.
///
/// No routing decision has been made yet in `PREROUTING` and `INPUT`.
#[inline]
pub fn chain_has_output_interface(chain: Chain) -> bool {
    matches!(chain, Chain::Forward | Chain::Output | Chain::Postrouting)
}

// ═══════════════════════════════════════════════════════════════════════════
// Address Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `true` if the two addresses can appear in the same rule.
///
/// `any` is compatible with everything; two concrete networks must share an
/// address family.
///
/// # Examples
///
/// ```
/// use fwvault::core::firewall::Address;
/// use fwvault::core::rule_constraints::addresses_compatible;
///
/// let v4: Address = "10.0.0.0/8".parse().unwrap();
/// let v6: Address = "fd00::/8".parse().unwrap();
/// assert!(addresses_compatible(v4, Address::Any));
/// assert!(!addresses_compatible(v4, v6));
/// ```
#[inline]
pub fn addresses_compatible(a: Address, b: Address) -> bool {
    match (a.network(), b.network()) {
        (Some(x), Some(y)) => x.is_ipv4() == y.is_ipv4(),
        _ => true,
    }
}
