//! Rule validation for fwvault
//!
//! Field checks return `Result<_, String>` and are composed by [`validate`],
//! which runs every check in one pass and reports all violations together.
//! Nothing here touches state, so validation is safe to call from any thread
//! and always gives the same answer for the same input.

use crate::core::error::ValidationError;
use crate::core::firewall::{
    Action, Address, Chain, DEFAULT_PRIORITY, Protocol, Rule, RuleDefinition, RuleSet, RuleSpec,
    Table,
};
use crate::core::rule_constraints::{
    action_valid_for_chain, action_valid_for_table, addresses_compatible,
    chain_has_input_interface, chain_has_output_interface, chain_valid_for_table,
    chains_for_action, chains_for_table, protocol_supports_ports,
};
use std::str::FromStr;
use strum::IntoEnumIterator;

/// Maximum log prefix / comment length in bytes
pub const MAX_LOG_PREFIX_LEN: usize = 64;

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if the port is outside 0..=65535.
pub fn validate_port(port: i64) -> Result<u16, String> {
    u16::try_from(port).map_err(|_| format!("Port {port} must be between 0 and 65535"))
}

/// Validates a rule priority.
///
/// # Errors
///
/// Returns `Err` if the value does not fit a 32-bit signed integer.
pub fn validate_priority(priority: i64) -> Result<i32, String> {
    i32::try_from(priority).map_err(|_| {
        format!(
            "Priority {priority} is out of range ({}..={})",
            i32::MIN,
            i32::MAX
        )
    })
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Interface name is empty".to_string());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Validates a log prefix / comment.
///
/// Unlike a sanitizer this refuses bad input instead of rewriting it, so
/// the stored text is exactly what the user typed.
///
/// # Errors
///
/// Returns `Err` if the prefix is longer than 64 bytes or contains control
/// characters, quotes, or a backslash.
///
/// # Examples
///
/// ```
/// use fwvault::validators::validate_log_prefix;
///
/// assert!(validate_log_prefix("ssh-drop: ").is_ok());
/// assert!(validate_log_prefix("bad\"quote").is_err());
/// assert!(validate_log_prefix(&"x".repeat(65)).is_err());
/// ```
pub fn validate_log_prefix(prefix: &str) -> Result<String, String> {
    if prefix.len() > MAX_LOG_PREFIX_LEN {
        return Err(format!(
            "Log prefix too long ({} bytes, max {MAX_LOG_PREFIX_LEN})",
            prefix.len()
        ));
    }

    if prefix
        .chars()
        .any(|c| c.is_control() || matches!(c, '"' | '\'' | '\\' | '`'))
    {
        return Err("Log prefix contains control characters or quotes".to_string());
    }

    Ok(prefix.to_string())
}

/// Parses a source/destination address.
///
/// # Errors
///
/// Returns `Err` if the value is neither `any` nor valid CIDR notation.
pub fn validate_address(value: &str) -> Result<Address, String> {
    Address::from_str(value)
}

fn allowed<T: AsRef<str>>(items: impl IntoIterator<Item = T>) -> String {
    items
        .into_iter()
        .map(|i| i.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parses a required closed-enum field, recording an error on failure.
fn parse_enum<T>(field: &str, raw: &str, errors: &mut Vec<ValidationError>) -> Option<T>
where
    T: FromStr + IntoEnumIterator + AsRef<str>,
{
    let raw = raw.trim();
    if raw.is_empty() {
        errors.push(ValidationError::new(field, format!("{field} is required")));
        return None;
    }
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            errors.push(ValidationError::new(
                field,
                format!("'{raw}' is not one of: {}", allowed(T::iter())),
            ));
            None
        }
    }
}

/// Blank optional strings count as absent.
fn non_blank(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}

fn record<T>(
    field: &str,
    result: Result<T, String>,
    errors: &mut Vec<ValidationError>,
) -> Option<T> {
    result
        .map_err(|message| errors.push(ValidationError::new(field, message)))
        .ok()
}

// ═══════════════════════════════════════════════════════════════════════════
// Cross-field checks
// ═══════════════════════════════════════════════════════════════════════════

fn check_table_chain(table: Table, chain: Chain, errors: &mut Vec<ValidationError>) {
    if !chain_valid_for_table(table, chain) {
        errors.push(ValidationError::new(
            "chain",
            format!(
                "Chain {chain} is not valid for table {table} (allowed: {})",
                allowed(chains_for_table(table))
            ),
        ));
    }
}

fn check_action(
    action: Action,
    table: Option<Table>,
    chain: Option<Chain>,
    errors: &mut Vec<ValidationError>,
) {
    if let Some(table) = table
        && !action_valid_for_table(action, table)
    {
        errors.push(ValidationError::new(
            "action",
            format!("Action {action} is not allowed in table {table}"),
        ));
    }
    if let Some(chain) = chain
        && !action_valid_for_chain(action, chain)
    {
        errors.push(ValidationError::new(
            "action",
            format!(
                "Action {action} is only valid in {}",
                allowed(chains_for_action(action))
            ),
        ));
    }
}

fn check_ports(
    protocol: Protocol,
    src_port: Option<u16>,
    dst_port: Option<u16>,
    errors: &mut Vec<ValidationError>,
) {
    if protocol_supports_ports(protocol) {
        return;
    }
    for (field, port) in [("src_port", src_port), ("dst_port", dst_port)] {
        if port.is_some() {
            errors.push(ValidationError::new(
                field,
                format!("Ports require protocol tcp or udp (got {protocol})"),
            ));
        }
    }
}

fn check_interfaces(
    chain: Chain,
    in_interface: Option<&str>,
    out_interface: Option<&str>,
    errors: &mut Vec<ValidationError>,
) {
    if in_interface.is_some() && !chain_has_input_interface(chain) {
        errors.push(ValidationError::new(
            "in_interface",
            format!("Chain {chain} has no input interface"),
        ));
    }
    if out_interface.is_some() && !chain_has_output_interface(chain) {
        errors.push(ValidationError::new(
            "out_interface",
            format!("Chain {chain} has no output interface"),
        ));
    }
}

fn check_address_families(src: Address, dst: Address, errors: &mut Vec<ValidationError>) {
    if !addresses_compatible(src, dst) {
        errors.push(ValidationError::new(
            "dst_ip",
            format!("Source {src} and destination {dst} use different address families"),
        ));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Entry points
// ═══════════════════════════════════════════════════════════════════════════

/// Validates submitted rule content and converts it to a [`RuleDefinition`].
///
/// Every field check and every cross-field check runs; the error list holds
/// all violations found, each tagged with the offending field.
///
/// # Errors
///
/// Returns the full list of [`ValidationError`]s when any check fails.
pub fn validate(spec: &RuleSpec) -> Result<RuleDefinition, Vec<ValidationError>> {
    let mut errors = Vec::new();

    let priority = match spec.priority {
        None => Some(DEFAULT_PRIORITY),
        Some(p) => record("priority", validate_priority(p), &mut errors),
    };

    let table = parse_enum::<Table>("table_name", &spec.table_name, &mut errors);
    let chain = parse_enum::<Chain>("chain", &spec.chain, &mut errors);
    let action = parse_enum::<Action>("action", &spec.action, &mut errors);
    let protocol = match non_blank(spec.protocol.as_ref()) {
        None => Some(Protocol::All),
        Some(raw) => parse_enum::<Protocol>("protocol", raw, &mut errors),
    };

    let src_ip = record(
        "src_ip",
        validate_address(spec.src_ip.as_deref().unwrap_or_default()),
        &mut errors,
    );
    let dst_ip = record(
        "dst_ip",
        validate_address(spec.dst_ip.as_deref().unwrap_or_default()),
        &mut errors,
    );

    let src_port = spec
        .src_port
        .map(|p| record("src_port", validate_port(p), &mut errors));
    let dst_port = spec
        .dst_port
        .map(|p| record("dst_port", validate_port(p), &mut errors));

    let in_interface = non_blank(spec.in_interface.as_ref())
        .map(|name| record("in_interface", validate_interface(name), &mut errors));
    let out_interface = non_blank(spec.out_interface.as_ref())
        .map(|name| record("out_interface", validate_interface(name), &mut errors));

    let log_prefix = spec
        .log_prefix
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(|p| record("log_prefix", validate_log_prefix(p), &mut errors));

    if let (Some(table), Some(chain)) = (table, chain) {
        check_table_chain(table, chain, &mut errors);
    }
    if let Some(action) = action {
        check_action(action, table, chain, &mut errors);
    }
    if let Some(protocol) = protocol {
        check_ports(
            protocol,
            src_port.flatten(),
            dst_port.flatten(),
            &mut errors,
        );
    }
    if let Some(chain) = chain {
        check_interfaces(
            chain,
            in_interface.as_ref().and_then(|i| i.as_deref()),
            out_interface.as_ref().and_then(|i| i.as_deref()),
            &mut errors,
        );
    }
    if let (Some(src), Some(dst)) = (src_ip, dst_ip) {
        check_address_families(src, dst, &mut errors);
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    match (priority, table, chain, action, protocol, src_ip, dst_ip) {
        (
            Some(priority),
            Some(table),
            Some(chain),
            Some(action),
            Some(protocol),
            Some(src_ip),
            Some(dst_ip),
        ) => Ok(RuleDefinition {
            priority,
            table,
            chain,
            in_interface: in_interface.flatten(),
            out_interface: out_interface.flatten(),
            src_ip,
            dst_ip,
            protocol,
            src_port: src_port.flatten(),
            dst_port: dst_port.flatten(),
            action,
            log_prefix: log_prefix.flatten(),
            enabled: spec.enabled.unwrap_or(true),
        }),
        _ => Err(vec![ValidationError::new(
            "rule",
            "Rule could not be assembled from its fields",
        )]),
    }
}

/// Re-checks a stored rule, e.g. before it is deployed.
///
/// Rules loaded from a state file or taken from a historical version never
/// went through [`validate`] in this process, so the same field and
/// cross-field checks run again on the typed form.
///
/// # Errors
///
/// Returns every violation, with fields prefixed by `rules[<id>].`.
pub fn validate_rule(rule: &Rule) -> Result<(), Vec<ValidationError>> {
    validate(&RuleSpec::from(&rule.definition))
        .map(|_| ())
        .map_err(|errors| {
            errors
                .into_iter()
                .map(|e| ValidationError::new(format!("rules[{}].{}", rule.id, e.field), e.message))
                .collect()
        })
}

/// Validates every rule of a candidate rule set.
///
/// # Errors
///
/// Returns all violations across all rules.
pub fn validate_ruleset(ruleset: &RuleSet) -> Result<(), Vec<ValidationError>> {
    let errors: Vec<ValidationError> = ruleset
        .ordered()
        .into_iter()
        .filter_map(|rule| validate_rule(rule).err())
        .flatten()
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
