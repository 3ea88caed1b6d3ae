//! Name validation against the kernel's fixed-size buffers.
//!
//! Every name that ends up in a rule table blob passes through one of these
//! checks first. Over-long names are rejected, never truncated.

/// Longest chain name: it must also fit an `xt_entry_target` name.
pub const MAX_CHAIN_NAME_LEN: usize = 28;

/// Longest table name (`XT_TABLE_MAXNAMELEN` minus the terminator).
pub const MAX_TABLE_NAME_LEN: usize = 31;

/// Longest interface name (`IFNAMSIZ` minus the terminator).
pub const MAX_INTERFACE_LEN: usize = 15;

/// Names of the standard verdicts; no chain may take one of these.
pub const RESERVED_TARGETS: [&str; 4] = ["ACCEPT", "DROP", "QUEUE", "RETURN"];

/// True for the four standard verdict names.
pub fn is_reserved_target(name: &str) -> bool {
    RESERVED_TARGETS.contains(&name)
}

/// Validates a user-defined chain name.
///
/// # Errors
///
/// Returns `Err` if the name:
/// - is empty or longer than 28 bytes
/// - contains whitespace, control characters or NUL
/// - starts with `-` or `!` (would read as an option or negation)
/// - is `ERROR`, which marks chain heads in the kernel format
pub fn validate_chain_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Chain name cannot be empty".to_string());
    }
    if name.len() > MAX_CHAIN_NAME_LEN {
        return Err(format!(
            "Chain name too long (max {MAX_CHAIN_NAME_LEN} bytes)"
        ));
    }
    if name
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err("Chain name contains whitespace or control characters".to_string());
    }
    if name.starts_with('-') || name.starts_with('!') {
        return Err("Chain name cannot start with '-' or '!'".to_string());
    }
    if name == "ERROR" {
        return Err("ERROR is reserved for chain heads".to_string());
    }
    Ok(())
}

/// Validates a table name.
///
/// # Errors
///
/// Returns `Err` if the name is empty, longer than 31 bytes or contains NUL.
pub fn validate_table_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Table name cannot be empty".to_string());
    }
    if name.len() > MAX_TABLE_NAME_LEN {
        return Err(format!(
            "Table name too long (max {MAX_TABLE_NAME_LEN} bytes)"
        ));
    }
    if name.contains('\0') {
        return Err("Table name contains NUL".to_string());
    }
    Ok(())
}

/// Validates an extension target name (e.g. `LOG`, `REJECT`).
///
/// # Errors
///
/// Returns `Err` if the name is longer than 28 bytes, contains NUL or is
/// the reserved `ERROR` target.
pub fn validate_target_name(name: &str) -> Result<(), String> {
    if name.len() > MAX_CHAIN_NAME_LEN {
        return Err(format!(
            "Target name too long (max {MAX_CHAIN_NAME_LEN} bytes)"
        ));
    }
    if name.contains('\0') {
        return Err("Target name contains NUL".to_string());
    }
    if name == "ERROR" {
        return Err("ERROR cannot be used as a rule target".to_string());
    }
    Ok(())
}

/// Validates a network interface name for `-i`/`-o` matches.
///
/// Linux interface naming rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - No whitespace, `/` or `:`
/// - Cannot be "." or ".."
/// - A trailing `+` turns the name into a prefix match
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Ok(String::new());
    }

    if name.len() > MAX_INTERFACE_LEN {
        return Err(format!(
            "Interface name too long (max {MAX_INTERFACE_LEN} characters)"
        ));
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    if name
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '/' | ':'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_name_limits() {
        assert!(validate_chain_name("LOGDROP").is_ok());
        assert!(validate_chain_name(&"a".repeat(28)).is_ok());
        assert!(validate_chain_name(&"a".repeat(29)).is_err());
        assert!(validate_chain_name("").is_err());
    }

    #[test]
    fn test_chain_name_characters() {
        assert!(validate_chain_name("my chain").is_err());
        assert!(validate_chain_name("-x").is_err());
        assert!(validate_chain_name("!x").is_err());
        assert!(validate_chain_name("ERROR").is_err());
        assert!(validate_chain_name("in-eth0_v2").is_ok());
    }

    #[test]
    fn test_reserved_targets() {
        for name in RESERVED_TARGETS {
            assert!(is_reserved_target(name));
        }
        assert!(!is_reserved_target("accept"));
        assert!(!is_reserved_target("LOG"));
    }

    #[test]
    fn test_table_name() {
        assert!(validate_table_name("filter").is_ok());
        assert!(validate_table_name(&"t".repeat(31)).is_ok());
        assert!(validate_table_name(&"t".repeat(32)).is_err());
        assert!(validate_table_name("").is_err());
    }

    #[test]
    fn test_target_name() {
        assert!(validate_target_name("LOG").is_ok());
        assert!(validate_target_name("").is_ok());
        assert!(validate_target_name("ERROR").is_err());
        assert!(validate_target_name(&"T".repeat(29)).is_err());
    }

    #[test]
    fn test_interface_names() {
        assert_eq!(validate_interface("eth0"), Ok("eth0".to_string()));
        assert_eq!(validate_interface("eth+"), Ok("eth+".to_string()));
        assert_eq!(validate_interface(""), Ok(String::new()));
        assert!(validate_interface("..").is_err());
        assert!(validate_interface("a/b").is_err());
        assert!(validate_interface("eth 0").is_err());
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_chain_name_length_constraint(name in "[A-Za-z0-9_]{1,40}") {
            let result = validate_chain_name(&name);
            if name.len() <= MAX_CHAIN_NAME_LEN {
                prop_assert!(result.is_ok());
            } else {
                prop_assert!(result.is_err());
            }
        }

        #[test]
        fn test_validate_interface_length_constraint(name in "[a-zA-Z0-9._-]{0,20}") {
            let result = validate_interface(&name);
            if name.len() <= MAX_INTERFACE_LEN && name != "." && name != ".." {
                prop_assert!(result.is_ok());
            } else if name.len() > MAX_INTERFACE_LEN {
                prop_assert!(result.is_err());
            }
        }

        #[test]
        fn test_validate_interface_rejects_separators(
            prefix in "[a-z0-9]{1,10}",
            bad in "[/: \t]"
        ) {
            let name = format!("{prefix}{bad}");
            prop_assert!(validate_interface(&name).is_err());
        }
    }
}
