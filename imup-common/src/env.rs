//! Settings resolution with flag > environment variable > default precedence.
//!
//! Every resolver takes the environment as a lookup function rather than
//! reading the process environment directly, so configuration construction
//! stays testable without mutating global state. [`process_env`] is the
//! production lookup.

use std::str::FromStr;

/// Environment lookup used by the resolvers.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Production environment lookup backed by the process environment.
#[must_use]
pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Resolve a string setting: an explicitly passed flag wins, then the
/// environment variable, then the built-in default.
#[must_use]
pub fn value_or(flag: Option<&str>, env: EnvLookup<'_>, var: &str, default: &str) -> String {
    match flag {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => env(var).unwrap_or_else(|| default.to_string()),
    }
}

/// Resolve a boolean setting with the same precedence.
///
/// An unparsable environment value falls back to the default rather than
/// failing startup.
#[must_use]
pub fn bool_value_or(flag: Option<bool>, env: EnvLookup<'_>, var: &str, default: bool) -> bool {
    if let Some(v) = flag {
        return v;
    }

    env(var)
        .and_then(|v| v.trim().parse::<bool>().ok())
        .unwrap_or(default)
}

/// Resolve a numeric setting with the same precedence.
///
/// An unparsable environment value falls back to the default rather than
/// failing startup.
#[must_use]
pub fn parse_value_or<T: FromStr + Copy>(
    flag: Option<T>,
    env: EnvLookup<'_>,
    var: &str,
    default: T,
) -> T {
    if let Some(v) = flag {
        return v;
    }

    env(var)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Split a comma separated setting into its non-empty entries.
#[must_use]
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn flag_wins_over_environment() {
        let env = env_of(&[("EMAIL", "env@example.com")]);
        assert_eq!(
            value_or(Some("flag@example.com"), &env, "EMAIL", "unknown"),
            "flag@example.com"
        );
    }

    #[test]
    fn environment_wins_over_default() {
        let env = env_of(&[("EMAIL", "env@example.com")]);
        assert_eq!(value_or(None, &env, "EMAIL", "unknown"), "env@example.com");
    }

    #[test]
    fn empty_flag_falls_through() {
        let env = env_of(&[("EMAIL", "env@example.com")]);
        assert_eq!(value_or(Some(""), &env, "EMAIL", "unknown"), "env@example.com");
        let empty = env_of(&[]);
        assert_eq!(value_or(Some(""), &empty, "EMAIL", "unknown"), "unknown");
    }

    #[test]
    fn bool_resolution() {
        let env = env_of(&[("REALTIME", "false"), ("NO_SPEED_TEST", "garbage")]);
        assert!(!bool_value_or(None, &env, "REALTIME", true));
        assert!(bool_value_or(Some(true), &env, "REALTIME", true));
        // unparsable environment value keeps the default
        assert!(!bool_value_or(None, &env, "NO_SPEED_TEST", false));
        let empty = env_of(&[]);
        assert!(bool_value_or(None, &empty, "REALTIME", true));
    }

    #[test]
    fn numeric_resolution() {
        let env = env_of(&[("PING_INTERVAL", "15"), ("PING_DELAY", "oops")]);
        assert_eq!(parse_value_or(None, &env, "PING_INTERVAL", 60_u64), 15);
        assert_eq!(parse_value_or(Some(5_u64), &env, "PING_INTERVAL", 60), 5);
        assert_eq!(parse_value_or(None, &env, "PING_DELAY", 100_u64), 100);
    }

    #[test]
    fn list_splitting_skips_empty_entries() {
        assert_eq!(
            split_list("1.1.1.1/32, 8.8.8.8/32,,"),
            vec!["1.1.1.1/32".to_string(), "8.8.8.8/32".to_string()]
        );
        assert!(split_list("").is_empty());
    }
}
