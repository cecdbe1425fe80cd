//! Machine configuration properties.
//!
//! A flat `name -> property` map assembled from machine defaults and
//! device-contributed entries, then merged with user overrides. Every
//! property is an integer, a string, or a binary flag; integer and string
//! properties may carry an allow-list that overrides are validated against.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PropError {
    #[error("unknown property '{0}'")]
    Unknown(String),
    #[error("property '{0}': '{1}' is not a number")]
    NotANumber(String, String),
    #[error("property '{0}': value '{1}' is not allowed")]
    NotAllowed(String, String),
}

#[derive(Debug, Clone)]
pub enum Property {
    Int { value: u32, allowed: Vec<u32> },
    Str { value: String, allowed: Vec<String> },
    Bin { value: bool },
}

#[derive(Debug, Clone, Default)]
pub struct PropMap {
    props: HashMap<String, Property>,
}

impl PropMap {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Defaults registration ─────────────────────────────────

    pub fn add_int(&mut self, name: &str, value: u32, allowed: &[u32]) {
        self.props.insert(
            name.to_string(),
            Property::Int {
                value,
                allowed: allowed.to_vec(),
            },
        );
    }

    pub fn add_str(&mut self, name: &str, value: &str, allowed: &[&str]) {
        self.props.insert(
            name.to_string(),
            Property::Str {
                value: value.to_string(),
                allowed: allowed.iter().map(|s| s.to_string()).collect(),
            },
        );
    }

    pub fn add_bin(&mut self, name: &str, value: bool) {
        self.props
            .insert(name.to_string(), Property::Bin { value });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.props.contains_key(name)
    }

    // ── Override merging ──────────────────────────────────────

    /// Apply one user override, validating against the property kind and its
    /// allow-list.
    pub fn set_override(&mut self, name: &str, value: &str) -> Result<(), PropError> {
        let prop = self
            .props
            .get_mut(name)
            .ok_or_else(|| PropError::Unknown(name.to_string()))?;

        match prop {
            Property::Int {
                value: cur,
                allowed,
            } => {
                let parsed = parse_int(value)
                    .ok_or_else(|| PropError::NotANumber(name.to_string(), value.to_string()))?;
                if !allowed.is_empty() && !allowed.contains(&parsed) {
                    return Err(PropError::NotAllowed(name.to_string(), value.to_string()));
                }
                *cur = parsed;
            }
            Property::Str {
                value: cur,
                allowed,
            } => {
                if !allowed.is_empty() && !allowed.iter().any(|a| a == value) {
                    return Err(PropError::NotAllowed(name.to_string(), value.to_string()));
                }
                *cur = value.to_string();
            }
            Property::Bin { value: cur } => {
                *cur = match value {
                    "1" | "on" | "yes" => true,
                    "0" | "off" | "no" => false,
                    _ => {
                        return Err(PropError::NotAllowed(name.to_string(), value.to_string()));
                    }
                };
            }
        }
        Ok(())
    }

    // ── Typed access ──────────────────────────────────────────

    pub fn get_int(&self, name: &str) -> u32 {
        match self.props.get(name) {
            Some(Property::Int { value, .. }) => *value,
            _ => panic!("machine property '{}' is not an int", name),
        }
    }

    pub fn get_str(&self, name: &str) -> String {
        match self.props.get(name) {
            Some(Property::Str { value, .. }) => value.clone(),
            _ => panic!("machine property '{}' is not a string", name),
        }
    }

    /// Like `get_str`, empty when the property does not exist at all.
    pub fn get_str_opt(&self, name: &str) -> String {
        match self.props.get(name) {
            Some(Property::Str { value, .. }) => value.clone(),
            _ => String::new(),
        }
    }

    pub fn get_bin(&self, name: &str) -> bool {
        match self.props.get(name) {
            Some(Property::Bin { value }) => *value,
            _ => panic!("machine property '{}' is not a binary flag", name),
        }
    }
}

fn parse_int(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_validate_against_allow_list() {
        let mut props = PropMap::new();
        props.add_int("rambank1_size", 16, &[4, 8, 16, 32, 64, 128]);
        props.add_str("cpu", "604e", &["601", "604", "604e", "750"]);
        props.add_bin("emmo", false);

        props.set_override("rambank1_size", "64").unwrap();
        assert_eq!(props.get_int("rambank1_size"), 64);

        assert!(props.set_override("rambank1_size", "7").is_err());
        assert!(props.set_override("cpu", "486").is_err());
        assert!(props.set_override("nonsense", "1").is_err());

        props.set_override("cpu", "750").unwrap();
        assert_eq!(props.get_str("cpu"), "750");

        props.set_override("emmo", "1").unwrap();
        assert!(props.get_bin("emmo"));
    }

    #[test]
    fn hex_int_overrides() {
        let mut props = PropMap::new();
        props.add_int("mon_id", 0, &[]);
        props.set_override("mon_id", "0x20").unwrap();
        assert_eq!(props.get_int("mon_id"), 0x20);
    }
}
