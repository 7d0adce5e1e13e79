//! Property validation.
//!
//! Validators are data: the schema registry attaches one per declared
//! property and the pipeline runs them on every create/update. All
//! failures map to 400.

use serde_json::Value;

use fabricd_alloc::subnet::parse_cidr;

use crate::error::ApiError;

/// Well-known community strings accepted alongside `asn:value` pairs.
const WELL_KNOWN_COMMUNITIES: &[&str] = &[
    "no-export",
    "accept-own",
    "no-advertise",
    "no-export-subconfed",
    "no-reoriginate",
];

/// Declarative validator for one property.
#[derive(Clone, Debug)]
pub enum Validator {
    /// Any JSON value; structure checked by hooks if at all.
    Any,
    /// JSON string.
    Text,
    /// JSON boolean.
    Boolean,
    /// Integer within an inclusive range.
    IntRange(i64, i64),
    /// One of a fixed set of strings.
    StringEnum(&'static [&'static str]),
    /// Community value list (`asn:value` or well-known strings).
    CommunityList,
    /// Service-interface type string.
    ServiceInterfaceType,
    /// List of allowed-address-pair entries.
    AllowedAddressPairs,
}

impl Validator {
    /// Validates `value` for the property `name`.
    pub fn check(&self, name: &str, value: &Value) -> Result<(), ApiError> {
        let bad = |reason: &str| {
            Err(ApiError::MalformedRequest(format!(
                "invalid value for {}: {}",
                name, reason
            )))
        };
        match self {
            Validator::Any => Ok(()),
            Validator::Text => {
                if value.is_string() {
                    Ok(())
                } else {
                    bad("expected string")
                }
            }
            Validator::Boolean => {
                if value.is_boolean() {
                    Ok(())
                } else {
                    bad("expected boolean")
                }
            }
            Validator::IntRange(min, max) => match value.as_i64() {
                Some(v) if v >= *min && v <= *max => Ok(()),
                Some(v) => bad(&format!("{} outside [{}, {}]", v, min, max)),
                None => bad("expected integer"),
            },
            Validator::StringEnum(allowed) => match value.as_str() {
                Some(s) if allowed.contains(&s) => Ok(()),
                Some(s) => bad(&format!("{} not one of {:?}", s, allowed)),
                None => bad("expected string"),
            },
            Validator::CommunityList => {
                let entries = match value {
                    Value::Array(a) => a.as_slice(),
                    _ => return bad("expected list of community values"),
                };
                for entry in entries {
                    let Some(s) = entry.as_str() else {
                        return bad("community value must be a string");
                    };
                    validate_community_value(s)
                        .map_err(|r| ApiError::MalformedRequest(format!("{}: {}", name, r)))?;
                }
                Ok(())
            }
            Validator::ServiceInterfaceType => match value.as_str() {
                Some(s) if is_service_interface_type(s) => Ok(()),
                Some(s) => bad(&format!("bad service interface type {}", s)),
                None => bad("expected string"),
            },
            Validator::AllowedAddressPairs => validate_allowed_address_pairs(name, value),
        }
    }
}

/// Validates one community value: `asn:value` with both in 0..2¹⁶, or
/// a well-known string.
pub fn validate_community_value(s: &str) -> Result<(), String> {
    if WELL_KNOWN_COMMUNITIES.contains(&s) {
        return Ok(());
    }
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() == 2
        && parts[0].parse::<u16>().is_ok()
        && parts[1].parse::<u16>().is_ok()
    {
        return Ok(());
    }
    Err(format!("bad community value {}", s))
}

/// Service interfaces are `management`, `left`, `right`, or `otherN`.
pub fn is_service_interface_type(s: &str) -> bool {
    match s {
        "management" | "left" | "right" => true,
        _ => s
            .strip_prefix("other")
            .is_some_and(|rest| rest.is_empty() || rest.chars().all(|c| c.is_ascii_digit())),
    }
}

/// Allowed-address-pair prefixes must be at least /24 (IPv4) or /120
/// (IPv6): anything broader would let one port claim a huge range.
fn validate_allowed_address_pairs(name: &str, value: &Value) -> Result<(), ApiError> {
    let bad =
        |reason: String| Err(ApiError::MalformedRequest(format!("{}: {}", name, reason)));
    let pairs = match value.get("allowed_address_pair") {
        Some(Value::Array(a)) => a.as_slice(),
        Some(_) => return bad("allowed_address_pair must be a list".to_string()),
        None => return Ok(()),
    };
    for pair in pairs {
        let Some(ip) = pair.get("ip") else { continue };
        let prefix = ip
            .get("ip_prefix")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let prefix_len = ip
            .get("ip_prefix_len")
            .and_then(Value::as_u64)
            .unwrap_or(32);
        let is_v4 = prefix.parse::<std::net::Ipv4Addr>().is_ok();
        let is_v6 = prefix.parse::<std::net::Ipv6Addr>().is_ok();
        if !is_v4 && !is_v6 {
            return bad(format!("bad allowed-address-pair prefix {}", prefix));
        }
        let min = if is_v4 { 24 } else { 120 };
        if prefix_len < min {
            return bad(format!(
                "allowed-address-pair prefix length {} below minimum {}",
                prefix_len, min
            ));
        }
    }
    Ok(())
}

/// Normalizes a subnet dict `{ip_prefix, ip_prefix_len}` in place to
/// its network address.
pub fn normalize_subnet(subnet: &mut Value) -> Result<String, ApiError> {
    let prefix = subnet
        .get("ip_prefix")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::MalformedRequest("subnet missing ip_prefix".to_string()))?;
    let prefix_len = subnet
        .get("ip_prefix_len")
        .and_then(Value::as_u64)
        .ok_or_else(|| ApiError::MalformedRequest("subnet missing ip_prefix_len".to_string()))?;
    let cidr = format!("{}/{}", prefix, prefix_len);
    let (network, len) =
        parse_cidr(&cidr).map_err(|e| ApiError::MalformedRequest(e.to_string()))?;
    subnet["ip_prefix"] = Value::String(network.to_string());
    subnet["ip_prefix_len"] = Value::from(len);
    Ok(format!("{}/{}", network, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_int_range() {
        let v = Validator::IntRange(1, 1 << 24);
        assert!(v.check("virtual_network_network_id", &json!(5)).is_ok());
        assert!(v.check("virtual_network_network_id", &json!(0)).is_err());
        assert!(v.check("virtual_network_network_id", &json!("5")).is_err());
    }

    #[test]
    fn test_string_enum() {
        let v = Validator::StringEnum(&["l2", "l3", "l2_l3"]);
        assert!(v.check("forwarding_mode", &json!("l2_l3")).is_ok());
        assert!(v.check("forwarding_mode", &json!("l4")).is_err());
    }

    #[test]
    fn test_community_values() {
        let v = Validator::CommunityList;
        assert!(v.check("communities", &json!(["64512:100", "no-export"])).is_ok());
        assert!(v.check("communities", &json!(["70000:100"])).is_err());
        assert!(v.check("communities", &json!(["banana"])).is_err());
        assert!(v.check("communities", &json!("64512:100")).is_err());
    }

    #[test]
    fn test_service_interface_types() {
        assert!(is_service_interface_type("left"));
        assert!(is_service_interface_type("management"));
        assert!(is_service_interface_type("other"));
        assert!(is_service_interface_type("other2"));
        assert!(!is_service_interface_type("middle"));
        assert!(!is_service_interface_type("otherx"));
    }

    #[test]
    fn test_allowed_address_pairs() {
        let v = Validator::AllowedAddressPairs;
        let ok = json!({"allowed_address_pair": [
            {"ip": {"ip_prefix": "10.0.0.0", "ip_prefix_len": 24}}
        ]});
        assert!(v.check("aap", &ok).is_ok());
        let too_broad = json!({"allowed_address_pair": [
            {"ip": {"ip_prefix": "10.0.0.0", "ip_prefix_len": 16}}
        ]});
        assert!(v.check("aap", &too_broad).is_err());
        let v6_ok = json!({"allowed_address_pair": [
            {"ip": {"ip_prefix": "fd00::", "ip_prefix_len": 120}}
        ]});
        assert!(v.check("aap", &v6_ok).is_ok());
        let v6_bad = json!({"allowed_address_pair": [
            {"ip": {"ip_prefix": "fd00::", "ip_prefix_len": 64}}
        ]});
        assert!(v.check("aap", &v6_bad).is_err());
    }

    #[test]
    fn test_normalize_subnet() {
        let mut subnet = json!({"ip_prefix": "10.0.0.57", "ip_prefix_len": 24});
        let cidr = normalize_subnet(&mut subnet).unwrap();
        assert_eq!(cidr, "10.0.0.0/24");
        assert_eq!(subnet["ip_prefix"], json!("10.0.0.0"));
    }
}
