//! Column grammar for object rows.
//!
//! Every row in the object table is a sparse set of named columns.
//! Structural edges (parent, children, refs, back-refs) and properties
//! share the row, distinguished by column-name prefixes.

use crate::error::StoreError;

/// Column for the latest-mutation timestamp, used for cache
/// invalidation.
pub const LATEST_COL_TS: &str = "META:latest_col_ts";

/// Parsed column name per the control-plane grammar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnName {
    /// `type` — the resource type string.
    Type,
    /// `fq_name` — JSON array of name components.
    FqName,
    /// `parent:<type>:<uuid>` — this row's parent.
    Parent {
        /// Parent resource type.
        type_name: String,
        /// Parent UUID.
        uuid: String,
    },
    /// `children:<type>:<uuid>` — a child of this row.
    Children {
        /// Child resource type.
        type_name: String,
        /// Child UUID.
        uuid: String,
    },
    /// `ref:<type>:<uuid>` — outgoing reference; value carries the
    /// attribute payload.
    Ref {
        /// Target resource type.
        type_name: String,
        /// Target UUID.
        uuid: String,
    },
    /// `backref:<type>:<uuid>` — incoming reference.
    BackRef {
        /// Source resource type.
        type_name: String,
        /// Source UUID.
        uuid: String,
    },
    /// `relaxbackref:<uuid>` — incoming reference that does not block
    /// deletion of this row.
    RelaxBackRef {
        /// Source UUID.
        uuid: String,
    },
    /// `prop:<name>` — scalar property.
    Prop {
        /// Property name.
        name: String,
    },
    /// `propl:<name>:<position>` — list-property element.
    PropList {
        /// Property name.
        name: String,
        /// Element position.
        position: u32,
    },
    /// `propm:<name>:<key>` — map-property element.
    PropMap {
        /// Property name.
        name: String,
        /// Map key.
        key: String,
    },
    /// `META:latest_col_ts` — mutation timestamp tombstone.
    LatestColTs,
}

impl ColumnName {
    /// Renders the column name to its stored string form.
    pub fn render(&self) -> String {
        match self {
            ColumnName::Type => "type".to_string(),
            ColumnName::FqName => "fq_name".to_string(),
            ColumnName::Parent { type_name, uuid } => format!("parent:{}:{}", type_name, uuid),
            ColumnName::Children { type_name, uuid } => {
                format!("children:{}:{}", type_name, uuid)
            }
            ColumnName::Ref { type_name, uuid } => format!("ref:{}:{}", type_name, uuid),
            ColumnName::BackRef { type_name, uuid } => format!("backref:{}:{}", type_name, uuid),
            ColumnName::RelaxBackRef { uuid } => format!("relaxbackref:{}", uuid),
            ColumnName::Prop { name } => format!("prop:{}", name),
            ColumnName::PropList { name, position } => {
                format!("propl:{}:{}", name, position)
            }
            ColumnName::PropMap { name, key } => format!("propm:{}:{}", name, key),
            ColumnName::LatestColTs => LATEST_COL_TS.to_string(),
        }
    }

    /// Parses a stored column name.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        if raw == "type" {
            return Ok(ColumnName::Type);
        }
        if raw == "fq_name" {
            return Ok(ColumnName::FqName);
        }
        if raw == LATEST_COL_TS {
            return Ok(ColumnName::LatestColTs);
        }
        let bad = || StoreError::BadColumnName(raw.to_string());
        let (prefix, rest) = raw.split_once(':').ok_or_else(bad)?;
        match prefix {
            "parent" | "children" | "ref" | "backref" => {
                let (type_name, uuid) = rest.split_once(':').ok_or_else(bad)?;
                let type_name = type_name.to_string();
                let uuid = uuid.to_string();
                Ok(match prefix {
                    "parent" => ColumnName::Parent { type_name, uuid },
                    "children" => ColumnName::Children { type_name, uuid },
                    "ref" => ColumnName::Ref { type_name, uuid },
                    _ => ColumnName::BackRef { type_name, uuid },
                })
            }
            "relaxbackref" => Ok(ColumnName::RelaxBackRef {
                uuid: rest.to_string(),
            }),
            "prop" => Ok(ColumnName::Prop {
                name: rest.to_string(),
            }),
            "propl" => {
                let (name, pos) = rest.split_once(':').ok_or_else(bad)?;
                Ok(ColumnName::PropList {
                    name: name.to_string(),
                    position: pos.parse().map_err(|_| bad())?,
                })
            }
            "propm" => {
                let (name, key) = rest.split_once(':').ok_or_else(bad)?;
                Ok(ColumnName::PropMap {
                    name: name.to_string(),
                    key: key.to_string(),
                })
            }
            _ => Err(bad()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_parse_round_trip() {
        let cases = vec![
            ColumnName::Type,
            ColumnName::FqName,
            ColumnName::Parent {
                type_name: "project".into(),
                uuid: "u1".into(),
            },
            ColumnName::Children {
                type_name: "virtual-network".into(),
                uuid: "u2".into(),
            },
            ColumnName::Ref {
                type_name: "network-ipam".into(),
                uuid: "u3".into(),
            },
            ColumnName::BackRef {
                type_name: "virtual-machine-interface".into(),
                uuid: "u4".into(),
            },
            ColumnName::RelaxBackRef { uuid: "u5".into() },
            ColumnName::Prop {
                name: "virtual_network_properties".into(),
            },
            ColumnName::PropList {
                name: "annotations".into(),
                position: 3,
            },
            ColumnName::PropMap {
                name: "bindings".into(),
                key: "vif_type".into(),
            },
            ColumnName::LatestColTs,
        ];
        for c in cases {
            assert_eq!(ColumnName::parse(&c.render()).unwrap(), c);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ColumnName::parse("nonsense").is_err());
        assert!(ColumnName::parse("ref:only-type").is_err());
        assert!(ColumnName::parse("propl:name:notanumber").is_err());
        assert!(ColumnName::parse("weird:a:b").is_err());
    }

    #[test]
    fn test_prop_name_with_colon_in_map_key() {
        // Map keys may themselves contain colons; everything after the
        // second separator belongs to the key.
        let parsed = ColumnName::parse("propm:kv:a:b:c").unwrap();
        assert_eq!(
            parsed,
            ColumnName::PropMap {
                name: "kv".into(),
                key: "a:b:c".into()
            }
        );
    }
}
