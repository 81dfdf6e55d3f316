use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// IndexType is the declared semantic type of an indexed bucket field.
/// It determines the backing column type, how JSON values are projected
/// into that column, and how filter comparisons against it behave.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexType {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "number")]
    Number,
    #[serde(rename = "boolean")]
    Boolean,
    #[serde(rename = "ip")]
    Ip,
    #[serde(rename = "subnet")]
    Subnet,
    #[serde(rename = "[string]")]
    StringArray,
    #[serde(rename = "[number]")]
    NumberArray,
    #[serde(rename = "[boolean]")]
    BooleanArray,
    #[serde(rename = "[ip]")]
    IpArray,
    #[serde(rename = "[subnet]")]
    SubnetArray,
}

impl IndexType {
    pub fn is_array(&self) -> bool {
        matches!(
            self,
            IndexType::StringArray
                | IndexType::NumberArray
                | IndexType::BooleanArray
                | IndexType::IpArray
                | IndexType::SubnetArray
        )
    }

    /// The scalar type of this type's elements. Identity for scalar types.
    pub fn element(&self) -> IndexType {
        match self {
            IndexType::StringArray => IndexType::String,
            IndexType::NumberArray => IndexType::Number,
            IndexType::BooleanArray => IndexType::Boolean,
            IndexType::IpArray => IndexType::Ip,
            IndexType::SubnetArray => IndexType::Subnet,
            scalar => *scalar,
        }
    }

    /// The PostgreSQL column type which backs this semantic type.
    pub fn pg_type(&self) -> &'static str {
        match self {
            IndexType::String => "TEXT",
            IndexType::Number => "BIGINT",
            IndexType::Boolean => "BOOLEAN",
            IndexType::Ip => "INET",
            IndexType::Subnet => "CIDR",
            IndexType::StringArray => "TEXT[]",
            IndexType::NumberArray => "BIGINT[]",
            IndexType::BooleanArray => "BOOLEAN[]",
            IndexType::IpArray => "INET[]",
            IndexType::SubnetArray => "CIDR[]",
        }
    }

    /// The index access method used for this column type.
    /// Array containment queries require GIN; everything else is BTREE.
    pub fn index_method(&self) -> &'static str {
        if self.is_array() {
            "GIN"
        } else {
            "BTREE"
        }
    }
}

impl std::fmt::Display for IndexType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IndexType::String => "string",
            IndexType::Number => "number",
            IndexType::Boolean => "boolean",
            IndexType::Ip => "ip",
            IndexType::Subnet => "subnet",
            IndexType::StringArray => "[string]",
            IndexType::NumberArray => "[number]",
            IndexType::BooleanArray => "[boolean]",
            IndexType::IpArray => "[ip]",
            IndexType::SubnetArray => "[subnet]",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("cannot coerce {value} to index type {ty}")]
pub struct CoercionError {
    pub ty: IndexType,
    pub value: String,
}

/// ColumnValue is a projected column value, typed to match its column.
/// Scalars bind directly as SQL parameters; arrays render to the
/// PostgreSQL array-literal text form and are cast server-side.
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnValue {
    Text(String),
    Int(i64),
    Bool(bool),
    Inet(IpNetwork),
    Cidr(IpNetwork),
    Array(IndexType, Vec<ColumnValue>),
}

/// Project a JSON value onto a column of the given semantic type.
/// JSON null is treated as an absent field and projects to no value at all;
/// callers leave the column NULL.
pub fn coerce(ty: IndexType, value: &serde_json::Value) -> Result<Option<ColumnValue>, CoercionError> {
    if value.is_null() {
        return Ok(None);
    }
    if ty.is_array() {
        let elem = ty.element();
        let items: Vec<&serde_json::Value> = match value {
            serde_json::Value::Array(items) => items.iter().collect(),
            // A scalar projects as a one-element array.
            scalar => vec![scalar],
        };
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match coerce_scalar(elem, item)? {
                Some(v) => out.push(v),
                None => continue, // null elements are dropped
            }
        }
        return Ok(Some(ColumnValue::Array(elem, out)));
    }
    coerce_scalar(ty, value)
}

fn coerce_scalar(
    ty: IndexType,
    value: &serde_json::Value,
) -> Result<Option<ColumnValue>, CoercionError> {
    if value.is_null() {
        return Ok(None);
    }
    let err = || CoercionError {
        ty,
        value: value.to_string(),
    };
    let v = match ty {
        IndexType::String => ColumnValue::Text(string_form(value)),
        IndexType::Number => {
            let parsed = match value {
                serde_json::Value::Number(n) => {
                    n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))
                }
                serde_json::Value::String(s) => parse_i64(s),
                _ => None,
            };
            ColumnValue::Int(parsed.ok_or_else(err)?)
        }
        IndexType::Boolean => ColumnValue::Bool(string_form(value).eq_ignore_ascii_case("true")),
        IndexType::Ip => {
            let addr: IpAddr = string_form(value).parse().map_err(|_| err())?;
            ColumnValue::Inet(IpNetwork::from(addr))
        }
        IndexType::Subnet => ColumnValue::Cidr(parse_subnet(&string_form(value)).ok_or_else(err)?),
        _ => unreachable!("array types are handled by coerce"),
    };
    Ok(Some(v))
}

/// Reverse projection: a column value back to its JSON representation.
pub fn uncoerce(value: &ColumnValue) -> serde_json::Value {
    match value {
        ColumnValue::Text(s) => serde_json::Value::String(s.clone()),
        ColumnValue::Int(n) => serde_json::Value::Number((*n).into()),
        ColumnValue::Bool(b) => serde_json::Value::Bool(*b),
        ColumnValue::Inet(net) => serde_json::Value::String(canonical_ip(net)),
        ColumnValue::Cidr(net) => serde_json::Value::String(net.to_string()),
        ColumnValue::Array(_, items) => {
            serde_json::Value::Array(items.iter().map(uncoerce).collect())
        }
    }
}

/// The string form used by `string` and `boolean` coercions: a JSON string's
/// contents, or the serialized text of any other JSON value.
pub fn string_form(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// An integer, or a finite float truncated toward zero.
fn parse_i64(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(n) = s.parse::<i64>() {
        return Some(n);
    }
    s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64)
}

/// Parse a CIDR subnet. A bare address is not a subnet; the prefix length
/// is required.
pub fn parse_subnet(s: &str) -> Option<IpNetwork> {
    if !s.contains('/') {
        return None;
    }
    s.parse().ok()
}

/// The canonical text form of an INET value. Host networks render without
/// a prefix length, matching PostgreSQL's own INET output.
pub fn canonical_ip(net: &IpNetwork) -> String {
    let full = match net {
        IpNetwork::V4(_) => net.prefix() == 32,
        IpNetwork::V6(_) => net.prefix() == 128,
    };
    if full {
        net.ip().to_string()
    } else {
        net.to_string()
    }
}

impl ColumnValue {
    /// Render a scalar value as its canonical text, suitable for binding
    /// with a server-side cast to the column type.
    pub fn scalar_text(&self) -> String {
        match self {
            ColumnValue::Text(s) => s.clone(),
            ColumnValue::Int(n) => n.to_string(),
            ColumnValue::Bool(b) => b.to_string(),
            ColumnValue::Inet(net) => canonical_ip(net),
            ColumnValue::Cidr(net) => net.to_string(),
            ColumnValue::Array(..) => self.array_literal(),
        }
    }

    /// Render an array value as a PostgreSQL array literal, e.g. `{a,"b,c"}`.
    /// Elements containing any of `" , { } \` are wrapped in double quotes
    /// with each such character backslash-escaped.
    pub fn array_literal(&self) -> String {
        let items = match self {
            ColumnValue::Array(_, items) => items,
            scalar => return scalar.scalar_text(),
        };
        let mut out = String::from("{");
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&escape_array_element(&item.scalar_text()));
        }
        out.push('}');
        out
    }
}

fn escape_array_element(text: &str) -> String {
    let needs_quoting =
        text.is_empty() || text.chars().any(|c| matches!(c, '"' | ',' | '{' | '}' | '\\'));
    if !needs_quoting {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        if matches!(c, '"' | ',' | '{' | '}' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn coerced(ty: IndexType, v: serde_json::Value) -> serde_json::Value {
        match coerce(ty, &v) {
            Ok(Some(cv)) => uncoerce(&cv),
            Ok(None) => serde_json::Value::Null,
            Err(err) => serde_json::Value::String(err.to_string()),
        }
    }

    #[test]
    fn index_type_serde_round_trip() {
        for (tag, ty) in [
            ("string", IndexType::String),
            ("number", IndexType::Number),
            ("boolean", IndexType::Boolean),
            ("ip", IndexType::Ip),
            ("subnet", IndexType::Subnet),
            ("[string]", IndexType::StringArray),
            ("[number]", IndexType::NumberArray),
            ("[boolean]", IndexType::BooleanArray),
            ("[ip]", IndexType::IpArray),
            ("[subnet]", IndexType::SubnetArray),
        ] {
            let parsed: IndexType = serde_json::from_value(json!(tag)).unwrap();
            assert_eq!(parsed, ty);
            assert_eq!(serde_json::to_value(ty).unwrap(), json!(tag));
        }
        assert!(serde_json::from_value::<IndexType>(json!("uuid")).is_err());
    }

    #[test]
    fn string_coercion_uses_string_form() {
        insta::assert_json_snapshot!(coerced(IndexType::String, json!("hello")), @r#""hello""#);
        insta::assert_json_snapshot!(coerced(IndexType::String, json!(30)), @r#""30""#);
        insta::assert_json_snapshot!(coerced(IndexType::String, json!(true)), @r#""true""#);
        insta::assert_json_snapshot!(
            coerced(IndexType::String, json!({"a": 1})),
            @r#""{\"a\":1}""#);
    }

    #[test]
    fn number_coercion() {
        insta::assert_json_snapshot!(coerced(IndexType::Number, json!(30)), @"30");
        insta::assert_json_snapshot!(coerced(IndexType::Number, json!("42")), @"42");
        insta::assert_json_snapshot!(coerced(IndexType::Number, json!(1.9)), @"1");
        insta::assert_json_snapshot!(
            coerced(IndexType::Number, json!("not a number")),
            @r#""cannot coerce \"not a number\" to index type number""#);
    }

    #[test]
    fn boolean_coercion_is_true_test() {
        assert_eq!(coerced(IndexType::Boolean, json!(true)), json!(true));
        assert_eq!(coerced(IndexType::Boolean, json!("TRUE")), json!(true));
        assert_eq!(coerced(IndexType::Boolean, json!("yes")), json!(false));
        assert_eq!(coerced(IndexType::Boolean, json!(1)), json!(false));
    }

    #[test]
    fn ip_coercion_canonicalizes() {
        assert_eq!(coerced(IndexType::Ip, json!("10.0.0.1")), json!("10.0.0.1"));
        // IPv6 canonical form per the address library.
        assert_eq!(
            coerced(IndexType::Ip, json!("2001:0db8:0000:0000:0000:0000:0000:0001")),
            json!("2001:db8::1")
        );
        insta::assert_json_snapshot!(
            coerced(IndexType::Ip, json!("10.0.0.256")),
            @r#""cannot coerce \"10.0.0.256\" to index type ip""#);
        // Idempotent on canonical inputs.
        let canon = coerced(IndexType::Ip, json!("2001:db8::1"));
        assert_eq!(coerced(IndexType::Ip, canon.clone()), canon);
    }

    #[test]
    fn subnet_coercion_requires_prefix() {
        assert_eq!(
            coerced(IndexType::Subnet, json!("10.0.0.0/8")),
            json!("10.0.0.0/8")
        );
        insta::assert_json_snapshot!(
            coerced(IndexType::Subnet, json!("10.0.0.0")),
            @r#""cannot coerce \"10.0.0.0\" to index type subnet""#);
    }

    #[test]
    fn scalar_input_projects_as_one_element_array() {
        let cv = coerce(IndexType::NumberArray, &json!(7)).unwrap().unwrap();
        assert_eq!(uncoerce(&cv), json!([7]));
    }

    #[test]
    fn null_projects_to_no_value() {
        assert!(coerce(IndexType::String, &serde_json::Value::Null)
            .unwrap()
            .is_none());
    }

    #[test]
    fn array_literal_escaping() {
        let cv = coerce(
            IndexType::StringArray,
            &json!(["plain", "with,comma", "with\"quote", "back\\slash", "curly{}", ""]),
        )
        .unwrap()
        .unwrap();
        insta::assert_snapshot!(
            cv.array_literal(),
            @r#"{plain,"with\,comma","with\"quote","back\\slash","curly\{\}",""}"#);
    }

    #[test]
    fn typed_array_literals() {
        let nums = coerce(IndexType::NumberArray, &json!([1, 2, 3])).unwrap().unwrap();
        assert_eq!(nums.array_literal(), "{1,2,3}");

        let ips = coerce(IndexType::IpArray, &json!(["10.0.0.1", "::1"])).unwrap().unwrap();
        assert_eq!(ips.array_literal(), "{10.0.0.1,::1}");
    }

    #[test]
    fn pg_types() {
        assert_eq!(IndexType::Number.pg_type(), "BIGINT");
        assert_eq!(IndexType::SubnetArray.pg_type(), "CIDR[]");
        assert_eq!(IndexType::StringArray.index_method(), "GIN");
        assert_eq!(IndexType::Ip.index_method(), "BTREE");
    }
}
