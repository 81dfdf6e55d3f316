//! An LDAP-style search filter: the AST and its parser.
//!
//! The grammar is the RFC 4515 string representation: `(attr=value)`,
//! `(&(a=1)(b=2))`, `(|(a=1)(b=2))`, `(!(a=1))`, `(attr>=v)`, `(attr<=v)`,
//! presence `(attr=*)`, substrings `(attr=pre*mid*post)`, and extensible
//! matches `(attr:rule:=value)`. Approximate matches (`~=`) are rejected.

mod parse;

pub use parse::{parse, ParseError};

/// A parsed filter expression. Assertion values are held in their decoded
/// form; `\XX` escapes have been resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality {
        attr: String,
        value: String,
    },
    Present {
        attr: String,
    },
    GreaterOrEqual {
        attr: String,
        value: String,
    },
    LessOrEqual {
        attr: String,
        value: String,
    },
    /// `(attr=initial*any1*any2*last)`. Empty `any` components are dropped
    /// during parsing, so adjacent wildcards collapse.
    Substring {
        attr: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
    /// `(attr:rule:=value)`. The rule is kept verbatim; which rules are
    /// supported is the caller's concern.
    Extensible {
        attr: String,
        rule: String,
        value: String,
    },
}

impl Filter {
    /// The attribute this leaf asserts over, or None for composites.
    pub fn attr(&self) -> Option<&str> {
        match self {
            Filter::And(_) | Filter::Or(_) | Filter::Not(_) => None,
            Filter::Equality { attr, .. }
            | Filter::Present { attr }
            | Filter::GreaterOrEqual { attr, .. }
            | Filter::LessOrEqual { attr, .. }
            | Filter::Substring { attr, .. }
            | Filter::Extensible { attr, .. } => Some(attr),
        }
    }
}

fn escape_value(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '(' | ')' | '*' | '\\' | '\0' => {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).as_bytes() {
                    out.push('\\');
                    out.push_str(&format!("{:02x}", b));
                }
            }
            c => out.push(c),
        }
    }
}

impl std::fmt::Display for Filter {
    /// Re-render the filter in its string form, escaping special characters.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = String::new();
        render(self, &mut out);
        f.write_str(&out)
    }
}

fn render(filter: &Filter, out: &mut String) {
    out.push('(');
    match filter {
        Filter::And(children) => {
            out.push('&');
            for child in children {
                render(child, out);
            }
        }
        Filter::Or(children) => {
            out.push('|');
            for child in children {
                render(child, out);
            }
        }
        Filter::Not(child) => {
            out.push('!');
            render(child, out);
        }
        Filter::Equality { attr, value } => {
            out.push_str(attr);
            out.push('=');
            escape_value(value, out);
        }
        Filter::Present { attr } => {
            out.push_str(attr);
            out.push_str("=*");
        }
        Filter::GreaterOrEqual { attr, value } => {
            out.push_str(attr);
            out.push_str(">=");
            escape_value(value, out);
        }
        Filter::LessOrEqual { attr, value } => {
            out.push_str(attr);
            out.push_str("<=");
            escape_value(value, out);
        }
        Filter::Substring {
            attr,
            initial,
            any,
            last,
        } => {
            out.push_str(attr);
            out.push('=');
            if let Some(initial) = initial {
                escape_value(initial, out);
            }
            out.push('*');
            for component in any {
                escape_value(component, out);
                out.push('*');
            }
            if let Some(last) = last {
                escape_value(last, out);
            }
        }
        Filter::Extensible { attr, rule, value } => {
            out.push_str(attr);
            out.push(':');
            out.push_str(rule);
            out.push_str(":=");
            escape_value(value, out);
        }
    }
    out.push(')');
}
