//! Compilation of a parsed filter into a parameterized SQL WHERE clause.
//!
//! Every leaf is resolved against the bucket's index map (plus the internal
//! row columns) and typed accordingly. Leaves over unindexed fields, or
//! fields whose backing columns are still reindexing, compile to nothing;
//! the composite rules then decide whether the filter as a whole is
//! answerable without a table scan.

use filter::Filter;
use models::{BucketDescriptor, IndexType};

use crate::error::{Error, Result};

/// A compiled WHERE clause with 1-based `$n` placeholders and its ordered
/// argument list.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    pub clause: String,
    pub args: Vec<FilterArg>,
}

/// One bound filter argument. `ip`/`subnet` values bind as canonical text
/// and are cast server-side, so comparisons use INET's numeric ordering.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterArg {
    Text(String),
    Int(i64),
    Bool(bool),
}

/// Matching rules understood by the extensible filter form.
const CASE_IGNORE: &str = "caseIgnoreMatch";
const CASE_IGNORE_SUBSTRINGS: &str = "caseIgnoreSubstringsMatch";

/// Internal row columns which are always queryable, with their types.
fn internal_field(attr: &str) -> Option<IndexType> {
    match attr {
        "_key" | "_etag" => Some(IndexType::String),
        "_id" | "_mtime" | "_txn_snap" => Some(IndexType::Number),
        _ => None,
    }
}

/// Compile `parsed` against the bucket's index. Fails with `NotIndexed`
/// when the filter cannot be answered from indexed columns alone.
pub fn compile_filter(bucket: &BucketDescriptor, parsed: &Filter) -> Result<CompiledFilter> {
    let mut compiler = Compiler {
        bucket,
        args: Vec::new(),
    };
    match compiler.compile(parsed)? {
        Some(clause) => Ok(CompiledFilter {
            clause,
            args: compiler.args,
        }),
        None => Err(Error::NotIndexed(parsed.to_string())),
    }
}

// The resolved typing of one leaf's attribute.
enum Usable {
    // The attribute is indexed (or internal) and its column is queryable.
    Typed(IndexType),
    // Unindexed, or its column is still backfilling.
    No,
}

struct Compiler<'a> {
    bucket: &'a BucketDescriptor,
    args: Vec<FilterArg>,
}

impl<'a> Compiler<'a> {
    // Push an argument, returning its 1-based placeholder.
    fn push(&mut self, arg: FilterArg) -> String {
        self.args.push(arg);
        format!("${}", self.args.len())
    }

    fn resolve(&self, attr: &str) -> Usable {
        if let Some(ty) = internal_field(attr) {
            return Usable::Typed(ty);
        }
        let Some(field) = self.bucket.index.get(attr) else {
            return Usable::No;
        };
        // A reindexing column has rows which predate it; treat it as
        // unusable until the backfill drains.
        if self.bucket.reindex_active.contains_field(attr) {
            return Usable::No;
        }
        Usable::Typed(field.ty)
    }

    // Coerce a filter assertion value per the attribute's type, producing
    // the argument to bind and an optional cast suffix for the placeholder.
    fn typed_arg(&self, attr: &str, ty: IndexType, value: &str) -> Result<(FilterArg, &'static str)> {
        let scalar = ty.element();
        let invalid = || {
            Error::InvalidQuery(format!(
                "cannot compare {} with {} (type {})",
                attr, value, scalar
            ))
        };
        match scalar {
            IndexType::String => Ok((FilterArg::Text(value.to_string()), "")),
            IndexType::Number => {
                let n: i64 = value.trim().parse().map_err(|_| invalid())?;
                Ok((FilterArg::Int(n), ""))
            }
            IndexType::Boolean => Ok((
                FilterArg::Bool(value.eq_ignore_ascii_case("true")),
                "",
            )),
            IndexType::Ip => {
                let addr: std::net::IpAddr = value.parse().map_err(|_| invalid())?;
                let net = ipnetwork::IpNetwork::from(addr);
                Ok((FilterArg::Text(models::canonical_ip(&net)), "::inet"))
            }
            IndexType::Subnet => {
                let net = models::parse_subnet(value).ok_or_else(invalid)?;
                Ok((FilterArg::Text(net.to_string()), "::cidr"))
            }
            _ => unreachable!("element() returns scalars"),
        }
    }

    // The array element type used for containment casts, e.g. `text[]`.
    fn array_cast(ty: IndexType) -> String {
        ty.pg_type().to_lowercase()
    }

    fn compile(&mut self, node: &Filter) -> Result<Option<String>> {
        match node {
            Filter::And(children) => {
                let mut clauses = Vec::new();
                for child in children {
                    if let Some(clause) = self.compile(child)? {
                        clauses.push(clause);
                    }
                }
                if clauses.is_empty() {
                    return Err(Error::NotIndexed(node.to_string()));
                }
                Ok(Some(format!("({})", clauses.join(" AND "))))
            }
            Filter::Or(children) => {
                let mut clauses = Vec::new();
                for child in children {
                    match self.compile(child)? {
                        Some(clause) => clauses.push(clause),
                        // A disjunction with an unanswerable arm would
                        // require a scan.
                        None => return Err(Error::NotIndexed(node.to_string())),
                    }
                }
                Ok(Some(format!("({})", clauses.join(" OR "))))
            }
            Filter::Not(child) => Ok(self
                .compile(child)?
                .map(|clause| format!("NOT ({})", clause))),
            Filter::Equality { attr, value } => self.comparison(attr, "=", value),
            Filter::GreaterOrEqual { attr, value } => self.comparison(attr, ">=", value),
            Filter::LessOrEqual { attr, value } => self.comparison(attr, "<=", value),
            Filter::Present { attr } => match self.resolve(attr) {
                Usable::No => Ok(None),
                Usable::Typed(_) => Ok(Some(format!("({} IS NOT NULL)", attr))),
            },
            Filter::Substring {
                attr,
                initial,
                any,
                last,
            } => self.substring(attr, initial.as_deref(), any, last.as_deref(), false),
            Filter::Extensible { attr, rule, value } => self.extensible(attr, rule, value),
        }
    }

    fn comparison(&mut self, attr: &str, op: &str, value: &str) -> Result<Option<String>> {
        let ty = match self.resolve(attr) {
            Usable::No => return Ok(None),
            Usable::Typed(ty) => ty,
        };
        let (arg, cast) = self.typed_arg(attr, ty, value)?;
        let placeholder = self.push(arg);
        if ty.is_array() {
            let clause = match op {
                // Containment: the array holds the value.
                "=" => format!(
                    "({} @> ARRAY[{}{}]::{})",
                    attr,
                    placeholder,
                    cast,
                    Self::array_cast(ty)
                ),
                // Range: the value compares against some element.
                op => format!("({}{} {} ANY({}))", placeholder, cast, op, attr),
            };
            return Ok(Some(clause));
        }
        Ok(Some(format!(
            "({} {} {}{} AND {} IS NOT NULL)",
            attr, op, placeholder, cast, attr
        )))
    }

    fn substring(
        &mut self,
        attr: &str,
        initial: Option<&str>,
        any: &[String],
        last: Option<&str>,
        case_insensitive: bool,
    ) -> Result<Option<String>> {
        let ty = match self.resolve(attr) {
            Usable::No => return Ok(None),
            Usable::Typed(ty) => ty,
        };
        // LIKE over an array column has no index-backed meaning.
        if ty.is_array() || ty.element() != IndexType::String {
            return Ok(None);
        }

        // Segments join on single '%' wildcards; empty endpoints mean the
        // pattern is open on that side. Adjacent wildcards were already
        // collapsed during parsing, so no '%%' can appear.
        let mut segments: Vec<&str> = Vec::with_capacity(any.len() + 2);
        segments.push(initial.unwrap_or(""));
        segments.extend(any.iter().map(String::as_str));
        segments.push(last.unwrap_or(""));
        let mut pattern = segments.join("%");
        if case_insensitive {
            pattern = pattern.to_lowercase();
        }

        let operator = if case_insensitive { "ILIKE" } else { "LIKE" };
        let placeholder = self.push(FilterArg::Text(pattern));
        Ok(Some(format!(
            "({} {} {} AND {} IS NOT NULL)",
            attr, operator, placeholder, attr
        )))
    }

    fn extensible(&mut self, attr: &str, rule: &str, value: &str) -> Result<Option<String>> {
        match rule {
            CASE_IGNORE => {
                let ty = match self.resolve(attr) {
                    Usable::No => return Ok(None),
                    Usable::Typed(ty) => ty,
                };
                if ty != IndexType::String {
                    return Err(Error::InvalidQuery(format!(
                        "{} requires a string field, and {} is {}",
                        CASE_IGNORE, attr, ty
                    )));
                }
                let placeholder = self.push(FilterArg::Text(value.to_lowercase()));
                Ok(Some(format!(
                    "(LOWER({}) = {} AND {} IS NOT NULL)",
                    attr, placeholder, attr
                )))
            }
            CASE_IGNORE_SUBSTRINGS => {
                // Expand the assertion into substring components on '*'.
                let mut segments = value.split('*');
                let initial = segments.next().filter(|s| !s.is_empty()).map(String::from);
                let mut rest: Vec<String> = segments.map(String::from).collect();
                let last = rest.pop().filter(|s| !s.is_empty());
                let any: Vec<String> = rest.into_iter().filter(|s| !s.is_empty()).collect();
                if initial.is_none() && any.is_empty() && last.is_none() {
                    // No components at all: an unconstrained pattern.
                    return Err(Error::InvalidQuery(format!(
                        "{} assertion on {} has no components",
                        CASE_IGNORE_SUBSTRINGS, attr
                    )));
                }
                self.substring(attr, initial.as_deref(), &any, last.as_deref(), true)
            }
            unknown => Err(Error::NotIndexed(format!(
                "{} (unknown matching rule {})",
                attr, unknown
            ))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::{BucketDescriptor, FieldIndex, ReindexActive};
    use std::collections::BTreeMap;

    fn bucket(fields: &[(&str, IndexType)], reindexing: &[(u64, &str)]) -> BucketDescriptor {
        let index: BTreeMap<String, FieldIndex> = fields
            .iter()
            .map(|(name, ty)| {
                (
                    name.to_string(),
                    FieldIndex {
                        ty: *ty,
                        unique: false,
                    },
                )
            })
            .collect();
        let mut reindex_active = ReindexActive::default();
        for (version, field) in reindexing {
            reindex_active.consolidate(*version, [field.to_string()]);
        }
        BucketDescriptor {
            name: "b".to_string(),
            index,
            pre: vec![],
            post: vec![],
            options: Default::default(),
            reindex_active,
            mtime: chrono::Utc::now(),
        }
    }

    fn case(desc: &BucketDescriptor, input: &str) -> String {
        let parsed = filter::parse(input).expect(input);
        match compile_filter(desc, &parsed) {
            Ok(compiled) => format!("{} {:?}", compiled.clause, compiled.args),
            Err(err) => format!("error[{}]: {}", err.code(), err),
        }
    }

    #[test]
    fn scalar_comparisons() {
        let desc = bucket(
            &[
                ("age", IndexType::Number),
                ("name", IndexType::String),
                ("ok", IndexType::Boolean),
            ],
            &[],
        );
        insta::assert_snapshot!(
            case(&desc, "(age>=18)"),
            @r#"(age >= $1 AND age IS NOT NULL) [Int(18)]"#);
        insta::assert_snapshot!(
            case(&desc, "(name=a)"),
            @r#"(name = $1 AND name IS NOT NULL) [Text("a")]"#);
        insta::assert_snapshot!(
            case(&desc, "(ok=true)"),
            @r#"(ok = $1 AND ok IS NOT NULL) [Bool(true)]"#);
        insta::assert_snapshot!(
            case(&desc, "(age<=64)"),
            @r#"(age <= $1 AND age IS NOT NULL) [Int(64)]"#);
        insta::assert_snapshot!(
            case(&desc, "(age=x)"),
            @r#"error[InvalidQuery]: invalid filter: cannot compare age with x (type number)"#);
    }

    #[test]
    fn composites_thread_dense_placeholders() {
        let desc = bucket(
            &[("age", IndexType::Number), ("name", IndexType::String)],
            &[],
        );
        insta::assert_snapshot!(
            case(&desc, "(&(age>=18)(age<=64)(name=a*))"),
            @r#"((age >= $1 AND age IS NOT NULL) AND (age <= $2 AND age IS NOT NULL) AND (name LIKE $3 AND name IS NOT NULL)) [Int(18), Int(64), Text("a%")]"#);
        insta::assert_snapshot!(
            case(&desc, "(|(age=1)(age=2))"),
            @r#"((age = $1 AND age IS NOT NULL) OR (age = $2 AND age IS NOT NULL)) [Int(1), Int(2)]"#);
        insta::assert_snapshot!(
            case(&desc, "(!(name=a))"),
            @r#"NOT ((name = $1 AND name IS NOT NULL)) [Text("a")]"#);
    }

    #[test]
    fn unindexed_leaves_are_rejected_or_dropped() {
        let desc = bucket(&[("age", IndexType::Number)], &[]);
        // Sole predicate on an unindexed field.
        insta::assert_snapshot!(
            case(&desc, "(name=a)"),
            @"error[NotIndexed]: filter requires an index on (name=a)");
        // Presence on an unindexed field.
        insta::assert_snapshot!(
            case(&desc, "(name=*)"),
            @"error[NotIndexed]: filter requires an index on (name=*)");
        // A conjunction survives as long as one arm is indexed.
        insta::assert_snapshot!(
            case(&desc, "(&(age>=18)(name=a))"),
            @"((age >= $1 AND age IS NOT NULL)) [Int(18)]");
        // A disjunction does not.
        insta::assert_snapshot!(
            case(&desc, "(|(age>=18)(name=a))"),
            @"error[NotIndexed]: filter requires an index on (|(age>=18)(name=a))");
        // Negation of an unanswerable arm is unanswerable.
        insta::assert_snapshot!(
            case(&desc, "(!(name=a))"),
            @"error[NotIndexed]: filter requires an index on (!(name=a))");
    }

    #[test]
    fn reindexing_fields_are_unusable() {
        let desc = bucket(
            &[("age", IndexType::Number), ("name", IndexType::String)],
            &[(2, "name")],
        );
        insta::assert_snapshot!(
            case(&desc, "(name=a)"),
            @"error[NotIndexed]: filter requires an index on (name=a)");
        // Still answerable through the other field.
        insta::assert_snapshot!(
            case(&desc, "(&(age>=1)(name=a))"),
            @"((age >= $1 AND age IS NOT NULL)) [Int(1)]");
    }

    #[test]
    fn internal_fields_are_queryable() {
        let desc = bucket(&[], &[]);
        insta::assert_snapshot!(
            case(&desc, "(_key=p1)"),
            @r#"(_key = $1 AND _key IS NOT NULL) [Text("p1")]"#);
        insta::assert_snapshot!(
            case(&desc, "(_mtime>=1700000000000)"),
            @"(_mtime >= $1 AND _mtime IS NOT NULL) [Int(1700000000000)]");
        // _rver is not part of the queryable internal set.
        insta::assert_snapshot!(
            case(&desc, "(_rver=1)"),
            @"error[NotIndexed]: filter requires an index on (_rver=1)");
    }

    #[test]
    fn array_containment_and_ranges() {
        let desc = bucket(
            &[
                ("tags", IndexType::StringArray),
                ("ports", IndexType::NumberArray),
            ],
            &[],
        );
        insta::assert_snapshot!(
            case(&desc, "(tags=blue)"),
            @r#"(tags @> ARRAY[$1]::text[]) [Text("blue")]"#);
        insta::assert_snapshot!(
            case(&desc, "(ports>=1024)"),
            @"($1 >= ANY(ports)) [Int(1024)]");
        // Substring over an array has no index-backed meaning.
        insta::assert_snapshot!(
            case(&desc, "(tags=bl*)"),
            @"error[NotIndexed]: filter requires an index on (tags=bl*)");
    }

    #[test]
    fn ip_and_subnet_canonicalize() {
        let desc = bucket(
            &[("addr", IndexType::Ip), ("net", IndexType::Subnet)],
            &[],
        );
        insta::assert_snapshot!(
            case(&desc, "(addr<=10.0.0.255)"),
            @r#"(addr <= $1::inet AND addr IS NOT NULL) [Text("10.0.0.255")]"#);
        insta::assert_snapshot!(
            case(&desc, "(addr=2001:0db8:0000:0000:0000:0000:0000:0001)"),
            @r#"(addr = $1::inet AND addr IS NOT NULL) [Text("2001:db8::1")]"#);
        insta::assert_snapshot!(
            case(&desc, "(net=192.168.0.0/16)"),
            @r#"(net = $1::cidr AND net IS NOT NULL) [Text("192.168.0.0/16")]"#);
        insta::assert_snapshot!(
            case(&desc, "(addr=not-an-ip)"),
            @"error[InvalidQuery]: invalid filter: cannot compare addr with not-an-ip (type ip)");
    }

    #[test]
    fn substring_patterns() {
        let desc = bucket(&[("name", IndexType::String)], &[]);
        insta::assert_snapshot!(
            case(&desc, "(name=pre*post)"),
            @r#"(name LIKE $1 AND name IS NOT NULL) [Text("pre%post")]"#);
        // Empty initial, one any, no final compiles to %x%.
        insta::assert_snapshot!(
            case(&desc, "(name=*x*)"),
            @r#"(name LIKE $1 AND name IS NOT NULL) [Text("%x%")]"#);
        // Adjacent wildcards collapse; no %% appears.
        insta::assert_snapshot!(
            case(&desc, "(name=a**b)"),
            @r#"(name LIKE $1 AND name IS NOT NULL) [Text("a%b")]"#);
    }

    #[test]
    fn extensible_rules() {
        let desc = bucket(&[("name", IndexType::String)], &[]);
        insta::assert_snapshot!(
            case(&desc, "(name:caseIgnoreMatch:=Foo)"),
            @r#"(LOWER(name) = $1 AND name IS NOT NULL) [Text("foo")]"#);
        insta::assert_snapshot!(
            case(&desc, "(name:caseIgnoreSubstringsMatch:=Foo*Bar)"),
            @r#"(name ILIKE $1 AND name IS NOT NULL) [Text("foo%bar")]"#);
        insta::assert_snapshot!(
            case(&desc, "(name:soundexMatch:=Foo)"),
            @"error[NotIndexed]: filter requires an index on name (unknown matching rule soundexMatch)");
    }
}
