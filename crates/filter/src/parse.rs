use crate::Filter;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected end of filter")]
    UnexpectedEnd,
    #[error("expected {expected:?} at offset {offset}")]
    Expected { expected: char, offset: usize },
    #[error("empty attribute name at offset {offset}")]
    EmptyAttribute { offset: usize },
    #[error("empty matching rule at offset {offset}")]
    EmptyRule { offset: usize },
    #[error("approx filters are not supported")]
    ApproxUnsupported,
    #[error("composite filter has no children at offset {offset}")]
    EmptyComposite { offset: usize },
    #[error("invalid escape sequence at offset {offset}")]
    InvalidEscape { offset: usize },
    #[error("trailing input after filter at offset {offset}")]
    TrailingInput { offset: usize },
}

pub type Result<Ok> = std::result::Result<Ok, ParseError>;

/// Parse an LDAP filter string into its AST.
pub fn parse(input: &str) -> Result<Filter> {
    let mut parser = Parser {
        input: input.as_bytes(),
        pos: 0,
    };
    let filter = parser.filter()?;
    if parser.pos != parser.input.len() {
        return Err(ParseError::TrailingInput { offset: parser.pos });
    }
    Ok(filter)
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, expected: u8) -> Result<()> {
        match self.peek() {
            Some(c) if c == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(_) => Err(ParseError::Expected {
                expected: expected as char,
                offset: self.pos,
            }),
            None => Err(ParseError::UnexpectedEnd),
        }
    }

    fn filter(&mut self) -> Result<Filter> {
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.filter_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.filter_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter()?))
            }
            Some(_) => self.item()?,
            None => return Err(ParseError::UnexpectedEnd),
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn filter_list(&mut self) -> Result<Vec<Filter>> {
        let mut children = Vec::new();
        while self.peek() == Some(b'(') {
            children.push(self.filter()?);
        }
        if children.is_empty() {
            return Err(ParseError::EmptyComposite { offset: self.pos });
        }
        Ok(children)
    }

    fn item(&mut self) -> Result<Filter> {
        let attr = self.attribute()?;
        match self.peek() {
            Some(b'=') => {
                self.pos += 1;
                self.value_item(attr)
            }
            Some(b'>') => {
                self.pos += 1;
                self.expect(b'=')?;
                let (value, _) = self.value()?;
                Ok(Filter::GreaterOrEqual { attr, value })
            }
            Some(b'<') => {
                self.pos += 1;
                self.expect(b'=')?;
                let (value, _) = self.value()?;
                Ok(Filter::LessOrEqual { attr, value })
            }
            Some(b'~') => {
                self.pos += 1;
                self.expect(b'=')?;
                Err(ParseError::ApproxUnsupported)
            }
            Some(b':') => {
                self.pos += 1;
                let rule = self.rule()?;
                self.expect(b':')?;
                self.expect(b'=')?;
                let (value, _) = self.value()?;
                Ok(Filter::Extensible { attr, rule, value })
            }
            Some(_) => Err(ParseError::Expected {
                expected: '=',
                offset: self.pos,
            }),
            None => Err(ParseError::UnexpectedEnd),
        }
    }

    // An equality-shaped item: plain equality, presence, or substrings,
    // depending on where unescaped '*' characters appear in the value.
    fn value_item(&mut self, attr: String) -> Result<Filter> {
        let (value, mut segments) = self.value()?;
        if segments.len() == 1 {
            return Ok(Filter::Equality { attr, value });
        }
        if segments.len() == 2 && segments[0].is_empty() && segments[1].is_empty() {
            return Ok(Filter::Present { attr });
        }

        let last = match segments.pop() {
            Some(s) if s.is_empty() => None,
            Some(s) => Some(s),
            None => None,
        };
        let mut segments = segments.into_iter();
        let initial = match segments.next() {
            Some(s) if s.is_empty() => None,
            Some(s) => Some(s),
            None => None,
        };
        // Empty interior components collapse: 'a**b' means 'a*b'.
        let any: Vec<String> = segments.filter(|s| !s.is_empty()).collect();
        Ok(Filter::Substring {
            attr,
            initial,
            any,
            last,
        })
    }

    fn attribute(&mut self) -> Result<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, b'=' | b'<' | b'>' | b'~' | b':' | b'(' | b')') {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(ParseError::EmptyAttribute { offset: start });
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
    }

    fn rule(&mut self) -> Result<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, b':' | b'=' | b'(' | b')') {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(ParseError::EmptyRule { offset: start });
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
    }

    // Decode an assertion value up to the closing ')'. Returns the decoded
    // value and its segments as split on unescaped '*' characters; a value
    // without wildcards yields a single segment equal to the value.
    fn value(&mut self) -> Result<(String, Vec<String>)> {
        let mut segments = vec![Vec::<u8>::new()];
        loop {
            match self.peek() {
                None => return Err(ParseError::UnexpectedEnd),
                Some(b')') => break,
                Some(b'*') => {
                    self.pos += 1;
                    segments.push(Vec::new());
                }
                Some(b'\\') => {
                    self.pos += 1;
                    let hex = self
                        .input
                        .get(self.pos..self.pos + 2)
                        .ok_or(ParseError::UnexpectedEnd)?;
                    match u8::from_str_radix(std::str::from_utf8(hex).unwrap_or(""), 16) {
                        Ok(byte) => {
                            segments.last_mut().unwrap().push(byte);
                            self.pos += 2;
                        }
                        // A non-hex escape is the escaped character itself.
                        Err(_) => {
                            let c = self.peek().ok_or(ParseError::UnexpectedEnd)?;
                            if matches!(c, b'(' | b')' | b'*' | b'\\') {
                                segments.last_mut().unwrap().push(c);
                                self.pos += 1;
                            } else {
                                return Err(ParseError::InvalidEscape { offset: self.pos - 1 });
                            }
                        }
                    }
                }
                Some(c) => {
                    segments.last_mut().unwrap().push(c);
                    self.pos += 1;
                }
            }
        }
        let segments: Vec<String> = segments
            .into_iter()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .collect();
        let value = segments.join("*");
        Ok((value, segments))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // Parse and re-render, or the error text.
    fn case(input: &str) -> String {
        match parse(input) {
            Ok(filter) => filter.to_string(),
            Err(err) => format!("error: {}", err),
        }
    }

    #[test]
    fn simple_items() {
        insta::assert_snapshot!(case("(cn=foo)"), @"(cn=foo)");
        insta::assert_snapshot!(case("(age>=18)"), @"(age>=18)");
        insta::assert_snapshot!(case("(age<=64)"), @"(age<=64)");
        insta::assert_snapshot!(case("(cn=*)"), @"(cn=*)");
    }

    #[test]
    fn composites() {
        insta::assert_snapshot!(case("(&(a=1)(b=2))"), @"(&(a=1)(b=2))");
        insta::assert_snapshot!(case("(|(a=1)(b=2)(c=3))"), @"(|(a=1)(b=2)(c=3))");
        insta::assert_snapshot!(case("(!(a=1))"), @"(!(a=1))");
        insta::assert_snapshot!(
            case("(&(|(a=1)(b=2))(!(c=3)))"),
            @"(&(|(a=1)(b=2))(!(c=3)))");
    }

    #[test]
    fn substrings() {
        let parsed = parse("(cn=pre*mid*post)").unwrap();
        insta::assert_snapshot!(parsed, @"(cn=pre*mid*post)");
        match parsed {
            Filter::Substring {
                initial, any, last, ..
            } => {
                assert_eq!(initial.as_deref(), Some("pre"));
                assert_eq!(any, vec!["mid".to_string()]);
                assert_eq!(last.as_deref(), Some("post"));
            }
            other => panic!("expected substring, got {:?}", other),
        }

        // Leading wildcard: no initial. Trailing wildcard: no final.
        match parse("(cn=*x*)").unwrap() {
            Filter::Substring {
                initial, any, last, ..
            } => {
                assert_eq!(initial, None);
                assert_eq!(any, vec!["x".to_string()]);
                assert_eq!(last, None);
            }
            other => panic!("expected substring, got {:?}", other),
        }

        // Adjacent wildcards collapse.
        match parse("(cn=a**b)").unwrap() {
            Filter::Substring {
                initial, any, last, ..
            } => {
                assert_eq!(initial.as_deref(), Some("a"));
                assert!(any.is_empty());
                assert_eq!(last.as_deref(), Some("b"));
            }
            other => panic!("expected substring, got {:?}", other),
        }
    }

    #[test]
    fn extensible() {
        let parsed = parse("(cn:caseIgnoreMatch:=Foo)").unwrap();
        insta::assert_snapshot!(parsed, @"(cn:caseIgnoreMatch:=Foo)");
        match parsed {
            Filter::Extensible { rule, value, .. } => {
                assert_eq!(rule, "caseIgnoreMatch");
                assert_eq!(value, "Foo");
            }
            other => panic!("expected extensible, got {:?}", other),
        }
    }

    #[test]
    fn escapes() {
        // Hex escapes decode; the escaped star is not a wildcard.
        match parse(r"(cn=a\2ab)").unwrap() {
            Filter::Equality { value, .. } => assert_eq!(value, "a*b"),
            other => panic!("expected equality, got {:?}", other),
        }
        match parse(r"(cn=a\28b\29)").unwrap() {
            Filter::Equality { value, .. } => assert_eq!(value, "a(b)"),
            other => panic!("expected equality, got {:?}", other),
        }
        // Rendering escapes special characters back out.
        insta::assert_snapshot!(case(r"(cn=a\2ab)"), @r"(cn=a\2ab)");
    }

    #[test]
    fn rejections() {
        insta::assert_snapshot!(case("(cn~=foo)"), @"error: approx filters are not supported");
        insta::assert_snapshot!(case("(cn=foo"), @"error: unexpected end of filter");
        insta::assert_snapshot!(case("cn=foo"), @"error: expected '(' at offset 0");
        insta::assert_snapshot!(case("(cn=foo)x"), @"error: trailing input after filter at offset 8");
        insta::assert_snapshot!(case("(&)"), @"error: composite filter has no children at offset 2");
        insta::assert_snapshot!(case("(=foo)"), @"error: empty attribute name at offset 1");
        insta::assert_snapshot!(case("(a:=b)"), @"error: empty matching rule at offset 3");
    }

    #[test]
    fn present_requires_bare_star() {
        // '*' alone is presence; '**' is a degenerate substring matching
        // anything, not presence.
        assert!(matches!(parse("(a=*)").unwrap(), Filter::Present { .. }));
        assert!(matches!(
            parse("(a=**)").unwrap(),
            Filter::Substring { .. }
        ));
    }
}
