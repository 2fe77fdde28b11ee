//! Recursive-descent parser producing [`ParsedQuery`] plans.

use super::ast::{DataQuery, DataRange, ParsedQuery, QueryKind, TimeValue, WhereNode, ALL_TAGS};
use super::lexer::{tokenize, Token, TokenKind};
use super::time::{duration_unit, now_nanos, parse_calendar};
use crate::core::{canonical_tag, guess_to_nanoseconds, to_nanoseconds, UnitOfTime};
use crate::error::{GilesError, Result};
use regex::Regex;

const RESERVED: [&str; 17] = [
    "select", "distinct", "delete", "set", "apply", "where", "and", "or", "not", "has", "like",
    "in", "before", "after", "limit", "streamlimit", "as",
];

/// Outcome of a parse, with whether the query read the clock.
pub(crate) struct Parsed {
    pub query: ParsedQuery,
    pub uses_now: bool,
}

/// Parses one query string.
pub fn parse_query(input: &str) -> Result<ParsedQuery> {
    parse(input).map(|parsed| parsed.query)
}

pub(crate) fn parse(input: &str) -> Result<Parsed> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { input, tokens, cursor: 0, uses_now: false };
    let query = parser.query()?;
    Ok(Parsed { query, uses_now: parser.uses_now })
}

enum TimeBase {
    Raw(u64),
    Absolute(u64),
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    cursor: usize,
    uses_now: bool,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token {
        // tokenize always ends with Eof, and the cursor never moves past it
        &self.tokens[self.cursor.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if tok.kind != TokenKind::Eof {
            self.cursor += 1;
        }
        tok
    }

    fn error(&self, tok: &Token, message: &str) -> GilesError {
        GilesError::parse(tok.pos, tok.describe(), message)
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        self.peek().is_keyword(keyword)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.at_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(self.peek(), &format!("expected '{}'", keyword)))
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.peek().kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<()> {
        if self.eat(&kind) {
            Ok(())
        } else {
            Err(self.error(self.peek(), &format!("expected {}", what)))
        }
    }

    fn expect_number(&mut self) -> Result<u64> {
        let tok = self.advance();
        match tok.kind {
            TokenKind::Number(n) => Ok(n),
            _ => Err(self.error(&tok, "expected a number")),
        }
    }

    fn query(&mut self) -> Result<ParsedQuery> {
        let tok = self.peek().clone();
        let mut query = if self.eat_keyword("select") {
            self.select()?
        } else if self.eat_keyword("delete") {
            self.delete()?
        } else if self.eat_keyword("set") {
            self.set()?
        } else if self.eat_keyword("apply") {
            self.apply()?
        } else {
            return Err(self.error(&tok, "expected select, delete, set or apply"));
        };

        self.eat(&TokenKind::Semicolon);
        let trailing = self.peek().clone();
        if trailing.kind != TokenKind::Eof {
            return Err(self.error(&trailing, "unexpected input after query"));
        }

        query.querystring = query.canonical();
        Ok(query)
    }

    fn select(&mut self) -> Result<ParsedQuery> {
        if self.eat_keyword("distinct") {
            let mut query = ParsedQuery::new(QueryKind::Select);
            query.distinct = true;
            query.tags = vec![self.tag()?];
            query.where_clause = self.optional_where()?;
            return Ok(query);
        }
        if self.eat_keyword("data") {
            let mut query = ParsedQuery::new(QueryKind::Data);
            query.data = Some(self.data_clause()?);
            query.where_clause = Some(self.required_where()?);
            return Ok(query);
        }
        let mut query = ParsedQuery::new(QueryKind::Select);
        query.tags = self.tag_list()?;
        query.where_clause = self.optional_where()?;
        Ok(query)
    }

    fn delete(&mut self) -> Result<ParsedQuery> {
        let mut query = ParsedQuery::new(QueryKind::Delete);
        if self.eat_keyword("data") {
            query.data = Some(self.data_clause()?);
        } else if !self.at_keyword("where") {
            query.tags = self.tag_list()?;
        }
        query.where_clause = Some(self.required_where()?);
        Ok(query)
    }

    fn set(&mut self) -> Result<ParsedQuery> {
        let mut query = ParsedQuery::new(QueryKind::Set);
        loop {
            let tag = self.tag()?;
            self.expect(TokenKind::Eq, "'='")?;
            let value = self.value()?;
            query.set.push((tag, value));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        query.where_clause = Some(self.required_where()?);
        Ok(query)
    }

    fn apply(&mut self) -> Result<ParsedQuery> {
        let first = self.peek().clone();
        let mut end = None;
        while !matches!(self.peek().kind, TokenKind::Eof | TokenKind::Semicolon) && !self.at_keyword("where") {
            end = Some(self.advance().end);
        }
        let end = end.ok_or_else(|| self.error(&first, "expected an expression to apply"))?;

        let mut query = ParsedQuery::new(QueryKind::Apply);
        query.apply = Some(self.input[first.pos..end].trim().to_string());
        query.where_clause = self.optional_where()?;
        Ok(query)
    }

    fn optional_where(&mut self) -> Result<Option<WhereNode>> {
        if self.eat_keyword("where") {
            Ok(Some(self.predicate()?))
        } else {
            Ok(None)
        }
    }

    fn required_where(&mut self) -> Result<WhereNode> {
        self.expect_keyword("where")?;
        self.predicate()
    }

    fn tag(&mut self) -> Result<String> {
        let tok = self.advance();
        match &tok.kind {
            TokenKind::Word(w) if !RESERVED.iter().any(|r| w.eq_ignore_ascii_case(r)) => {
                Ok(canonical_tag(w))
            }
            _ => Err(self.error(&tok, "expected a tag name")),
        }
    }

    fn tag_list(&mut self) -> Result<Vec<String>> {
        if self.eat(&TokenKind::Star) {
            return Ok(vec![ALL_TAGS.to_string()]);
        }
        let mut tags = vec![self.tag()?];
        while self.eat(&TokenKind::Comma) {
            tags.push(self.tag()?);
        }
        Ok(tags)
    }

    fn value(&mut self) -> Result<String> {
        let tok = self.advance();
        match tok.kind {
            TokenKind::Str(s) => Ok(s),
            TokenKind::Number(n) => Ok(n.to_string()),
            _ => Err(self.error(&tok, "expected a quoted value")),
        }
    }

    fn predicate(&mut self) -> Result<WhereNode> {
        let mut left = self.conjunction()?;
        while self.eat_keyword("or") {
            let right = self.conjunction()?;
            left = WhereNode::or(left, right);
        }
        Ok(left)
    }

    fn conjunction(&mut self) -> Result<WhereNode> {
        let mut left = self.negation()?;
        while self.eat_keyword("and") {
            let right = self.negation()?;
            left = WhereNode::and(left, right);
        }
        Ok(left)
    }

    fn negation(&mut self) -> Result<WhereNode> {
        if self.eat_keyword("not") {
            return Ok(WhereNode::negate(self.negation()?));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<WhereNode> {
        let tok = self.peek().clone();
        match &tok.kind {
            TokenKind::LParen => {
                self.advance();
                let inner = self.predicate()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::Word(_) if tok.is_keyword("has") => {
                self.advance();
                Ok(WhereNode::Has(self.tag()?))
            }
            TokenKind::Str(value) => {
                self.advance();
                let value = value.clone();
                self.expect_keyword("in")?;
                Ok(WhereNode::In { tag: self.tag()?, values: vec![value] })
            }
            TokenKind::LBracket => {
                self.advance();
                let mut values = vec![self.value()?];
                while self.eat(&TokenKind::Comma) {
                    values.push(self.value()?);
                }
                self.expect(TokenKind::RBracket, "']'")?;
                self.expect_keyword("in")?;
                Ok(WhereNode::In { tag: self.tag()?, values })
            }
            TokenKind::Word(_) => {
                let tag = self.tag()?;
                if self.eat(&TokenKind::Eq) {
                    Ok(WhereNode::Eq { tag, value: self.value()? })
                } else if self.eat(&TokenKind::Neq) {
                    Ok(WhereNode::Neq { tag, value: self.value()? })
                } else if self.eat_keyword("like") {
                    let pattern_tok = self.peek().clone();
                    let pattern = self.value()?;
                    Regex::new(&pattern).map_err(|e| {
                        GilesError::parse(pattern_tok.pos, pattern_tok.describe(), format!("invalid regex: {}", e))
                    })?;
                    Ok(WhereNode::Like { tag, pattern })
                } else {
                    Err(self.error(self.peek(), "expected '=', '!=' or 'like'"))
                }
            }
            _ => Err(self.error(&tok, "expected a predicate")),
        }
    }

    fn data_clause(&mut self) -> Result<DataQuery> {
        let range = if self.eat_keyword("in") {
            let parenthesized = self.eat(&TokenKind::LParen);
            let start = self.time()?;
            self.expect(TokenKind::Comma, "','")?;
            let end = self.time()?;
            if parenthesized {
                self.expect(TokenKind::RParen, "')'")?;
            }
            DataRange::Range { start, end }
        } else if self.eat_keyword("before") {
            DataRange::Before(self.time()?)
        } else if self.eat_keyword("after") {
            DataRange::After(self.time()?)
        } else {
            return Err(self.error(self.peek(), "expected in, before or after"));
        };

        let mut data = DataQuery::new(range);
        let (mut seen_limit, mut seen_stream_limit, mut seen_unit) = (false, false, false);
        loop {
            let tok = self.peek().clone();
            if tok.is_keyword("limit") {
                if seen_limit {
                    return Err(self.error(&tok, "duplicate limit"));
                }
                self.advance();
                data.limit = Some(self.expect_number()?);
                seen_limit = true;
            } else if tok.is_keyword("streamlimit") {
                if seen_stream_limit {
                    return Err(self.error(&tok, "duplicate streamlimit"));
                }
                self.advance();
                data.stream_limit = Some(self.expect_number()?);
                seen_stream_limit = true;
            } else if tok.is_keyword("as") {
                if seen_unit {
                    return Err(self.error(&tok, "duplicate unit"));
                }
                self.advance();
                let unit_tok = self.advance();
                data.timeconv = match &unit_tok.kind {
                    TokenKind::Word(w) => w.parse::<UnitOfTime>().map_err(|e| self.error(&unit_tok, &e))?,
                    _ => return Err(self.error(&unit_tok, "expected a unit of time")),
                };
                seen_unit = true;
            } else {
                break;
            }
        }
        Ok(data)
    }

    fn time_unit_follows(&self) -> Option<UnitOfTime> {
        match &self.peek().kind {
            TokenKind::Word(w) => w.parse::<UnitOfTime>().ok(),
            _ => None,
        }
    }

    fn time(&mut self) -> Result<TimeValue> {
        let tok = self.advance();
        let base = match &tok.kind {
            TokenKind::Number(n) => match self.time_unit_follows() {
                Some(unit) => {
                    self.advance();
                    let ns = to_nanoseconds(*n, unit)
                        .ok_or_else(|| self.error(&tok, "timestamp out of range"))?;
                    TimeBase::Absolute(ns)
                }
                None => TimeBase::Raw(*n),
            },
            TokenKind::Str(text) => TimeBase::Absolute(
                parse_calendar(text).ok_or_else(|| self.error(&tok, "unrecognised date format"))?,
            ),
            TokenKind::Word(_) if tok.is_keyword("now") => {
                self.uses_now = true;
                TimeBase::Absolute(now_nanos())
            }
            _ => return Err(self.error(&tok, "expected a time")),
        };

        let mut offset: i128 = 0;
        let mut has_offset = false;
        loop {
            let sign: i128 = match self.peek().kind {
                TokenKind::Plus => 1,
                TokenKind::Minus => -1,
                _ => break,
            };
            self.advance();
            let amount = self.expect_number()?;
            let unit_tok = self.advance();
            let unit = match &unit_tok.kind {
                TokenKind::Word(w) => duration_unit(w),
                _ => None,
            }
            .ok_or_else(|| self.error(&unit_tok, "expected a duration unit"))?;
            offset += sign * i128::from(amount) * i128::from(unit);
            has_offset = true;
        }

        if !has_offset {
            return Ok(match base {
                TimeBase::Raw(n) => TimeValue::Raw(n),
                TimeBase::Absolute(ns) => TimeValue::Absolute(ns),
            });
        }

        let base_ns = match base {
            TimeBase::Raw(n) => guess_to_nanoseconds(n),
            TimeBase::Absolute(ns) => ns,
        };
        u64::try_from(i128::from(base_ns) + offset)
            .map(TimeValue::Absolute)
            .map_err(|_| self.error(&tok, "time offset out of range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distinct_with_conjunction() {
        let q = parse_query(
            r#"select distinct Metadata/Room where has Metadata/Room and Properties/UnitofMeasure = "Watt";"#,
        )
        .unwrap();
        assert_eq!(q.kind, QueryKind::Select);
        assert!(q.distinct);
        assert_eq!(q.tags, vec!["Metadata|Room"]);
        assert_eq!(
            q.where_clause,
            Some(WhereNode::and(
                WhereNode::Has("Metadata|Room".into()),
                WhereNode::Eq { tag: "Properties|UnitofMeasure".into(), value: "Watt".into() },
            ))
        );
    }

    #[test]
    fn test_precedence() {
        let q = parse_query("select * where has a or has b and not has c").unwrap();
        assert_eq!(
            q.where_clause,
            Some(WhereNode::or(
                WhereNode::Has("a".into()),
                WhereNode::and(WhereNode::Has("b".into()), WhereNode::negate(WhereNode::Has("c".into()))),
            ))
        );
    }

    #[test]
    fn test_data_clause_modifiers_any_order() {
        let q = parse_query(r#"select data before 1351043670 s as us streamlimit 2 limit 5 where uuid = "x""#)
            .unwrap();
        let data = q.data.unwrap();
        assert_eq!(data.range, DataRange::Before(TimeValue::Absolute(1_351_043_670_000_000_000)));
        assert_eq!(data.limit, Some(5));
        assert_eq!(data.stream_limit, Some(2));
        assert_eq!(data.timeconv, UnitOfTime::Microseconds);
    }

    #[test]
    fn test_raw_and_relative_times() {
        let q = parse_query(r#"select data in 1000, 2000 + 1 s where has x"#).unwrap();
        match q.data.unwrap().range {
            DataRange::Range { start, end } => {
                assert_eq!(start, TimeValue::Raw(1000));
                // 2000 is inferred as seconds before the offset applies.
                assert_eq!(end, TimeValue::Absolute(2001 * 1_000_000_000));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_now_is_flagged() {
        let parsed = parse(r#"select data after now - 5 min where has x"#).unwrap();
        assert!(parsed.uses_now);
        let parsed = parse(r#"select data after "2012-10-24" where has x"#).unwrap();
        assert!(!parsed.uses_now);
    }

    #[test]
    fn test_set_delete_apply() {
        let q = parse_query(r#"set Metadata/Room = "410", Metadata.Floor = "4" where uuid = "u""#).unwrap();
        assert_eq!(q.kind, QueryKind::Set);
        assert_eq!(q.set, vec![("Metadata|Room".into(), "410".into()), ("Metadata|Floor".into(), "4".into())]);

        let q = parse_query(r#"delete where has Metadata/Room"#).unwrap();
        assert_eq!(q.kind, QueryKind::Delete);
        assert!(q.tags.is_empty() && q.data.is_none());

        let q = parse_query(r#"delete data in (1, 2) where has x"#).unwrap();
        assert_eq!(q.kind, QueryKind::Delete);
        assert!(q.data.is_some());

        let q = parse_query(r#"apply window(mean, 5 min) where has x"#).unwrap();
        assert_eq!(q.apply.as_deref(), Some("window(mean, 5 min)"));
    }

    #[test]
    fn test_in_forms() {
        let q = parse_query(r#"select * where ["a", "b"] in Metadata/Room or "c" in Path"#).unwrap();
        assert_eq!(
            q.where_clause,
            Some(WhereNode::or(
                WhereNode::In { tag: "Metadata|Room".into(), values: vec!["a".into(), "b".into()] },
                WhereNode::In { tag: "Path".into(), values: vec!["c".into()] },
            ))
        );
    }

    #[test]
    fn test_errors() {
        let cases = [
            "",
            "select",
            "select * where",
            "select * where has",
            r#"select * where x like "[unclosed""#,
            "select data where has x",
            "select data in (1, 2) limit 1 limit 2 where has x",
            "select data in (1, 2) as weeks where has x",
            "delete Metadata/Room",
            r#"select * where a = "b" extra"#,
            "update x",
        ];
        for case in cases {
            assert!(
                matches!(parse_query(case), Err(GilesError::Parse { .. })),
                "expected parse error for {:?}",
                case
            );
        }
    }

    #[test]
    fn test_error_position() {
        match parse_query("select * wher has x") {
            Err(GilesError::Parse { position, token, .. }) => {
                assert_eq!(position, 9);
                assert_eq!(token, "wher");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_canonical_round_trip() {
        let inputs = [
            r#"select distinct Metadata/Room where has Metadata/Room and Properties/UnitofMeasure = "Watt";"#,
            r#"SELECT uuid, Path WHERE not (has a or Metadata/x != "y") and b like "^S.*""#,
            r#"select data in (1351043670000, 1351043680000) limit 100 as s where uuid = "d24325e6""#,
            r#"select data before "10/24/2012 01:00" + 2 h where has x or has y or has z"#,
            r#"delete Metadata/Room where has a and (has b and has c)"#,
            r#"set Metadata/Note = "say \"hi\"" where uuid = "u""#,
            r#"apply max where ["1", "2"] in Metadata/Floor"#,
        ];
        for input in inputs {
            let q = parse_query(input).unwrap();
            let again = parse_query(&q.querystring).unwrap();
            assert_eq!(q, again, "round trip of {:?} via {:?}", input, q.querystring);
        }
    }
}
