//! Evaluation of WHERE trees against flat documents.

use super::Document;
use crate::core::TAG_SEPARATOR;
use crate::error::{GilesError, Result};
use crate::querylang::WhereNode;
use regex::Regex;

/// A WHERE tree with its regular expressions compiled.
#[derive(Debug)]
pub enum Matcher {
    Eq(String, String),
    Neq(String, String),
    Like(String, Regex),
    Has(String),
    In(String, Vec<String>),
    And(Box<Matcher>, Box<Matcher>),
    Or(Box<Matcher>, Box<Matcher>),
    Not(Box<Matcher>),
    All,
}

impl Matcher {
    pub fn compile(node: Option<&WhereNode>) -> Result<Self> {
        match node {
            Some(node) => Self::compile_node(node),
            None => Ok(Matcher::All),
        }
    }

    fn compile_node(node: &WhereNode) -> Result<Self> {
        Ok(match node {
            WhereNode::Eq { tag, value } => Matcher::Eq(tag.clone(), value.clone()),
            WhereNode::Neq { tag, value } => Matcher::Neq(tag.clone(), value.clone()),
            WhereNode::Like { tag, pattern } => {
                let regex = Regex::new(pattern)
                    .map_err(|e| GilesError::Resolve(format!("bad pattern for {}: {}", tag, e)))?;
                Matcher::Like(tag.clone(), regex)
            }
            WhereNode::Has(tag) => Matcher::Has(tag.clone()),
            WhereNode::In { tag, values } => Matcher::In(tag.clone(), values.clone()),
            WhereNode::And(l, r) => {
                Matcher::And(Box::new(Self::compile_node(l)?), Box::new(Self::compile_node(r)?))
            }
            WhereNode::Or(l, r) => {
                Matcher::Or(Box::new(Self::compile_node(l)?), Box::new(Self::compile_node(r)?))
            }
            WhereNode::Not(inner) => Matcher::Not(Box::new(Self::compile_node(inner)?)),
        })
    }

    /// A stream without a tag is "not equal" to any value for it.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Matcher::Eq(tag, value) => doc.get(tag) == Some(value),
            Matcher::Neq(tag, value) => doc.get(tag) != Some(value),
            Matcher::Like(tag, regex) => doc.get(tag).map_or(false, |v| regex.is_match(v)),
            Matcher::Has(tag) => has_tag(doc, tag),
            Matcher::In(tag, values) => doc.get(tag).map_or(false, |v| values.contains(v)),
            Matcher::And(l, r) => l.matches(doc) && r.matches(doc),
            Matcher::Or(l, r) => l.matches(doc) || r.matches(doc),
            Matcher::Not(inner) => !inner.matches(doc),
            Matcher::All => true,
        }
    }
}

// `has Metadata|Location` also matches documents that only carry nested keys below it.
fn has_tag(doc: &Document, tag: &str) -> bool {
    if doc.contains_key(tag) {
        return true;
    }
    let prefix = format!("{}{}", tag, TAG_SEPARATOR);
    doc.range(prefix.clone()..).next().map_or(false, |(k, _)| k.starts_with(&prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::querylang::parse_query;

    fn doc(pairs: &[(&str, &str)]) -> Document {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn matcher(where_clause: &str) -> Matcher {
        let q = parse_query(&format!("select * where {}", where_clause)).unwrap();
        Matcher::compile(q.where_clause.as_ref()).unwrap()
    }

    #[test]
    fn test_leaf_predicates() {
        let d = doc(&[("uuid", "u1"), ("Metadata|Room", "410"), ("Metadata|Location|Building", "Soda")]);
        assert!(matcher(r#"Metadata/Room = "410""#).matches(&d));
        assert!(matcher(r#"Metadata/Room != "411""#).matches(&d));
        assert!(matcher(r#"Metadata/Floor != "4""#).matches(&d));
        assert!(matcher(r#"Metadata/Location/Building like "^So""#).matches(&d));
        assert!(matcher("has Metadata/Location").matches(&d));
        assert!(!matcher("has Metadata/Loc").matches(&d));
        assert!(matcher(r#"["409", "410"] in Metadata/Room"#).matches(&d));
        assert!(!matcher(r#""409" in Metadata/Room"#).matches(&d));
    }

    #[test]
    fn test_boolean_combinations() {
        let d = doc(&[("uuid", "u1"), ("Metadata|Room", "410")]);
        assert!(matcher("has Metadata/Room and not has Metadata/Floor").matches(&d));
        assert!(matcher("has Metadata/Floor or has Metadata/Room").matches(&d));
        assert!(!matcher("not (has Metadata/Floor or has Metadata/Room)").matches(&d));
        assert!(Matcher::compile(None).unwrap().matches(&d));
    }
}
