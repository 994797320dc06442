//! Query planning: a small boolean grammar over the text index, radius
//! queries over the spatial index, and their combination.
//!
//! Grammar: `AND`/`OR` keywords, parenthesized groups, double-quoted
//! phrases, bare tokens. `AND` binds tighter than `OR`, both left
//! associative; adjacent terms conjoin.

use crate::error::{JobdeckError, Result};
use crate::geocoder::Geocoder;
use crate::index::OfferIndex;
use crate::location::fix_location;
use crate::spatial::SpatialIndex;
use crate::types::DatedOffer;
use tantivy::query::{BooleanQuery, PhraseQuery, Query, TermQuery, TermSetQuery};
use tantivy::schema::IndexRecordOption;
use tantivy::Term;

const DEFAULT_RADIUS_M: f64 = 30_000.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextQuery {
    And(Box<TextQuery>, Box<TextQuery>),
    Or(Box<TextQuery>, Box<TextQuery>),
    Token(String),
    Phrase(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Word(String),
    Phrase(String),
}

fn lex(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '"' => {
                chars.next();
                let mut phrase = String::new();
                for c in chars.by_ref() {
                    if c == '"' {
                        break;
                    }
                    phrase.push(c);
                }
                tokens.push(Token::Phrase(phrase));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '(' | ')' | '"') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                match word.as_str() {
                    "AND" => tokens.push(Token::And),
                    "OR" => tokens.push(Token::Or),
                    _ => tokens.push(Token::Word(word)),
                }
            }
        }
    }
    tokens
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<TextQuery> {
        let mut node = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.parse_and()?;
            node = TextQuery::Or(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<TextQuery> {
        let mut node = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.next();
                    let rhs = self.parse_primary()?;
                    node = TextQuery::And(Box::new(node), Box::new(rhs));
                }
                // Adjacent terms conjoin.
                Some(Token::LParen) | Some(Token::Word(_)) | Some(Token::Phrase(_)) => {
                    let rhs = self.parse_primary()?;
                    node = TextQuery::And(Box::new(node), Box::new(rhs));
                }
                _ => break,
            }
        }
        Ok(node)
    }

    fn parse_primary(&mut self) -> Result<TextQuery> {
        match self.next() {
            Some(Token::LParen) => {
                let node = self.parse_or()?;
                if self.next() != Some(Token::RParen) {
                    return Err(JobdeckError::InvalidQuery("missing closing paren".into()));
                }
                Ok(node)
            }
            Some(Token::Word(w)) => Ok(TextQuery::Token(w)),
            Some(Token::Phrase(p)) => Ok(TextQuery::Phrase(p)),
            Some(token) => Err(JobdeckError::InvalidQuery(format!(
                "unexpected token: {:?}",
                token
            ))),
            None => Err(JobdeckError::InvalidQuery("empty query".into())),
        }
    }
}

pub fn parse_text_query(input: &str) -> Result<TextQuery> {
    let mut parser = Parser {
        tokens: lex(input),
        pos: 0,
    };
    let node = parser.parse_or()?;
    if parser.peek().is_some() {
        return Err(JobdeckError::InvalidQuery(format!(
            "trailing input after query: {:?}",
            parser.peek()
        )));
    }
    Ok(node)
}

/// Lower a leaf to a disjunction over the title and html fields, using the
/// index analyzer so query terms match indexed terms.
fn leaf_query(index: &OfferIndex, text: &str) -> Result<Box<dyn Query>> {
    let tokens = index.analyze(text);
    if tokens.is_empty() {
        return Err(JobdeckError::InvalidQuery(format!(
            "term {:?} has no searchable text",
            text
        )));
    }
    let fields = index.fields();
    let mut per_field: Vec<Box<dyn Query>> = Vec::new();
    for field in [fields.title, fields.html] {
        if tokens.len() == 1 {
            per_field.push(Box::new(TermQuery::new(
                Term::from_field_text(field, &tokens[0]),
                IndexRecordOption::WithFreqs,
            )));
        } else {
            let terms: Vec<Term> = tokens
                .iter()
                .map(|t| Term::from_field_text(field, t))
                .collect();
            per_field.push(Box::new(PhraseQuery::new(terms)));
        }
    }
    Ok(Box::new(BooleanQuery::union(per_field)))
}

fn lower(index: &OfferIndex, node: &TextQuery) -> Result<Box<dyn Query>> {
    match node {
        TextQuery::Token(t) | TextQuery::Phrase(t) => leaf_query(index, t),
        TextQuery::And(a, b) => Ok(Box::new(BooleanQuery::intersection(vec![
            lower(index, a)?,
            lower(index, b)?,
        ]))),
        TextQuery::Or(a, b) => Ok(Box::new(BooleanQuery::union(vec![
            lower(index, a)?,
            lower(index, b)?,
        ]))),
    }
}

/// Text search, optionally restricted to a set of document ids.
pub fn find_offers_from_text(
    index: &OfferIndex,
    query: &str,
    ids: &[String],
) -> Result<Vec<DatedOffer>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }
    let tree = parse_text_query(query)?;
    let mut q = lower(index, &tree)?;
    if !ids.is_empty() {
        let terms: Vec<Term> = ids
            .iter()
            .map(|id| Term::from_field_text(index.fields().id, id))
            .collect();
        q = Box::new(BooleanQuery::intersection(vec![
            q,
            Box::new(TermSetQuery::new(terms)),
        ]));
    }
    index.search_dated(q.as_ref())
}

fn parse_radius(part: Option<&str>) -> Result<f64> {
    match part {
        None => Ok(DEFAULT_RADIUS_M),
        Some(p) => p
            .trim()
            .parse()
            .map_err(|_| JobdeckError::InvalidQuery(format!("invalid radius: {}", p))),
    }
}

/// Resolve a location clause to spatial hits. Accepts nothing (all indexed
/// offers), `wgs84:lat,lon[,radius]`, or `place[,radius]` where the place
/// is geocoded from cache only.
pub fn find_offers_from_location(
    spatial: &SpatialIndex,
    geocoder: &Geocoder,
    location: &str,
) -> Result<Vec<DatedOffer>> {
    let location = location.trim();
    if location.is_empty() {
        return Ok(spatial.list_dated());
    }
    if let Some(rest) = location.strip_prefix("wgs84:") {
        let parts: Vec<&str> = rest.split(',').collect();
        if parts.len() != 2 && parts.len() != 3 {
            return Err(JobdeckError::InvalidQuery(
                "location must be like: wgs84:lat,lon[,radius]".into(),
            ));
        }
        let lat: f64 = parts[0]
            .trim()
            .parse()
            .map_err(|_| JobdeckError::InvalidQuery(format!("invalid latitude: {}", parts[0])))?;
        let lon: f64 = parts[1]
            .trim()
            .parse()
            .map_err(|_| JobdeckError::InvalidQuery(format!("invalid longitude: {}", parts[1])))?;
        let radius = parse_radius(parts.get(2).copied())?;
        return Ok(spatial.find_nearest(lat, lon, radius));
    }
    let parts: Vec<&str> = location.split(',').collect();
    if parts.len() > 2 {
        return Err(JobdeckError::InvalidQuery(
            "location must be like: place[,radius] or wgs84:lat,lon[,radius]".into(),
        ));
    }
    let radius = parse_radius(parts.get(1).copied())?;
    for candidate in fix_location(parts[0]) {
        let (resolved, _) = geocoder.get_cached_location(&candidate, "fr")?;
        if let Some(loc) = resolved {
            return Ok(spatial.find_nearest(loc.lat, loc.lon, radius));
        }
    }
    Err(JobdeckError::InvalidQuery(format!(
        "could not geocode {}",
        parts[0]
    )))
}

/// Combined query: the spatial filter runs first — it is cheap and shrinks
/// the id set the text query has to consider.
pub fn find_offers(
    index: &OfferIndex,
    spatial: &SpatialIndex,
    geocoder: &Geocoder,
    query: &str,
    location: &str,
) -> Result<Vec<DatedOffer>> {
    let query = query.trim();
    let location = location.trim();
    if location.is_empty() {
        return find_offers_from_text(index, query, &[]);
    }
    let located = find_offers_from_location(spatial, geocoder, location)?;
    if query.is_empty() {
        return Ok(located);
    }
    let ids: Vec<String> = located.into_iter().map(|o| o.id).collect();
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    find_offers_from_text(index, query, &ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(s: &str) -> Box<TextQuery> {
        Box::new(TextQuery::Token(s.to_string()))
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let parsed = parse_text_query("a OR b AND c").unwrap();
        assert_eq!(
            parsed,
            TextQuery::Or(
                token("a"),
                Box::new(TextQuery::And(token("b"), token("c")))
            )
        );
    }

    #[test]
    fn left_associative() {
        let parsed = parse_text_query("a OR b OR c").unwrap();
        assert_eq!(
            parsed,
            TextQuery::Or(
                Box::new(TextQuery::Or(token("a"), token("b"))),
                token("c")
            )
        );
    }

    #[test]
    fn adjacency_conjoins() {
        let parsed = parse_text_query("a b").unwrap();
        assert_eq!(parsed, TextQuery::And(token("a"), token("b")));
    }

    #[test]
    fn parens_override_precedence() {
        let parsed = parse_text_query("(a OR b) AND c").unwrap();
        assert_eq!(
            parsed,
            TextQuery::And(
                Box::new(TextQuery::Or(token("a"), token("b"))),
                token("c")
            )
        );
    }

    #[test]
    fn quoted_phrases() {
        let parsed = parse_text_query("\"chef de projet\" OR dev").unwrap();
        assert_eq!(
            parsed,
            TextQuery::Or(
                Box::new(TextQuery::Phrase("chef de projet".to_string())),
                token("dev")
            )
        );
    }

    #[test]
    fn malformed_queries() {
        assert!(parse_text_query("").is_err());
        assert!(parse_text_query("(a OR b").is_err());
        assert!(parse_text_query("a )").is_err());
        assert!(parse_text_query("AND a").is_err());
    }
}
