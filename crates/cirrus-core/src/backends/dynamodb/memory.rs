//! In-process DynamoDB stand-in.
//!
//! Tables are keyed by the `_pk`/`_sk` string attributes and kept in key
//! order. Key condition and filter expressions are parsed from the same
//! grammar the adapter emits. As in DynamoDB, `Limit` bounds the number of
//! items evaluated, not the number returned, so a filtered page can come back
//! short or empty with a `LastEvaluatedKey`.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::client::{
    AttributeValue, DeleteItemInput, DynamoApi, ExpressionAttributes, GetItemInput, Item, Page,
    PutItemInput, QueryInput, ScanInput, document_from_item,
};
use crate::error::{Error, Result};
use crate::predicate::Predicate;
use crate::types::{ATTRIB_PK, ATTRIB_SK};

type Table = BTreeMap<(String, String), Item>;

/// Tables are created implicitly on first write; reading a missing table
/// behaves like reading an empty one.
#[derive(Default)]
pub struct MemoryDynamo {
    tables: RwLock<HashMap<String, Table>>,
}

impl MemoryDynamo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn item_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, |t| t.len())
    }

    /// Raw stored item, including key attributes.
    pub fn raw_item(&self, table: &str, partition: &str, sort: &str) -> Option<Item> {
        self.tables
            .read()
            .get(table)?
            .get(&(partition.to_string(), sort.to_string()))
            .cloned()
    }

    fn read_page(
        &self,
        table: &str,
        key_condition: Option<&Predicate>,
        filter: Option<&Predicate>,
        limit: Option<i32>,
        exclusive_start_key: Option<&Item>,
    ) -> Result<Page> {
        let limit = match limit {
            Some(l) if l < 1 => {
                return Err(validation("Limit must be greater than or equal to 1"));
            }
            Some(l) => Some(l as usize),
            None => None,
        };
        let start = exclusive_start_key.map(key_of).transpose()?;

        let tables = self.tables.read();
        let Some(rows) = tables.get(table) else {
            return Ok(Page::default());
        };

        let mut candidates = rows
            .iter()
            .filter(|(id, _)| start.as_ref().is_none_or(|s| *id > s))
            .map(|(id, item)| (id, item, document_from_item(item)))
            .filter(|(_, _, doc)| key_condition.is_none_or(|p| p.eval(doc)))
            .peekable();

        let mut page = Page::default();
        let mut evaluated = 0;
        while let Some((id, item, doc)) = candidates.next() {
            evaluated += 1;
            if filter.is_none_or(|f| f.eval(&doc)) {
                page.items.push(item.clone());
            }
            if limit.is_some_and(|l| evaluated >= l) {
                if candidates.peek().is_some() {
                    page.last_evaluated_key = Some(key_item(id));
                }
                break;
            }
        }
        Ok(page)
    }
}

#[async_trait]
impl DynamoApi for MemoryDynamo {
    async fn get_item(&self, input: GetItemInput) -> Result<Option<Item>> {
        let id = key_of(&input.key)?;
        Ok(self
            .tables
            .read()
            .get(&input.table)
            .and_then(|t| t.get(&id))
            .cloned())
    }

    async fn put_item(&self, input: PutItemInput) -> Result<()> {
        let id = key_of(&input.item)?;
        self.tables
            .write()
            .entry(input.table)
            .or_default()
            .insert(id, input.item);
        Ok(())
    }

    async fn delete_item(&self, input: DeleteItemInput) -> Result<()> {
        let id = key_of(&input.key)?;
        if let Some(table) = self.tables.write().get_mut(&input.table) {
            table.remove(&id);
        }
        Ok(())
    }

    async fn query(&self, input: QueryInput) -> Result<Page> {
        let key_condition = parse_condition(&input.key_condition_expression, &input.attributes)?;
        let filter = input
            .filter_expression
            .as_deref()
            .map(|f| parse_condition(f, &input.attributes))
            .transpose()?;
        self.read_page(
            &input.table,
            Some(&key_condition),
            filter.as_ref(),
            input.limit,
            input.exclusive_start_key.as_ref(),
        )
    }

    async fn scan(&self, input: ScanInput) -> Result<Page> {
        let filter = input
            .filter_expression
            .as_deref()
            .map(|f| parse_condition(f, &input.attributes))
            .transpose()?;
        self.read_page(
            &input.table,
            None,
            filter.as_ref(),
            input.limit,
            input.exclusive_start_key.as_ref(),
        )
    }
}

fn validation(message: impl std::fmt::Display) -> Error {
    Error::request("ValidationException", message)
}

fn key_of(item: &Item) -> Result<(String, String)> {
    let attr = |name: &str| {
        item.get(name)
            .and_then(AttributeValue::as_s)
            .map(str::to_string)
            .ok_or_else(|| validation(format!("missing string key attribute {name}")))
    };
    Ok((attr(ATTRIB_PK)?, attr(ATTRIB_SK)?))
}

fn key_item((pk, sk): &(String, String)) -> Item {
    Item::from([
        (ATTRIB_PK.to_string(), AttributeValue::S(pk.clone())),
        (ATTRIB_SK.to_string(), AttributeValue::S(sk.clone())),
    ])
}

// ---------------------------------------------------------------------------
// Expression parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    Value(String),
    Word(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let ident_end = |mut j: usize| {
        while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
            j += 1;
        }
        j
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '#' | ':' => {
                let end = ident_end(i + 1);
                if end == i + 1 {
                    return Err(validation(format!("empty placeholder at {i} in {expr:?}")));
                }
                let text: String = chars[i..end].iter().collect();
                tokens.push(if c == '#' {
                    Token::Name(text)
                } else {
                    Token::Value(text)
                });
                i = end;
            }
            '=' => {
                tokens.push(Token::Op("="));
                i += 1;
            }
            '<' | '>' => {
                let with_eq = chars.get(i + 1) == Some(&'=');
                tokens.push(Token::Op(match (c, with_eq) {
                    ('<', true) => "<=",
                    ('<', false) => "<",
                    ('>', true) => ">=",
                    _ => ">",
                }));
                i += if with_eq { 2 } else { 1 };
            }
            c if c.is_ascii_alphabetic() => {
                let end = ident_end(i);
                tokens.push(Token::Word(chars[i..end].iter().collect()));
                i = end;
            }
            other => {
                return Err(validation(format!("unexpected {other:?} in {expr:?}")));
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    attributes: &'a ExpressionAttributes,
}

/// Parse a conjunction of comparisons, `BETWEEN` and `begins_with` terms.
fn parse_condition(expr: &str, attributes: &ExpressionAttributes) -> Result<Predicate> {
    let mut parser = Parser {
        tokens: tokenize(expr)?,
        pos: 0,
        attributes,
    };
    let mut terms = vec![parser.term()?];
    while parser.eat_word("AND") {
        terms.push(parser.term()?);
    }
    if parser.pos != parser.tokens.len() {
        return Err(validation(format!("trailing tokens in {expr:?}")));
    }
    Ok(if terms.len() == 1 {
        terms.remove(0)
    } else {
        Predicate::And(terms)
    })
}

impl Parser<'_> {
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat_word(&mut self, word: &str) -> bool {
        match self.tokens.get(self.pos) {
            Some(Token::Word(w)) if w.eq_ignore_ascii_case(word) => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn expect(&mut self, want: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == want => Ok(()),
            other => Err(validation(format!("expected {want:?}, found {other:?}"))),
        }
    }

    fn name(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Name(placeholder)) => self
                .attributes
                .names
                .get(&placeholder)
                .cloned()
                .ok_or_else(|| validation(format!("undefined attribute name {placeholder}"))),
            other => Err(validation(format!("expected attribute name, found {other:?}"))),
        }
    }

    fn value(&mut self) -> Result<serde_json::Value> {
        match self.next() {
            Some(Token::Value(placeholder)) => self
                .attributes
                .values
                .get(&placeholder)
                .map(AttributeValue::to_json)
                .ok_or_else(|| validation(format!("undefined attribute value {placeholder}"))),
            other => Err(validation(format!("expected attribute value, found {other:?}"))),
        }
    }

    fn term(&mut self) -> Result<Predicate> {
        if self.eat_word("begins_with") {
            self.expect(Token::LParen)?;
            let attr = self.name()?;
            self.expect(Token::Comma)?;
            let prefix = match self.value()? {
                serde_json::Value::String(s) => s,
                other => {
                    return Err(validation(format!("begins_with needs a string, got {other}")));
                }
            };
            self.expect(Token::RParen)?;
            return Ok(Predicate::Prefix(attr, prefix));
        }

        let attr = self.name()?;
        if self.eat_word("BETWEEN") {
            let low = self.value()?;
            if !self.eat_word("AND") {
                return Err(validation("BETWEEN requires AND"));
            }
            let high = self.value()?;
            return Ok(Predicate::Between(attr, low, high));
        }
        match self.next() {
            Some(Token::Op(op)) => {
                let value = self.value()?;
                Ok(match op {
                    "=" => Predicate::Eq(attr, value),
                    "<" => Predicate::Lt(attr, value),
                    "<=" => Predicate::Le(attr, value),
                    ">" => Predicate::Gt(attr, value),
                    _ => Predicate::Ge(attr, value),
                })
            }
            other => Err(validation(format!("expected comparator, found {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(names: &[(&str, &str)], values: &[(&str, AttributeValue)]) -> ExpressionAttributes {
        ExpressionAttributes {
            names: names
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    fn item(pk: &str, sk: &str, extra: serde_json::Value) -> Item {
        let mut item = super::super::client::item_from_document(extra.as_object().unwrap());
        item.extend(key_item(&(pk.to_string(), sk.to_string())));
        item
    }

    #[test]
    fn test_parse_condition_shapes() {
        let a = attrs(
            &[("#pk", "_pk"), ("#sk", "_sk"), ("#n", "number")],
            &[
                (":pk", AttributeValue::S("1000".into())),
                (":sk", AttributeValue::S("orders#".into())),
                (":n0", AttributeValue::N("1".into())),
                (":n1", AttributeValue::N("2".into())),
            ],
        );
        assert_eq!(
            parse_condition("#pk = :pk AND begins_with(#sk, :sk)", &a).unwrap(),
            Predicate::And(vec![
                Predicate::Eq("_pk".into(), json!("1000")),
                Predicate::Prefix("_sk".into(), "orders#".into()),
            ])
        );
        assert_eq!(
            parse_condition("#n BETWEEN :n0 AND :n1", &a).unwrap(),
            Predicate::Between("number".into(), json!(1), json!(2))
        );
        assert_eq!(
            parse_condition("#n <= :n1", &a).unwrap(),
            Predicate::Le("number".into(), json!(2))
        );
        assert!(parse_condition("#missing = :pk", &a).is_err());
        assert!(parse_condition("#n = :n0 OR #n = :n1", &a).is_err());
    }

    #[tokio::test]
    async fn test_limit_applies_before_filter() {
        let db = MemoryDynamo::new();
        for (i, kind) in ["bike", "scooter", "scooter", "bike"].iter().enumerate() {
            db.put_item(PutItemInput {
                table: "t".into(),
                item: item("p", &format!("o#{i}"), json!({"type": kind})),
            })
            .await
            .unwrap();
        }
        let input = |esk: Option<Item>| ScanInput {
            table: "t".into(),
            filter_expression: Some("#t = :t".into()),
            attributes: attrs(&[("#t", "type")], &[(":t", AttributeValue::S("bike".into()))]),
            limit: Some(2),
            exclusive_start_key: esk,
        };

        let first = db.scan(input(None)).await.unwrap();
        assert_eq!(first.items.len(), 1);
        let esk = first.last_evaluated_key.unwrap();
        assert_eq!(esk[ATTRIB_SK], AttributeValue::S("o#1".into()));

        let second = db.scan(input(Some(esk))).await.unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(second.last_evaluated_key.is_none());
    }

    #[tokio::test]
    async fn test_missing_table_reads_empty() {
        let db = MemoryDynamo::new();
        let got = db
            .get_item(GetItemInput {
                table: "nope".into(),
                key: key_item(&("a".into(), "b".into())),
            })
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_items_require_string_keys() {
        let db = MemoryDynamo::new();
        let err = db
            .put_item(PutItemInput {
                table: "t".into(),
                item: Item::from([("_pk".to_string(), AttributeValue::N("1".into()))]),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ValidationException"));
    }
}
