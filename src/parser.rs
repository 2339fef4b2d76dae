//! Line-oriented parser for the restricted YAML dialect used by the metadata files.
//!
//! Supported: nested mappings, block lists (including lists of mappings written as
//! `- id: X`), quoted and plain scalars, inline lists `[a, b]`, multi-line plain scalars
//! (continuation lines), `|` / `>` block scalars and `#` comments. Anchors, tags, flow
//! mappings with content and multi-document streams are not.
//!
//! Structure is derived purely from indentation: each line's depth is compared with the
//! depth of the field or section that is currently open, and a decrease closes everything
//! nested deeper. Duplicate keys within one mapping overwrite the earlier value.
//!
//! ```
//! let doc = unicef_sdmx::parser::parse("indicators:\n  CME_MRY0T4:\n    dataflows: [CME, GLOBAL_DATAFLOW]\n").unwrap();
//! let flows = doc.root().path(&["indicators", "CME_MRY0T4", "dataflows"]).unwrap();
//! assert_eq!(flows.as_str_list(), vec!["CME", "GLOBAL_DATAFLOW"]);
//! ```

use std::fmt;
use std::sync::LazyLock;

use ahash::AHashMap;
use regex::Regex;
use thiserror::Error;

/// `key:` or `key: value`; keys may be quoted.
static KEY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?P<key>'[^']*'|"[^"]*"|[^\s'"\-#\[\]{}][^:]*?|-[^\s:][^:]*?)\s*:(?:\s+(?P<value>.*))?$"#)
        .expect("key pattern")
});

/// `- value` or a bare `-`.
static ITEM_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-(?P<gap>\s+(?P<value>.*))?$").expect("item pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// A value in the parsed tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Null,
    Scalar(String),
    List(Vec<Node>),
    Map(Mapping),
}

impl Node {
    pub fn get(&self, key: &str) -> Option<&Node> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Walks nested mappings.
    pub fn path(&self, keys: &[&str]) -> Option<&Node> {
        keys.iter().try_fold(self, |node, key| node.get(key))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_str().and_then(|s| s.trim().parse().ok())
    }

    pub fn as_list(&self) -> Option<&[Node]> {
        match self {
            Node::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Mapping> {
        match self {
            Node::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Node::Null)
    }

    /// A scalar as a one-element list, a list of scalars as-is; anything else is empty.
    pub fn as_str_list(&self) -> Vec<&str> {
        match self {
            Node::Scalar(s) if !s.trim().is_empty() => vec![s.as_str()],
            Node::List(items) => items
                .iter()
                .filter_map(Node::as_str)
                .filter(|s| !s.trim().is_empty())
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappingEntry {
    pub key: String,
    pub value: Node,
    /// 1-based source line of the key.
    pub line: usize,
}

/// Insertion-ordered mapping. A repeated key replaces the earlier value in place.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    entries: Vec<MappingEntry>,
    index: AHashMap<String, usize>,
}

impl PartialEq for Mapping {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(&other.entries)
                .all(|(a, b)| a.key == b.key && a.value == b.value)
    }
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Node, line: usize) {
        let key = key.into();
        match self.index.get(&key) {
            Some(&i) => {
                self.entries[i].value = value;
                self.entries[i].line = line;
            }
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push(MappingEntry { key, value, line });
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.entry(key).map(|e| &e.value)
    }

    pub fn entry(&self, key: &str) -> Option<&MappingEntry> {
        self.index.get(key).map(|&i| &self.entries[i])
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MappingEntry> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }
}

/// A parsed metadata document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    root: Node,
}

impl Document {
    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.root.get(key)
    }

    pub fn into_root(self) -> Node {
        self.root
    }
}

impl From<Node> for Document {
    fn from(root: Node) -> Self {
        Self { root }
    }
}

#[derive(Debug, Clone)]
enum LineKind {
    Key { key: String, value: Option<String> },
    Item { value: Option<String>, column: usize },
    Text,
}

#[derive(Debug, Clone)]
struct Line {
    number: usize,
    indent: usize,
    content: String,
    kind: LineKind,
}

/// Parses a whole document.
pub fn parse(text: &str) -> Result<Document, ParseError> {
    let lines = scan(text)?;
    let mut parser = Parser { lines, pos: 0 };
    let root = parser.parse_document()?;
    Ok(Document { root })
}

fn scan(text: &str) -> Result<Vec<Line>, ParseError> {
    let mut lines = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        let number = i + 1;
        let raw = raw.trim_end_matches('\r');
        let content = raw.trim();
        if content.is_empty() || content.starts_with('#') || content == "---" || content == "..." {
            continue;
        }
        let lead = &raw[..raw.len() - raw.trim_start().len()];
        if lead.contains('\t') {
            return Err(ParseError::new(number, "tab characters are not allowed in indentation"));
        }
        let indent = lead.len();
        lines.push(Line {
            number,
            indent,
            content: content.to_string(),
            kind: classify(content, indent),
        });
    }
    Ok(lines)
}

fn classify(content: &str, indent: usize) -> LineKind {
    if let Some(caps) = ITEM_LINE.captures(content) {
        let value = caps.name("value").map(|m| m.as_str().trim().to_string());
        let gap = caps.name("gap").map(|m| m.as_str().len()).unwrap_or(0);
        let value_len = value.as_ref().map(|v| v.len()).unwrap_or(0);
        // column where the item's content starts: the dash, then the spaces before the value
        let column = indent + 1 + gap - value_len;
        return LineKind::Item {
            value: value.filter(|v| !v.is_empty()),
            column,
        };
    }
    match split_key(content) {
        Some((key, value)) => LineKind::Key { key, value },
        None => LineKind::Text,
    }
}

fn split_key(content: &str) -> Option<(String, Option<String>)> {
    let caps = KEY_LINE.captures(content)?;
    let key = unquote(caps.name("key")?.as_str().trim());
    let value = caps
        .name("value")
        .map(|m| m.as_str().trim().to_string())
        .filter(|v| !v.is_empty());
    Some((key, value))
}

struct Parser {
    lines: Vec<Line>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Line> {
        self.lines.get(self.pos)
    }

    fn parse_document(&mut self) -> Result<Node, ParseError> {
        let Some(first) = self.peek() else {
            return Ok(Node::Map(Mapping::new()));
        };
        let root_indent = first.indent;
        let root = self.parse_block(root_indent)?;
        if let Some(line) = self.peek() {
            let message = if line.indent < root_indent {
                "indentation decreases below the document root"
            } else {
                "unexpected content after the document root"
            };
            return Err(ParseError::new(line.number, message));
        }
        Ok(root)
    }

    fn parse_block(&mut self, indent: usize) -> Result<Node, ParseError> {
        let Some(line) = self.peek() else {
            return Ok(Node::Null);
        };
        match &line.kind {
            LineKind::Key { .. } => self.parse_mapping(indent),
            LineKind::Item { .. } => self.parse_list(indent),
            LineKind::Text => Err(ParseError::new(
                line.number,
                format!("expected `key:` or `- item`, found {:?}", line.content),
            )),
        }
    }

    fn parse_mapping(&mut self, indent: usize) -> Result<Node, ParseError> {
        let mut map = Mapping::new();
        while let Some(line) = self.peek() {
            if line.indent < indent {
                break;
            }
            if line.indent > indent {
                return Err(ParseError::new(line.number, "unexpected indentation"));
            }
            let number = line.number;
            match &line.kind {
                LineKind::Key { key, value } => {
                    let (key, value) = (key.clone(), value.clone());
                    self.pos += 1;
                    let node = self.parse_value(indent, value, number)?;
                    map.insert(key, node, number);
                }
                LineKind::Item { .. } => {
                    // a list at the mapping's own depth ends it; the caller decides
                    break;
                }
                LineKind::Text => {
                    return Err(ParseError::new(
                        number,
                        format!("expected `key:` but found {:?}", line.content),
                    ));
                }
            }
        }
        Ok(Node::Map(map))
    }

    fn parse_list(&mut self, indent: usize) -> Result<Node, ParseError> {
        let mut items = Vec::new();
        while let Some(line) = self.peek() {
            if line.indent < indent {
                break;
            }
            if line.indent > indent {
                return Err(ParseError::new(line.number, "unexpected indentation"));
            }
            let number = line.number;
            let (value, column) = match &line.kind {
                LineKind::Item { value, column } => (value.clone(), *column),
                LineKind::Key { .. } => break,
                LineKind::Text => {
                    return Err(ParseError::new(
                        number,
                        format!("expected `- item` but found {:?}", line.content),
                    ));
                }
            };
            match value {
                None => {
                    self.pos += 1;
                    items.push(self.parse_nested(indent)?);
                }
                Some(value) => match split_key(&value) {
                    Some((key, inline)) => {
                        // `- key: value` opens a mapping at the item's content column
                        self.lines[self.pos] = Line {
                            number,
                            indent: column,
                            content: value.clone(),
                            kind: LineKind::Key { key, value: inline },
                        };
                        items.push(self.parse_mapping(column)?);
                    }
                    _ => {
                        self.pos += 1;
                        let scalar = self.parse_inline(indent, &value, number)?;
                        items.push(scalar);
                    }
                },
            }
        }
        Ok(Node::List(items))
    }

    /// Value of `key:` whose inline part is `value`, owned by a field at `indent`.
    fn parse_value(
        &mut self,
        indent: usize,
        value: Option<String>,
        number: usize,
    ) -> Result<Node, ParseError> {
        match value {
            Some(v) if matches!(v.as_str(), "|" | "|-" | ">" | ">-") => {
                let joiner = if v.starts_with('|') { "\n" } else { " " };
                let mut parts = Vec::new();
                while let Some(line) = self.peek() {
                    if line.indent <= indent {
                        break;
                    }
                    parts.push(line.content.clone());
                    self.pos += 1;
                }
                Ok(Node::Scalar(parts.join(joiner)))
            }
            Some(v) => self.parse_inline(indent, &v, number),
            None => {
                let list_at_same_depth = self.peek().is_some_and(|next| {
                    next.indent == indent && matches!(next.kind, LineKind::Item { .. })
                });
                if list_at_same_depth {
                    self.parse_list(indent)
                } else {
                    self.parse_nested(indent)
                }
            }
        }
    }

    /// Block nested deeper than `indent`, or `Null` when there is none.
    fn parse_nested(&mut self, indent: usize) -> Result<Node, ParseError> {
        let (child, is_text) = match self.peek() {
            Some(next) if next.indent > indent => (next.indent, matches!(next.kind, LineKind::Text)),
            _ => return Ok(Node::Null),
        };
        if is_text {
            let text = self.continuation(indent);
            return Ok(Node::Scalar(text.join(" ")));
        }
        self.parse_block(child)
    }

    /// Scalar or inline list written on the owning line, plus any continuation lines.
    fn parse_inline(&mut self, indent: usize, value: &str, number: usize) -> Result<Node, ParseError> {
        let node = parse_scalar(value, number)?;
        let Node::Scalar(mut text) = node else {
            return Ok(node);
        };
        let more = self.continuation(indent);
        if !more.is_empty() {
            text.push(' ');
            text.push_str(&more.join(" "));
        }
        if let Some(line) = self.peek()
            && line.indent > indent
        {
            return Err(ParseError::new(
                line.number,
                "nested content under a scalar value",
            ));
        }
        Ok(Node::Scalar(text))
    }

    /// Consumes text lines deeper than `indent`.
    fn continuation(&mut self, indent: usize) -> Vec<String> {
        let mut parts = Vec::new();
        while let Some(line) = self.peek() {
            if line.indent <= indent || !matches!(line.kind, LineKind::Text) {
                break;
            }
            parts.push(line.content.clone());
            self.pos += 1;
        }
        parts
    }
}

fn parse_scalar(value: &str, number: usize) -> Result<Node, ParseError> {
    let value = value.trim();
    if let Some(inner) = value.strip_prefix('[') {
        let inner = inner
            .strip_suffix(']')
            .ok_or_else(|| ParseError::new(number, "unterminated inline list"))?;
        let items = split_inline(inner, number)?
            .into_iter()
            .map(Node::Scalar)
            .collect();
        return Ok(Node::List(items));
    }
    if value == "{}" {
        return Ok(Node::Map(Mapping::new()));
    }
    if let Some(quote) = value.chars().next().filter(|c| *c == '\'' || *c == '"') {
        if value.len() < 2 || !value.ends_with(quote) {
            return Err(ParseError::new(number, "unterminated quoted string"));
        }
        return Ok(Node::Scalar(unquote(value)));
    }
    let plain = strip_comment(value);
    if matches!(plain, "~" | "null" | "") {
        return Ok(Node::Null);
    }
    Ok(Node::Scalar(plain.to_string()))
}

fn strip_comment(value: &str) -> &str {
    match value.find(" #") {
        Some(i) => value[..i].trim_end(),
        None => value,
    }
}

/// Splits the inside of `[...]` on commas that are not inside quotes.
fn split_inline(inner: &str, number: usize) -> Result<Vec<String>, ParseError> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for ch in inner.chars() {
        match (quote, ch) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(ch);
                current.push(ch);
            }
            (None, ',') => {
                items.push(std::mem::take(&mut current));
            }
            (None, c) => current.push(c),
        }
    }
    if quote.is_some() {
        return Err(ParseError::new(number, "unterminated quoted string in inline list"));
    }
    items.push(current);
    Ok(items
        .into_iter()
        .map(|s| unquote(s.trim()))
        .filter(|s| !s.is_empty())
        .collect())
}

/// Strips one pair of outer quotes.
fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if value.len() >= 2 && bytes[0] == b'\'' && bytes[value.len() - 1] == b'\'' {
        return value[1..value.len() - 1].replace("''", "'");
    }
    if value.len() >= 2 && bytes[0] == b'"' && bytes[value.len() - 1] == b'"' {
        let inner = &value[1..value.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        }
        return out;
    }
    value.to_string()
}

fn needs_quotes(s: &str) -> bool {
    s.is_empty()
        || s != s.trim()
        || s.starts_with(['\'', '"', '[', ']', '{', '}', '#', '-', '|', '>', '&', '*', '!', '%', '@', '`'])
        || matches!(s, "~" | "null")
        || s.contains(": ")
        || s.contains(" #")
        || s.ends_with(':')
        || s.contains('\n')
}

fn render_scalar(s: &str) -> String {
    if s.contains('\n') || s.contains('\t') {
        let escaped = s
            .replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('\n', "\\n")
            .replace('\t', "\\t");
        format!("\"{escaped}\"")
    } else if needs_quotes(s) {
        format!("'{}'", s.replace('\'', "''"))
    } else {
        s.to_string()
    }
}

fn render_key(key: &str) -> String {
    if needs_quotes(key) || key.contains(':') {
        format!("'{}'", key.replace('\'', "''"))
    } else {
        key.to_string()
    }
}

fn write_inline(out: &mut String, node: &Node) {
    match node {
        Node::Null => out.push('~'),
        Node::Scalar(s) => out.push_str(&render_scalar(s)),
        Node::List(_) => out.push_str("[]"),
        Node::Map(_) => out.push_str("{}"),
    }
}

fn write_mapping(out: &mut String, map: &Mapping, indent: usize) {
    for entry in map.iter() {
        out.push_str(&" ".repeat(indent));
        out.push_str(&render_key(&entry.key));
        out.push(':');
        match &entry.value {
            Node::Map(child) if !child.is_empty() => {
                out.push('\n');
                write_mapping(out, child, indent + 2);
            }
            Node::List(items) if !items.is_empty() => {
                out.push('\n');
                write_list(out, items, indent + 2);
            }
            Node::Null => out.push('\n'),
            other => {
                out.push(' ');
                write_inline(out, other);
                out.push('\n');
            }
        }
    }
}

fn write_list(out: &mut String, items: &[Node], indent: usize) {
    for item in items {
        out.push_str(&" ".repeat(indent));
        match item {
            Node::Map(child) if !child.is_empty() => {
                out.push_str("- ");
                let mut nested = String::new();
                write_mapping(&mut nested, child, indent + 2);
                out.push_str(&nested[indent + 2..]);
            }
            Node::List(nested) if !nested.is_empty() => {
                out.push_str("-\n");
                write_list(out, nested, indent + 2);
            }
            other => {
                out.push_str("- ");
                write_inline(out, other);
                out.push('\n');
            }
        }
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        match &self.root {
            Node::Map(map) => write_mapping(&mut out, map, 0),
            Node::List(items) => write_list(&mut out, items, 0),
            other => {
                write_inline(&mut out, other);
                out.push('\n');
            }
        }
        f.write_str(&out)
    }
}
