//! XML dialects for the durable store file.
//!
//! Both dialects share one layout and one in-memory model
//! ([`StoreSnapshot`]); they differ only in element/attribute names and in
//! whitespace. The compact dialect is written on one line with short
//! names, the verbose dialect is indented with self-describing names.
//!
//! ```text
//! compact: <db v=".."><sy><s id=".." ls=".."/></sy><o id tc tm><f id t tm>value</f></o></db>
//! verbose: <database version><sync><source id lastSync/></sync><object id created modified>
//!              <field id type modified>value</field></object></database>
//! ```
//!
//! Files are told apart by their closing tag.

use crate::{
    error::Result, Error, FieldType, Record, Schema, StoreSnapshot, Timestamp, Value, NEVER_SYNCED,
};
use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::borrow::Cow;
use std::sync::Arc;

/// On-disk schema dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// Long element names, one element per line.
    Verbose,
    /// Short element names, no whitespace. Default for new stores.
    #[default]
    Compact,
}

/// Element and attribute names of one dialect.
#[derive(Debug)]
struct Vocabulary {
    root: &'static str,
    version: &'static str,
    sync: &'static str,
    source: &'static str,
    last_sync: &'static str,
    record: &'static str,
    created: &'static str,
    modified: &'static str,
    field: &'static str,
    field_type: &'static str,
}

const ID: &str = "id";

const VERBOSE: Vocabulary = Vocabulary {
    root: "database",
    version: "version",
    sync: "sync",
    source: "source",
    last_sync: "lastSync",
    record: "object",
    created: "created",
    modified: "modified",
    field: "field",
    field_type: "type",
};

const COMPACT: Vocabulary = Vocabulary {
    root: "db",
    version: "v",
    sync: "sy",
    source: "s",
    last_sync: "ls",
    record: "o",
    created: "tc",
    modified: "tm",
    field: "f",
    field_type: "t",
};

impl Dialect {
    fn vocabulary(self) -> &'static Vocabulary {
        match self {
            Dialect::Verbose => &VERBOSE,
            Dialect::Compact => &COMPACT,
        }
    }

    /// Pick the dialect of a stored file from its trailing marker.
    pub fn detect(text: &str) -> Self {
        if text.trim_end().ends_with("</database>") {
            Dialect::Verbose
        } else {
            Dialect::Compact
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::Verbose => f.write_str("verbose"),
            Dialect::Compact => f.write_str("compact"),
        }
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Serialize a snapshot in the given dialect.
pub fn encode(snapshot: &StoreSnapshot, dialect: Dialect) -> Result<String> {
    let mut out = XmlOut::new(dialect);
    let vocab = dialect.vocabulary();

    out.event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("yes"))))?;
    out.indent(0)?;

    let mut root = BytesStart::new(vocab.root);
    push_attr(&mut root, vocab.version, &snapshot.format_version)?;
    out.event(Event::Start(root))?;

    out.indent(1)?;
    out.event(Event::Start(BytesStart::new(vocab.sync)))?;
    for (id, last_sync) in &snapshot.sync_sources {
        out.indent(2)?;
        let mut source = BytesStart::new(vocab.source);
        push_attr(&mut source, ID, id)?;
        push_attr(&mut source, vocab.last_sync, &last_sync.to_string())?;
        out.event(Event::Empty(source))?;
    }
    out.indent(1)?;
    out.event(Event::End(BytesEnd::new(vocab.sync)))?;

    for record in snapshot.records.values() {
        out.indent(1)?;
        encode_record(&mut out, vocab, record)?;
    }

    out.indent(0)?;
    out.event(Event::End(BytesEnd::new(vocab.root)))?;
    out.finish()
}

fn encode_record(out: &mut XmlOut, vocab: &Vocabulary, record: &Record) -> Result<()> {
    let mut start = BytesStart::new(vocab.record);
    push_attr(&mut start, ID, record.id())?;
    push_attr(&mut start, vocab.created, &record.created_at().to_string())?;
    push_attr(&mut start, vocab.modified, &record.modified_at().to_string())?;
    out.event(Event::Start(start))?;

    for (def, field) in record.defs_and_fields() {
        out.indent(2)?;
        let mut start = BytesStart::new(vocab.field);
        push_attr(&mut start, ID, &def.name)?;
        push_attr(&mut start, vocab.field_type, field.value().field_type().tag())?;
        push_attr(&mut start, vocab.modified, &field.modified_at().to_string())?;
        out.event(Event::Start(start))?;
        let raw = field.value().to_text();
        let text = escape_markup(&raw)?;
        out.event(Event::Text(BytesText::from_escaped(text)))?;
        out.event(Event::End(BytesEnd::new(vocab.field)))?;
    }

    out.indent(1)?;
    out.event(Event::End(BytesEnd::new(vocab.record)))?;
    Ok(())
}

struct XmlOut {
    writer: Writer<Vec<u8>>,
    pretty: bool,
}

impl XmlOut {
    fn new(dialect: Dialect) -> Self {
        Self {
            writer: Writer::new(Vec::new()),
            pretty: dialect == Dialect::Verbose,
        }
    }

    fn event(&mut self, event: Event<'_>) -> Result<()> {
        self.writer
            .write_event(event)
            .map_err(|e| Error::Unencodable(e.to_string()))
    }

    /// Line break plus `depth` tabs, verbose dialect only.
    fn indent(&mut self, depth: usize) -> Result<()> {
        if !self.pretty {
            return Ok(());
        }
        let mut ws = String::with_capacity(depth + 1);
        ws.push('\n');
        ws.extend(std::iter::repeat('\t').take(depth));
        self.event(Event::Text(BytesText::from_escaped(ws)))
    }

    fn finish(self) -> Result<String> {
        String::from_utf8(self.writer.into_inner()).map_err(|e| Error::Unencodable(e.to_string()))
    }
}

/// Push an attribute whose value we escaped ourselves.
fn push_attr(start: &mut BytesStart<'_>, key: &str, value: &str) -> Result<()> {
    let escaped = escape_markup(value)?;
    start.push_attribute(Attribute::from((key.as_bytes(), escaped.as_bytes())));
    Ok(())
}

/// Escape markup-significant characters.
///
/// Whitespace other than plain spaces is written as character references so
/// that attribute-value and line-ending normalization cannot alter it on
/// the way back in. Characters XML 1.0 cannot carry at all are rejected.
fn escape_markup(raw: &str) -> Result<Cow<'_, str>> {
    let needs_escape = |c: char| matches!(c, '&' | '<' | '>' | '"' | '\'' | '\t' | '\n' | '\r');
    if let Some(bad) = raw.chars().find(|c| !is_xml_char(*c)) {
        return Err(Error::Unencodable(format!(
            "character U+{:04X} is not allowed in XML",
            bad as u32
        )));
    }
    if !raw.contains(needs_escape) {
        return Ok(Cow::Borrowed(raw));
    }

    let mut escaped = String::with_capacity(raw.len() + 16);
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            '\t' => escaped.push_str("&#9;"),
            '\n' => escaped.push_str("&#10;"),
            '\r' => escaped.push_str("&#13;"),
            other => escaped.push(other),
        }
    }
    Ok(Cow::Owned(escaped))
}

fn is_xml_char(c: char) -> bool {
    matches!(c,
        '\t' | '\n' | '\r'
        | '\u{20}'..='\u{D7FF}'
        | '\u{E000}'..='\u{FFFD}'
        | '\u{10000}'..='\u{10FFFF}')
}

// ============================================================================
// Decoding
// ============================================================================

/// Parse a stored file. Returns the snapshot and the dialect it was in.
///
/// All or nothing: any structural, attribute or value error fails the whole
/// decode.
pub fn decode(text: &str, schema: &Arc<Schema>) -> Result<(StoreSnapshot, Dialect)> {
    let dialect = Dialect::detect(text);
    let vocab = dialect.vocabulary();

    let doc = roxmltree::Document::parse(text).map_err(|e| Error::unreadable(e.to_string()))?;
    let root = doc.root_element();
    if root.tag_name().name() != vocab.root {
        return Err(Error::unreadable(format!(
            "expected <{}> root element, found <{}>",
            vocab.root,
            root.tag_name().name()
        )));
    }

    let mut snapshot = StoreSnapshot::new();
    if let Some(version) = root.attribute(vocab.version) {
        snapshot.format_version = version.to_string();
    }

    for node in root.children().filter(|n| n.is_element()) {
        let tag = node.tag_name().name();
        if tag == vocab.sync {
            for source in node
                .children()
                .filter(|n| n.is_element() && n.tag_name().name() == vocab.source)
            {
                let id = required_attr(&source, ID)?;
                let last_sync = timestamp_attr(&source, vocab.last_sync)?;
                snapshot.sync_sources.insert(id.to_string(), last_sync);
            }
        } else if tag == vocab.record {
            let record = decode_record(&node, vocab, schema)?;
            snapshot.add_record(record);
        }
    }

    Ok((snapshot, dialect))
}

fn decode_record(
    node: &roxmltree::Node<'_, '_>,
    vocab: &Vocabulary,
    schema: &Arc<Schema>,
) -> Result<Record> {
    let id = required_attr(node, ID)?;
    let created = timestamp_attr(node, vocab.created)?;
    let modified = timestamp_attr(node, vocab.modified)?;
    let mut record = Record::restored(schema.clone(), id, created, modified);

    for field in node
        .children()
        .filter(|n| n.is_element() && n.tag_name().name() == vocab.field)
    {
        let name = required_attr(&field, ID)?;
        let tag = required_attr(&field, vocab.field_type)?;
        let kind = FieldType::from_tag(tag).unwrap_or_else(|| {
            tracing::warn!(record = id, field = name, tag, "unknown field type, reading as str");
            FieldType::Str
        });
        let modified = timestamp_attr(&field, vocab.modified)?;
        let text: String = field
            .children()
            .filter(|n| n.is_text())
            .filter_map(|n| n.text())
            .collect();
        let value = Value::from_text(kind, &text)?;
        record
            .restore_field(name, value, modified)
            .map_err(|e| Error::unreadable(format!("record {id}: {e}")))?;
    }

    record.finish_construction();
    Ok(record)
}

fn required_attr<'a>(node: &roxmltree::Node<'a, '_>, name: &str) -> Result<&'a str> {
    node.attribute(name).ok_or_else(|| {
        Error::unreadable(format!(
            "<{}> is missing attribute {name:?}",
            node.tag_name().name()
        ))
    })
}

/// Integer milliseconds, or fractional seconds as older files wrote them.
fn timestamp_attr(node: &roxmltree::Node<'_, '_>, name: &str) -> Result<Timestamp> {
    let raw = required_attr(node, name)?;
    parse_timestamp(raw)
        .ok_or_else(|| Error::unreadable(format!("invalid timestamp {raw:?} in {name:?}")))
}

fn parse_timestamp(raw: &str) -> Option<Timestamp> {
    let raw = raw.trim();
    if !raw.contains(|c: char| c == '.' || c == 'e' || c == 'E') {
        return raw.parse().ok();
    }
    let seconds: f64 = raw.parse().ok()?;
    if !seconds.is_finite() {
        return None;
    }
    if seconds < 0.0 {
        return Some(NEVER_SYNCED);
    }
    let millis = (seconds * 1000.0).round();
    (millis <= Timestamp::MAX as f64).then_some(millis as Timestamp)
}
