//! XML encoding of store snapshots.
//!
//! The document nests `<group>` elements for readability only; decoding collects
//! every `<record>` at any depth, so regrouping a store never changes its keys.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::{
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
    Reader, Writer,
};
use sked_core::{compare_group_values, GroupingSpec, NaturalKey, Record, SnapshotMeta, StoreSnapshot};
use tracing::warn;

pub const ROOT_ELEMENT: &str = "store";
pub const GROUP_ELEMENT: &str = "group";
pub const RECORD_ELEMENT: &str = "record";
pub const FIELD_ELEMENT: &str = "field";

type XmlWriter = Writer<Vec<u8>>;

fn encode_err(err: impl std::fmt::Display) -> String {
    format!("xml write failed: {err}")
}

/// Render a snapshot as an indented, deterministic XML document.
pub fn encode_snapshot(snapshot: &StoreSnapshot, grouping: &GroupingSpec) -> Result<Vec<u8>, String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(encode_err)?;

    let total = snapshot.len().to_string();
    let last_updated = snapshot.meta.last_updated.map(format_timestamp);
    let mut root = BytesStart::new(ROOT_ELEMENT);
    if let Some(source) = &snapshot.meta.source {
        root.push_attribute(("source", source.as_str()));
    }
    root.push_attribute(("total_records", total.as_str()));
    if let Some(ts) = &last_updated {
        root.push_attribute(("last_updated", ts.as_str()));
    }
    writer.write_event(Event::Start(root)).map_err(encode_err)?;

    let records: Vec<&Record> = snapshot.records().collect();
    write_level(&mut writer, records, &grouping.levels)?;

    writer
        .write_event(Event::End(BytesEnd::new(ROOT_ELEMENT)))
        .map_err(encode_err)?;

    let mut bytes = writer.into_inner();
    bytes.push(b'\n');
    Ok(bytes)
}

fn write_level(writer: &mut XmlWriter, records: Vec<&Record>, levels: &[String]) -> Result<(), String> {
    let Some((field, rest)) = levels.split_first() else {
        for record in records {
            write_record(writer, record)?;
        }
        return Ok(());
    };

    let mut groups: BTreeMap<&str, Vec<&Record>> = BTreeMap::new();
    for record in records {
        groups
            .entry(GroupingSpec::group_value(record, field))
            .or_default()
            .push(record);
    }
    let mut groups: Vec<_> = groups.into_iter().collect();
    groups.sort_by(|(a, _), (b, _)| compare_group_values(a, b));

    for (value, members) in groups {
        let mut start = BytesStart::new(GROUP_ELEMENT);
        start.push_attribute(("field", field.as_str()));
        start.push_attribute(("value", value));
        writer.write_event(Event::Start(start)).map_err(encode_err)?;
        write_level(writer, members, rest)?;
        writer
            .write_event(Event::End(BytesEnd::new(GROUP_ELEMENT)))
            .map_err(encode_err)?;
    }
    Ok(())
}

fn write_record(writer: &mut XmlWriter, record: &Record) -> Result<(), String> {
    let observed_at = record.observed_at.map(format_timestamp);
    let mut start = BytesStart::new(RECORD_ELEMENT);
    start.push_attribute(("key", record.key.as_str()));
    if let Some(source) = &record.source {
        start.push_attribute(("source", source.as_str()));
    }
    if let Some(ts) = &observed_at {
        start.push_attribute(("observed_at", ts.as_str()));
    }
    writer.write_event(Event::Start(start)).map_err(encode_err)?;

    for (name, value) in &record.fields {
        let mut field = BytesStart::new(FIELD_ELEMENT);
        field.push_attribute(("name", name.as_str()));
        writer.write_event(Event::Start(field)).map_err(encode_err)?;
        writer
            .write_event(Event::Text(BytesText::new(value)))
            .map_err(encode_err)?;
        writer
            .write_event(Event::End(BytesEnd::new(FIELD_ELEMENT)))
            .map_err(encode_err)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new(RECORD_ELEMENT)))
        .map_err(encode_err)
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_timestamp(raw: &str, what: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(err) => {
            warn!(value = raw, error = %err, "ignoring unparseable {what} timestamp");
            None
        }
    }
}

fn read_attributes(start: &BytesStart<'_>) -> Result<BTreeMap<String, String>, String> {
    let mut attrs = BTreeMap::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| format!("bad attribute: {e}"))?;
        let name = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| format!("bad attribute value for {name}: {e}"))?
            .into_owned();
        attrs.insert(name, value);
    }
    Ok(attrs)
}

struct PendingRecord {
    record: Record,
}

impl PendingRecord {
    fn open(attrs: &BTreeMap<String, String>) -> Result<Self, String> {
        let key = attrs
            .get("key")
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| "record element without a key attribute".to_string())?;
        Ok(Self {
            record: Record {
                key: NaturalKey::from_rendered(key),
                fields: BTreeMap::new(),
                source: attrs.get("source").cloned(),
                observed_at: attrs
                    .get("observed_at")
                    .and_then(|raw| parse_timestamp(raw, "record observed_at")),
            },
        })
    }
}

fn finish_record(snapshot: &mut StoreSnapshot, pending: PendingRecord) {
    let key = pending.record.key.clone();
    if snapshot.upsert(pending.record).is_some() {
        warn!(%key, "store document repeats a record key; keeping the later record");
    }
}

/// Parse a store document. Any structural problem is reported as a reason string;
/// the caller wraps it into a corrupt-store error.
pub fn decode_snapshot(bytes: &[u8]) -> Result<StoreSnapshot, String> {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();

    let mut snapshot: Option<StoreSnapshot> = None;
    let mut declared_total: Option<usize> = None;
    let mut depth = 0usize;
    let mut root_closed = false;
    let mut pending: Option<PendingRecord> = None;
    let mut open_field: Option<(String, String)> = None;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| format!("malformed xml near byte {}: {e}", reader.buffer_position()))?;

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let name = e.local_name();
                let name = name.as_ref();

                if root_closed {
                    return Err("content after the root element".into());
                }

                let Some(current) = snapshot.as_mut() else {
                    if name != ROOT_ELEMENT.as_bytes() {
                        return Err(format!(
                            "unexpected root element <{}>",
                            String::from_utf8_lossy(name)
                        ));
                    }
                    let attrs = read_attributes(e)?;
                    declared_total = attrs.get("total_records").and_then(|v| v.parse().ok());
                    snapshot = Some(StoreSnapshot::with_meta(SnapshotMeta {
                        source: attrs.get("source").cloned(),
                        last_updated: attrs
                            .get("last_updated")
                            .and_then(|raw| parse_timestamp(raw, "store last_updated")),
                    }));
                    if is_empty {
                        root_closed = true;
                    } else {
                        depth += 1;
                    }
                    buf.clear();
                    continue;
                };

                if name == RECORD_ELEMENT.as_bytes() {
                    if pending.is_some() {
                        return Err("nested record elements".into());
                    }
                    let record = PendingRecord::open(&read_attributes(e)?)?;
                    if is_empty {
                        finish_record(current, record);
                    } else {
                        pending = Some(record);
                    }
                } else if name == FIELD_ELEMENT.as_bytes() {
                    if pending.is_none() {
                        return Err("field element outside a record".into());
                    }
                    let attrs = read_attributes(e)?;
                    let field_name = attrs
                        .get("name")
                        .cloned()
                        .ok_or_else(|| "field element without a name attribute".to_string())?;
                    if is_empty {
                        if let Some(p) = pending.as_mut() {
                            p.record.fields.insert(field_name, String::new());
                        }
                    } else {
                        open_field = Some((field_name, String::new()));
                    }
                }

                if !is_empty {
                    depth += 1;
                }
            }
            Event::End(ref e) => {
                depth = depth.saturating_sub(1);
                let name = e.local_name();
                let name = name.as_ref();
                if name == FIELD_ELEMENT.as_bytes() {
                    if let (Some((field, value)), Some(p)) = (open_field.take(), pending.as_mut()) {
                        p.record.fields.insert(field, value);
                    }
                } else if name == RECORD_ELEMENT.as_bytes() {
                    if let (Some(p), Some(current)) = (pending.take(), snapshot.as_mut()) {
                        finish_record(current, p);
                    }
                }
                if depth == 0 {
                    root_closed = true;
                }
            }
            Event::Text(ref t) => {
                if let Some((_, value)) = open_field.as_mut() {
                    let text = t.unescape().map_err(|e| format!("bad text content: {e}"))?;
                    value.push_str(&text);
                }
            }
            Event::CData(ref c) => {
                if let Some((_, value)) = open_field.as_mut() {
                    value.push_str(&String::from_utf8_lossy(c));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let snapshot = snapshot.ok_or_else(|| "document has no <store> root element".to_string())?;
    if !root_closed {
        return Err("document is truncated".into());
    }
    if let Some(total) = declared_total {
        if total != snapshot.len() {
            warn!(
                declared = total,
                actual = snapshot.len(),
                "store total_records attribute disagrees with record count"
            );
        }
    }
    Ok(snapshot)
}
