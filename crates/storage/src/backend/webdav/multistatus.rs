//! Parser for `207 Multi-Status` PROPFIND responses.
//!
//! Elements are matched by local name, so any namespace prefix works. The
//! parser is lenient: a missing or malformed property falls back to a
//! default, a response without an `href` is skipped, and a body that stops
//! being well-formed XML still yields everything parsed up to that point.

use crate::models::FileEntry;
use crate::path::basename;
use percent_encoding::percent_decode_str;
use quick_xml::Reader;
use quick_xml::events::Event;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

/// RFC 1123 date as sent in `getlastmodified` and `Last-Modified`, zone
/// name stripped.
const HTTP_DATE: &[BorrowedFormatItem<'static>] =
    format_description!("[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second]");
/// Same, from servers that don't zero-pad the day.
const HTTP_DATE_UNPADDED: &[BorrowedFormatItem<'static>] =
    format_description!("[weekday repr:short], [day padding:none] [month repr:short] [year] [hour]:[minute]:[second]");

/// Parse an HTTP date. The zone name is ignored and the time taken as UTC,
/// which is what every server sends (`GMT`).
pub(super) fn parse_http_date(value: &str) -> Option<OffsetDateTime> {
    let value = value.trim();
    let stamp = match value.rsplit_once(' ') {
        Some((stamp, zone)) if zone.chars().all(|c| c.is_ascii_alphabetic()) => stamp,
        _ => value,
    };
    [HTTP_DATE, HTTP_DATE_UNPADDED]
        .into_iter()
        .find_map(|format| PrimitiveDateTime::parse(stamp, format).ok())
        .map(PrimitiveDateTime::assume_utc)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Href,
    DisplayName,
    ContentLength,
    LastModified,
}

#[derive(Debug, Default)]
struct Record {
    href: String,
    display_name: String,
    content_length: String,
    last_modified: String,
    is_directory: bool,
}
impl Record {
    fn text(&mut self, field: Field) -> &mut String {
        match field {
            Field::Href => &mut self.href,
            Field::DisplayName => &mut self.display_name,
            Field::ContentLength => &mut self.content_length,
            Field::LastModified => &mut self.last_modified,
        }
    }

    fn into_entry(self, collection: &str) -> Option<FileEntry> {
        let href = self.href.trim();
        if href.is_empty() {
            return None;
        }
        let href = normalize(href);
        // The queried collection describes itself too
        if href == collection {
            return None;
        }
        let name = match self.display_name.trim() {
            "" => basename(&href).to_string(),
            name => name.to_string(),
        };
        let relative = href
            .strip_prefix(collection)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| name.clone());
        let size = self.content_length.trim().parse().unwrap_or(0);
        let modified = parse_http_date(&self.last_modified).unwrap_or_else(OffsetDateTime::now_utc);
        Some(FileEntry::new(name, relative, size, modified).directory(self.is_directory))
    }
}

/// Decoded path of an `href` (which may be an absolute URL), without the
/// trailing slash.
fn normalize(href: &str) -> String {
    let path = match href.split_once("://") {
        Some((_, rest)) => rest.find('/').map_or("", |slash| &rest[slash..]),
        None => href,
    };
    let decoded = percent_decode_str(path).decode_utf8_lossy();
    decoded.trim_end_matches('/').to_string()
}

/// Entries of a depth-1 listing of `collection` (the request path), minus
/// the collection itself. Entry paths are relative to the collection.
pub(super) fn parse(body: &str, collection: &str) -> Vec<FileEntry> {
    let collection = normalize(collection);
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);
    reader.config_mut().check_end_names = false;

    let mut entries = Vec::new();
    let mut record: Option<Record> = None;
    let mut field: Option<Field> = None;
    let mut in_resource_type = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => match element.local_name().as_ref() {
                b"response" => record = Some(Record::default()),
                // Only the first href names the resource
                b"href" => field = record.as_ref().filter(|r| r.href.is_empty()).map(|_| Field::Href),
                b"displayname" => field = Some(Field::DisplayName),
                b"getcontentlength" => field = Some(Field::ContentLength),
                b"getlastmodified" => field = Some(Field::LastModified),
                b"resourcetype" => in_resource_type = true,
                b"collection" | b"directory" if in_resource_type => {
                    record.iter_mut().for_each(|r| r.is_directory = true);
                },
                _ => field = None,
            },
            Ok(Event::Empty(element)) => {
                if in_resource_type && matches!(element.local_name().as_ref(), b"collection" | b"directory") {
                    record.iter_mut().for_each(|r| r.is_directory = true);
                }
            },
            Ok(Event::End(element)) => {
                field = None;
                match element.local_name().as_ref() {
                    b"response" => entries.extend(record.take().and_then(|r| r.into_entry(&collection))),
                    b"resourcetype" => in_resource_type = false,
                    _ => {},
                }
            },
            Ok(Event::Text(text)) => {
                if let (Some(field), Some(record)) = (field, record.as_mut()) {
                    match text.unescape() {
                        Ok(value) => record.text(field).push_str(&value),
                        Err(_) => record.text(field).push_str(&String::from_utf8_lossy(&text)),
                    }
                }
            },
            Ok(Event::CData(data)) => {
                if let (Some(field), Some(record)) = (field, record.as_mut()) {
                    record.text(field).push_str(&String::from_utf8_lossy(&data));
                }
            },
            Ok(Event::Eof) => break,
            Err(err) => {
                tracing::warn!(
                    position = reader.buffer_position(),
                    error = %err,
                    "malformed multistatus body, keeping entries parsed so far"
                );
                break;
            },
            Ok(_) => {},
        }
    }
    // A truncated body can end inside a response that is still usable
    entries.extend(record.and_then(|r| r.into_entry(&collection)));
    entries
}
