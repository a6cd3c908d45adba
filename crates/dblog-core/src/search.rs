use crate::store::RecordFilter;
use crate::{display_timestamp, LogRecord};

/// Queries starting with this prefix filter on exact type.
pub const TYPE_QUERY_PREFIX: &str = "type@";

/// Turns a reporting search box query into a record filter.
///
/// `type@error` selects rows whose type is exactly `error`; any other
/// non-empty text is matched against the message.
#[must_use]
pub fn text_search(query: &str) -> RecordFilter {
    if query.is_empty() {
        return RecordFilter::All;
    }

    match query.strip_prefix(TYPE_QUERY_PREFIX) {
        Some(log_type) => RecordFilter::TypeEq(log_type.to_string()),
        None => RecordFilter::MessageMatch(query.to_string()),
    }
}

/// `<created>: <type>[ - IP: <ip>][ - Referer: <refer>]` followed by the
/// message on its own line.
#[must_use]
pub fn format_record(record: &LogRecord) -> String {
    let mut content = format!("{}: {}", display_timestamp(record.created), record.log_type);
    if !record.ip.is_empty() {
        content.push_str(" - IP: ");
        content.push_str(&record.ip);
    }
    if !record.refer.is_empty() {
        content.push_str(" - Referer: ");
        content.push_str(&record.refer);
    }
    content.push('\n');
    content.push_str(&record.message);
    content
}
