use crate::normalize::normalize;
use crate::schema::{Continuation, ExtractionSchema, LineSplitMode};
use crate::types::ExtractedRecord;

/// Run `schema` over OCR text. Total: unmatched fields stay absent, nothing errors.
pub fn extract(text: &str, schema: &ExtractionSchema) -> ExtractedRecord {
    let normalized;
    let lines: Vec<&str> = match schema.line_split() {
        LineSplitMode::Raw => text.split('\n').map(str::trim).collect(),
        LineSplitMode::Normalized => {
            normalized = normalize(text);
            vec![normalized.as_str()]
        }
    };

    let mut record = ExtractedRecord::with_fields(schema.fields());
    for index in 0..lines.len() {
        apply_rules(schema, &lines, index, &mut record);
    }

    tracing::debug!(
        schema = schema.name(),
        lines = lines.len(),
        matched = record.matched(),
        "extraction finished"
    );
    record
}

/// Evaluate rules against `lines[index]`; at most one rule takes the line.
fn apply_rules(schema: &ExtractionSchema, lines: &[&str], index: usize, record: &mut ExtractedRecord) {
    let line = lines[index];
    for rule in schema.rules() {
        if record.is_set(rule.field()) {
            continue;
        }
        let Some(value) = rule.match_line(line) else {
            continue;
        };
        let value = match rule.continuation_rule() {
            Some(cont) => append_continuation(cont, value, &lines[index + 1..], record),
            None => value,
        };
        record.set_if_absent(rule.field(), value);
        return;
    }
}

/// Extend `head` with following lines while they match; sub-fields are filled
/// from each accepted line as a side effect.
fn append_continuation(
    cont: &Continuation,
    head: String,
    following: &[&str],
    record: &mut ExtractedRecord,
) -> String {
    let limit = cont.max_lines().unwrap_or(usize::MAX);
    let mut value = head;
    for line in following.iter().take(limit) {
        let Some(m) = cont.pattern().find(line) else {
            break;
        };
        value.push(' ');
        value.push_str(m.as_str().trim());

        for sub in cont.sub_fields() {
            if record.is_set(&sub.field) {
                continue;
            }
            if let Some(v) = sub.capture.apply(line) {
                record.set_if_absent(&sub.field, v);
            }
        }
    }
    value
}
