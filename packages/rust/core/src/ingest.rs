//! Entry ingestion: validate, assign identity, store.
//!
//! Storing the entry is all ingestion does; the insert trigger puts it on the
//! change feed. Rejected payloads never reach the store.

use serde_json::Value;
use tracing::{info, instrument};

use moood_shared::{Entry, MooodError, Result};
use moood_storage::Storage;

/// Extract the entry text from a request body.
///
/// Accepts the plain `{ "entry": "..." }` form and the JSON:API resource form
/// `{ "data": { "type": "entry", "attributes": { "entry": "..." } } }`.
pub fn parse_entry_payload(body: &Value) -> Result<String> {
    let Some(object) = body.as_object() else {
        return Err(MooodError::malformed("request body must be a JSON object"));
    };

    let fields = match object.get("data") {
        Some(Value::Object(resource)) if !object.contains_key("entry") => {
            match resource.get("type") {
                None => {}
                Some(Value::String(kind)) if kind == "entry" => {}
                Some(other) => {
                    return Err(MooodError::malformed(format!(
                        "resource type must be \"entry\", got {other}"
                    )));
                }
            }
            match resource.get("attributes") {
                Some(Value::Object(attributes)) => attributes,
                _ => return Err(MooodError::malformed("missing `data.attributes` object")),
            }
        }
        _ => object,
    };

    match fields.get("entry") {
        None | Some(Value::Null) => Err(MooodError::malformed("missing `entry` field")),
        Some(Value::String(text)) => {
            validate_entry_text(text)?;
            Ok(text.clone())
        }
        Some(_) => Err(MooodError::malformed("`entry` must be a string")),
    }
}

/// Entry text must be at least one character long.
pub fn validate_entry_text(text: &str) -> Result<()> {
    if text.is_empty() {
        return Err(MooodError::malformed("`entry` must not be empty"));
    }
    Ok(())
}

/// Store a new entry with a fresh id and creation time.
#[instrument(skip_all, fields(len = text.len()))]
pub async fn ingest(storage: &Storage, text: &str) -> Result<Entry> {
    validate_entry_text(text)?;

    let entry = Entry::new(text);
    storage.insert_entry(&entry).await?;

    info!(entry_id = %entry.id, "entry ingested");
    Ok(entry)
}
