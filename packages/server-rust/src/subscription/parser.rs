//! Subscription payload parsing.
//!
//! A source supplies a JSON document: either a top-level array of outbound
//! option objects, or an object with an `outbounds` array (the common feed
//! envelope). The `tag` field is a label, not identity: it is stripped
//! before the entry is canonically re-encoded (sorted object keys) and
//! hashed, and rides the subscription→node link instead. Relabeling a node
//! therefore keeps its hash, health state, and leases, and reconciles as a
//! tag update. Entry order is preserved; duplicate hashes keep the first
//! entry and merge tags.

use serde_json::Value;

use resin_core::{canonical_options, node_hash, Error, Result};

/// One outbound spec extracted from a subscription payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedOutbound {
    /// Content hash of `raw_options`; the node identity.
    pub hash: String,
    /// Canonical tag-free encoding, preserved verbatim from here on.
    pub raw_options: Vec<u8>,
    pub tags: Vec<String>,
}

/// Parses a payload into the ordered outbound list.
///
/// # Errors
///
/// `InvalidArgument` when the payload is not JSON or has neither a top-level
/// array nor an `outbounds` array.
pub fn parse_outbounds(payload: &[u8]) -> Result<Vec<ParsedOutbound>> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| Error::invalid(format!("subscription payload is not valid JSON: {e}")))?;

    let entries = match value {
        Value::Array(entries) => entries,
        Value::Object(mut object) => match object.remove("outbounds") {
            Some(Value::Array(entries)) => entries,
            Some(_) => {
                return Err(Error::invalid(
                    "subscription payload field \"outbounds\" is not an array",
                ))
            }
            None => {
                return Err(Error::invalid(
                    "subscription payload has no \"outbounds\" array",
                ))
            }
        },
        _ => {
            return Err(Error::invalid(
                "subscription payload must be a JSON array or object",
            ))
        }
    };

    let mut parsed: Vec<ParsedOutbound> = Vec::with_capacity(entries.len());
    for entry in entries {
        let Value::Object(mut object) = entry else {
            // Tolerate stray scalars in third-party feeds.
            continue;
        };

        // The label leaves the options before hashing; non-string tags are
        // dropped with it.
        let tag = match object.remove("tag") {
            Some(Value::String(tag)) => Some(tag),
            _ => None,
        };

        let stripped = Value::Object(object);
        let raw_options = canonical_options(&stripped)
            .map_err(|e| Error::invalid(format!("unencodable outbound entry: {e}")))?;
        let hash = node_hash(&raw_options);

        if let Some(existing) = parsed.iter_mut().find(|p| p.hash == hash) {
            if let Some(tag) = tag {
                if !existing.tags.contains(&tag) {
                    existing.tags.push(tag);
                }
            }
            continue;
        }

        parsed.push(ParsedOutbound {
            hash,
            raw_options,
            tags: tag.into_iter().collect(),
        });
    }

    Ok(parsed)
}
