//! Deterministic result ids shared by `search` and `fetch`.
//!
//! An id has the shape `<kind>-<fragment>-<tail>`. The fragment is a
//! sanitized piece of the item's name so ids stay readable, and the tail
//! either hashes the item's identity (when the adapter can rescan its source)
//! or encodes it (when the adapter must address the item directly).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

const MAX_FRAGMENT_CHARS: usize = 32;
const HASH_HEX_CHARS: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedId<'a> {
    pub kind: &'a str,
    pub fragment: &'a str,
    pub tail: &'a str,
}

pub fn sanitize_fragment(name: &str) -> String {
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    };

    let mut fragment = String::with_capacity(stem.len());
    for ch in stem.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            fragment.push(ch);
        } else if !fragment.ends_with('_') {
            fragment.push('_');
        }
    }

    let fragment: String = fragment
        .trim_matches('_')
        .chars()
        .take(MAX_FRAGMENT_CHARS)
        .collect();
    if fragment.is_empty() {
        "item".to_string()
    } else {
        fragment
    }
}

pub fn identity_hash(identity: &str) -> String {
    let digest = Sha256::digest(identity.as_bytes());
    digest
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>()
        .chars()
        .take(HASH_HEX_CHARS)
        .collect()
}

/// Id whose tail is a hash of `identity`; resolving it requires rescanning.
pub fn hashed_id(kind: &str, name: &str, identity: &str) -> String {
    format!("{kind}-{}-{}", sanitize_fragment(name), identity_hash(identity))
}

/// Id whose tail carries `identity` itself, base64url encoded.
pub fn encoded_id(kind: &str, name: &str, identity: &str) -> String {
    format!(
        "{kind}-{}-{}",
        sanitize_fragment(name),
        URL_SAFE_NO_PAD.encode(identity.as_bytes())
    )
}

pub fn parse_id(id: &str) -> Option<ParsedId<'_>> {
    let (kind, rest) = id.split_once('-')?;
    let (fragment, tail) = rest.split_once('-')?;
    let well_formed = !kind.is_empty()
        && kind.chars().all(|ch| ch.is_ascii_lowercase())
        && !fragment.is_empty()
        && !tail.is_empty();
    well_formed.then_some(ParsedId {
        kind,
        fragment,
        tail,
    })
}

pub fn decode_identity(parsed: &ParsedId<'_>) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(parsed.tail.as_bytes()).ok()?;
    String::from_utf8(bytes).ok()
}
