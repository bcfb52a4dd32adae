//! Storage-safe identifiers.
//!
//! Filenames become table names by keeping ASCII letters and digits and
//! replacing every other character, underscore included, with
//! `_<hex codepoint>_`. Because a literal `_` never survives encoding, every
//! underscore in an encoded string opens or closes an escape and decoding is
//! unambiguous.

use base64::{Engine as _, engine::general_purpose::STANDARD};

use crate::errors::IdentifierError;

const PROJECT_PREFIX: &str = "Project:";

pub fn encode(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            encoded.push(ch);
        } else {
            encoded.push('_');
            encoded.push_str(&format!("{:x}", ch as u32));
            encoded.push('_');
        }
    }
    encoded
}

/// Inverse of [`encode`]. Only canonical encodings are accepted, so
/// `encode(decode(s)?) == s` whenever decoding succeeds.
pub fn decode(encoded: &str) -> Result<String, IdentifierError> {
    let mut decoded = String::with_capacity(encoded.len());
    let mut chars = encoded.char_indices();

    while let Some((offset, ch)) = chars.next() {
        if ch.is_ascii_alphanumeric() {
            decoded.push(ch);
            continue;
        }
        if ch != '_' {
            return Err(IdentifierError::UnexpectedCharacter { found: ch, offset });
        }

        let mut hex = String::new();
        let mut closed = false;
        for (_, next) in chars.by_ref() {
            if next == '_' {
                closed = true;
                break;
            }
            hex.push(next);
        }
        if !closed {
            return Err(IdentifierError::UnterminatedEscape {
                input: encoded.to_string(),
                offset,
            });
        }
        decoded.push(decode_escape(&hex)?);
    }

    Ok(decoded)
}

fn decode_escape(hex: &str) -> Result<char, IdentifierError> {
    let invalid = || IdentifierError::InvalidEscape {
        sequence: format!("_{}_", hex),
    };

    let canonical = !hex.is_empty()
        && hex.len() <= 6
        && !(hex.len() > 1 && hex.starts_with('0'))
        && hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'));
    if !canonical {
        return Err(invalid());
    }

    let codepoint = u32::from_str_radix(hex, 16).map_err(|_| invalid())?;
    match char::from_u32(codepoint) {
        Some(ch) if !ch.is_ascii_alphanumeric() => Ok(ch),
        _ => Err(invalid()),
    }
}

/// Project ids handed out by the file API are base64 of `Project:<uuid>`.
pub fn project_id_to_uuid(project_id: &str) -> Result<String, IdentifierError> {
    let bytes = STANDARD
        .decode(project_id)
        .map_err(|e| IdentifierError::InvalidProjectId {
            reason: e.to_string(),
        })?;
    let text = String::from_utf8(bytes).map_err(|e| IdentifierError::InvalidProjectId {
        reason: e.to_string(),
    })?;

    let uuid = text.rsplit(PROJECT_PREFIX).next().unwrap_or_default();
    if uuid.is_empty() {
        return Err(IdentifierError::InvalidProjectId {
            reason: "empty project uuid".to_string(),
        });
    }
    // The uuid names a database file, so it has to be path-safe.
    if !uuid.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(IdentifierError::InvalidProjectId {
            reason: format!("unexpected characters in {:?}", uuid),
        });
    }
    Ok(uuid.to_string())
}

pub fn project_uuid_to_id(project_uuid: &str) -> String {
    STANDARD.encode(format!("{}{}", PROJECT_PREFIX, project_uuid))
}
