//! Document identifiers.
//!
//! A doc id is an opaque string of characters from `[-=_A-Za-z0-9~%]`. It
//! may be a composite URL id carrying up to four fields:
//!
//! ```text
//! trunk                      plain document
//! trunk~fork                 fork of trunk
//! trunk~fork~17              fork owned by user 17
//! trunk~fork~17~v=<id>       historical snapshot of that fork
//! ```
//!
//! The snapshot segment is tagged and percent-encoded because remote version
//! ids are free-form; the other segments are positional. `parse` and
//! `to_url_id` round-trip canonically.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::error::{Error, Result};

/// Trunk id used when forking a document that does not exist yet.
pub const NEW_DOCUMENT_CODE: &str = "new";

/// Characters escaped inside a snapshot segment. Everything outside the doc
/// id character class must be encoded; `-` and `_` are legal as-is.
const SNAPSHOT_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

/// Tag prefix of a snapshot segment.
const SNAPSHOT_TAG: &str = "v=";

/// Check a doc id against the legal character class, without parsing it.
pub fn validate_doc_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidDocId("empty".to_string()));
    }
    for c in id.chars() {
        if !(c.is_ascii_alphanumeric() || matches!(c, '-' | '=' | '_' | '~' | '%')) {
            return Err(Error::InvalidDocId(format!("illegal character {c:?} in {id}")));
        }
    }
    Ok(())
}

/// The fields of a composite URL id. Ids differing only in `snapshot_id`
/// refer to the same underlying object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocIdParts {
    pub trunk_id: String,
    pub fork_id: Option<String>,
    pub fork_user_id: Option<i64>,
    pub snapshot_id: Option<String>,
}

impl DocIdParts {
    /// Parse a doc id into its fields. Fails eagerly on the character class
    /// so no path or key is ever formed from a malformed id.
    pub fn parse(id: &str) -> Result<Self> {
        validate_doc_id(id)?;

        let mut trunk_id = None;
        let mut fork_id = None;
        let mut fork_user_id = None;
        let mut snapshot_id: Option<String> = None;

        for segment in id.split('~') {
            if segment.is_empty() {
                return Err(Error::InvalidDocId(format!("empty segment in {id}")));
            }
            if snapshot_id.is_some() {
                return Err(Error::InvalidDocId(format!(
                    "segment after snapshot in {id}"
                )));
            }
            if let Some(encoded) = segment.strip_prefix(SNAPSHOT_TAG) {
                if trunk_id.is_none() {
                    return Err(Error::InvalidDocId(format!("snapshot with no trunk: {id}")));
                }
                let decoded = percent_decode_str(encoded)
                    .decode_utf8()
                    .map_err(|e| Error::InvalidDocId(format!("bad snapshot id in {id}: {e}")))?;
                snapshot_id = Some(decoded.into_owned());
            } else if trunk_id.is_none() {
                trunk_id = Some(segment.to_string());
            } else if fork_id.is_none() {
                fork_id = Some(segment.to_string());
            } else if fork_user_id.is_none() {
                let user = segment.parse::<i64>().map_err(|_| {
                    Error::InvalidDocId(format!("fork user segment not numeric in {id}"))
                })?;
                fork_user_id = Some(user);
            } else {
                return Err(Error::InvalidDocId(format!("too many segments in {id}")));
            }
        }

        Ok(Self {
            trunk_id: trunk_id.ok_or_else(|| Error::InvalidDocId("empty".to_string()))?,
            fork_id,
            fork_user_id,
            snapshot_id,
        })
    }

    /// Build the canonical URL id for these fields.
    pub fn to_url_id(&self) -> String {
        let mut out = self.trunk_id.clone();
        if let Some(fork) = &self.fork_id {
            out.push('~');
            out.push_str(fork);
        }
        if let Some(user) = self.fork_user_id {
            out.push('~');
            out.push_str(&user.to_string());
        }
        if let Some(snapshot) = &self.snapshot_id {
            out.push('~');
            out.push_str(SNAPSHOT_TAG);
            out.push_str(&utf8_percent_encode(snapshot, SNAPSHOT_ESCAPE).to_string());
        }
        out
    }

    /// The same id with any snapshot component removed. Remote objects are
    /// keyed by this form; snapshots are native object versions.
    pub fn without_snapshot(&self) -> String {
        Self {
            snapshot_id: None,
            ..self.clone()
        }
        .to_url_id()
    }

    /// Derive the id of a given snapshot of this document.
    pub fn at_snapshot(&self, snapshot_id: &str) -> String {
        Self {
            snapshot_id: Some(snapshot_id.to_string()),
            ..self.clone()
        }
        .to_url_id()
    }

    /// True when this id addresses an immutable historical version.
    pub fn is_snapshot(&self) -> bool {
        self.snapshot_id.is_some()
    }

    /// True when this id addresses a fork of a trunk document.
    pub fn is_fork(&self) -> bool {
        self.fork_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_id() {
        let parts = DocIdParts::parse("abc123").unwrap();
        assert_eq!(parts.trunk_id, "abc123");
        assert!(parts.fork_id.is_none());
        assert!(!parts.is_snapshot());
        assert_eq!(parts.to_url_id(), "abc123");
    }

    #[test]
    fn test_fork_roundtrip() {
        for id in ["abc~f1", "abc~f1~42", "abc~f1~42~v=ver-1"] {
            let parts = DocIdParts::parse(id).unwrap();
            assert_eq!(parts.to_url_id(), id);
        }
        let parts = DocIdParts::parse("abc~f1~42").unwrap();
        assert_eq!(parts.fork_id.as_deref(), Some("f1"));
        assert_eq!(parts.fork_user_id, Some(42));
    }

    #[test]
    fn test_snapshot_percent_roundtrip() {
        // S3 version ids may contain dots and other characters outside the
        // doc id class; they must survive the encode/decode round-trip.
        let parts = DocIdParts {
            trunk_id: "doc".to_string(),
            fork_id: None,
            fork_user_id: None,
            snapshot_id: Some("ver.1+x/y".to_string()),
        };
        let id = parts.to_url_id();
        validate_doc_id(&id).unwrap();
        assert_eq!(DocIdParts::parse(&id).unwrap(), parts);
    }

    #[test]
    fn test_without_snapshot() {
        let parts = DocIdParts::parse("abc~f1~v=snap").unwrap();
        assert_eq!(parts.without_snapshot(), "abc~f1");
        assert_eq!(parts.at_snapshot("other"), "abc~f1~v=other");
    }

    #[test]
    fn test_rejects_illegal_characters() {
        for id in ["", "a/b", "a b", "../../etc", "a\nb", "a.b"] {
            assert!(DocIdParts::parse(id).is_err(), "should reject {id:?}");
        }
    }

    #[test]
    fn test_rejects_malformed_composites() {
        assert!(DocIdParts::parse("a~~b").is_err());
        assert!(DocIdParts::parse("a~f~notanumber").is_err());
        assert!(DocIdParts::parse("a~f~1~v=s~extra").is_err());
        assert!(DocIdParts::parse("v=snap").is_err());
    }
}
