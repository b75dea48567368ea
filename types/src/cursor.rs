// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resumable cursors for the streaming dispatch methods.
//!
//! A cursor is an ordered sequence of opaque section strings mirroring the
//! producing resolver's recursion: the head section positions the outermost
//! level, the tail positions the levels below it. Clients treat the whole
//! thing as an opaque token. The embedded `dispatch_version` is bumped
//! whenever the encoding shape changes; a cursor carrying a different
//! version is treated as absent (the stream restarts) rather than an error.

use crate::error::Error;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// Version of the cursor section grammar currently produced.
pub const DISPATCH_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Cursor {
    pub dispatch_version: u32,
    pub sections: Vec<String>,
}

impl Cursor {
    /// An empty cursor at the current dispatch version: the position before
    /// the first result.
    pub fn start() -> Cursor {
        Cursor { dispatch_version: DISPATCH_VERSION, sections: Vec::new() }
    }

    pub fn at(sections: Vec<String>) -> Cursor {
        Cursor { dispatch_version: DISPATCH_VERSION, sections }
    }

    /// Whether this cursor was produced by the running dispatch version.
    /// Mismatched cursors are ignored, restarting the stream.
    pub fn is_current(&self) -> bool {
        self.dispatch_version == DISPATCH_VERSION
    }

    /// The head section, if any: the position at the outermost resolver
    /// level.
    pub fn head(&self) -> Option<&str> {
        self.sections.first().map(String::as_str)
    }

    /// The cursor one recursion level down: everything below the head.
    pub fn tail(&self) -> Cursor {
        Cursor {
            dispatch_version: self.dispatch_version,
            sections: self.sections.iter().skip(1).cloned().collect(),
        }
    }

    /// Stacks `section` on top, producing the cursor as seen one recursion
    /// level up.
    pub fn pushed(&self, section: impl Into<String>) -> Cursor {
        let mut sections = Vec::with_capacity(self.sections.len() + 1);
        sections.push(section.into());
        sections.extend(self.sections.iter().cloned());
        Cursor { dispatch_version: self.dispatch_version, sections }
    }

    /// Serializes to the opaque token handed to clients.
    pub fn encode(&self) -> String {
        // Serialization of this struct cannot fail.
        let json = serde_json::to_vec(self).expect("cursor serializes");
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decodes a client-provided token. A structurally invalid token is an
    /// `InvalidArgument`; a valid token from another dispatch version is
    /// returned as `None` (treat as absent).
    pub fn decode(token: &str) -> Result<Option<Cursor>, Error> {
        let bad = || Error::InvalidArgument {
            message: String::from("malformed cursor token"),
        };
        let bytes = URL_SAFE_NO_PAD.decode(token).map_err(|_| bad())?;
        let cursor: Cursor =
            serde_json::from_slice(&bytes).map_err(|_| bad())?;
        if cursor.is_current() { Ok(Some(cursor)) } else { Ok(None) }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let cursor = Cursor::at(vec![
            String::from("2"),
            String::from("direct:doc17"),
        ]);
        let decoded = Cursor::decode(&cursor.encode()).unwrap().unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn test_stale_version_treated_as_absent() {
        let cursor = Cursor {
            dispatch_version: DISPATCH_VERSION + 1,
            sections: vec![String::from("0")],
        };
        assert_eq!(Cursor::decode(&cursor.encode()).unwrap(), None);
    }

    #[test]
    fn test_garbage_token_rejected() {
        assert!(Cursor::decode("!!!not-base64!!!").is_err());
        let not_json = URL_SAFE_NO_PAD.encode(b"plainly not json");
        assert!(Cursor::decode(&not_json).is_err());
    }

    #[test]
    fn test_push_and_tail_mirror_recursion() {
        let child = Cursor::at(vec![String::from("5")]);
        let parent = child.pushed("1");
        assert_eq!(parent.head(), Some("1"));
        assert_eq!(parent.tail(), child);
    }
}
