use crate::HttpError;

/// Upper bound on the stored key/value bytes of one header block.
const MAX_HEADER_SIZE: usize = 4096;

/// An HTTP header block.
///
/// Keys compare case-insensitively; insertion order is preserved on
/// output. The block is bounded at 4 KiB of key/value data, matching the
/// parser's limit on inbound messages.
#[derive(Clone, Debug, Default)]
pub struct MessageHeader {
    fields: Vec<(String, String)>,
    size: usize,
}

impl MessageHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Adds a field, failing when the block would exceed its capacity.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<(), HttpError> {
        let key = key.into();
        let value = value.into();
        let added = key.len() + value.len() + 2;
        if self.size + added > MAX_HEADER_SIZE {
            return Err(HttpError::HeaderTooLarge);
        }
        self.size += added;
        self.fields.push((key, value));
        Ok(())
    }

    /// Replaces a field if present, adds it otherwise.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<(), HttpError> {
        let value = value.into();
        if let Some(field) = self.fields.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
            self.size -= field.1.len();
            self.size += value.len();
            field.1 = value;
            Ok(())
        } else {
            self.add(key.to_string(), value)
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.fields.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        self.size = self.fields.iter().map(|(k, v)| k.len() + v.len() + 2).sum();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn clear(&mut self) {
        self.fields.clear();
        self.size = 0;
    }

    // derived accessors

    pub fn content_length(&self) -> Option<u64> {
        self.get("Content-Length").and_then(|v| v.trim().parse().ok())
    }

    pub fn chunked(&self) -> bool {
        self.get("Transfer-Encoding")
            .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")))
    }

    /// Keep-alive negotiation: HTTP/1.1 defaults to keep-alive unless the
    /// peer says `close`; HTTP/1.0 requires an explicit `keep-alive`.
    pub fn keep_alive(&self, version: (u8, u8)) -> bool {
        match self.get("Connection") {
            Some(v) if v.trim().eq_ignore_ascii_case("close") => false,
            Some(v) if v.trim().eq_ignore_ascii_case("keep-alive") => true,
            _ => version >= (1, 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_lookup() {
        let mut h = MessageHeader::new();
        h.add("Content-Type", "text/plain").unwrap();
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(h.get("Content-Length"), None);
    }

    #[test]
    fn set_replaces() {
        let mut h = MessageHeader::new();
        h.add("X", "1").unwrap();
        h.set("x", "2").unwrap();
        assert_eq!(h.get("X"), Some("2"));
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn capacity_is_bounded() {
        let mut h = MessageHeader::new();
        let big = "v".repeat(4000);
        h.add("a", big).unwrap();
        assert!(matches!(h.add("b", "v".repeat(200)), Err(HttpError::HeaderTooLarge)));
    }

    #[test]
    fn derived_accessors() {
        let mut h = MessageHeader::new();
        h.add("Content-Length", "42").unwrap();
        h.add("Transfer-Encoding", "chunked").unwrap();
        assert_eq!(h.content_length(), Some(42));
        assert!(h.chunked());
    }

    #[test]
    fn keep_alive_defaults() {
        let h = MessageHeader::new();
        assert!(h.keep_alive((1, 1)));
        assert!(!h.keep_alive((1, 0)));

        let mut h = MessageHeader::new();
        h.add("Connection", "close").unwrap();
        assert!(!h.keep_alive((1, 1)));

        let mut h = MessageHeader::new();
        h.add("Connection", "Keep-Alive").unwrap();
        assert!(h.keep_alive((1, 0)));
    }
}
