//! Consumer request body representation
//!
//! Bodies are read once by the pipeline and carried as text or raw bytes
//! depending on the endpoint's transform mode. Read failures degrade to
//! `Empty` rather than failing the request.

use bytes::Bytes;

/// The consumer request body as read by the pipeline
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    /// No body, or the body could not be read
    #[default]
    Empty,
    /// UTF-8 text body (lossy-decoded)
    Text(String),
    /// Raw bytes for `binary` transform endpoints
    Binary(Bytes),
}

impl RequestBody {
    pub fn len(&self) -> u64 {
        match self {
            RequestBody::Empty => 0,
            RequestBody::Text(text) => text.len() as u64,
            RequestBody::Binary(bytes) => bytes.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, RequestBody::Binary(_))
    }

    /// The text content, when this is a text body
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RequestBody::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Body content as bytes for hashing and forwarding
    pub fn to_bytes(&self) -> Bytes {
        match self {
            RequestBody::Empty => Bytes::new(),
            RequestBody::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
            RequestBody::Binary(bytes) => bytes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_and_emptiness() {
        assert_eq!(RequestBody::Empty.len(), 0);
        assert!(RequestBody::Empty.is_empty());
        assert_eq!(RequestBody::Text("abc".into()).len(), 3);
        assert_eq!(RequestBody::Binary(Bytes::from_static(b"1234")).len(), 4);
        assert!(!RequestBody::Binary(Bytes::from_static(b"1")).is_empty());
    }

    #[test]
    fn text_accessor() {
        assert_eq!(RequestBody::Text("x".into()).as_text(), Some("x"));
        assert_eq!(RequestBody::Binary(Bytes::new()).as_text(), None);
        assert_eq!(RequestBody::Empty.as_text(), None);
    }
}
