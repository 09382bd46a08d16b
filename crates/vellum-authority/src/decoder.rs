use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use vellum_types::{MediaId, MediaType};

use crate::error::{AuthorityError, AuthorityResult};

/// What a decoder knows about the buffer it decodes.
#[derive(Clone, Debug, Default)]
pub struct DecodeContext {
    pub media_id: Option<MediaId>,
    pub name: Option<String>,
    pub media_type: Option<MediaType>,
}

/// Turns raw media bytes into a native value.
pub trait Decoder: Send + Sync {
    /// Stable name, used as the memoization key for decoded content.
    fn name(&self) -> &str;

    fn decode(&self, bytes: &[u8], ctx: &DecodeContext) -> AuthorityResult<Value>;
}

/// UTF-8 text, decoded to a JSON string.
#[derive(Clone, Copy, Debug, Default)]
pub struct TextDecoder;

impl Decoder for TextDecoder {
    fn name(&self) -> &str {
        "text"
    }

    fn decode(&self, bytes: &[u8], _ctx: &DecodeContext) -> AuthorityResult<Value> {
        let text = std::str::from_utf8(bytes).map_err(|e| AuthorityError::Decode {
            decoder: self.name().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Value::String(text.to_string()))
    }
}

/// JSON documents.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonDecoder;

impl Decoder for JsonDecoder {
    fn name(&self) -> &str {
        "json"
    }

    fn decode(&self, bytes: &[u8], _ctx: &DecodeContext) -> AuthorityResult<Value> {
        serde_json::from_slice(bytes).map_err(|e| AuthorityError::Decode {
            decoder: self.name().to_string(),
            reason: e.to_string(),
        })
    }
}

/// Registry of decoders keyed by `(type, subtype)`.
///
/// Lookup tries the exact pair, then `(type, "")`, then `("", subtype)`,
/// then `("", "")`, and finally asks the parent registry.
#[derive(Clone, Default)]
pub struct DecoderArray {
    decoders: HashMap<(String, String), Arc<dyn Decoder>>,
    parent: Option<Arc<DecoderArray>>,
}

impl DecoderArray {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty registry that falls back to `parent`.
    pub fn with_parent(parent: Arc<DecoderArray>) -> Self {
        Self {
            decoders: HashMap::new(),
            parent: Some(parent),
        }
    }

    /// Registry preloaded with the built-in text and JSON decoders.
    pub fn with_builtins() -> Self {
        let mut array = Self::new();
        array.register("text", "", Arc::new(TextDecoder));
        array.register("application", "json", Arc::new(JsonDecoder));
        array.register("", "json", Arc::new(JsonDecoder));
        array
    }

    /// Register `decoder` for `(type_name, subtype)`; an empty string is a
    /// wildcard. Replaces any decoder registered for the same pair.
    pub fn register(
        &mut self,
        type_name: impl Into<String>,
        subtype: impl Into<String>,
        decoder: Arc<dyn Decoder>,
    ) -> &mut Self {
        self.decoders.insert((type_name.into(), subtype.into()), decoder);
        self
    }

    pub fn find(&self, media_type: &MediaType) -> Option<Arc<dyn Decoder>> {
        let candidates = [
            (media_type.type_name.as_str(), media_type.subtype.as_str()),
            (media_type.type_name.as_str(), ""),
            ("", media_type.subtype.as_str()),
            ("", ""),
        ];
        for (type_name, subtype) in candidates {
            if let Some(decoder) = self.decoders.get(&(type_name.to_string(), subtype.to_string())) {
                return Some(Arc::clone(decoder));
            }
        }
        self.parent.as_ref().and_then(|parent| parent.find(media_type))
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl fmt::Debug for DecoderArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self
            .decoders
            .keys()
            .map(|(t, s)| format!("{t}/{s}"))
            .collect();
        keys.sort();
        f.debug_struct("DecoderArray")
            .field("decoders", &keys)
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Decoder for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn decode(&self, _bytes: &[u8], _ctx: &DecodeContext) -> AuthorityResult<Value> {
            Ok(Value::String(self.0.to_string()))
        }
    }

    fn found(array: &DecoderArray, t: &str, s: &str) -> Option<String> {
        array
            .find(&MediaType::new(t, s))
            .map(|decoder| decoder.name().to_string())
    }

    #[test]
    fn lookup_order_is_exact_then_type_then_subtype_then_any() {
        let mut array = DecoderArray::new();
        array
            .register("image", "png", Arc::new(Named("png")))
            .register("image", "", Arc::new(Named("image")))
            .register("", "svg", Arc::new(Named("svg")))
            .register("", "", Arc::new(Named("any")));

        assert_eq!(found(&array, "image", "png").as_deref(), Some("png"));
        assert_eq!(found(&array, "image", "svg").as_deref(), Some("image"));
        assert_eq!(found(&array, "text", "svg").as_deref(), Some("svg"));
        assert_eq!(found(&array, "audio", "ogg").as_deref(), Some("any"));
    }

    #[test]
    fn falls_back_to_parent() {
        let parent = Arc::new(DecoderArray::with_builtins());
        let mut child = DecoderArray::with_parent(parent);
        child.register("image", "", Arc::new(Named("image")));

        assert_eq!(found(&child, "text", "plain").as_deref(), Some("text"));
        assert_eq!(found(&child, "image", "gif").as_deref(), Some("image"));
        assert_eq!(found(&child, "video", "mp4"), None);
    }

    #[test]
    fn builtins_decode() {
        let ctx = DecodeContext::default();
        assert_eq!(TextDecoder.decode(b"hi", &ctx).unwrap(), Value::String("hi".into()));
        assert_eq!(
            JsonDecoder.decode(br#"{"a":1}"#, &ctx).unwrap(),
            serde_json::json!({ "a": 1 })
        );
        assert!(matches!(
            TextDecoder.decode(&[0xff, 0xfe], &ctx),
            Err(AuthorityError::Decode { .. })
        ));
    }
}
