//! Type-tagged payloads.
//!
//! Records are redispatched long after the value that created them went out
//! of scope, so the payload is stored as a type tag plus JSON. Decoding checks
//! the tag before touching the data.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{RecordError, Result};

/// A value that can be stored in a record payload.
///
/// The tag is the stable discriminator persisted next to the data. It must
/// stay the same across deployments for records to remain decodable.
pub trait PayloadType: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE_TAG: &'static str;
}

impl PayloadType for () {
    const TYPE_TAG: &'static str = "unit";
}

impl PayloadType for String {
    const TYPE_TAG: &'static str = "string";
}

impl PayloadType for serde_json::Value {
    const TYPE_TAG: &'static str = "json";
}

/// Serialized value plus its type tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub type_tag: String,
    pub data: serde_json::Value,
}

impl Payload {
    /// Creates a payload from an already-serialized value.
    pub fn raw(type_tag: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            type_tag: type_tag.into(),
            data,
        }
    }

    /// Serializes `value` under its type tag.
    pub fn encode<T: PayloadType>(value: &T) -> Result<Self> {
        Ok(Self {
            type_tag: T::TYPE_TAG.to_string(),
            data: serde_json::to_value(value)?,
        })
    }

    /// Deserializes the payload as `T`, rejecting a foreign type tag.
    pub fn decode<T: PayloadType>(&self) -> Result<T> {
        if !self.is::<T>() {
            return Err(RecordError::TypeMismatch {
                expected: T::TYPE_TAG.to_string(),
                actual: self.type_tag.clone(),
            });
        }
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Returns true if the payload was stored as `T`.
    pub fn is<T: PayloadType>(&self) -> bool {
        self.type_tag == T::TYPE_TAG
    }

    pub fn unit() -> Self {
        Self::raw(<() as PayloadType>::TYPE_TAG, serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct SendEmail {
        to: String,
    }

    impl PayloadType for SendEmail {
        const TYPE_TAG: &'static str = "send_email";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Refund {
        amount: u64,
    }

    impl PayloadType for Refund {
        const TYPE_TAG: &'static str = "refund";
    }

    #[test]
    fn test_encode_keeps_tag() {
        let payload = Payload::encode(&SendEmail {
            to: "a@example.com".into(),
        })
        .unwrap();
        assert_eq!(payload.type_tag, "send_email");
        assert_eq!(payload.data["to"], "a@example.com");
        assert!(payload.is::<SendEmail>());
    }

    #[test]
    fn test_decode_rejects_foreign_tag() {
        let payload = Payload::encode(&Refund { amount: 10 }).unwrap();
        let err = payload.decode::<SendEmail>().unwrap_err();
        assert!(matches!(
            err,
            RecordError::TypeMismatch { ref expected, ref actual }
                if expected == "send_email" && actual == "refund"
        ));
    }

    #[test]
    fn test_decode_reports_bad_data() {
        let payload = Payload::raw("send_email", serde_json::json!({"to": 42}));
        assert!(matches!(
            payload.decode::<SendEmail>(),
            Err(RecordError::Serialization(_))
        ));
    }

    #[test]
    fn test_unit_payload() {
        let payload = Payload::unit();
        payload.decode::<()>().unwrap();
    }
}
