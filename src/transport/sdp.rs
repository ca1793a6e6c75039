//! Service discovery record attributes advertised by the companion device.
//!
//! Each attribute value starts with a type byte: the attribute type in the
//! high 5 bits and the size descriptor in the low 3 bits.
//!
//! | Attribute    | Id       | Type byte | Payload                      |
//! |--------------|----------|-----------|------------------------------|
//! | service name | `0x0100` | `0x25`    | 1-byte length, UTF-8 text    |
//! | version      | `0x0300` | `0x0A`    | big-endian `u32`             |

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::TransportError;

/// Service name attribute id
pub const SERVICE_NAME_ATTRIBUTE_ID: u16 = 0x0100;

/// Text string, 1-byte length
pub const SERVICE_NAME_ATTRIBUTE_TYPE: u8 = (4 << 3) | 5;

/// Service name the companion app advertises
pub const SERVICE_NAME: &str = "btProximity";

/// Service version attribute id
pub const SERVICE_VERSION_ATTRIBUTE_ID: u16 = 0x0300;

/// Unsigned integer, 4 bytes
pub const SERVICE_VERSION_ATTRIBUTE_TYPE: u8 = 0x0A;

/// Raw attributes of one advertised service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceRecord {
    attributes: BTreeMap<u16, Bytes>,
}

/// What a validated record tells us about the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Advertised service name
    pub name: String,
    /// Advertised version, when present
    pub version: Option<u32>,
}

impl ServiceRecord {
    /// Empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Record advertising `name` and optionally `version`, encoded the way
    /// the companion app publishes them.
    pub fn for_service(name: &str, version: Option<u32>) -> Self {
        let name = name.as_bytes();
        let len = name.len().min(usize::from(u8::MAX));

        let mut value = BytesMut::with_capacity(2 + len);
        value.put_u8(SERVICE_NAME_ATTRIBUTE_TYPE);
        value.put_u8(len as u8);
        value.put_slice(&name[..len]);

        let mut record = Self::new().with_attribute(SERVICE_NAME_ATTRIBUTE_ID, value.freeze());
        if let Some(version) = version {
            let mut value = BytesMut::with_capacity(5);
            value.put_u8(SERVICE_VERSION_ATTRIBUTE_TYPE);
            value.put_u32(version);
            record = record.with_attribute(SERVICE_VERSION_ATTRIBUTE_ID, value.freeze());
        }
        record
    }

    /// Add or replace a raw attribute
    pub fn with_attribute(mut self, id: u16, value: impl Into<Bytes>) -> Self {
        self.attributes.insert(id, value.into());
        self
    }

    /// Raw attribute value
    pub fn attribute(&self, id: u16) -> Option<&Bytes> {
        self.attributes.get(&id)
    }

    /// Decode the service name attribute.
    pub fn service_name(&self) -> Result<String, TransportError> {
        let mut value = self
            .attribute(SERVICE_NAME_ATTRIBUTE_ID)
            .cloned()
            .ok_or_else(|| invalid("service name attribute missing"))?;

        if value.remaining() < 2 {
            return Err(invalid("service name attribute truncated"));
        }
        let kind = value.get_u8();
        if kind != SERVICE_NAME_ATTRIBUTE_TYPE {
            return Err(invalid(format!("service name attribute type {kind:#04x}")));
        }
        let len = usize::from(value.get_u8());
        if value.remaining() < len {
            return Err(invalid(format!(
                "service name length {len}, {} bytes present",
                value.remaining()
            )));
        }
        String::from_utf8(value.copy_to_bytes(len).to_vec())
            .map_err(|_| invalid("service name is not UTF-8"))
    }

    /// Decode the version attribute, if present.
    pub fn version(&self) -> Result<Option<u32>, TransportError> {
        let Some(value) = self.attribute(SERVICE_VERSION_ATTRIBUTE_ID) else {
            return Ok(None);
        };
        let mut value = value.clone();
        if value.remaining() < 5 {
            return Err(invalid("version attribute truncated"));
        }
        let kind = value.get_u8();
        if kind != SERVICE_VERSION_ATTRIBUTE_TYPE {
            return Err(invalid(format!("version attribute type {kind:#04x}")));
        }
        Ok(Some(value.get_u32()))
    }

    /// Check the record and extract its descriptor.
    ///
    /// A name other than [`SERVICE_NAME`] is logged, not rejected. The version
    /// is only required when `min_version` is set.
    pub fn validate(&self, min_version: Option<u32>) -> Result<ServiceDescriptor, TransportError> {
        let name = self.service_name()?;
        if name != SERVICE_NAME {
            tracing::warn!(name = %name, expected = SERVICE_NAME, "Unexpected service name");
        }

        let version = self.version()?;
        if let Some(min) = min_version {
            match version {
                Some(v) if v >= min => {}
                Some(v) => {
                    return Err(invalid(format!("service version {v} below minimum {min}")));
                }
                None => return Err(invalid("service version attribute missing")),
            }
        }

        Ok(ServiceDescriptor { name, version })
    }
}

fn invalid(reason: impl Into<String>) -> TransportError {
    TransportError::InvalidServiceRecord(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_byte() {
        assert_eq!(SERVICE_NAME_ATTRIBUTE_TYPE, 0x25);
    }

    #[test]
    fn test_encoded_layout() {
        let record = ServiceRecord::for_service(SERVICE_NAME, Some(200));
        let name = record.attribute(SERVICE_NAME_ATTRIBUTE_ID).unwrap();
        assert_eq!(&name[..2], &[0x25, 11]);
        assert_eq!(&name[2..], b"btProximity");

        let version = record.attribute(SERVICE_VERSION_ATTRIBUTE_ID).unwrap();
        assert_eq!(version.as_ref(), &[0x0A, 0, 0, 0, 200]);
    }

    #[test]
    fn test_validate() {
        let descriptor = ServiceRecord::for_service(SERVICE_NAME, Some(201))
            .validate(Some(200))
            .unwrap();
        assert_eq!(descriptor.name, "btProximity");
        assert_eq!(descriptor.version, Some(201));

        // Name mismatch is tolerated
        let descriptor = ServiceRecord::for_service("otherApp", None).validate(None).unwrap();
        assert_eq!(descriptor.name, "otherApp");
    }

    #[test]
    fn test_version_checks() {
        assert!(ServiceRecord::for_service(SERVICE_NAME, Some(199))
            .validate(Some(200))
            .is_err());
        assert!(ServiceRecord::for_service(SERVICE_NAME, None)
            .validate(Some(200))
            .is_err());
        assert!(ServiceRecord::for_service(SERVICE_NAME, Some(1)).validate(None).is_ok());
    }

    #[test]
    fn test_malformed_name() {
        assert!(ServiceRecord::new().validate(None).is_err());

        let wrong_type = ServiceRecord::new()
            .with_attribute(SERVICE_NAME_ATTRIBUTE_ID, vec![0x26, 1, b'x']);
        assert!(wrong_type.service_name().is_err());

        let truncated = ServiceRecord::new()
            .with_attribute(SERVICE_NAME_ATTRIBUTE_ID, vec![0x25, 9, b'x']);
        assert!(matches!(
            truncated.service_name(),
            Err(TransportError::InvalidServiceRecord(_))
        ));
    }
}
