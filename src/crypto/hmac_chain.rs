//! HMAC-SHA256 challenge-response chain.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::keys::KeyMaterial;
use super::{CryptoError, HMAC_TAG_SIZE};

type HmacSha256 = Hmac<Sha256>;

/// One HMAC-SHA256 output.
pub type Tag = [u8; HMAC_TAG_SIZE];

/// The pair of authenticators a companion device returns in `REQUEST_MAC_REPLY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticators {
    /// `HMAC(device_key, device_nonce)`
    pub hmac_dk: Tag,
    /// `HMAC(auth_key, hmac_dk || session_nonce)`
    pub hmac_sk: Tag,
}

fn keyed(key: &KeyMaterial) -> Result<HmacSha256, CryptoError> {
    if key.is_empty() {
        return Err(CryptoError::InvalidKey("empty key".to_string()));
    }
    HmacSha256::new_from_slice(key.as_bytes()).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

fn sign(key: &KeyMaterial, parts: &[&[u8]]) -> Result<Tag, CryptoError> {
    let mut mac = keyed(key)?;
    for part in parts {
        mac.update(part);
    }
    let mut tag = [0u8; HMAC_TAG_SIZE];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    Ok(tag)
}

fn verify(key: &KeyMaterial, parts: &[&[u8]], tag: &[u8]) -> Result<(), CryptoError> {
    let mut mac = keyed(key)?;
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(tag)
        .map_err(|_| CryptoError::VerificationFailed)
}

/// `HMAC(device_key, device_nonce)`
pub fn device_authenticator(device_key: &KeyMaterial, device_nonce: &[u8]) -> Result<Tag, CryptoError> {
    sign(device_key, &[device_nonce])
}

/// `HMAC(auth_key, device_authenticator || session_nonce)`
pub fn session_authenticator(
    auth_key: &KeyMaterial,
    device_authenticator: &[u8],
    session_nonce: &[u8],
) -> Result<Tag, CryptoError> {
    sign(auth_key, &[device_authenticator, session_nonce])
}

/// Both links of the chain.
pub fn compute_chain(
    device_key: &KeyMaterial,
    auth_key: &KeyMaterial,
    device_nonce: &[u8],
    session_nonce: &[u8],
) -> Result<Authenticators, CryptoError> {
    let hmac_dk = device_authenticator(device_key, device_nonce)?;
    let hmac_sk = session_authenticator(auth_key, &hmac_dk, session_nonce)?;
    Ok(Authenticators { hmac_dk, hmac_sk })
}

/// Constant-time check of a device's authenticators against the chain.
pub fn verify_chain(
    device_key: &KeyMaterial,
    auth_key: &KeyMaterial,
    device_nonce: &[u8],
    session_nonce: &[u8],
    hmac_dk: &[u8],
    hmac_sk: &[u8],
) -> Result<(), CryptoError> {
    verify(device_key, &[device_nonce], hmac_dk)?;
    // The session link is keyed over the device's own hmac_dk, which just verified.
    verify(auth_key, &[hmac_dk, session_nonce], hmac_sk)
}

/// `HMAC(auth_key, service_nonce || device_nonce || session_nonce)`
pub fn service_authenticator(
    auth_key: &KeyMaterial,
    service_nonce: &[u8],
    device_nonce: &[u8],
    session_nonce: &[u8],
) -> Result<Tag, CryptoError> {
    sign(auth_key, &[service_nonce, device_nonce, session_nonce])
}

/// Constant-time check of the host's service HMAC, run on the companion side.
pub fn verify_service(
    auth_key: &KeyMaterial,
    service_nonce: &[u8],
    device_nonce: &[u8],
    session_nonce: &[u8],
    tag: &[u8],
) -> Result<(), CryptoError> {
    verify(auth_key, &[service_nonce, device_nonce, session_nonce], tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn device_key() -> KeyMaterial {
        KeyMaterial::new(vec![0x11; 32])
    }

    fn auth_key() -> KeyMaterial {
        KeyMaterial::new(vec![0x22; 32])
    }

    fn device_nonce() -> Vec<u8> {
        (0u8..32).collect()
    }

    fn session_nonce() -> Vec<u8> {
        (32u8..64).collect()
    }

    #[test]
    fn test_rfc4231_case_1() {
        let key = KeyMaterial::new(vec![0x0b; 20]);
        let tag = device_authenticator(&key, b"Hi There").unwrap();
        assert_eq!(
            tag,
            hex!("b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7")
        );
    }

    #[test]
    fn test_chain_vector() {
        let chain =
            compute_chain(&device_key(), &auth_key(), &device_nonce(), &session_nonce()).unwrap();

        assert_eq!(
            chain.hmac_dk,
            hex!("74b9ee840de5d5a97a0a075fb825e319f4f1fd18e73809ef1dd0cd89fe5921b5")
        );
        assert_eq!(
            chain.hmac_sk,
            hex!("9ca7ea46a1af7b2ee3f578378aa29c82742fbcf80671c1878863a33c740b3981")
        );
    }

    #[test]
    fn test_chain_deterministic() {
        let a = compute_chain(&device_key(), &auth_key(), &device_nonce(), &session_nonce()).unwrap();
        let b = compute_chain(&device_key(), &auth_key(), &device_nonce(), &session_nonce()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_swapped_keys_break_chain() {
        let swapped =
            compute_chain(&auth_key(), &device_key(), &device_nonce(), &session_nonce()).unwrap();
        assert_eq!(
            swapped.hmac_dk,
            hex!("bf683264d61f34f5a35e517924acb0645178887fc6148efb1334783fdb588153")
        );

        let result = verify_chain(
            &device_key(),
            &auth_key(),
            &device_nonce(),
            &session_nonce(),
            &swapped.hmac_dk,
            &swapped.hmac_sk,
        );
        assert!(matches!(result, Err(CryptoError::VerificationFailed)));
    }

    #[test]
    fn test_verify_chain_accepts_matching() {
        let chain =
            compute_chain(&device_key(), &auth_key(), &device_nonce(), &session_nonce()).unwrap();
        verify_chain(
            &device_key(),
            &auth_key(),
            &device_nonce(),
            &session_nonce(),
            &chain.hmac_dk,
            &chain.hmac_sk,
        )
        .unwrap();
    }

    #[test]
    fn test_service_vector() {
        let service_nonce = [0x33u8; 16];
        let tag =
            service_authenticator(&auth_key(), &service_nonce, &device_nonce(), &session_nonce())
                .unwrap();
        assert_eq!(
            tag,
            hex!("288b17edc7c2202ee320a4c154209cc1bf4a7e76b388e9159fbc8304ca70557b")
        );
        verify_service(&auth_key(), &service_nonce, &device_nonce(), &session_nonce(), &tag)
            .unwrap();
        assert!(verify_service(&device_key(), &service_nonce, &device_nonce(), &session_nonce(), &tag)
            .is_err());
    }

    #[test]
    fn test_empty_key_rejected() {
        let empty = KeyMaterial::new(Vec::new());
        assert!(matches!(
            device_authenticator(&empty, b"nonce"),
            Err(CryptoError::InvalidKey(_))
        ));
    }
}
