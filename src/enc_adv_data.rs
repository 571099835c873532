//! Encrypted Advertising Data: AES-128-CCM encryption and LTV wrapping of
//! advertising payloads, per Core 5.4.
//!
//! The cipher geometry is fixed: 4-byte MIC, 13-byte nonce built from the
//! per-emission randomizer and the key material's IV (both reversed before
//! use), and the single associated-data byte 0xEA.

use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit, Payload};
use ccm::consts::{U13, U4};
use ccm::Ccm;
use log::{debug, error};

/// AD type carrying an encrypted payload.
pub const AD_TYPE_ENCRYPTED_DATA: u8 = 0x31;

pub const ENC_KEY_LEN: usize = 16;
pub const ENC_IV_LEN: usize = 8;
/// A caller-provided key value is session key followed by IV.
pub const ENC_KEY_VALUE_LEN: usize = ENC_KEY_LEN + ENC_IV_LEN;
pub const RANDOMIZER_LEN: usize = 5;

const NONCE_LEN: usize = RANDOMIZER_LEN + ENC_IV_LEN;
const ASSOCIATED_DATA: [u8; 1] = [0xea];

type EadCipher = Ccm<Aes128, U4, U13>;

/// Session key and initialization vector for Encrypted Advertising Data.
///
/// Either supplied by the caller as a 24-byte key value, or taken from the
/// stack's GAP Encrypted Data Key Material characteristic.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EncKeyMaterial {
    pub session_key: [u8; ENC_KEY_LEN],
    pub init_vector: [u8; ENC_IV_LEN],
}

impl EncKeyMaterial {
    /// Splits a caller-provided key value (key followed by IV). Returns
    /// `None` unless the value is exactly 24 bytes.
    pub fn from_key_value(enc_key_value: &[u8]) -> Option<EncKeyMaterial> {
        if enc_key_value.len() != ENC_KEY_VALUE_LEN {
            return None;
        }
        let mut material = EncKeyMaterial::default();
        material.session_key.copy_from_slice(&enc_key_value[..ENC_KEY_LEN]);
        material.init_vector.copy_from_slice(&enc_key_value[ENC_KEY_LEN..]);
        Some(material)
    }
}

/// Converts LE Rand output into the stored randomizer: the first five
/// bytes, reversed.
pub fn randomizer_from_le_rand(rand: [u8; 8]) -> [u8; RANDOMIZER_LEN] {
    let mut randomizer = [0u8; RANDOMIZER_LEN];
    randomizer.copy_from_slice(&rand[..RANDOMIZER_LEN]);
    randomizer.reverse();
    randomizer
}

/// Encrypts `data` and wraps it as a complete Encrypted Data AD structure:
/// `[length][0x31][randomizer (reversed) || ciphertext || 4-byte MIC]`.
///
/// Returns `None` if the cipher rejects the input (the payload is then
/// reported as failed rather than sent in the clear).
pub fn encrypted_ad_structure(
    key_material: &EncKeyMaterial,
    randomizer: &[u8; RANDOMIZER_LEN],
    data: &[u8],
    log_enabled: bool,
) -> Option<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    for (dst, src) in nonce[..RANDOMIZER_LEN].iter_mut().zip(randomizer.iter().rev()) {
        *dst = *src;
    }
    for (dst, src) in nonce[RANDOMIZER_LEN..].iter_mut().zip(key_material.init_vector.iter().rev())
    {
        *dst = *src;
    }

    if log_enabled {
        debug!("encrypted advertising key: {}", hex(&key_material.session_key));
        debug!("encrypted advertising iv: {}", hex(&key_material.init_vector));
        debug!("encrypted advertising randomizer: {}", hex(randomizer));
        debug!("encrypted advertising nonce: {}", hex(&nonce));
        debug!("encrypted advertising input: {}", hex(data));
    }

    let cipher = EadCipher::new(GenericArray::from_slice(&key_material.session_key));
    let sealed = match cipher.encrypt(
        GenericArray::from_slice(&nonce),
        Payload { msg: data, aad: &ASSOCIATED_DATA },
    ) {
        Ok(sealed) => sealed,
        Err(_) => {
            error!("encrypting advertising data failed");
            return None;
        }
    };

    if log_enabled {
        debug!("encrypted advertising output: {}", hex(&sealed));
    }

    let mut ad = Vec::with_capacity(2 + RANDOMIZER_LEN + sealed.len());
    ad.push((1 + RANDOMIZER_LEN + sealed.len()) as u8);
    ad.push(AD_TYPE_ENCRYPTED_DATA);
    ad.extend(randomizer.iter().rev());
    ad.extend_from_slice(&sealed);
    Some(ad)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_material() -> EncKeyMaterial {
        EncKeyMaterial {
            session_key: [
                0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c,
                0x0d, 0x0e, 0x0f,
            ],
            init_vector: [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07],
        }
    }

    #[test]
    fn test_key_value_split() {
        let mut value = Vec::new();
        value.extend(0u8..24u8);
        let material = EncKeyMaterial::from_key_value(&value).unwrap();
        assert_eq!(material.session_key[0], 0);
        assert_eq!(material.session_key[15], 15);
        assert_eq!(material.init_vector, [16, 17, 18, 19, 20, 21, 22, 23]);

        assert!(EncKeyMaterial::from_key_value(&[]).is_none());
        assert!(EncKeyMaterial::from_key_value(&value[..23]).is_none());
    }

    #[test]
    fn test_randomizer_from_le_rand() {
        let randomizer = randomizer_from_le_rand([1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(randomizer, [5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_ad_structure_layout() {
        let randomizer = [0x01, 0x02, 0x03, 0x04, 0x05];
        // Service data AD for the Broadcast Audio Announcement UUID.
        let plaintext = [0x03, 0x16, 0x51, 0x18];
        let ad =
            encrypted_ad_structure(&test_material(), &randomizer, &plaintext, false).unwrap();

        // length || type || randomizer(5) || ciphertext(4) || mic(4)
        assert_eq!(ad.len(), 2 + 5 + plaintext.len() + 4);
        assert_eq!(ad[0] as usize, ad.len() - 1);
        assert_eq!(ad[1], AD_TYPE_ENCRYPTED_DATA);
        assert_eq!(&ad[2..7], &[0x05, 0x04, 0x03, 0x02, 0x01]);
        // The ciphertext must not be the plaintext in the clear.
        assert_ne!(&ad[7..11], &plaintext);
    }

    #[test]
    fn test_ciphertext_decrypts_with_same_nonce() {
        let material = test_material();
        let randomizer = [0x01, 0x02, 0x03, 0x04, 0x05];
        let plaintext = [0x03, 0x16, 0x51, 0x18];
        let ad = encrypted_ad_structure(&material, &randomizer, &plaintext, false).unwrap();

        let mut nonce = [0u8; NONCE_LEN];
        nonce[..RANDOMIZER_LEN].copy_from_slice(&[0x05, 0x04, 0x03, 0x02, 0x01]);
        nonce[RANDOMIZER_LEN..]
            .copy_from_slice(&[0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, 0x00]);

        let cipher = EadCipher::new(GenericArray::from_slice(&material.session_key));
        let opened = cipher
            .decrypt(
                GenericArray::from_slice(&nonce),
                Payload { msg: &ad[7..], aad: &ASSOCIATED_DATA },
            )
            .unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_fresh_randomizer_changes_ciphertext() {
        let material = test_material();
        let plaintext = [0xaa, 0xbb, 0xcc];
        let first =
            encrypted_ad_structure(&material, &[1, 2, 3, 4, 5], &plaintext, false).unwrap();
        let second =
            encrypted_ad_structure(&material, &[6, 7, 8, 9, 10], &plaintext, false).unwrap();
        assert_ne!(&first[7..], &second[7..]);
    }
}
