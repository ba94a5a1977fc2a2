//! Sample decryption for Common Encryption protected fragments.

use std::{
    collections::HashMap,
    str::FromStr,
    sync::{Mutex, RwLock},
};

use aes::{
    cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit, StreamCipher},
    Aes128,
};
use bytes::Bytes;

use crate::{
    error::{PlayerError, PlayerResult},
    mp4::{FourCC, SubSample},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecrypterState {
    Idle,
    WaitingForKey,
    Ready,
    Error,
}

/// Everything needed to decrypt one sample.
#[derive(Debug, Clone)]
pub struct SampleEncryptionInfo {
    pub scheme: FourCC,
    pub key_id: [u8; 16],
    pub iv: Vec<u8>,
    /// Empty if the whole sample is protected.
    pub subsamples: Vec<SubSample>,
    pub crypt_byte_block: u8,
    pub skip_byte_block: u8,
}

pub trait Decrypter: Send + Sync {
    fn state(&self) -> DecrypterState;

    /// Passes the raw `pssh` boxes found in the init and media segments.
    fn update_init_data_from_multiple_pssh(&self, pssh: &[Bytes]) -> PlayerResult<()>;

    fn decrypt_in_place(&self, data: &mut [u8], info: &SampleEncryptionInfo) -> PlayerResult<()>;

    fn last_error_message(&self) -> Option<String> {
        None
    }
}

/// Decrypter with keys given up front as `kid:key` pairs.
#[derive(Debug, Default)]
pub struct ClearKeyDecrypter {
    keys: RwLock<HashMap<[u8; 16], [u8; 16]>>,
    last_error: Mutex<Option<String>>,
}

impl ClearKeyDecrypter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key. A previous decryption error is cleared so that the decrypter becomes
    /// usable again.
    pub fn add_key(&self, kid: [u8; 16], key: [u8; 16]) {
        self.keys.write().unwrap().insert(kid, key);
        self.last_error.lock().unwrap().take();
    }

    fn fail(&self, error: PlayerError) -> PlayerError {
        *self.last_error.lock().unwrap() = Some(error.to_string());
        error
    }
}

impl FromStr for ClearKeyDecrypter {
    type Err = PlayerError;

    /// Parses `<kid>:<key>;<kid>:<key>;...` with hex encoded 16 byte values.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decrypter = Self::new();
        for pair in s.split(';').filter(|pair| !pair.trim().is_empty()) {
            match pair.trim().split_once(':') {
                Some((kid, key)) if is_valid_kid_key_pair(kid, key) => {
                    let mut kid_bytes = [0u8; 16];
                    let mut key_bytes = [0u8; 16];
                    hex::decode_to_slice(kid, &mut kid_bytes)?;
                    hex::decode_to_slice(key, &mut key_bytes)?;
                    decrypter.add_key(kid_bytes, key_bytes);
                }
                _ => log::warn!("Ignored invalid key format: {}", pair),
            }
        }
        if decrypter.keys.read().unwrap().is_empty() {
            return Err(PlayerError::DecryptionFailed(format!("No valid key found in {s}")));
        }
        Ok(decrypter)
    }
}

impl Decrypter for ClearKeyDecrypter {
    fn state(&self) -> DecrypterState {
        if self.last_error.lock().unwrap().is_some() {
            DecrypterState::Error
        } else if self.keys.read().unwrap().is_empty() {
            DecrypterState::WaitingForKey
        } else {
            DecrypterState::Ready
        }
    }

    fn update_init_data_from_multiple_pssh(&self, pssh: &[Bytes]) -> PlayerResult<()> {
        tracing::debug!(count = pssh.len(), "Received protection system data");
        Ok(())
    }

    fn decrypt_in_place(&self, data: &mut [u8], info: &SampleEncryptionInfo) -> PlayerResult<()> {
        let key = self
            .keys
            .read()
            .unwrap()
            .get(&info.key_id)
            .copied()
            .ok_or_else(|| {
                self.fail(PlayerError::DecryptionFailed(format!(
                    "No key for KID {}",
                    hex::encode(info.key_id)
                )))
            })?;
        let mut iv = [0u8; 16];
        if info.iv.len() > 16 {
            return Err(self.fail(PlayerError::DecryptionFailed(format!(
                "Invalid IV size {}",
                info.iv.len()
            ))));
        }
        iv[..info.iv.len()].copy_from_slice(&info.iv);

        let ranges = protected_ranges(data.len(), &info.subsamples)
            .map_err(|e| self.fail(e))?;
        match info.scheme {
            FourCC::SCHEME_CENC => decrypt_ctr(&key, iv, data, &ranges),
            FourCC::SCHEME_CBC1 => decrypt_cbc1(&key, iv, data, &ranges),
            FourCC::SCHEME_CBCS => decrypt_cbcs(&key, iv, data, &ranges, info),
            scheme => {
                return Err(self.fail(PlayerError::DecryptionFailed(format!(
                    "Unsupported protection scheme {scheme}"
                ))))
            }
        }
        self.last_error.lock().unwrap().take();
        Ok(())
    }

    fn last_error_message(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }
}

fn is_valid_kid_key_pair(kid: &str, key: &str) -> bool {
    kid.len() == 32
        && key.len() == 32
        && kid.chars().all(|c| c.is_ascii_hexdigit())
        && key.chars().all(|c| c.is_ascii_hexdigit())
}

/// Byte ranges of the protected parts of a sample.
fn protected_ranges(len: usize, subsamples: &[SubSample]) -> PlayerResult<Vec<(usize, usize)>> {
    if subsamples.is_empty() {
        return Ok(vec![(0, len)]);
    }
    let mut ranges = Vec::with_capacity(subsamples.len());
    let mut position = 0usize;
    for subsample in subsamples {
        let start = position + subsample.clear_bytes as usize;
        let end = start + subsample.protected_bytes as usize;
        if end > len {
            return Err(PlayerError::DecryptionFailed(format!(
                "Subsamples cover {end} bytes but the sample has {len}"
            )));
        }
        ranges.push((start, end));
        position = end;
    }
    Ok(ranges)
}

/// `cenc`: AES-CTR with a 64 bit block counter, running on across subsamples.
fn decrypt_ctr(key: &[u8; 16], iv: [u8; 16], data: &mut [u8], ranges: &[(usize, usize)]) {
    let mut cipher = ctr::Ctr64BE::<Aes128>::new(key.into(), (&iv).into());
    for &(start, end) in ranges {
        cipher.apply_keystream(&mut data[start..end]);
    }
}

/// `cbc1`: one CBC chain over all protected bytes, trailing partial blocks stay clear.
fn decrypt_cbc1(key: &[u8; 16], iv: [u8; 16], data: &mut [u8], ranges: &[(usize, usize)]) {
    let mut protected = Vec::new();
    for &(start, end) in ranges {
        let whole = (end - start) / 16 * 16;
        protected.extend_from_slice(&data[start..start + whole]);
    }
    cbc_decrypt(key, iv, &mut protected);

    let mut offset = 0;
    for &(start, end) in ranges {
        let whole = (end - start) / 16 * 16;
        data[start..start + whole].copy_from_slice(&protected[offset..offset + whole]);
        offset += whole;
    }
}

/// `cbcs`: pattern encryption, the chain restarts with the IV for every subsample.
fn decrypt_cbcs(
    key: &[u8; 16],
    iv: [u8; 16],
    data: &mut [u8],
    ranges: &[(usize, usize)],
    info: &SampleEncryptionInfo,
) {
    let (crypt, skip) = match (info.crypt_byte_block, info.skip_byte_block) {
        (0, 0) => (1, 0),
        (crypt, skip) => (crypt as usize, skip as usize),
    };
    for &(start, end) in ranges {
        let blocks = (end - start) / 16;
        let mut encrypted = Vec::new();
        let mut block_indices = Vec::new();
        for block in 0..blocks {
            if block % (crypt + skip) < crypt {
                let at = start + block * 16;
                encrypted.extend_from_slice(&data[at..at + 16]);
                block_indices.push(at);
            }
        }
        cbc_decrypt(key, iv, &mut encrypted);
        for (i, at) in block_indices.into_iter().enumerate() {
            data[at..at + 16].copy_from_slice(&encrypted[i * 16..i * 16 + 16]);
        }
    }
}

fn cbc_decrypt(key: &[u8; 16], iv: [u8; 16], buf: &mut [u8]) {
    if buf.is_empty() {
        return;
    }
    let decryptor = cbc::Decryptor::<Aes128>::new(key.into(), (&iv).into());
    // The length is a multiple of the block size, so unpadding cannot fail.
    _ = decryptor.decrypt_padded_mut::<NoPadding>(buf);
}

#[cfg(test)]
mod tests {
    use aes::cipher::{BlockEncrypt, BlockEncryptMut, KeyInit};

    use super::*;

    const KID: &str = "00112233445566778899aabbccddeeff";
    const KEY: &str = "000102030405060708090a0b0c0d0e0f";

    fn info(scheme: FourCC, subsamples: Vec<SubSample>) -> SampleEncryptionInfo {
        let mut key_id = [0u8; 16];
        hex::decode_to_slice(KID, &mut key_id).unwrap();
        SampleEncryptionInfo {
            scheme,
            key_id,
            iv: vec![7u8; 16],
            subsamples,
            crypt_byte_block: 0,
            skip_byte_block: 0,
        }
    }

    #[test]
    fn test_parse_key_pairs() {
        let decrypter: ClearKeyDecrypter = format!("{KID}:{KEY};invalid").parse().unwrap();
        assert_eq!(decrypter.state(), DecrypterState::Ready);
        assert!("nothing:here".parse::<ClearKeyDecrypter>().is_err());
        assert_eq!(ClearKeyDecrypter::new().state(), DecrypterState::WaitingForKey);
    }

    #[test]
    fn test_ctr_is_symmetric() {
        let decrypter: ClearKeyDecrypter = format!("{KID}:{KEY}").parse().unwrap();
        let plain: Vec<u8> = (0..100u8).collect();
        let info = info(
            FourCC::SCHEME_CENC,
            vec![SubSample {
                clear_bytes: 10,
                protected_bytes: 90,
            }],
        );

        let mut data = plain.clone();
        decrypter.decrypt_in_place(&mut data, &info).unwrap();
        assert_eq!(&data[..10], &plain[..10]);
        assert_ne!(&data[10..], &plain[10..]);
        decrypter.decrypt_in_place(&mut data, &info).unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn test_cbc1_roundtrip() {
        let mut key = [0u8; 16];
        hex::decode_to_slice(KEY, &mut key).unwrap();
        let plain: Vec<u8> = (0..40u8).collect();

        let mut encrypted = plain.clone();
        let encryptor = cbc::Encryptor::<Aes128>::new((&key).into(), (&[7u8; 16]).into());
        encryptor
            .encrypt_padded_mut::<NoPadding>(&mut encrypted[..32], 32)
            .unwrap();

        let decrypter: ClearKeyDecrypter = format!("{KID}:{KEY}").parse().unwrap();
        decrypter
            .decrypt_in_place(&mut encrypted, &info(FourCC::SCHEME_CBC1, Vec::new()))
            .unwrap();
        assert_eq!(encrypted, plain);
    }

    #[test]
    fn test_missing_key_sets_error() {
        let decrypter: ClearKeyDecrypter =
            format!("ffffffffffffffffffffffffffffffff:{KEY}").parse().unwrap();
        let mut data = vec![0u8; 16];
        assert!(decrypter
            .decrypt_in_place(&mut data, &info(FourCC::SCHEME_CENC, Vec::new()))
            .is_err());
        assert_eq!(decrypter.state(), DecrypterState::Error);
        assert!(decrypter.last_error_message().unwrap().contains("No key"));
    }

    #[test]
    fn test_added_key_recovers_from_error() {
        let decrypter: ClearKeyDecrypter =
            format!("ffffffffffffffffffffffffffffffff:{KEY}").parse().unwrap();
        let info = info(FourCC::SCHEME_CENC, Vec::new());
        let mut data = vec![0u8; 16];
        assert!(decrypter.decrypt_in_place(&mut data, &info).is_err());
        assert_eq!(decrypter.state(), DecrypterState::Error);

        decrypter.add_key(info.key_id, [1u8; 16]);
        assert_eq!(decrypter.state(), DecrypterState::Ready);
        assert!(decrypter.last_error_message().is_none());
        decrypter.decrypt_in_place(&mut data, &info).unwrap();
        assert_eq!(decrypter.state(), DecrypterState::Ready);
    }

    #[test]
    fn test_successful_sample_clears_error() {
        let decrypter: ClearKeyDecrypter = format!("{KID}:{KEY}").parse().unwrap();
        let mut other = info(FourCC::SCHEME_CENC, Vec::new());
        other.key_id = [0xee; 16];
        let mut data = vec![0u8; 16];
        assert!(decrypter.decrypt_in_place(&mut data, &other).is_err());
        assert_eq!(decrypter.state(), DecrypterState::Error);

        decrypter
            .decrypt_in_place(&mut data, &info(FourCC::SCHEME_CENC, Vec::new()))
            .unwrap();
        assert_eq!(decrypter.state(), DecrypterState::Ready);
    }

    #[test]
    fn test_ctr_counter_wraps_in_low_half() {
        let mut key = [0u8; 16];
        hex::decode_to_slice(KEY, &mut key).unwrap();
        let mut iv = [0x11u8; 16];
        iv[8..].fill(0xff);

        let decrypter: ClearKeyDecrypter = format!("{KID}:{KEY}").parse().unwrap();
        let mut info = info(FourCC::SCHEME_CENC, Vec::new());
        info.iv = iv.to_vec();
        let mut data = vec![0u8; 32];
        decrypter.decrypt_in_place(&mut data, &info).unwrap();

        // The second block uses the counter with its lower 64 bits wrapped to zero.
        let mut counter = [0x11u8; 16];
        counter[8..].fill(0);
        let mut block = counter.into();
        Aes128::new((&key).into()).encrypt_block(&mut block);
        assert_eq!(&data[16..], block.as_slice());
    }
}
