//! ECMA-376 Agile decryption for password-protected workbooks.
//!
//! An encrypted `.xlsx` is an OLE compound file holding an `EncryptionInfo`
//! stream (version 4.4 header followed by an XML descriptor) and an
//! `EncryptedPackage` stream (8-byte plaintext size, then AES-CBC segments of
//! 4096 bytes). Decryption yields the original ZIP package.

use aes::{Aes128, Aes192, Aes256};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use cipher::block_padding::NoPadding;
use cipher::{BlockDecryptMut, KeyIvInit};
use quick_xml::Reader as XmlReader;
use quick_xml::events::{BytesStart, Event};
use std::io::{Read, Seek};
use thiserror::Error;

const SEGMENT_LEN: usize = 4096;
const VERIFIER_INPUT_LEN: usize = 16;
/// Excel writes 100000; anything far above that is refused before hashing.
const MAX_SPIN_COUNT: u32 = 1_000_000;

const VERIFIER_HASH_INPUT_BLOCK: [u8; 8] = [0xfe, 0xa7, 0xd2, 0x76, 0x3b, 0x4b, 0x9e, 0x79];
const VERIFIER_HASH_VALUE_BLOCK: [u8; 8] = [0xd7, 0xaa, 0x0f, 0x6d, 0x30, 0x61, 0x34, 0x4e];
const KEY_VALUE_BLOCK: [u8; 8] = [0x14, 0x6e, 0x0b, 0xe7, 0xab, 0xac, 0xd0, 0xd6];

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("invalid password")]
    InvalidPassword,
    #[error("unsupported encryption version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error("invalid encryption info: {0}")]
    InvalidInfo(String),
    #[error("encrypted package is corrupt: {0}")]
    CorruptPackage(String),
    #[error("failed to read encrypted container: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    fn parse(name: &str) -> Result<Self, DecryptError> {
        match name.trim().to_ascii_uppercase().replace('-', "").as_str() {
            "SHA1" => Ok(Self::Sha1),
            "SHA256" => Ok(Self::Sha256),
            "SHA384" => Ok(Self::Sha384),
            "SHA512" => Ok(Self::Sha512),
            other => Err(DecryptError::InvalidInfo(format!(
                "unsupported hash algorithm {other}"
            ))),
        }
    }

    fn digest_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    fn digest(self, parts: &[&[u8]]) -> Vec<u8> {
        fn run<D: sha2::Digest>(parts: &[&[u8]]) -> Vec<u8> {
            let mut hasher = D::new();
            for part in parts {
                hasher.update(part);
            }
            hasher.finalize().to_vec()
        }
        match self {
            Self::Sha1 => run::<sha1::Sha1>(parts),
            Self::Sha256 => run::<sha2::Sha256>(parts),
            Self::Sha384 => run::<sha2::Sha384>(parts),
            Self::Sha512 => run::<sha2::Sha512>(parts),
        }
    }
}

#[derive(Debug, Default)]
struct KeyData {
    salt: Vec<u8>,
    hash: Option<HashAlgorithm>,
    block_size: usize,
}

#[derive(Debug, Default)]
struct PasswordKey {
    spin_count: u32,
    salt: Vec<u8>,
    hash: Option<HashAlgorithm>,
    key_bits: usize,
    encrypted_key_value: Vec<u8>,
    encrypted_verifier_hash_input: Vec<u8>,
    encrypted_verifier_hash_value: Vec<u8>,
}

#[derive(Debug)]
struct AgileInfo {
    key_data: KeyData,
    password: PasswordKey,
}

/// True when the compound file carries an `EncryptionInfo` stream.
pub fn is_encrypted<F: Read + Seek>(container: &cfb::CompoundFile<F>) -> bool {
    container.is_stream("/EncryptionInfo")
}

/// Decrypts the `EncryptedPackage` of `container` with `password`, returning the ZIP bytes.
pub fn decrypt_package<F: Read + Seek>(
    container: &mut cfb::CompoundFile<F>,
    password: &str,
) -> Result<Vec<u8>, DecryptError> {
    let info_bytes = read_stream(container, "/EncryptionInfo")?;
    let info = parse_encryption_info(&info_bytes)?;
    let package = read_stream(container, "/EncryptedPackage")?;

    let secret_key = secret_key_from_password(&info.password, password)?;
    decrypt_segments(&info.key_data, &secret_key, &package)
}

fn read_stream<F: Read + Seek>(
    container: &mut cfb::CompoundFile<F>,
    path: &str,
) -> Result<Vec<u8>, DecryptError> {
    let mut stream = container.open_stream(path)?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;
    Ok(buf)
}

fn parse_encryption_info(bytes: &[u8]) -> Result<AgileInfo, DecryptError> {
    if bytes.len() < 8 {
        return Err(DecryptError::InvalidInfo("header is truncated".into()));
    }
    let major = u16::from_le_bytes([bytes[0], bytes[1]]);
    let minor = u16::from_le_bytes([bytes[2], bytes[3]]);
    if (major, minor) != (4, 4) {
        return Err(DecryptError::UnsupportedVersion { major, minor });
    }
    parse_agile_xml(&bytes[8..])
}

fn parse_agile_xml(xml: &[u8]) -> Result<AgileInfo, DecryptError> {
    let mut reader = XmlReader::from_reader(xml);
    reader.trim_text(true);

    let mut key_data: Option<KeyData> = None;
    let mut password: Option<PasswordKey> = None;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"keyData" => key_data = Some(parse_key_data(&e)?),
                b"encryptedKey" if has_attribute(&e, b"spinCount") => {
                    password = Some(parse_password_key(&e)?)
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(DecryptError::InvalidInfo(format!("malformed XML: {err}"))),
        }
        buf.clear();
    }

    let key_data = key_data.ok_or_else(|| DecryptError::InvalidInfo("missing keyData".into()))?;
    let password = password
        .ok_or_else(|| DecryptError::InvalidInfo("missing password key encryptor".into()))?;
    Ok(AgileInfo { key_data, password })
}

fn has_attribute(e: &BytesStart<'_>, name: &[u8]) -> bool {
    e.attributes()
        .with_checks(false)
        .flatten()
        .any(|attr| attr.key.local_name().as_ref() == name)
}

fn attributes(e: &BytesStart<'_>) -> Result<Vec<(Vec<u8>, String)>, DecryptError> {
    let mut out = Vec::new();
    for attr in e.attributes().with_checks(false) {
        let attr = attr.map_err(|err| DecryptError::InvalidInfo(format!("bad attribute: {err}")))?;
        let value = std::str::from_utf8(&attr.value)
            .map_err(|_| DecryptError::InvalidInfo("attribute is not UTF-8".into()))?
            .to_string();
        out.push((attr.key.local_name().as_ref().to_vec(), value));
    }
    Ok(out)
}

fn parse_key_data(e: &BytesStart<'_>) -> Result<KeyData, DecryptError> {
    let mut data = KeyData::default();
    for (key, value) in attributes(e)? {
        match key.as_slice() {
            b"saltValue" => data.salt = decode_base64(&value)?,
            b"hashAlgorithm" => data.hash = Some(HashAlgorithm::parse(&value)?),
            b"blockSize" => data.block_size = parse_number(&value, "blockSize")?,
            _ => {}
        }
    }
    if data.salt.is_empty() || data.hash.is_none() || data.block_size == 0 {
        return Err(DecryptError::InvalidInfo("incomplete keyData".into()));
    }
    Ok(data)
}

fn parse_password_key(e: &BytesStart<'_>) -> Result<PasswordKey, DecryptError> {
    let mut key = PasswordKey::default();
    for (name, value) in attributes(e)? {
        match name.as_slice() {
            b"spinCount" => key.spin_count = parse_number(&value, "spinCount")?,
            b"saltValue" => key.salt = decode_base64(&value)?,
            b"hashAlgorithm" => key.hash = Some(HashAlgorithm::parse(&value)?),
            b"keyBits" => key.key_bits = parse_number(&value, "keyBits")?,
            b"encryptedKeyValue" => key.encrypted_key_value = decode_base64(&value)?,
            b"encryptedVerifierHashInput" => {
                key.encrypted_verifier_hash_input = decode_base64(&value)?
            }
            b"encryptedVerifierHashValue" => {
                key.encrypted_verifier_hash_value = decode_base64(&value)?
            }
            _ => {}
        }
    }
    if key.spin_count > MAX_SPIN_COUNT {
        return Err(DecryptError::InvalidInfo(format!(
            "spinCount {} exceeds {MAX_SPIN_COUNT}",
            key.spin_count
        )));
    }
    if key.salt.len() != 16 || key.hash.is_none() || key.key_bits == 0 || key.key_bits % 8 != 0
    {
        return Err(DecryptError::InvalidInfo(
            "incomplete password key encryptor".into(),
        ));
    }
    Ok(key)
}

fn parse_number<T: std::str::FromStr>(value: &str, field: &str) -> Result<T, DecryptError> {
    value
        .trim()
        .parse()
        .map_err(|_| DecryptError::InvalidInfo(format!("{field} is not a number")))
}

/// Base64 with embedded whitespace and optional padding.
fn decode_base64(value: &str) -> Result<Vec<u8>, DecryptError> {
    let compact: String = value
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .trim_end_matches('=')
        .to_string();
    STANDARD_NO_PAD
        .decode(compact.as_bytes())
        .map_err(|err| DecryptError::InvalidInfo(format!("invalid base64: {err}")))
}

fn password_utf16le(password: &str) -> Vec<u8> {
    password
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect()
}

fn iterated_hash(hash: HashAlgorithm, salt: &[u8], password: &str, spin_count: u32) -> Vec<u8> {
    let mut h = hash.digest(&[salt, &password_utf16le(password)]);
    for i in 0..spin_count {
        h = hash.digest(&[&i.to_le_bytes(), &h]);
    }
    h
}

fn derive_key(hash: HashAlgorithm, h: &[u8], block_key: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = hash.digest(&[h, block_key]);
    key.resize(key_len, 0x36);
    key
}

fn aes_cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, DecryptError> {
    if data.len() % 16 != 0 {
        return Err(DecryptError::CorruptPackage(format!(
            "ciphertext length {} is not a multiple of the block size",
            data.len()
        )));
    }
    if iv.len() != 16 {
        return Err(DecryptError::InvalidInfo(format!(
            "IV must be 16 bytes, got {}",
            iv.len()
        )));
    }

    let mut buf = data.to_vec();
    let bad_key = |_| DecryptError::InvalidInfo("invalid key length".into());
    let unpadded = match key.len() {
        16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map(|_| ()),
        24 => cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map(|_| ()),
        32 => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map(|_| ()),
        other => {
            return Err(DecryptError::InvalidInfo(format!(
                "unsupported key length {other}"
            )));
        }
    };
    unpadded.map_err(|_| DecryptError::CorruptPackage("block decryption failed".into()))?;
    Ok(buf)
}

fn secret_key_from_password(key: &PasswordKey, password: &str) -> Result<Vec<u8>, DecryptError> {
    let hash = key
        .hash
        .ok_or_else(|| DecryptError::InvalidInfo("missing hash algorithm".into()))?;
    let key_len = key.key_bits / 8;
    let h = iterated_hash(hash, &key.salt, password, key.spin_count);

    let input_key = derive_key(hash, &h, &VERIFIER_HASH_INPUT_BLOCK, key_len);
    let verifier_input = aes_cbc_decrypt(&input_key, &key.salt, &key.encrypted_verifier_hash_input)?;
    let value_key = derive_key(hash, &h, &VERIFIER_HASH_VALUE_BLOCK, key_len);
    let verifier_value = aes_cbc_decrypt(&value_key, &key.salt, &key.encrypted_verifier_hash_value)?;

    let digest_len = hash.digest_len();
    if verifier_input.len() < VERIFIER_INPUT_LEN || verifier_value.len() < digest_len {
        return Err(DecryptError::InvalidInfo("verifier is truncated".into()));
    }
    let expected = hash.digest(&[&verifier_input[..VERIFIER_INPUT_LEN]]);
    if expected[..] != verifier_value[..digest_len] {
        return Err(DecryptError::InvalidPassword);
    }

    let value_key = derive_key(hash, &h, &KEY_VALUE_BLOCK, key_len);
    let mut secret = aes_cbc_decrypt(&value_key, &key.salt, &key.encrypted_key_value)?;
    if secret.len() < key_len {
        return Err(DecryptError::InvalidInfo("key value is truncated".into()));
    }
    secret.truncate(key_len);
    Ok(secret)
}

fn decrypt_segments(
    key_data: &KeyData,
    secret_key: &[u8],
    package: &[u8],
) -> Result<Vec<u8>, DecryptError> {
    let hash = key_data
        .hash
        .ok_or_else(|| DecryptError::InvalidInfo("missing keyData hash".into()))?;
    if package.len() < 8 {
        return Err(DecryptError::CorruptPackage("size header is truncated".into()));
    }
    let mut size_bytes = [0u8; 8];
    size_bytes.copy_from_slice(&package[..8]);
    let declared = u64::from_le_bytes(size_bytes);
    let declared = usize::try_from(declared)
        .map_err(|_| DecryptError::CorruptPackage("declared size overflows".into()))?;

    let mut out = Vec::with_capacity(declared.min(package.len()));
    for (index, segment) in package[8..].chunks(SEGMENT_LEN).enumerate() {
        if out.len() >= declared {
            break;
        }
        let index = u32::try_from(index)
            .map_err(|_| DecryptError::CorruptPackage("too many segments".into()))?;
        let mut iv = hash.digest(&[&key_data.salt, &index.to_le_bytes()]);
        iv.resize(key_data.block_size, 0x36);
        // the final segment may carry trailing bytes past the last full block
        let usable = segment.len() - segment.len() % 16;
        out.extend_from_slice(&aes_cbc_decrypt(secret_key, &iv, &segment[..usable])?);
    }

    if out.len() < declared {
        return Err(DecryptError::CorruptPackage(format!(
            "decrypted {} bytes but header declares {declared}",
            out.len()
        )));
    }
    out.truncate(declared);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_tolerates_whitespace_and_missing_padding() {
        assert_eq!(decode_base64("aGVs\nbG8=").unwrap(), b"hello");
        assert_eq!(decode_base64("aGVsbG8").unwrap(), b"hello");
    }

    #[test]
    fn derive_key_pads_with_0x36() {
        let key = derive_key(HashAlgorithm::Sha1, b"h", &KEY_VALUE_BLOCK, 32);
        assert_eq!(key.len(), 32);
        assert!(key[20..].iter().all(|b| *b == 0x36));
    }

    #[test]
    fn rejects_non_agile_versions() {
        let mut bytes = vec![3, 0, 2, 0, 0, 0, 0, 0];
        bytes.extend_from_slice(b"<x/>");
        assert!(matches!(
            parse_encryption_info(&bytes),
            Err(DecryptError::UnsupportedVersion { major: 3, minor: 2 })
        ));
    }

    fn agile_xml(spin_count: u32) -> String {
        format!(
            r#"<encryption xmlns="http://schemas.microsoft.com/office/2006/encryption">
<keyData saltValue="AAECAwQFBgcICQoLDA0ODw==" hashAlgorithm="SHA512" blockSize="16"/>
<keyEncryptors><keyEncryptor uri="http://schemas.microsoft.com/office/2006/keyEncryptor/password">
<p:encryptedKey xmlns:p="http://schemas.microsoft.com/office/2006/keyEncryptor/password"
 spinCount="{spin_count}" saltValue="AAECAwQFBgcICQoLDA0ODw==" hashAlgorithm="SHA512"
 keyBits="256" encryptedKeyValue="AAAA" encryptedVerifierHashInput="AAAA"
 encryptedVerifierHashValue="AAAA"/>
</keyEncryptor></keyEncryptors></encryption>"#
        )
    }

    #[test]
    fn spin_count_is_capped() {
        let info = parse_agile_xml(agile_xml(100_000).as_bytes()).unwrap();
        assert_eq!(info.password.spin_count, 100_000);

        let err = parse_agile_xml(agile_xml(u32::MAX).as_bytes()).err();
        assert!(matches!(err, Some(DecryptError::InvalidInfo(msg)) if msg.contains("spinCount")));
    }

    #[test]
    fn hash_names_parse_with_or_without_dash() {
        assert_eq!(HashAlgorithm::parse("SHA512").unwrap(), HashAlgorithm::Sha512);
        assert_eq!(HashAlgorithm::parse("sha-256").unwrap(), HashAlgorithm::Sha256);
        assert!(HashAlgorithm::parse("MD5").is_err());
    }
}
