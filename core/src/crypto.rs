use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use aes_gcm::Aes256Gcm;
use aes_gcm::Key;
use aes_gcm::KeyInit;
use aes_gcm::Nonce;
use aes_gcm::aead::Aead;
use aes_gcm::aead::Payload;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Digest;
use sha2::Sha256;

use nimbus_protocol::ENC_PREFIX;

use crate::CoreErr;
use crate::NimbusHome;
use crate::Result;

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// AES-256-GCM envelope encryption with a PBKDF2-derived master key.
///
/// The master key lives only in process memory; the per-user random salt is
/// the single piece of key material persisted (`data/keys/user_salt.bin`).
pub struct CryptoService {
    keys_dir: PathBuf,
    master_key: Mutex<Option<[u8; 32]>>,
}

impl CryptoService {
    pub fn new(home: &NimbusHome) -> Result<Self> {
        Ok(Self {
            keys_dir: home.keys_dir()?,
            master_key: Mutex::new(None),
        })
    }

    /// Derives and installs the master key from the user password.
    pub fn set_password(&self, password: &str) -> Result<()> {
        if password.is_empty() {
            return Err(CoreErr::InvalidInput("password cannot be empty".into()));
        }
        let salt = self.get_or_create_salt()?;
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut key);
        *self.lock_key() = Some(key);
        Ok(())
    }

    pub fn has_key(&self) -> bool {
        self.lock_key().is_some()
    }

    /// Overwrites then drops the in-memory key.
    pub fn clear_master_key(&self) {
        let mut guard = self.lock_key();
        if let Some(key) = guard.as_mut() {
            key.fill(0);
        }
        *guard = None;
    }

    /// Encrypts `plaintext` and returns base64(nonce || ciphertext || tag).
    pub fn encrypt_string(&self, plaintext: &str, associated_data: Option<&str>) -> Result<String> {
        let key = self.current_key()?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: associated_data.unwrap_or("").as_bytes(),
                },
            )
            .map_err(|_| CoreErr::DecryptFailed)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    /// Inverse of [`Self::encrypt_string`]. The associated data must match
    /// the value used at encryption time.
    pub fn decrypt_string(&self, encoded: &str, associated_data: Option<&str>) -> Result<String> {
        let key = self.current_key()?;
        let combined = BASE64
            .decode(encoded.trim())
            .map_err(|e| CoreErr::BadEnvelope(format!("invalid base64: {e}")))?;
        if combined.len() < NONCE_LEN {
            return Err(CoreErr::BadEnvelope("payload shorter than nonce".into()));
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: associated_data.unwrap_or("").as_bytes(),
                },
            )
            .map_err(|_| CoreErr::DecryptFailed)?;
        String::from_utf8(plaintext).map_err(|e| CoreErr::BadEnvelope(e.to_string()))
    }

    /// Wraps plaintext into the on-disk `ENC:` form.
    pub fn seal(&self, plaintext: &str, associated_data: Option<&str>) -> Result<String> {
        Ok(format!(
            "{ENC_PREFIX}{}",
            self.encrypt_string(plaintext, associated_data)?
        ))
    }

    fn current_key(&self) -> Result<[u8; 32]> {
        self.lock_key().ok_or(CoreErr::KeyNotSet)
    }

    fn lock_key(&self) -> std::sync::MutexGuard<'_, Option<[u8; 32]>> {
        match self.master_key.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn get_or_create_salt(&self) -> Result<[u8; SALT_LEN]> {
        let salt_file = self.keys_dir.join("user_salt.bin");
        if let Ok(existing) = fs::read(&salt_file)
            && existing.len() == SALT_LEN
        {
            let mut salt = [0u8; SALT_LEN];
            salt.copy_from_slice(&existing);
            return Ok(salt);
        }
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        fs::write(&salt_file, salt)?;
        Ok(salt)
    }
}

/// Typed view of an on-disk record: the decoder picks the branch by prefix
/// sniffing and re-encoding preserves the prior branch.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Plain(String),
    Encrypted(String),
}

impl Envelope {
    pub fn sniff(content: &str) -> Self {
        match content.strip_prefix(ENC_PREFIX) {
            Some(rest) => Envelope::Encrypted(rest.to_string()),
            None => Envelope::Plain(content.to_string()),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Envelope::Encrypted(_))
    }

    /// Yields the plaintext. A plain envelope is never run through the
    /// cipher; an encrypted one requires the master key.
    pub fn open(&self, crypto: &CryptoService, associated_data: Option<&str>) -> Result<String> {
        match self {
            Envelope::Plain(text) => Ok(text.clone()),
            Envelope::Encrypted(payload) => crypto.decrypt_string(payload, associated_data),
        }
    }
}

/// Hex-encoded SHA-256, the shape tokens are persisted in.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    fn service() -> (tempfile::TempDir, CryptoService) {
        let tmp = tempfile::tempdir().unwrap();
        let home = NimbusHome::with_root(tmp.path());
        let crypto = CryptoService::new(&home).unwrap();
        (tmp, crypto)
    }

    #[test]
    fn round_trip_with_associated_data() {
        let (_tmp, crypto) = service();
        crypto.set_password("hunter2!").unwrap();
        let sealed = crypto
            .encrypt_string("attack at dawn", Some("tunnel_auth_token"))
            .unwrap();
        let opened = crypto
            .decrypt_string(&sealed, Some("tunnel_auth_token"))
            .unwrap();
        assert_eq!(opened, "attack at dawn");

        // Mismatched associated data must fail authentication.
        assert!(matches!(
            crypto.decrypt_string(&sealed, Some("other_label")),
            Err(CoreErr::DecryptFailed)
        ));
    }

    #[test]
    fn wrong_password_fails_to_decrypt() {
        let tmp = tempfile::tempdir().unwrap();
        let home = NimbusHome::with_root(tmp.path());

        let crypto = CryptoService::new(&home).unwrap();
        crypto.set_password("first-password1").unwrap();
        let sealed = crypto.encrypt_string("secret", None).unwrap();

        // Same salt on disk, different password.
        let other = CryptoService::new(&home).unwrap();
        other.set_password("second-password2").unwrap();
        assert!(matches!(
            other.decrypt_string(&sealed, None),
            Err(CoreErr::DecryptFailed)
        ));

        // Same password derives the same key again.
        let again = CryptoService::new(&home).unwrap();
        again.set_password("first-password1").unwrap();
        assert_eq!(again.decrypt_string(&sealed, None).unwrap(), "secret");
    }

    #[test]
    fn encrypt_without_key_is_refused() {
        let (_tmp, crypto) = service();
        assert!(matches!(
            crypto.encrypt_string("x", None),
            Err(CoreErr::KeyNotSet)
        ));
    }

    #[test]
    fn envelope_sniffing_chooses_branch_by_prefix() {
        let plain = Envelope::sniff("{\"id\":1}");
        assert_eq!(plain, Envelope::Plain("{\"id\":1}".to_string()));
        assert!(!plain.is_encrypted());

        let enc = Envelope::sniff("ENC:abcd");
        assert_eq!(enc, Envelope::Encrypted("abcd".to_string()));
        assert!(enc.is_encrypted());
    }

    #[test]
    fn seal_round_trips_through_envelope() {
        let (_tmp, crypto) = service();
        crypto.set_password("pass-word-3").unwrap();
        let sealed = crypto.seal("payload", None).unwrap();
        assert!(sealed.starts_with("ENC:"));
        let opened = Envelope::sniff(&sealed).open(&crypto, None).unwrap();
        assert_eq!(opened, "payload");
    }

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn clear_master_key_drops_access() {
        let (_tmp, crypto) = service();
        crypto.set_password("some-pass-9").unwrap();
        assert!(crypto.has_key());
        crypto.clear_master_key();
        assert!(!crypto.has_key());
        assert!(matches!(
            crypto.encrypt_string("x", None),
            Err(CoreErr::KeyNotSet)
        ));
    }
}
