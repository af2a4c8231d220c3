//! At-rest encryption for persisted Instagram session blobs.
//!
//! The blob itself is opaque to the bot (it is whatever the client's
//! `dump_settings` produced); we only make sure it never hits the database in
//! plaintext. Passphrase-based `age` encryption, key from config.

use std::io::{Read, Write};

use crate::{Error, Result};

pub struct SessionVault {
    passphrase: String,
}

impl SessionVault {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: passphrase.into(),
        }
    }

    /// Encrypt a settings dump for storage.
    pub fn seal(&self, plaintext: &str) -> Result<Vec<u8>> {
        let encryptor = age::Encryptor::with_user_passphrase(age::secrecy::Secret::new(
            self.passphrase.clone(),
        ));

        let mut sealed = vec![];
        let mut writer = encryptor
            .wrap_output(&mut sealed)
            .map_err(|e| Error::Vault(e.to_string()))?;
        writer
            .write_all(plaintext.as_bytes())
            .map_err(|e| Error::Vault(e.to_string()))?;
        writer.finish().map_err(|e| Error::Vault(e.to_string()))?;

        Ok(sealed)
    }

    /// Decrypt a stored blob back into the settings dump.
    pub fn open(&self, sealed: &[u8]) -> Result<String> {
        let decryptor = match age::Decryptor::new(sealed) {
            Ok(age::Decryptor::Passphrase(d)) => d,
            Ok(_) => {
                return Err(Error::Vault(
                    "unexpected encryption format (expected passphrase)".to_string(),
                ))
            }
            Err(e) => return Err(Error::Vault(e.to_string())),
        };

        let mut plaintext = vec![];
        let mut reader = decryptor
            .decrypt(&age::secrecy::Secret::new(self.passphrase.clone()), None)
            .map_err(|e| Error::Vault(e.to_string()))?;
        reader
            .read_to_end(&mut plaintext)
            .map_err(|e| Error::Vault(e.to_string()))?;

        String::from_utf8(plaintext).map_err(|e| Error::Vault(format!("invalid utf-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let vault = SessionVault::new("correct horse battery staple");
        let sealed = vault.seal(r#"{"uuid":"abc","cookies":{}}"#).unwrap();
        assert_ne!(sealed, br#"{"uuid":"abc","cookies":{}}"#.to_vec());

        let opened = vault.open(&sealed).unwrap();
        assert_eq!(opened, r#"{"uuid":"abc","cookies":{}}"#);
    }

    #[test]
    fn wrong_passphrase_is_an_error() {
        let sealed = SessionVault::new("first-key").seal("secret").unwrap();
        let err = SessionVault::new("second-key").open(&sealed).unwrap_err();
        assert!(matches!(err, Error::Vault(_)));
    }

    #[test]
    fn garbage_input_is_an_error() {
        let vault = SessionVault::new("k");
        assert!(vault.open(b"not an age file").is_err());
    }
}
