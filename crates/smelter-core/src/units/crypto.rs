//! The `aes` unit: AES-CBC/ECB with PKCS#7 padding.
//!
//! The forward direction decrypts, `-R` encrypts. The key length selects
//! AES-128/192/256. Key and IV are multibin expressions re-evaluated per
//! chunk when volatile, so `--iv cut::16` peels the IV off the front of
//! each payload before decryption.

use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::multibin::{EvalCtx, Multibin};
use crate::unit::{Sink, Unit};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{
    BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit,
};
use aes::{Aes128, Aes192, Aes256};

const BLOCK: usize = 16;

/// Cipher mode of operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    /// Cipher block chaining with an IV
    Cbc,
    /// Electronic codebook
    Ecb,
}

impl CipherMode {
    /// Parses the `--mode` switch value
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "cbc" => Ok(Self::Cbc),
            "ecb" => Ok(Self::Ecb),
            other => Err(Error::argument(format!("unsupported cipher mode: {other}"))),
        }
    }
}

/// The `aes` unit
pub struct Aes {
    key: Multibin,
    iv: Option<Multibin>,
    mode: CipherMode,
}

impl Aes {
    /// Creates the unit from bound key and IV expressions
    pub fn new(key: Multibin, iv: Option<Multibin>, mode: CipherMode) -> Self {
        Self { key, iv, mode }
    }

    /// Evaluates key and IV against the chunk; the key first, so a
    /// payload-cutting IV expression sees the payload after any key cut
    fn material(&self, chunk: &mut Chunk) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut ctx = EvalCtx::new(chunk);
        let key = self.key.eval(&mut ctx)?;
        let iv = match &self.iv {
            Some(expr) => expr.eval(&mut ctx)?,
            None => vec![0u8; BLOCK],
        };
        if !matches!(key.len(), 16 | 24 | 32) {
            return Err(Error::argument(format!(
                "AES key must be 16, 24 or 32 bytes, got {}",
                key.len()
            )));
        }
        if self.mode == CipherMode::Cbc && iv.len() != BLOCK {
            return Err(Error::argument(format!(
                "AES IV must be {BLOCK} bytes, got {}",
                iv.len()
            )));
        }
        Ok((key, iv))
    }
}

fn cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    macro_rules! with {
        ($cipher:ty) => {
            cbc::Decryptor::<$cipher>::new_from_slices(key, iv)
                .map_err(|e| Error::argument(e.to_string()))?
                .decrypt_padded_vec_mut::<Pkcs7>(data)
                .map_err(|_| Error::unit("aes", "invalid padding after decryption"))
        };
    }
    match key.len() {
        16 => with!(Aes128),
        24 => with!(Aes192),
        _ => with!(Aes256),
    }
}

fn cbc_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    macro_rules! with {
        ($cipher:ty) => {
            Ok(cbc::Encryptor::<$cipher>::new_from_slices(key, iv)
                .map_err(|e| Error::argument(e.to_string()))?
                .encrypt_padded_vec_mut::<Pkcs7>(data))
        };
    }
    match key.len() {
        16 => with!(Aes128),
        24 => with!(Aes192),
        _ => with!(Aes256),
    }
}

fn ecb_decrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() || data.len() % BLOCK != 0 {
        return Err(Error::unit("aes", "ciphertext is not block aligned"));
    }
    let mut out = data.to_vec();
    macro_rules! with {
        ($cipher:ty) => {{
            let cipher =
                <$cipher>::new_from_slice(key).map_err(|e| Error::argument(e.to_string()))?;
            for block in out.chunks_mut(BLOCK) {
                cipher.decrypt_block(GenericArray::from_mut_slice(block));
            }
        }};
    }
    match key.len() {
        16 => with!(Aes128),
        24 => with!(Aes192),
        _ => with!(Aes256),
    }
    strip_pkcs7(out)
}

fn ecb_encrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut out = data.to_vec();
    let pad = BLOCK - out.len() % BLOCK;
    out.extend(std::iter::repeat(pad as u8).take(pad));
    macro_rules! with {
        ($cipher:ty) => {{
            let cipher =
                <$cipher>::new_from_slice(key).map_err(|e| Error::argument(e.to_string()))?;
            for block in out.chunks_mut(BLOCK) {
                cipher.encrypt_block(GenericArray::from_mut_slice(block));
            }
        }};
    }
    match key.len() {
        16 => with!(Aes128),
        24 => with!(Aes192),
        _ => with!(Aes256),
    }
    Ok(out)
}

fn strip_pkcs7(mut data: Vec<u8>) -> Result<Vec<u8>> {
    let pad = *data.last().ok_or_else(|| Error::unit("aes", "empty plaintext"))? as usize;
    if pad == 0 || pad > BLOCK || pad > data.len() {
        return Err(Error::unit("aes", "invalid padding after decryption"));
    }
    if !data[data.len() - pad..].iter().all(|&b| b as usize == pad) {
        return Err(Error::unit("aes", "invalid padding after decryption"));
    }
    data.truncate(data.len() - pad);
    Ok(data)
}

impl Unit for Aes {
    fn process(&mut self, mut chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        let (key, iv) = self.material(&mut chunk)?;
        let plain = match self.mode {
            CipherMode::Cbc => cbc_decrypt(&key, &iv, chunk.data()),
            CipherMode::Ecb => ecb_decrypt(&key, chunk.data()),
        }
        .map_err(|e| match e {
            Error::Unit { details, .. } => {
                Error::unit("aes", details).with_path(chunk.path_string())
            }
            other => other,
        })?;
        chunk.set_data(plain);
        sink(chunk)
    }

    fn reverse(&mut self, mut chunk: Chunk, sink: Sink<'_>) -> Result<()> {
        let (key, iv) = self.material(&mut chunk)?;
        let sealed = match self.mode {
            CipherMode::Cbc => cbc_encrypt(&key, &iv, chunk.data())?,
            CipherMode::Ecb => ecb_encrypt(&key, chunk.data())?,
        };
        chunk.set_data(sealed);
        sink(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multibin::handlers::hex_decode;

    fn collect(unit: &mut Aes, data: Vec<u8>, reverse: bool) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut sink = |c: Chunk| {
            out.push(c.into_data());
            Ok(())
        };
        let chunk = Chunk::new(data);
        if reverse {
            unit.reverse(chunk, &mut sink)?;
        } else {
            unit.process(chunk, &mut sink)?;
        }
        Ok(out.remove(0))
    }

    #[test]
    fn test_cbc_known_vector() {
        // key = pbkdf2_hmac_sha1("swordfish", "s4lty", 1000, 32)
        // iv  = 000102…0f, plaintext "attack at dawn"
        let mut unit = Aes::new(
            Multibin::parse("pbkdf2[32,s4lty]:swordfish").unwrap(),
            Some(Multibin::parse("hex:000102030405060708090a0b0c0d0e0f").unwrap()),
            CipherMode::Cbc,
        );
        let ciphertext = hex_decode(b"3f1a967f2968c85ac7b3fd566797ed50").unwrap();
        assert_eq!(
            collect(&mut unit, ciphertext.clone(), false).unwrap(),
            b"attack at dawn"
        );
        assert_eq!(
            collect(&mut unit, b"attack at dawn".to_vec(), true).unwrap(),
            ciphertext
        );
    }

    #[test]
    fn test_iv_cut_from_payload() {
        let mut encrypt = Aes::new(
            Multibin::parse("pbkdf2[32,s]:pw").unwrap(),
            Some(Multibin::parse("md5:x").unwrap()),
            CipherMode::Cbc,
        );
        let sealed = collect(&mut encrypt, b"hi".to_vec(), true).unwrap();

        // prepend the IV, then let --iv cut::16 recover it per chunk
        let mut transport = hex_decode(b"9dd4e461268c8034f5c8564e155c67a6").unwrap();
        transport.extend_from_slice(&sealed);
        let mut decrypt = Aes::new(
            Multibin::parse("pbkdf2[32,s]:pw").unwrap(),
            Some(Multibin::parse("cut:0:16").unwrap()),
            CipherMode::Cbc,
        );
        assert_eq!(collect(&mut decrypt, transport, false).unwrap(), b"hi");
    }

    #[test]
    fn test_ecb_roundtrip() {
        let mut unit = Aes::new(
            Multibin::parse("rep[16]:k").unwrap(),
            None,
            CipherMode::Ecb,
        );
        let sealed = collect(&mut unit, b"sixteen byte msg".to_vec(), true).unwrap();
        assert_eq!(sealed.len(), 32);
        assert_eq!(
            collect(&mut unit, sealed, false).unwrap(),
            b"sixteen byte msg"
        );
    }

    #[test]
    fn test_bad_key_length_is_fatal() {
        let mut unit = Aes::new(Multibin::parse("shortkey").unwrap(), None, CipherMode::Cbc);
        let err = collect(&mut unit, vec![0u8; 16], false).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_wrong_key_is_unit_error() {
        let mut unit = Aes::new(Multibin::parse("rep[16]:a").unwrap(), None, CipherMode::Cbc);
        let sealed = collect(&mut unit, b"secret".to_vec(), true).unwrap();
        let mut wrong = Aes::new(Multibin::parse("rep[16]:b").unwrap(), None, CipherMode::Cbc);
        let err = collect(&mut wrong, sealed, false).unwrap_err();
        assert!(!err.is_fatal());
    }
}
