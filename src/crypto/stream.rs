//! Chunked AES-256-CBC file pipeline
//!
//! Plaintext and ciphertext are moved through a fixed-size buffer, so peak
//! memory is bounded by the chunk size regardless of file size. The on-disk
//! format is raw CBC blocks with PKCS#7 padding and no header:
//!
//! ```text
//! [block 0][block 1]...[block n (padded)]
//! ```
//!
//! CBC carries no authentication tag. Decrypting with the wrong key or IV
//! completes normally and yields garbage; a successful decrypt is not proof
//! that the plaintext is the one originally stored.

use crate::crypto::{KeyMaterial, BLOCK_SIZE, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use crate::error::{Error, Result};
use cbc::cipher::block_padding::{Padding, Pkcs7};
use cbc::cipher::consts::U16;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use std::io;
use std::path::Path;
use crate::staging::create_exclusive;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Streaming encrypt/decrypt between byte streams and files
#[derive(Debug, Clone, Copy)]
pub struct StreamCipher {
    chunk_size: usize,
}

impl Default for StreamCipher {
    fn default() -> Self {
        StreamCipher::new(DEFAULT_CHUNK_SIZE)
    }
}

impl StreamCipher {
    /// Create a pipeline with the given chunk size, clamped to
    /// `BLOCK_SIZE..=MAX_CHUNK_SIZE` and rounded up to whole blocks
    pub fn new(chunk_size: usize) -> Self {
        let blocks = chunk_size.clamp(BLOCK_SIZE, MAX_CHUNK_SIZE).div_ceil(BLOCK_SIZE);
        StreamCipher {
            chunk_size: blocks * BLOCK_SIZE,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Encrypt everything read from `source` into a new file at `dest`.
    ///
    /// Returns the number of plaintext bytes consumed. On failure the
    /// partially written destination is removed before the error is returned.
    /// `dest` must not exist yet.
    pub async fn encrypt<R>(&self, source: &mut R, dest: &Path, material: &KeyMaterial) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut output = create_dest(dest)?;

        match self.encrypt_into(source, &mut output, material).await {
            Ok(total) => {
                debug!("Encrypted {} bytes into {:?}", total, dest);
                Ok(total)
            }
            Err(e) => {
                drop(output);
                discard_partial(dest).await;
                Err(e)
            }
        }
    }

    /// Decrypt the blob at `source` into a new file at `dest` using hex key material.
    ///
    /// The key and IV are validated before any file is touched.
    pub async fn decrypt(&self, source: &Path, dest: &Path, key_hex: &str, iv_hex: &str) -> Result<u64> {
        let material = KeyMaterial::from_hex(key_hex, iv_hex)?;
        self.decrypt_with(source, dest, &material).await
    }

    /// Decrypt the blob at `source` into a new file at `dest`.
    pub async fn decrypt_with(&self, source: &Path, dest: &Path, material: &KeyMaterial) -> Result<u64> {
        let mut input = File::open(source).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound(format!("encrypted blob {:?}", source)),
            _ => Error::CipherIo(format!("failed to open {:?}: {}", source, e)),
        })?;
        let mut output = create_dest(dest)?;

        match self.decrypt_into(&mut input, &mut output, material).await {
            Ok(total) => {
                debug!("Decrypted {:?} into {:?} ({} bytes)", source, dest, total);
                Ok(total)
            }
            Err(e) => {
                drop(output);
                discard_partial(dest).await;
                Err(e)
            }
        }
    }

    async fn encrypt_into<R>(&self, source: &mut R, output: &mut File, material: &KeyMaterial) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut cipher = Aes256CbcEnc::new(
            GenericArray::from_slice(material.key()),
            GenericArray::from_slice(material.iv()),
        );
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0usize;
        let mut total = 0u64;

        loop {
            let n = source
                .read(&mut buf[filled..])
                .await
                .map_err(|e| cipher_io("read plaintext", e))?;
            if n == 0 {
                break;
            }
            filled += n;
            total += n as u64;

            if filled == buf.len() {
                encrypt_blocks(&mut cipher, &mut buf);
                output
                    .write_all(&buf)
                    .await
                    .map_err(|e| cipher_io("write ciphertext", e))?;
                filled = 0;
            }
        }

        // Whole blocks left in the buffer, then the padded tail block
        let full = filled - filled % BLOCK_SIZE;
        let tail_len = filled - full;
        encrypt_blocks(&mut cipher, &mut buf[..full]);

        let mut last = [0u8; BLOCK_SIZE];
        last[..tail_len].copy_from_slice(&buf[full..filled]);
        let block = GenericArray::from_mut_slice(&mut last);
        <Pkcs7 as Padding<U16>>::pad(block, tail_len);
        cipher.encrypt_block_mut(block);

        output
            .write_all(&buf[..full])
            .await
            .map_err(|e| cipher_io("write ciphertext", e))?;
        output
            .write_all(&last)
            .await
            .map_err(|e| cipher_io("write ciphertext", e))?;
        finish(output).await?;

        Ok(total)
    }

    async fn decrypt_into(&self, input: &mut File, output: &mut File, material: &KeyMaterial) -> Result<u64> {
        let mut cipher = Aes256CbcDec::new(
            GenericArray::from_slice(material.key()),
            GenericArray::from_slice(material.iv()),
        );
        // One spare block: the final block is held back until EOF for unpadding
        let mut buf = vec![0u8; self.chunk_size + BLOCK_SIZE];
        let mut filled = 0usize;
        let mut total = 0u64;

        loop {
            let n = input
                .read(&mut buf[filled..])
                .await
                .map_err(|e| cipher_io("read ciphertext", e))?;
            if n == 0 {
                break;
            }
            filled += n;

            if filled == buf.len() {
                let ready = filled - BLOCK_SIZE;
                decrypt_blocks(&mut cipher, &mut buf[..ready]);
                output
                    .write_all(&buf[..ready])
                    .await
                    .map_err(|e| cipher_io("write plaintext", e))?;
                total += ready as u64;
                buf.copy_within(ready..filled, 0);
                filled = BLOCK_SIZE;
            }
        }

        if filled == 0 || filled % BLOCK_SIZE != 0 {
            return Err(Error::CipherIo(format!(
                "ciphertext is truncated: {} trailing bytes do not form whole blocks",
                filled
            )));
        }

        let ready = filled - BLOCK_SIZE;
        decrypt_blocks(&mut cipher, &mut buf[..ready]);
        output
            .write_all(&buf[..ready])
            .await
            .map_err(|e| cipher_io("write plaintext", e))?;
        total += ready as u64;

        let block = GenericArray::from_mut_slice(&mut buf[ready..filled]);
        cipher.decrypt_block_mut(block);
        let plain_len = match <Pkcs7 as Padding<U16>>::unpad(block) {
            Ok(plain) => plain.len(),
            Err(_) => {
                warn!("Invalid padding in final block; key material may not match this blob");
                BLOCK_SIZE
            }
        };
        output
            .write_all(&buf[ready..ready + plain_len])
            .await
            .map_err(|e| cipher_io("write plaintext", e))?;
        total += plain_len as u64;
        finish(output).await?;

        Ok(total)
    }
}

fn encrypt_blocks(cipher: &mut Aes256CbcEnc, data: &mut [u8]) {
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn decrypt_blocks(cipher: &mut Aes256CbcDec, data: &mut [u8]) {
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn create_dest(dest: &Path) -> Result<File> {
    create_exclusive(dest)
        .map(File::from_std)
        .map_err(|e| match e.kind() {
            // Missing or unwritable staging root
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => Error::storage(dest, e),
            _ => Error::CipherIo(format!("failed to create {:?}: {}", dest, e)),
        })
}

async fn finish(output: &mut File) -> Result<()> {
    output.flush().await.map_err(|e| cipher_io("flush output", e))?;
    output.sync_all().await.map_err(|e| cipher_io("sync output", e))
}

/// Remove a partially written destination
async fn discard_partial(dest: &Path) {
    match tokio::fs::remove_file(dest).await {
        Ok(()) => debug!("Discarded partial output {:?}", dest),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to discard partial output {:?}: {}", dest, e),
    }
}

fn cipher_io(stage: &str, e: io::Error) -> Error {
    Error::CipherIo(format!("{} failed: {}", stage, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tempfile::TempDir;
    use tokio::io::ReadBuf;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
    const IV_HEX: &str = "0f0e0d0c0b0a09080706050403020100";

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    async fn roundtrip(cipher: &StreamCipher, dir: &Path, plaintext: &[u8]) -> Vec<u8> {
        let material = KeyMaterial::generate().unwrap();
        let enc = dir.join(format!("enc-{}", plaintext.len()));
        let dec = dir.join(format!("dec-{}", plaintext.len()));

        let mut source = plaintext;
        let consumed = cipher.encrypt(&mut source, &enc, &material).await.unwrap();
        assert_eq!(consumed, plaintext.len() as u64);

        let ciphertext_len = std::fs::metadata(&enc).unwrap().len() as usize;
        assert_eq!(ciphertext_len, (plaintext.len() / BLOCK_SIZE + 1) * BLOCK_SIZE);

        let produced = cipher
            .decrypt(&enc, &dec, &material.key_hex(), &material.iv_hex())
            .await
            .unwrap();
        assert_eq!(produced, plaintext.len() as u64);
        std::fs::read(&dec).unwrap()
    }

    /// Reader that yields `limit` bytes and then fails
    struct FailingReader {
        remaining: usize,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.remaining == 0 {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away")));
            }
            let n = self.remaining.min(buf.remaining()).min(10);
            buf.put_slice(&vec![7u8; n]);
            self.remaining -= n;
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_chunk_size_rounding() {
        assert_eq!(StreamCipher::new(0).chunk_size(), BLOCK_SIZE);
        assert_eq!(StreamCipher::new(17).chunk_size(), 32);
        assert_eq!(StreamCipher::new(64).chunk_size(), 64);
        assert_eq!(StreamCipher::default().chunk_size(), DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_chunk_size_is_capped() {
        assert_eq!(StreamCipher::new(usize::MAX).chunk_size(), MAX_CHUNK_SIZE);
        assert_eq!(StreamCipher::new(MAX_CHUNK_SIZE + 1).chunk_size(), MAX_CHUNK_SIZE);
    }

    #[tokio::test]
    async fn test_roundtrip_sizes() {
        let temp = TempDir::new().unwrap();
        let cipher = StreamCipher::new(64);

        for len in [0, 1, 15, 16, 17, 63, 64, 65, 80, 79, 3 * 64 + 5, 1000] {
            let plaintext = pattern(len);
            let decrypted = roundtrip(&cipher, temp.path(), &plaintext).await;
            assert_eq!(decrypted, plaintext, "length {}", len);
        }
    }

    #[tokio::test]
    async fn test_roundtrip_default_chunk_large() {
        let temp = TempDir::new().unwrap();
        let cipher = StreamCipher::default();
        let plaintext = pattern(DEFAULT_CHUNK_SIZE * 2 + 123);

        let decrypted = roundtrip(&cipher, temp.path(), &plaintext).await;
        assert_eq!(decrypted, plaintext);
    }

    #[tokio::test]
    async fn test_matches_reference_ciphertext() {
        // openssl enc -aes-256-cbc -K <KEY_HEX> -iv <IV_HEX>
        let temp = TempDir::new().unwrap();
        let cipher = StreamCipher::new(16);
        let material = KeyMaterial::from_hex(KEY_HEX, IV_HEX).unwrap();
        let enc = temp.path().join("blob.enc");

        let mut source: &[u8] = b"hello world, encrypt me!";
        cipher.encrypt(&mut source, &enc, &material).await.unwrap();

        assert_eq!(
            hex::encode(std::fs::read(&enc).unwrap()),
            "ec5e8d0488ae68022d88cd6ebb4390cd107bc53c1107f049c43563d1c1d8f6bd"
        );
    }

    #[tokio::test]
    async fn test_wrong_key_yields_garbage() {
        let temp = TempDir::new().unwrap();
        let cipher = StreamCipher::new(64);
        let right = KeyMaterial::generate().unwrap();
        let wrong = KeyMaterial::generate().unwrap();
        let plaintext = pattern(300);
        let enc = temp.path().join("blob.enc");
        let dec = temp.path().join("plain");

        let mut source = plaintext.as_slice();
        cipher.encrypt(&mut source, &enc, &right).await.unwrap();

        cipher
            .decrypt(&enc, &dec, &wrong.key_hex(), &wrong.iv_hex())
            .await
            .unwrap();
        assert_ne!(std::fs::read(&dec).unwrap(), plaintext);
    }

    #[tokio::test]
    async fn test_truncated_ciphertext_removes_output() {
        let temp = TempDir::new().unwrap();
        let cipher = StreamCipher::new(64);
        let material = KeyMaterial::generate().unwrap();
        let enc = temp.path().join("blob.enc");
        let dec = temp.path().join("plain");

        let plaintext = pattern(200);
        let mut reader = plaintext.as_slice();
        cipher.encrypt(&mut reader, &enc, &material).await.unwrap();

        let mut ciphertext = std::fs::read(&enc).unwrap();
        ciphertext.truncate(ciphertext.len() - 5);
        std::fs::write(&enc, &ciphertext).unwrap();

        let err = cipher.decrypt_with(&enc, &dec, &material).await.unwrap_err();
        assert!(matches!(err, Error::CipherIo(_)));
        assert!(!dec.exists());
    }

    #[tokio::test]
    async fn test_empty_ciphertext_is_rejected() {
        let temp = TempDir::new().unwrap();
        let material = KeyMaterial::generate().unwrap();
        let enc = temp.path().join("empty.enc");
        let dec = temp.path().join("plain");
        std::fs::write(&enc, b"").unwrap();

        let err = StreamCipher::default()
            .decrypt_with(&enc, &dec, &material)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CipherIo(_)));
        assert!(!dec.exists());
    }

    #[tokio::test]
    async fn test_failing_source_removes_output() {
        let temp = TempDir::new().unwrap();
        let cipher = StreamCipher::new(16);
        let material = KeyMaterial::generate().unwrap();
        let enc = temp.path().join("blob.enc");

        let mut reader = FailingReader { remaining: 45 };
        let err = cipher.encrypt(&mut reader, &enc, &material).await.unwrap_err();

        assert!(matches!(err, Error::CipherIo(_)));
        assert!(!enc.exists());
    }

    #[tokio::test]
    async fn test_bad_hex_rejected_before_io() {
        let temp = TempDir::new().unwrap();
        let dec = temp.path().join("plain");

        let err = StreamCipher::default()
            .decrypt(&temp.path().join("missing.enc"), &dec, "not-hex", IV_HEX)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert!(!dec.exists());
    }

    #[tokio::test]
    async fn test_missing_source_is_not_found() {
        let temp = TempDir::new().unwrap();
        let dec = temp.path().join("plain");

        let err = StreamCipher::default()
            .decrypt(&temp.path().join("missing.enc"), &dec, KEY_HEX, IV_HEX)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NotFound(_)));
        assert!(!dec.exists());
    }

    #[tokio::test]
    async fn test_existing_destination_is_not_clobbered() {
        let temp = TempDir::new().unwrap();
        let material = KeyMaterial::generate().unwrap();
        let enc = temp.path().join("blob.enc");
        std::fs::write(&enc, b"keep me").unwrap();

        let mut source: &[u8] = b"new data";
        let err = StreamCipher::default()
            .encrypt(&mut source, &enc, &material)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CipherIo(_)));
        assert_eq!(std::fs::read(&enc).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn test_missing_root_is_storage_unavailable() {
        let temp = TempDir::new().unwrap();
        let material = KeyMaterial::generate().unwrap();
        let enc = temp.path().join("gone").join("blob.enc");

        let mut source: &[u8] = b"data";
        let err = StreamCipher::default()
            .encrypt(&mut source, &enc, &material)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::StorageUnavailable { .. }));
    }
}
