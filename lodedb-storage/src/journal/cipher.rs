use crate::conf::CIPHER_KEY_LEN;
use std::sync::Arc;

/// Keystream generator, applied by XOR so encryption and
/// decryption are the same operation.
pub trait StreamCipher {
    /// XOR keystream into given buffer and advance.
    fn crypt(&mut self, buf: &mut [u8]);

    /// Advance keystream without consuming it.
    fn skip(&mut self, n: u64);
}

/// Factory of stream ciphers keyed by 32-byte key and 64-bit IV.
pub trait StreamCipherProvider: Send + Sync {
    fn new_cipher(&self, key: &[u8; CIPHER_KEY_LEN], iv: u64) -> Box<dyn StreamCipher>;
}

/// Stream cipher built on keyed BLAKE3 in XOF mode.
/// Keystream of one block is the extendable output of
/// `keyed_hash(key, iv)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Blake3CipherProvider;

impl StreamCipherProvider for Blake3CipherProvider {
    #[inline]
    fn new_cipher(&self, key: &[u8; CIPHER_KEY_LEN], iv: u64) -> Box<dyn StreamCipher> {
        let mut hasher = blake3::Hasher::new_keyed(key);
        hasher.update(&iv.to_le_bytes());
        Box::new(Blake3Cipher {
            reader: hasher.finalize_xof(),
        })
    }
}

struct Blake3Cipher {
    reader: blake3::OutputReader,
}

const KEYSTREAM_CHUNK: usize = 64;

impl StreamCipher for Blake3Cipher {
    #[inline]
    fn crypt(&mut self, buf: &mut [u8]) {
        let mut keystream = [0u8; KEYSTREAM_CHUNK];
        for chunk in buf.chunks_mut(KEYSTREAM_CHUNK) {
            let ks = &mut keystream[..chunk.len()];
            self.reader.fill(ks);
            for (b, k) in chunk.iter_mut().zip(ks.iter()) {
                *b ^= *k;
            }
        }
    }

    #[inline]
    fn skip(&mut self, n: u64) {
        let pos = self.reader.position();
        self.reader.set_position(pos + n);
    }
}

/// XOR keystream into `buf` which holds bytes at log `address`.
/// The log is split into blocks of `alignment` bytes, each block
/// uses its own IV `basic_iv + block_address / alignment`, so any
/// byte range can be processed independently.
pub fn crypt_blocks(
    provider: &dyn StreamCipherProvider,
    key: &[u8; CIPHER_KEY_LEN],
    basic_iv: u64,
    address: u64,
    buf: &mut [u8],
    alignment: usize,
) {
    let alignment = alignment as u64;
    let mut address = address;
    let mut done = 0;
    while done < buf.len() {
        let block_address = address - address % alignment;
        let offset = address - block_address;
        let n = ((alignment - offset) as usize).min(buf.len() - done);
        let mut cipher =
            provider.new_cipher(key, basic_iv.wrapping_add(block_address / alignment));
        if offset > 0 {
            cipher.skip(offset);
        }
        cipher.crypt(&mut buf[done..done + n]);
        done += n;
        address += n as u64;
    }
}

/// Cipher settings of one opened log.
#[derive(Clone)]
pub struct CipherContext {
    provider: Arc<dyn StreamCipherProvider>,
    key: [u8; CIPHER_KEY_LEN],
    basic_iv: u64,
    alignment: usize,
}

impl CipherContext {
    #[inline]
    pub fn new(
        provider: Arc<dyn StreamCipherProvider>,
        key: [u8; CIPHER_KEY_LEN],
        basic_iv: u64,
        alignment: usize,
    ) -> Self {
        CipherContext {
            provider,
            key,
            basic_iv,
            alignment,
        }
    }

    #[inline]
    pub fn crypt(&self, address: u64, buf: &mut [u8]) {
        crypt_blocks(
            &*self.provider,
            &self.key,
            self.basic_iv,
            address,
            buf,
            self.alignment,
        )
    }
}
