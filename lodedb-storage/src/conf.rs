use crate::error::{Error, Result};
use byte_unit::Byte;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_LOG_PAGE_SIZE: Byte = Byte::from_u64(4096);
pub const MIN_LOG_PAGE_SIZE: u64 = 256;
pub const DEFAULT_LOG_SEGMENT_SIZE: Byte = Byte::from_u64(8 * 1024 * 1024);
pub const DEFAULT_LOG_HASH_CODE: bool = true;
pub const DEFAULT_LOG_CHECK_PAGES: bool = true;
pub const DEFAULT_CIPHER_ALIGNMENT: usize = 1024;
pub const CIPHER_KEY_LEN: usize = 32;
pub const DEFAULT_TREE_PAGE_BUDGET: Byte = Byte::from_u64(4096);
pub const DEFAULT_MAX_EMBEDDED_KEY_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    // Size of single log page, the unit of read, verification
    // and decryption. Must be power of two.
    pub page_size: Byte,
    // Size of one log segment. Loggables never cross segment
    // boundary, writer pads the rest of segment with null loggables.
    pub segment_size: Byte,
    // Whether each page carries a trailing 8-byte hash code.
    pub hash_code: bool,
    // Whether pages are verified on read.
    pub check_pages: bool,
    // Hex-encoded 32-byte key of stream cipher.
    // Encryption is disabled if not set.
    pub cipher_key: Option<String>,
    // Basic IV combined with block address to derive per-block IV.
    pub cipher_basic_iv: u64,
    // Size of cipher block, each block restarts keystream.
    pub cipher_alignment: usize,
}

impl LogConfig {
    #[inline]
    pub fn page_size<T>(mut self, page_size: T) -> Self
    where
        Byte: From<T>,
    {
        self.page_size = Byte::from(page_size);
        self
    }

    #[inline]
    pub fn segment_size<T>(mut self, segment_size: T) -> Self
    where
        Byte: From<T>,
    {
        self.segment_size = Byte::from(segment_size);
        self
    }

    #[inline]
    pub fn hash_code(mut self, hash_code: bool) -> Self {
        self.hash_code = hash_code;
        self
    }

    #[inline]
    pub fn check_pages(mut self, check_pages: bool) -> Self {
        self.check_pages = check_pages;
        self
    }

    /// Enable encryption with given key and basic IV.
    #[inline]
    pub fn cipher(mut self, key: &[u8; CIPHER_KEY_LEN], basic_iv: u64) -> Self {
        self.cipher_key = Some(hex::encode(key));
        self.cipher_basic_iv = basic_iv;
        self
    }

    #[inline]
    pub fn cipher_alignment(mut self, cipher_alignment: usize) -> Self {
        self.cipher_alignment = cipher_alignment;
        self
    }

    /// Returns decoded cipher key if encryption is enabled.
    #[inline]
    pub fn cipher_key_bytes(&self) -> Result<Option<[u8; CIPHER_KEY_LEN]>> {
        let Some(key) = self.cipher_key.as_ref() else {
            return Ok(None);
        };
        let mut bytes = [0u8; CIPHER_KEY_LEN];
        hex::decode_to_slice(key, &mut bytes)?;
        Ok(Some(bytes))
    }

    #[inline]
    pub fn page_size_usize(&self) -> usize {
        self.page_size.as_u64() as usize
    }

    #[inline]
    pub fn segment_size_u64(&self) -> u64 {
        self.segment_size.as_u64()
    }

    pub fn validate(&self) -> Result<()> {
        let page_size = self.page_size.as_u64();
        if page_size < MIN_LOG_PAGE_SIZE || !page_size.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "page size {page_size} must be power of two and at least {MIN_LOG_PAGE_SIZE}"
            )));
        }
        let segment_size = self.segment_size.as_u64();
        if segment_size < page_size || segment_size % page_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "segment size {segment_size} must be multiple of page size {page_size}"
            )));
        }
        if self.cipher_alignment == 0 || self.cipher_alignment % 8 != 0 {
            return Err(Error::InvalidConfig(format!(
                "cipher alignment {} must be positive multiple of 8",
                self.cipher_alignment
            )));
        }
        self.cipher_key_bytes()?;
        Ok(())
    }
}

impl Default for LogConfig {
    #[inline]
    fn default() -> Self {
        LogConfig {
            page_size: DEFAULT_LOG_PAGE_SIZE,
            segment_size: DEFAULT_LOG_SEGMENT_SIZE,
            hash_code: DEFAULT_LOG_HASH_CODE,
            check_pages: DEFAULT_LOG_CHECK_PAGES,
            cipher_key: None,
            cipher_basic_iv: 0,
            cipher_alignment: DEFAULT_CIPHER_ALIGNMENT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    // Maximum serialized size of one tree page.
    // Spill splits pages exceeding it.
    pub page_budget: Byte,
    // Keys longer than this are stored as standalone loggables
    // and referenced from page by address.
    pub max_embedded_key_size: usize,
}

impl TreeConfig {
    #[inline]
    pub fn page_budget<T>(mut self, page_budget: T) -> Self
    where
        Byte: From<T>,
    {
        self.page_budget = Byte::from(page_budget);
        self
    }

    #[inline]
    pub fn max_embedded_key_size(mut self, max_embedded_key_size: usize) -> Self {
        self.max_embedded_key_size = max_embedded_key_size;
        self
    }

    #[inline]
    pub fn page_budget_usize(&self) -> usize {
        self.page_budget.as_u64() as usize
    }

    pub fn validate(&self) -> Result<()> {
        // header, tree size, and two entries with the longest embedded keys.
        let min_budget = 16 + 2 * (16 + self.max_embedded_key_size);
        if self.page_budget_usize() < min_budget {
            return Err(Error::InvalidConfig(format!(
                "page budget {} must be at least {min_budget}",
                self.page_budget_usize()
            )));
        }
        Ok(())
    }
}

impl Default for TreeConfig {
    #[inline]
    fn default() -> Self {
        TreeConfig {
            page_budget: DEFAULT_TREE_PAGE_BUDGET,
            max_embedded_key_size: DEFAULT_MAX_EMBEDDED_KEY_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub log: LogConfig,
    pub tree: TreeConfig,
}

impl StoreConfig {
    #[inline]
    pub fn log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    #[inline]
    pub fn tree(mut self, tree: TreeConfig) -> Self {
        self.tree = tree;
        self
    }

    /// Parse and validate config in TOML format.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let conf: StoreConfig = toml::from_str(s)?;
        conf.validate()?;
        Ok(conf)
    }

    /// Load config from TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }

    #[inline]
    pub fn validate(&self) -> Result<()> {
        self.log.validate()?;
        self.tree.validate()
    }
}
