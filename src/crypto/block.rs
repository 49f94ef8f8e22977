//! Block-wise authenticated encryption of file contents
//!
//! Plaintext is cut into fixed-size blocks. Block `i` is stored as one record
//! at backing offset `i * (block_size + TAG_SIZE)`:
//!
//! ```text
//! [ciphertext(i): len <= block_size][tag(i): 16]
//! ```
//!
//! Every record is full-size except possibly the last, so the plaintext
//! length of a file is recoverable from its backing length alone.
//!
//! Nonces are never stored. The nonce of block `i` of file `id` is
//! `base_nonce XOR (id as u64 BE || i as u32 BE)`, which is distinct for every
//! `(id, i)` pair. The AAD binds the record to the same pair, so records moved
//! between positions or files fail authentication. The nonce carries no
//! write counter: rewriting a block seals it again under the same nonce, and
//! a backing inode number reused after unlink repeats the nonces of the file
//! that held it before.
//!
//! A trailing record too short to hold a tag (a torn write) only affects
//! reads that reach it. Writers drop it before touching the file.

use crate::crypto::{MountKey, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use tracing::{debug, error, warn};

/// Blocks written per batch when a truncate grows a file
const EXTEND_BATCH_BLOCKS: usize = 64;

/// Positioned reads from backing storage
pub trait BlockSource {
    /// Read into `buf` at `offset`, returning bytes read (0 at EOF)
    fn read_block_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Current length of the backing object in bytes
    fn backing_len(&self) -> io::Result<u64>;
}

/// Positioned writes to backing storage
pub trait BlockTarget: BlockSource {
    /// Write all of `buf` at `offset`
    fn write_block_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Cut or extend the backing object to `len` bytes
    fn truncate_to(&self, len: u64) -> io::Result<()>;
}

impl BlockSource for File {
    fn read_block_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        FileExt::read_at(self, buf, offset)
    }

    fn backing_len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

impl BlockTarget for File {
    fn write_block_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        FileExt::write_all_at(self, buf, offset)
    }

    fn truncate_to(&self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// One encrypted block ready to be written
#[derive(Debug, Clone)]
pub struct SealedBlock {
    /// Block index in the plaintext grid
    pub index: u64,
    /// Where the record starts in the backing file
    pub backing_offset: u64,
    /// `ciphertext || tag`
    pub bytes: Vec<u8>,
}

impl SealedBlock {
    /// Plaintext bytes carried by this record
    pub fn plaintext_len(&self) -> usize {
        self.bytes.len() - TAG_SIZE
    }
}

/// Plaintext/backing size arithmetic for a block size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    block_size: usize,
}

impl BlockLayout {
    pub fn new(block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::InvalidArgument(
                "Block size must be greater than 0".to_string(),
            ));
        }
        Ok(Self { block_size })
    }

    /// Plaintext bytes per block
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Backing bytes per full block
    pub fn record_size(&self) -> u64 {
        (self.block_size + TAG_SIZE) as u64
    }

    /// Backing length for a file of `plain_len` plaintext bytes
    pub fn ciphertext_len(&self, plain_len: u64) -> u64 {
        let bs = self.block_size as u64;
        let full = plain_len / bs;
        let rem = plain_len % bs;
        let tail = if rem > 0 { rem + TAG_SIZE as u64 } else { 0 };
        full * self.record_size() + tail
    }

    /// Plaintext length for a backing file of `cipher_len` bytes
    ///
    /// A trailing record too short to hold a tag and one byte means the
    /// backing file was cut mid-record.
    pub fn plaintext_len(&self, cipher_len: u64) -> Result<u64> {
        let record = self.record_size();
        let full = cipher_len / record;
        let rem = cipher_len % record;

        if rem == 0 {
            return Ok(full * self.block_size as u64);
        }
        if rem <= TAG_SIZE as u64 {
            return Err(Error::ShortRead {
                block: full,
                expected: TAG_SIZE + 1,
                actual: rem as usize,
            });
        }
        Ok(full * self.block_size as u64 + rem - TAG_SIZE as u64)
    }

    /// Plaintext bytes held by complete records, ignoring a torn tail
    pub fn complete_plaintext_len(&self, cipher_len: u64) -> u64 {
        self.plaintext_len(cipher_len)
            .unwrap_or((cipher_len / self.record_size()) * self.block_size as u64)
    }
}

/// Block cipher engine for one mount
pub struct BlockCipher {
    key: LessSafeKey,
    base_nonce: [u8; NONCE_SIZE],
    layout: BlockLayout,
    block_size: usize,
}

impl BlockCipher {
    /// Create an engine for the given key, nonce base and block size
    pub fn new(key: &MountKey, base_nonce: [u8; NONCE_SIZE], block_size: usize) -> Result<Self> {
        let layout = BlockLayout::new(block_size)?;
        let unbound = UnboundKey::new(&AES_256_GCM, key.bytes())
            .map_err(|_| Error::KeyDerivation("Invalid AES-256 key".to_string()))?;

        Ok(Self {
            key: LessSafeKey::new(unbound),
            base_nonce,
            layout,
            block_size,
        })
    }

    /// Size arithmetic for this engine's block size
    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    /// Plaintext bytes per block
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn record_size(&self) -> u64 {
        self.layout.record_size()
    }

    /// Backing length for a file of `plain_len` plaintext bytes
    pub fn ciphertext_len(&self, plain_len: u64) -> u64 {
        self.layout.ciphertext_len(plain_len)
    }

    /// Plaintext length for a backing file of `cipher_len` bytes
    pub fn plaintext_len(&self, cipher_len: u64) -> Result<u64> {
        self.layout.plaintext_len(cipher_len)
    }

    /// Nonce for block `index` of file `file_id`
    pub(crate) fn nonce_bytes(&self, file_id: u64, index: u64) -> Result<[u8; NONCE_SIZE]> {
        let index = u32::try_from(index)
            .map_err(|_| Error::FileTooLarge(index.saturating_mul(self.block_size as u64)))?;

        let mut nonce = self.base_nonce;
        for (n, b) in nonce[..8].iter_mut().zip(file_id.to_be_bytes()) {
            *n ^= b;
        }
        for (n, b) in nonce[8..].iter_mut().zip(index.to_be_bytes()) {
            *n ^= b;
        }
        Ok(nonce)
    }

    fn aad(file_id: u64, index: u64) -> [u8; 16] {
        let mut aad = [0u8; 16];
        aad[..8].copy_from_slice(&file_id.to_be_bytes());
        aad[8..].copy_from_slice(&index.to_be_bytes());
        aad
    }

    /// Seal one block of at most `block_size` bytes
    pub fn seal_block(&self, file_id: u64, index: u64, plaintext: &[u8]) -> Result<SealedBlock> {
        debug_assert!(!plaintext.is_empty() && plaintext.len() <= self.block_size);

        let nonce = Nonce::assume_unique_for_key(self.nonce_bytes(file_id, index)?);
        let mut bytes = Vec::with_capacity(plaintext.len() + TAG_SIZE);
        bytes.extend_from_slice(plaintext);

        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, Aad::from(Self::aad(file_id, index)), &mut bytes)
            .map_err(|_| Error::Internal(format!("Failed to seal block {}", index)))?;
        bytes.extend_from_slice(tag.as_ref());

        Ok(SealedBlock {
            index,
            backing_offset: index * self.record_size(),
            bytes,
        })
    }

    /// Verify and decrypt one record in place, returning its plaintext
    pub fn open_block(&self, file_id: u64, index: u64, mut record: Vec<u8>) -> Result<Vec<u8>> {
        if record.len() <= TAG_SIZE {
            return Err(Error::ShortRead {
                block: index,
                expected: TAG_SIZE + 1,
                actual: record.len(),
            });
        }

        let nonce = Nonce::assume_unique_for_key(self.nonce_bytes(file_id, index)?);
        let plain_len = self
            .key
            .open_in_place(nonce, Aad::from(Self::aad(file_id, index)), &mut record)
            .map_err(|_| {
                error!(file_id, block = index, "authentication tag mismatch");
                Error::Integrity { block: index }
            })?
            .len();

        record.truncate(plain_len);
        Ok(record)
    }

    /// Split block-aligned plaintext into sealed blocks
    pub fn encrypt_range(
        &self,
        file_id: u64,
        plaintext: &[u8],
        logical_offset: u64,
    ) -> Result<Vec<SealedBlock>> {
        let bs = self.block_size as u64;
        if logical_offset % bs != 0 {
            return Err(Error::InvalidArgument(format!(
                "Offset {} is not aligned to the {} byte block size",
                logical_offset, bs
            )));
        }

        let first = logical_offset / bs;
        plaintext
            .chunks(self.block_size)
            .enumerate()
            .map(|(i, chunk)| self.seal_block(file_id, first + i as u64, chunk))
            .collect()
    }

    /// Decrypt `[logical_offset, logical_offset + requested_length)`
    ///
    /// Reads stop at end of file. Any failed block fails the whole call,
    /// including a range that reaches a torn final record.
    pub fn decrypt_range<S: BlockSource + ?Sized>(
        &self,
        file_id: u64,
        requested_length: usize,
        logical_offset: u64,
        source: &S,
    ) -> Result<Vec<u8>> {
        if requested_length == 0 {
            return Ok(Vec::new());
        }

        let backing_len = source.backing_len()?;
        let (size, torn) = self.measure(backing_len);
        if torn && logical_offset.saturating_add(requested_length as u64) > size {
            return Err(self.torn_record(file_id, size, backing_len));
        }
        if logical_offset >= size {
            return Ok(Vec::new());
        }

        let end = logical_offset
            .saturating_add(requested_length as u64)
            .min(size);
        let bs = self.block_size as u64;
        let first = logical_offset / bs;
        let last = (end - 1) / bs;

        let mut out = Vec::with_capacity((end - logical_offset) as usize);
        for index in first..=last {
            let block = self.read_block(file_id, index, source, backing_len)?;
            let block_start = index * bs;
            let lo = (logical_offset.max(block_start) - block_start) as usize;
            let hi = (end.min(block_start + block.len() as u64) - block_start) as usize;
            out.extend_from_slice(&block[lo..hi]);
        }

        debug!(file_id, offset = logical_offset, len = out.len(), "decrypted range");
        Ok(out)
    }

    /// Plaintext length of the complete records, and whether a torn record follows
    fn measure(&self, backing_len: u64) -> (u64, bool) {
        match self.layout.plaintext_len(backing_len) {
            Ok(size) => (size, false),
            Err(_) => (self.layout.complete_plaintext_len(backing_len), true),
        }
    }

    fn torn_record(&self, file_id: u64, size: u64, backing_len: u64) -> Error {
        let block = size / self.block_size as u64;
        let actual = (backing_len % self.record_size()) as usize;
        error!(file_id, block, actual, "torn final record");
        Error::ShortRead {
            block,
            expected: TAG_SIZE + 1,
            actual,
        }
    }

    /// Current plaintext length for a writer, cutting off a torn final record
    fn settle<T: BlockTarget + ?Sized>(&self, file_id: u64, target: &T) -> Result<(u64, u64)> {
        let backing_len = target.backing_len()?;
        let (size, torn) = self.measure(backing_len);
        if !torn {
            return Ok((backing_len, size));
        }

        let complete = self.ciphertext_len(size);
        warn!(
            file_id,
            dropped = backing_len - complete,
            "dropping torn final record before write"
        );
        target.truncate_to(complete)?;
        Ok((complete, size))
    }

    /// Append encrypted zeros from `from` (the current end) up to `to`
    fn fill_zeros<T: BlockTarget + ?Sized>(
        &self,
        file_id: u64,
        from: u64,
        to: u64,
        target: &T,
    ) -> Result<()> {
        let zeros = vec![0u8; self.block_size * EXTEND_BATCH_BLOCKS];
        let mut pos = from;
        while pos < to {
            let n = (to - pos).min(zeros.len() as u64) as usize;
            self.write_range(file_id, &zeros[..n], pos, target)?;
            pos += n as u64;
        }
        Ok(())
    }

    /// Read and decrypt block `index`; empty when it lies past end of file
    fn read_block<S: BlockSource + ?Sized>(
        &self,
        file_id: u64,
        index: u64,
        source: &S,
        backing_len: u64,
    ) -> Result<Vec<u8>> {
        let start = index * self.record_size();
        if start >= backing_len {
            return Ok(Vec::new());
        }

        let expected = (backing_len - start).min(self.record_size()) as usize;
        let mut record = vec![0u8; expected];
        let mut filled = 0;
        while filled < expected {
            match source.read_block_at(&mut record[filled..], start + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::BackingIo(e)),
            }
        }

        if filled < expected {
            error!(file_id, block = index, expected, actual = filled, "short read from backing store");
            return Err(Error::ShortRead {
                block: index,
                expected,
                actual: filled,
            });
        }

        self.open_block(file_id, index, record)
    }

    /// Write `buf` at `offset`, re-sealing every block it touches
    ///
    /// Partially covered first and last blocks are read, merged and sealed
    /// again in full. A gap between the current end of file and `offset` is
    /// first filled with encrypted zeros in bounded batches, so memory use
    /// depends on `buf` and not on the gap.
    pub fn write_range<T: BlockTarget + ?Sized>(
        &self,
        file_id: u64,
        buf: &[u8],
        offset: u64,
        target: &T,
    ) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let bs = self.block_size as u64;
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(Error::FileTooLarge(offset))?;
        let last = (end - 1) / bs;
        if last > u32::MAX as u64 {
            return Err(Error::FileTooLarge(end));
        }

        let (mut backing_len, mut size) = self.settle(file_id, target)?;
        if offset > size {
            self.fill_zeros(file_id, size, offset, target)?;
            backing_len = target.backing_len()?;
            size = offset;
        }

        let first = offset / bs;
        let aligned_start = first * bs;
        let region_end = end.max(size.min((last + 1) * bs));
        let mut plain = vec![0u8; (region_end - aligned_start) as usize];

        if aligned_start < size {
            let head = self.read_block(file_id, first, target, backing_len)?;
            plain[..head.len()].copy_from_slice(&head);
        }
        if last != first && last * bs < size {
            let tail = self.read_block(file_id, last, target, backing_len)?;
            let at = (last * bs - aligned_start) as usize;
            plain[at..at + tail.len()].copy_from_slice(&tail);
        }

        let at = (offset - aligned_start) as usize;
        plain[at..at + buf.len()].copy_from_slice(buf);

        let blocks = self.encrypt_range(file_id, &plain, aligned_start)?;
        for block in &blocks {
            target.write_block_at(&block.bytes, block.backing_offset)?;
        }

        debug!(
            file_id,
            offset,
            len = buf.len(),
            blocks = blocks.len(),
            "encrypted range"
        );
        Ok(buf.len())
    }

    /// Set the plaintext length of a file to `new_len`
    pub fn truncate<T: BlockTarget + ?Sized>(
        &self,
        file_id: u64,
        new_len: u64,
        target: &T,
    ) -> Result<()> {
        let (backing_len, size) = self.settle(file_id, target)?;
        let bs = self.block_size as u64;

        if new_len < size {
            let rem = (new_len % bs) as usize;
            if rem == 0 {
                target.truncate_to(self.ciphertext_len(new_len))?;
            } else {
                let index = new_len / bs;
                let mut block = self.read_block(file_id, index, target, backing_len)?;
                block.truncate(rem);
                let sealed = self.seal_block(file_id, index, &block)?;
                target.truncate_to(self.ciphertext_len(new_len))?;
                target.write_block_at(&sealed.bytes, sealed.backing_offset)?;
            }
        } else if new_len > size {
            self.fill_zeros(file_id, size, new_len, target)?;
        }

        debug!(file_id, from = size, to = new_len, "truncated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_SIZE;
    use std::collections::HashSet;
    use std::io::{Read, Seek, SeekFrom, Write};

    const BS: usize = 4096;

    fn cipher() -> BlockCipher {
        BlockCipher::new(&MountKey::from_bytes([0x42; KEY_SIZE]), [7u8; NONCE_SIZE], BS).unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn raw(file: &mut File) -> Vec<u8> {
        let mut out = Vec::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_end(&mut out).unwrap();
        out
    }

    fn flip_bit(file: &File, offset: u64) {
        let mut byte = [0u8; 1];
        file.read_exact_at(&mut byte, offset).unwrap();
        byte[0] ^= 0x01;
        file.write_all_at(&byte, offset).unwrap();
    }

    #[test]
    fn test_layout_arithmetic() {
        let c = cipher();
        assert_eq!(c.ciphertext_len(0), 0);
        assert_eq!(c.ciphertext_len(11), 27);
        assert_eq!(c.ciphertext_len(4096), 4112);
        assert_eq!(c.ciphertext_len(4097), 4112 + 17);

        for len in [0u64, 1, 11, 4095, 4096, 4097, 8192, 10_000] {
            assert_eq!(c.plaintext_len(c.ciphertext_len(len)).unwrap(), len);
        }

        assert!(matches!(
            c.plaintext_len(4112 + 5),
            Err(Error::ShortRead { block: 1, .. })
        ));
        assert_eq!(c.layout().complete_plaintext_len(4112 + 5), 4096);
        assert!(BlockLayout::new(0).is_err());
    }

    #[test]
    fn test_hello_world_single_record() {
        let c = cipher();
        let mut file = tempfile::tempfile().unwrap();

        assert_eq!(c.write_range(1, b"hello world", 0, &file).unwrap(), 11);
        let stored = raw(&mut file);
        assert_eq!(stored.len(), 11 + TAG_SIZE);
        assert_ne!(&stored[..11], b"hello world");

        assert_eq!(c.decrypt_range(1, 11, 0, &file).unwrap(), b"hello world");
        assert_eq!(c.decrypt_range(1, 5, 6, &file).unwrap(), b"world");
    }

    #[test]
    fn test_round_trip_unaligned_ranges() {
        let c = cipher();
        for (offset, len) in [(0u64, 1usize), (1, 4095), (4095, 2), (4096, 4096), (100, 3 * BS + 7)] {
            let file = tempfile::tempfile().unwrap();
            let data = pattern(len);
            c.write_range(5, &data, offset, &file).unwrap();

            assert_eq!(c.decrypt_range(5, len, offset, &file).unwrap(), data);
            assert_eq!(
                c.plaintext_len(file.backing_len().unwrap()).unwrap(),
                offset + len as u64
            );
        }
    }

    #[test]
    fn test_sparse_write_reads_zeros() {
        let c = cipher();
        let file = tempfile::tempfile().unwrap();

        c.write_range(9, b"abc", 0, &file).unwrap();
        c.write_range(9, b"xyz", 10_000, &file).unwrap();

        let all = c.decrypt_range(9, 20_000, 0, &file).unwrap();
        assert_eq!(all.len(), 10_003);
        assert_eq!(&all[..3], b"abc");
        assert!(all[3..10_000].iter().all(|&b| b == 0));
        assert_eq!(&all[10_000..], b"xyz");
    }

    #[test]
    fn test_partial_block_write_spanning_boundary() {
        let c = cipher();
        let file = tempfile::tempfile().unwrap();
        let mut expected = pattern(3 * BS);
        c.write_range(3, &expected, 0, &file).unwrap();

        let mut before = vec![0u8; 3 * (BS + TAG_SIZE)];
        file.read_exact_at(&mut before, 0).unwrap();

        c.write_range(3, b"0123456789", 4090, &file).unwrap();
        expected[4090..4100].copy_from_slice(b"0123456789");

        let mut after = vec![0u8; 3 * (BS + TAG_SIZE)];
        file.read_exact_at(&mut after, 0).unwrap();
        let record = BS + TAG_SIZE;
        assert_ne!(before[..record], after[..record]);
        assert_ne!(before[record..2 * record], after[record..2 * record]);
        assert_eq!(before[2 * record..], after[2 * record..]);

        assert_eq!(c.decrypt_range(3, 3 * BS, 0, &file).unwrap(), expected);
    }

    #[test]
    fn test_tamper_ciphertext_detected() {
        let c = cipher();
        let file = tempfile::tempfile().unwrap();
        let data = pattern(3 * BS);
        c.write_range(4, &data, 0, &file).unwrap();

        flip_bit(&file, (BS + TAG_SIZE) as u64 + 17);

        assert!(matches!(
            c.decrypt_range(4, 3 * BS, 0, &file),
            Err(Error::Integrity { block: 1 })
        ));
        assert!(matches!(
            c.decrypt_range(4, 10, BS as u64 + 5, &file),
            Err(Error::Integrity { block: 1 })
        ));

        assert_eq!(c.decrypt_range(4, BS, 0, &file).unwrap(), &data[..BS]);
        assert_eq!(
            c.decrypt_range(4, BS, 2 * BS as u64, &file).unwrap(),
            &data[2 * BS..]
        );
    }

    #[test]
    fn test_tamper_tag_detected() {
        let c = cipher();
        let file = tempfile::tempfile().unwrap();
        c.write_range(4, b"hello world", 0, &file).unwrap();

        flip_bit(&file, 11 + 3);

        assert!(matches!(
            c.decrypt_range(4, 11, 0, &file),
            Err(Error::Integrity { block: 0 })
        ));
    }

    #[test]
    fn test_swapped_records_detected() {
        let c = cipher();
        let file = tempfile::tempfile().unwrap();
        c.write_range(6, &pattern(2 * BS), 0, &file).unwrap();

        let record = BS + TAG_SIZE;
        let mut bytes = vec![0u8; 2 * record];
        file.read_exact_at(&mut bytes, 0).unwrap();
        let (a, b) = bytes.split_at(record);
        let swapped = [b, a].concat();
        file.write_all_at(&swapped, 0).unwrap();

        assert!(matches!(
            c.decrypt_range(6, BS, 0, &file),
            Err(Error::Integrity { block: 0 })
        ));
    }

    #[test]
    fn test_wrong_file_identity_rejected() {
        let c = cipher();
        let file = tempfile::tempfile().unwrap();
        c.write_range(10, b"secret", 0, &file).unwrap();

        assert!(matches!(
            c.decrypt_range(11, 6, 0, &file),
            Err(Error::Integrity { block: 0 })
        ));
    }

    #[test]
    fn test_nonces_unique_per_file_and_block() {
        let c = cipher();
        let mut seen = HashSet::new();
        for file_id in 0..16u64 {
            for index in 0..64u64 {
                assert!(seen.insert(c.nonce_bytes(file_id, index).unwrap()));
            }
        }
        assert!(seen.insert(c.nonce_bytes(u64::MAX, u32::MAX as u64).unwrap()));
    }

    #[test]
    fn test_identical_blocks_encrypt_differently() {
        let c = cipher();
        let data = vec![0xaau8; 2 * BS];

        let blocks = c.encrypt_range(1, &data, 0).unwrap();
        assert_ne!(blocks[0].bytes, blocks[1].bytes);

        let other = c.encrypt_range(2, &data[..BS], 0).unwrap();
        assert_ne!(blocks[0].bytes, other[0].bytes);
    }

    #[test]
    fn test_encrypt_range_partial_last_block() {
        let c = cipher();
        let blocks = c.encrypt_range(1, &pattern(BS + 100), BS as u64).unwrap();

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].index, 1);
        assert_eq!(blocks[0].backing_offset, (BS + TAG_SIZE) as u64);
        assert_eq!(blocks[1].plaintext_len(), 100);
    }

    #[test]
    fn test_encrypt_range_rejects_misaligned_offset() {
        let c = cipher();
        assert!(matches!(
            c.encrypt_range(1, b"abc", 10),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_block_index_limit() {
        let c = cipher();
        let file = tempfile::tempfile().unwrap();
        let past_limit = (u32::MAX as u64 + 1) * BS as u64;

        assert!(matches!(
            c.write_range(1, b"x", past_limit, &file),
            Err(Error::FileTooLarge(_))
        ));
    }

    #[test]
    fn test_zero_length_and_past_eof_reads() {
        let c = cipher();
        let file = tempfile::tempfile().unwrap();
        c.write_range(1, b"hello world", 0, &file).unwrap();

        assert!(c.decrypt_range(1, 0, 0, &file).unwrap().is_empty());
        assert!(c.decrypt_range(1, 10, 11, &file).unwrap().is_empty());
        assert!(c.decrypt_range(1, 10, 5000, &file).unwrap().is_empty());
        assert_eq!(c.decrypt_range(1, 100, 6, &file).unwrap(), b"world");
    }

    #[test]
    fn test_torn_tail_only_fails_reads_that_reach_it() {
        let c = cipher();
        let mut file = tempfile::tempfile().unwrap();
        let data = pattern(BS);
        c.write_range(1, &data, 0, &file).unwrap();
        file.seek(SeekFrom::End(0)).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();

        assert_eq!(c.decrypt_range(1, 10, 0, &file).unwrap(), &data[..10]);
        assert_eq!(c.decrypt_range(1, BS, 0, &file).unwrap(), data);
        assert!(matches!(
            c.decrypt_range(1, BS + 1, 0, &file),
            Err(Error::ShortRead { block: 1, actual: 3, .. })
        ));
        assert!(matches!(
            c.decrypt_range(1, 10, BS as u64, &file),
            Err(Error::ShortRead { block: 1, .. })
        ));
    }

    #[test]
    fn test_torn_middle_of_record_keeps_earlier_blocks() {
        let c = cipher();
        let file = tempfile::tempfile().unwrap();
        let data = pattern(2 * BS);
        c.write_range(1, &data, 0, &file).unwrap();
        file.set_len((BS + TAG_SIZE) as u64 + 5).unwrap();

        assert_eq!(c.decrypt_range(1, 10, 0, &file).unwrap(), &data[..10]);
        assert!(matches!(
            c.decrypt_range(1, 10, BS as u64 + 2, &file),
            Err(Error::ShortRead { block: 1, expected: 17, actual: 5 })
        ));
    }

    #[test]
    fn test_write_drops_torn_tail() {
        let c = cipher();
        let mut file = tempfile::tempfile().unwrap();
        let data = pattern(BS);
        c.write_range(5, &data, 0, &file).unwrap();
        file.seek(SeekFrom::End(0)).unwrap();
        file.write_all(&[9; 7]).unwrap();

        c.write_range(5, b"tail", BS as u64, &file).unwrap();

        assert_eq!(file.backing_len().unwrap(), c.ciphertext_len(BS as u64 + 4));
        let all = c.decrypt_range(5, 2 * BS, 0, &file).unwrap();
        assert_eq!(&all[..BS], &data[..]);
        assert_eq!(&all[BS..], b"tail");
    }

    #[test]
    fn test_truncate_repairs_torn_tail() {
        let c = cipher();
        let mut file = tempfile::tempfile().unwrap();
        c.write_range(5, &pattern(BS), 0, &file).unwrap();
        file.seek(SeekFrom::End(0)).unwrap();
        file.write_all(&[9; 4]).unwrap();

        c.truncate(5, BS as u64, &file).unwrap();
        assert_eq!(file.backing_len().unwrap(), (BS + TAG_SIZE) as u64);
        assert_eq!(c.plaintext_len(file.backing_len().unwrap()).unwrap(), BS as u64);
    }

    #[test]
    fn test_far_sparse_write_fills_gap_in_batches() {
        let c = cipher();
        let file = tempfile::tempfile().unwrap();
        c.write_range(8, b"start", 0, &file).unwrap();

        let far = (3 * EXTEND_BATCH_BLOCKS * BS + 77) as u64;
        assert_eq!(c.write_range(8, b"!", far, &file).unwrap(), 1);

        assert_eq!(file.backing_len().unwrap(), c.ciphertext_len(far + 1));
        let all = c.decrypt_range(8, far as usize + 10, 0, &file).unwrap();
        assert_eq!(all.len() as u64, far + 1);
        assert_eq!(&all[..5], b"start");
        assert!(all[5..far as usize].iter().all(|&b| b == 0));
        assert_eq!(all[far as usize], b'!');
    }

    #[test]
    fn test_truncate_shrink_reseals_last_block() {
        let c = cipher();
        let file = tempfile::tempfile().unwrap();
        let data = pattern(2 * BS + 50);
        c.write_range(2, &data, 0, &file).unwrap();

        c.truncate(2, BS as u64 + 10, &file).unwrap();

        assert_eq!(file.backing_len().unwrap(), c.ciphertext_len(BS as u64 + 10));
        assert_eq!(
            c.decrypt_range(2, 3 * BS, 0, &file).unwrap(),
            &data[..BS + 10]
        );

        c.truncate(2, BS as u64, &file).unwrap();
        assert_eq!(file.backing_len().unwrap(), (BS + TAG_SIZE) as u64);
        assert_eq!(c.decrypt_range(2, 3 * BS, 0, &file).unwrap(), &data[..BS]);
    }

    #[test]
    fn test_truncate_extend_fills_zeros() {
        let c = cipher();
        let file = tempfile::tempfile().unwrap();
        c.write_range(2, b"head", 0, &file).unwrap();

        let new_len = (EXTEND_BATCH_BLOCKS * BS + 123) as u64;
        c.truncate(2, new_len, &file).unwrap();

        assert_eq!(file.backing_len().unwrap(), c.ciphertext_len(new_len));
        let all = c.decrypt_range(2, new_len as usize, 0, &file).unwrap();
        assert_eq!(all.len() as u64, new_len);
        assert_eq!(&all[..4], b"head");
        assert!(all[4..].iter().all(|&b| b == 0));
    }
}
