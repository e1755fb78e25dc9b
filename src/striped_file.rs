//! A striped view over a single backing file (spec §3, §4.3).
//!
//! The backing file is logically partitioned into `blockSize`-byte
//! super-blocks, each sliced into `stripeCount` equal stripes; a
//! `StripedFile` with `stripeIndex = i` only ever touches the i-th stripe
//! of every super-block, which is what lets [`crate::splicer::Splicer`]
//! hand each stripe to a different source peer and write them all into the
//! same file concurrently without the writers' byte ranges ever
//! overlapping.
//!
//! Positional I/O (`pread`/`pwrite`, not seek-then-read/write) is used so
//! multiple `StripedFile`s sharing one file descriptor can each make
//! progress without contending on a shared file cursor.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use nix::sys::uio::{pread, pwrite};

/// A (block, intra-stripe-offset) logical cursor.
pub type Cursor = (u64, usize);

#[derive(Clone)]
pub struct StripedFile {
    file: Arc<File>,
    block_size: usize,
    stripe_count: usize,
    stripe_index: usize,
    read_cursor: Cursor,
    write_cursor: Cursor,
}

impl StripedFile {
    /// Opens a stripe view. `stripe_index` must be `< stripe_count`.
    /// `block_size` need not divide evenly by `stripe_count`: the stripe
    /// size is `block_size / stripe_count`, truncated, and any remainder
    /// bytes of each super-block simply go unused by every stripe (spec
    /// §4.3's `stripeSize = blockSize / stripeCount` is plain integer
    /// division, not a divisibility requirement).
    pub fn new(file: Arc<File>, block_size: usize, stripe_count: usize, stripe_index: usize) -> Self {
        assert!(stripe_count > 0, "stripeCount must be positive");
        assert!(stripe_index < stripe_count, "stripeIndex out of range");
        Self {
            file,
            block_size,
            stripe_count,
            stripe_index,
            read_cursor: (0, 0),
            write_cursor: (0, 0),
        }
    }

    pub fn stripe_size(&self) -> usize {
        self.block_size / self.stripe_count
    }

    pub fn seek_read(&mut self, block: u64, offset: usize) {
        self.read_cursor = (block, offset);
    }

    pub fn seek_write(&mut self, block: u64, offset: usize) {
        self.write_cursor = (block, offset);
    }

    pub fn read_cursor(&self) -> Cursor {
        self.read_cursor
    }

    pub fn write_cursor(&self) -> Cursor {
        self.write_cursor
    }

    /// Ensures the backing file is at least `block_count * blockSize` bytes
    /// long by growing it up front, rather than relying on the writer's
    /// positional writes past the current end-of-file to lazily
    /// materialize a sparse hole (spec §9, Open Question: "on filesystems
    /// without sparse support, the implementation must explicitly
    /// pre-allocate").
    pub fn preallocate(&self, block_count: u64) -> io::Result<()> {
        let needed = block_count * self.block_size as u64;
        if self.file.metadata()?.len() < needed {
            self.file.set_len(needed)?;
        }
        Ok(())
    }

    /// Reads up to `len` bytes starting at the read cursor, following the
    /// stripe's path through successive super-blocks as needed. Returns
    /// fewer than `len` bytes only at end-of-file.
    pub async fn read(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let file = Arc::clone(&self.file);
        let block_size = self.block_size;
        let stripe_size = self.stripe_size();
        let stripe_index = self.stripe_index;
        let start = self.read_cursor;

        let (data, end_cursor) = tokio::task::spawn_blocking(move || {
            read_stripe_blocking(&file, block_size, stripe_size, stripe_index, start, len)
        })
        .await
        .expect("striped file read task panicked")?;

        self.read_cursor = end_cursor;
        Ok(data)
    }

    /// Writes `data` starting at the write cursor, splitting it across
    /// super-block boundaries as needed.
    pub async fn write(&mut self, data: Vec<u8>) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        let block_size = self.block_size;
        let stripe_size = self.stripe_size();
        let stripe_index = self.stripe_index;
        let start = self.write_cursor;

        let end_cursor = tokio::task::spawn_blocking(move || {
            write_stripe_blocking(&file, block_size, stripe_size, stripe_index, start, &data)
        })
        .await
        .expect("striped file write task panicked")?;

        self.write_cursor = end_cursor;
        Ok(())
    }
}

fn stripe_absolute_offset(block_size: usize, stripe_size: usize, stripe_index: usize, cursor: Cursor) -> u64 {
    let (block, offset) = cursor;
    block * block_size as u64 + (stripe_index * stripe_size) as u64 + offset as u64
}

fn advance_cursor(stripe_size: usize, cursor: Cursor, n: usize) -> Cursor {
    let (mut block, mut offset) = cursor;
    offset += n;
    if offset >= stripe_size {
        block += (offset / stripe_size) as u64;
        offset %= stripe_size;
    }
    (block, offset)
}

fn read_stripe_blocking(
    file: &File,
    block_size: usize,
    stripe_size: usize,
    stripe_index: usize,
    start: Cursor,
    len: usize,
) -> io::Result<(Vec<u8>, Cursor)> {
    let mut out = Vec::with_capacity(len);
    let mut cursor = start;
    while out.len() < len {
        let (_, offset) = cursor;
        let remaining_in_stripe = stripe_size - offset;
        let want = remaining_in_stripe.min(len - out.len());
        let abs = stripe_absolute_offset(block_size, stripe_size, stripe_index, cursor);
        let mut chunk = vec![0u8; want];
        let n = pread(file.as_raw_fd(), &mut chunk, abs as i64).map_err(|_| io::Error::last_os_error())?;
        if n == 0 {
            break;
        }
        chunk.truncate(n);
        out.extend_from_slice(&chunk);
        cursor = advance_cursor(stripe_size, cursor, n);
    }
    Ok((out, cursor))
}

fn write_stripe_blocking(
    file: &File,
    block_size: usize,
    stripe_size: usize,
    stripe_index: usize,
    start: Cursor,
    data: &[u8],
) -> io::Result<Cursor> {
    let mut cursor = start;
    let mut written = 0;
    while written < data.len() {
        let (_, offset) = cursor;
        let remaining_in_stripe = stripe_size - offset;
        let want = remaining_in_stripe.min(data.len() - written);
        let abs = stripe_absolute_offset(block_size, stripe_size, stripe_index, cursor);
        let mut done = 0;
        while done < want {
            let n = pwrite(file.as_raw_fd(), &data[written + done..written + want], (abs + done as u64) as i64)
                .map_err(|_| io::Error::last_os_error())?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "pwrite wrote zero bytes"));
            }
            done += n;
        }
        written += want;
        cursor = advance_cursor(stripe_size, cursor, want);
    }
    Ok(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn open_temp() -> (tempfile::TempPath, Arc<File>) {
        let named = tempfile::NamedTempFile::new().unwrap();
        let path = named.into_temp_path();
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        (path, Arc::new(file))
    }

    #[tokio::test]
    async fn stripe_zero_and_one_never_overlap() {
        let (_path, file) = open_temp();
        let block_size = 8;
        let stripe_count = 2;

        let mut stripe0 = StripedFile::new(Arc::clone(&file), block_size, stripe_count, 0);
        let mut stripe1 = StripedFile::new(Arc::clone(&file), block_size, stripe_count, 1);

        stripe0.write(vec![0xAAu8; 8]).await.unwrap(); // blocks 0,1 for stripe 0
        stripe1.write(vec![0xBBu8; 8]).await.unwrap(); // blocks 0,1 for stripe 1

        let mut raw = vec![0u8; 16];
        pread(file.as_raw_fd(), &mut raw, 0).unwrap();
        // stripe size is 4: [block0 stripe0][block0 stripe1][block1 stripe0][block1 stripe1]
        assert_eq!(&raw[0..4], &[0xAAu8; 4]);
        assert_eq!(&raw[4..8], &[0xBBu8; 4]);
        assert_eq!(&raw[8..12], &[0xAAu8; 4]);
        assert_eq!(&raw[12..16], &[0xBBu8; 4]);
    }

    #[tokio::test]
    async fn read_back_matches_write_for_multi_block_span() {
        let (_path, file) = open_temp();
        let block_size = 6;
        let stripe_count = 3;
        let mut writer = StripedFile::new(Arc::clone(&file), block_size, stripe_count, 1);
        let payload: Vec<u8> = (0..20u8).collect();
        writer.write(payload.clone()).await.unwrap();

        let mut reader = StripedFile::new(Arc::clone(&file), block_size, stripe_count, 1);
        let got = reader.read(payload.len()).await.unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn preallocate_extends_file_length() {
        let (_path, file) = open_temp();
        let view = StripedFile::new(Arc::clone(&file), 128 * 1024, 4, 0);
        view.preallocate(96).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 96 * 128 * 1024);
    }

    #[test]
    fn uneven_block_size_truncates_stripe_size() {
        let (_path, file) = open_temp();
        // 131072 / 3 spec scenario S5: blockSize doesn't divide evenly
        // across sources, stripe size truncates and the remainder byte(s)
        // of each super-block go unused.
        let view = StripedFile::new(file, 10, 3, 0);
        assert_eq!(view.stripe_size(), 3);
    }
}
