//! The symmetric cipher stream wrapping a session's socket (spec §4.1).
//!
//! Holds one AES-256-CTR state for reads and one for writes. Both start
//! out keyed with a fixed, well-known "obfuscation" key/IV pair — not a
//! secret, just a way to avoid trivially fingerprinting the protocol on
//! the wire before authentication — and are replaced in place with
//! authenticated per-direction keys once the handshake completes
//! (`rekey_read`/`rekey_write`).

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::crypto::hash::sha512;

/// AES-256 in CTR mode with a full 128-bit (16 byte) counter block.
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;

/// Derives the fixed obfuscation key/IV pair from a constant string, hashed
/// once with SHA-512: the first 32 bytes become the key, the next 16 the
/// IV. This is obfuscation, not secrecy — every TeapotNet node derives the
/// exact same pair.
pub fn obfuscation_key_iv() -> ([u8; KEY_LEN], [u8; IV_LEN]) {
    let digest = sha512(b"TeapotNet obfuscation layer v1");
    let mut key = [0u8; KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    key.copy_from_slice(&digest[..KEY_LEN]);
    iv.copy_from_slice(&digest[KEY_LEN..KEY_LEN + IV_LEN]);
    (key, iv)
}

/// Derives a per-direction key/IV pair from a 64-byte handshake digest, per
/// spec §4.5: the key is the digest's first 32 bytes, and the IV is the
/// first 16 bytes of the digest's remaining 32 ("next 32 bytes"); the
/// trailing 16 bytes of that second half are reserved and unused, since
/// AES's 16-byte block size needs no more than that for a full-width CTR
/// counter.
pub fn derive_key_iv(digest: &[u8; 64]) -> ([u8; KEY_LEN], [u8; IV_LEN]) {
    let mut key = [0u8; KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    key.copy_from_slice(&digest[..KEY_LEN]);
    iv.copy_from_slice(&digest[KEY_LEN..KEY_LEN + IV_LEN]);
    (key, iv)
}

fn make_cipher(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN]) -> Aes256Ctr {
    Aes256Ctr::new(key.into(), iv.into())
}

/// A shared sink that accumulates raw ciphertext bytes read off the inner
/// stream, used by the rendezvous intermediary to replay the bytes it
/// already consumed of each side's obfuscated hello onto the other side
/// (spec §4.6).
pub type DumpSink = Arc<Mutex<Vec<u8>>>;

/// Wraps a byte stream with independent read/write AES-256-CTR states.
pub struct CipherStream<S> {
    inner: S,
    read_cipher: Aes256Ctr,
    write_cipher: Aes256Ctr,
    dump: Option<DumpSink>,
}

impl<S> CipherStream<S> {
    /// Wraps `inner`, starting both directions on the fixed obfuscation
    /// key/IV (spec §4.1).
    pub fn new_obfuscated(inner: S) -> Self {
        let (key, iv) = obfuscation_key_iv();
        Self {
            inner,
            read_cipher: make_cipher(&key, &iv),
            write_cipher: make_cipher(&key, &iv),
            dump: None,
        }
    }

    /// Starts teeing every ciphertext byte read from the inner stream into
    /// `sink`. Used only during the handshake, so the rendezvous
    /// intermediary can later replay the bytes it has already consumed.
    pub fn set_dump_sink(&mut self, sink: DumpSink) {
        self.dump = Some(sink);
    }

    pub fn clear_dump_sink(&mut self) {
        self.dump = None;
    }

    /// Atomically replaces the read-direction cipher state. Bytes already
    /// read under the old key are unaffected; every byte read after this
    /// call uses the new key/IV (spec §4.1: "after re-key the old state is
    /// discarded").
    pub fn rekey_read(&mut self, key: &[u8; KEY_LEN], iv: &[u8; IV_LEN]) {
        self.read_cipher = make_cipher(key, iv);
    }

    /// Atomically replaces the write-direction cipher state.
    pub fn rekey_write(&mut self, key: &[u8; KEY_LEN], iv: &[u8; IV_LEN]) {
        self.write_cipher = make_cipher(key, iv);
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CipherStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        let filled_before = buf.filled().len();
        let poll = Pin::new(&mut me.inner).poll_read(cx, buf);
        if poll.is_ready() {
            let new_bytes = &mut buf.filled_mut()[filled_before..];
            if let Some(dump) = &me.dump {
                dump.lock().expect("dump sink poisoned").extend_from_slice(new_bytes);
            }
            me.read_cipher.apply_keystream(new_bytes);
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CipherStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        // CTR keystream position must advance in lockstep with bytes that
        // actually leave the socket, not with bytes we merely encrypted:
        // remember where we started so a partial underlying write can be
        // rewound to the correct position for the next call.
        let pos_before = me.write_cipher.current_pos::<u32>();
        let mut ciphertext = buf.to_vec();
        me.write_cipher.apply_keystream(&mut ciphertext);
        match Pin::new(&mut me.inner).poll_write(cx, &ciphertext) {
            Poll::Ready(Ok(n)) => {
                if n < ciphertext.len() {
                    me.write_cipher.seek(pos_before + n as u32);
                }
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => {
                me.write_cipher.seek(pos_before);
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                me.write_cipher.seek(pos_before);
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn encrypt_then_decrypt_roundtrips() {
        let (client, server) = duplex(64 * 1024);
        let (key, iv) = obfuscation_key_iv();

        let mut writer = CipherStream::new_obfuscated(client);
        writer.rekey_write(&key, &iv);
        let mut reader = CipherStream::new_obfuscated(server);
        reader.rekey_read(&key, &iv);

        let payload = vec![0x42u8; 200_000];
        let payload_clone = payload.clone();
        let write_task = tokio::spawn(async move {
            writer.write_all(&payload_clone).await.unwrap();
            writer.flush().await.unwrap();
        });

        let mut got = vec![0u8; payload.len()];
        reader.read_exact(&mut got).await.unwrap();
        write_task.await.unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn rekey_mid_stream_only_affects_subsequent_bytes() {
        let (client, server) = duplex(64 * 1024);
        let (key_a, iv_a) = obfuscation_key_iv();
        let key_b = sha512(b"different key material");
        let mut kb = [0u8; 32];
        kb.copy_from_slice(&key_b[..32]);

        let mut writer = CipherStream::new_obfuscated(client);
        writer.rekey_write(&key_a, &iv_a);
        let mut reader = CipherStream::new_obfuscated(server);
        reader.rekey_read(&key_a, &iv_a);

        let first = vec![1u8; 10];
        let second = vec![2u8; 10];
        let (first_c, second_c) = (first.clone(), second.clone());
        let write_task = tokio::spawn(async move {
            writer.write_all(&first_c).await.unwrap();
            writer.flush().await.unwrap();
            writer.rekey_write(&kb, &iv_a);
            writer.write_all(&second_c).await.unwrap();
            writer.flush().await.unwrap();
        });

        let mut got_first = vec![0u8; 10];
        reader.read_exact(&mut got_first).await.unwrap();
        assert_eq!(got_first, first);

        reader.rekey_read(&kb, &iv_a);
        let mut got_second = vec![0u8; 10];
        reader.read_exact(&mut got_second).await.unwrap();
        write_task.await.unwrap();
        assert_eq!(got_second, second);
    }

    #[tokio::test]
    async fn dump_sink_tees_raw_ciphertext() {
        let plaintext = b"obfuscated hello line\r\n".to_vec();
        let (key, iv) = obfuscation_key_iv();
        let mut enc_cipher = make_cipher(&key, &iv);
        let mut ciphertext = plaintext.clone();
        enc_cipher.apply_keystream(&mut ciphertext);

        let sink: DumpSink = Arc::new(Mutex::new(Vec::new()));
        let mut reader = CipherStream::new_obfuscated(Cursor::new(ciphertext.clone()));
        reader.set_dump_sink(sink.clone());

        let mut got = vec![0u8; plaintext.len()];
        reader.read_exact(&mut got).await.unwrap();
        assert_eq!(got, plaintext);
        assert_eq!(*sink.lock().unwrap(), ciphertext);
    }
}
