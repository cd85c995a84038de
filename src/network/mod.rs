pub mod compression;
pub mod crypt;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::CompressionScheme;
use compression::CompressionError;
use crypt::{CryptoError, FrameCipher, DIR_CLIENTBOUND, DIR_SERVERBOUND, SESSION_KEY_LEN};

/// Largest front frame accepted from a peer
pub const MAX_FRONT_FRAME: usize = 8 * 1024 * 1024;

/// Largest back frame accepted from the backend
pub const MAX_BACK_FRAME: usize = 2 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Frame of {0} bytes exceeds limit")]
    TooLarge(usize),

    #[error("VarInt too long")]
    VarIntTooLong,

    #[error(transparent)]
    Compression(#[from] CompressionError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read one `u32 BE length` framed body from the front leg.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRONT_FRAME {
        return Err(FrameError::TooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write one framed body to the front leg.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<(), FrameError> {
    if body.len() > MAX_FRONT_FRAME {
        return Err(FrameError::TooLarge(body.len()));
    }
    let mut buf = BytesMut::with_capacity(body.len() + 4);
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Append a VarInt (7 bits per byte, low group first).
pub fn put_varint(buf: &mut BytesMut, value: i32) {
    let mut v = value as u32;
    loop {
        if v & !0x7F == 0 {
            buf.put_u8(v as u8);
            return;
        }
        buf.put_u8(((v & 0x7F) | 0x80) as u8);
        v >>= 7;
    }
}

async fn read_varint_async<R: AsyncRead + Unpin>(reader: &mut R) -> Result<i32, FrameError> {
    let mut value: u32 = 0;
    for shift in 0..5 {
        let byte = reader.read_u8().await?;
        value |= ((byte & 0x7F) as u32) << (7 * shift);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(FrameError::VarIntTooLong)
}

/// Read one VarInt-length framed body from the back leg.
pub async fn read_varint_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let len = read_varint_async(reader).await?;
    let len = usize::try_from(len).map_err(|_| FrameError::TooLarge(0))?;
    if len > MAX_BACK_FRAME {
        return Err(FrameError::TooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write one VarInt-length framed body to the back leg.
pub async fn write_varint_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<(), FrameError> {
    let mut buf = BytesMut::with_capacity(body.len() + 5);
    put_varint(&mut buf, body.len() as i32);
    buf.put_slice(body);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Which end of the front leg a codec sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Per-connection front frame pipeline.
///
/// Outbound: compress, then encrypt. Inbound: decrypt, then decompress.
/// Both stages start disabled and are switched on by the handshake.
pub struct FrameCodec {
    role: Role,
    compression: Option<CompressionScheme>,
    outbound: Option<FrameCipher>,
    inbound: Option<FrameCipher>,
}

impl FrameCodec {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            compression: None,
            outbound: None,
            inbound: None,
        }
    }

    pub fn enable_compression(&mut self, scheme: CompressionScheme) {
        self.compression = Some(scheme);
    }

    pub fn enable_encryption(&mut self, key: &[u8; SESSION_KEY_LEN]) {
        let (out_dir, in_dir) = match self.role {
            Role::Server => (DIR_CLIENTBOUND, DIR_SERVERBOUND),
            Role::Client => (DIR_SERVERBOUND, DIR_CLIENTBOUND),
        };
        self.outbound = Some(FrameCipher::new(key, out_dir));
        self.inbound = Some(FrameCipher::new(key, in_dir));
    }

    pub fn is_compressed(&self) -> bool {
        self.compression.is_some()
    }

    pub fn is_encrypted(&self) -> bool {
        self.outbound.is_some()
    }

    /// Turn an encoded packet into a frame body.
    pub fn encode(&mut self, packet: &[u8]) -> Result<Bytes, FrameError> {
        let mut body = match self.compression {
            Some(scheme) => compression::compress(scheme, packet)?,
            None => packet.to_vec(),
        };
        if let Some(cipher) = self.outbound.as_mut() {
            body = cipher.seal(&body)?;
        }
        Ok(Bytes::from(body))
    }

    /// Turn a frame body back into an encoded packet.
    pub fn decode(&mut self, body: &[u8]) -> Result<Vec<u8>, FrameError> {
        let plain = match self.inbound.as_mut() {
            Some(cipher) => cipher.open(body)?,
            None => body.to_vec(),
        };
        match self.compression {
            Some(_) => Ok(compression::decompress(&plain)?),
            None => Ok(plain),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_io_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"abc").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_FRONT_FRAME + 1) as u32).await.unwrap();
        assert!(matches!(read_frame(&mut b).await, Err(FrameError::TooLarge(_))));
    }

    #[tokio::test]
    async fn test_varint_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let body = vec![9u8; 300];
        write_varint_frame(&mut a, &body).await.unwrap();
        assert_eq!(read_varint_frame(&mut b).await.unwrap(), body);
    }

    #[test]
    fn test_varint_encoding() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 300);
        assert_eq!(&buf[..], &[0xAC, 0x02]);

        let mut buf = BytesMut::new();
        put_varint(&mut buf, -1);
        assert_eq!(&buf[..], &[0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
    }

    #[test]
    fn test_codec_pipeline_stages() {
        let mut server = FrameCodec::new(Role::Server);
        let mut client = FrameCodec::new(Role::Client);

        let plain = server.encode(b"hello").unwrap();
        assert_eq!(&plain[..], b"hello");

        server.enable_compression(CompressionScheme::Zlib);
        client.enable_compression(CompressionScheme::Zlib);
        let key = [1u8; 32];
        server.enable_encryption(&key);
        client.enable_encryption(&key);

        let big = vec![5u8; 2000];
        let body = server.encode(&big).unwrap();
        assert_eq!(client.decode(&body).unwrap(), big);

        let body = client.encode(b"ack").unwrap();
        assert_eq!(server.decode(&body).unwrap(), b"ack");
    }
}
