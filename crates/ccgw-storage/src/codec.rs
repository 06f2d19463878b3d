//! Brotli codec for persisted prompt/response blobs.

use async_compression::tokio::write::{BrotliDecoder, BrotliEncoder};
use tokio::io::AsyncWriteExt;

pub async fn compress(text: &str) -> std::io::Result<Vec<u8>> {
    let mut encoder = BrotliEncoder::new(Vec::new());
    encoder.write_all(text.as_bytes()).await?;
    encoder.shutdown().await?;
    Ok(encoder.into_inner())
}

pub async fn decompress(bytes: &[u8]) -> std::io::Result<String> {
    let mut decoder = BrotliDecoder::new(Vec::new());
    decoder.write_all(bytes).await?;
    decoder.shutdown().await?;
    String::from_utf8(decoder.into_inner())
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
}
