//! Streaming a client upload onto disk.

use std::path::Path;

use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use tokio::io::AsyncWriteExt;

use crate::{
    error::{ServiceError, ServiceResult},
    fsop::FsOps,
};

/// Body of a client upload.
pub type UploadStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

/// Write `body` to `dest` and return the number of bytes stored.
///
/// A broken stream or an empty result counts as a failed upload: the file is
/// removed and a bad request is returned.
pub async fn receive_file(fs: &FsOps, body: UploadStream, dest: &Path) -> ServiceResult<u64> {
    tracing::info!("start uploading file to {}", dest.display());

    if let Err(e) = write_stream(body, dest).await {
        tracing::error!("upload to {} failed: {e}", dest.display());
        return Err(discard(fs, dest).await);
    }

    match fs.get_file_size(dest).await {
        Ok(0) => {
            tracing::warn!("upload to {} produced an empty file", dest.display());
            Err(discard(fs, dest).await)
        }
        Ok(size) => {
            tracing::info!("uploaded {size} bytes to {}", dest.display());
            Ok(size)
        }
        Err(e) => {
            tracing::error!("cannot stat uploaded file: {e}");
            Err(discard(fs, dest).await)
        }
    }
}

async fn write_stream(mut body: UploadStream, dest: &Path) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(dest).await?;
    while let Some(chunk) = body.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    file.sync_all().await
}

async fn discard(fs: &FsOps, dest: &Path) -> ServiceError {
    if let Err(e) = fs.remove_file(dest).await {
        tracing::warn!("could not remove partial upload {}: {e}", dest.display());
    }
    ServiceError::bad_request("Error uploading file")
}

#[cfg(test)]
pub(crate) fn stream_of(chunks: Vec<&'static [u8]>) -> UploadStream {
    futures::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c)))).boxed()
}
