//! Byte-range iterator factories over cache entries.

use std::io::SeekFrom;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use memmap2::Mmap;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

use super::CacheError;

pub(crate) const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Calls `on_finish` once the stream it guards is dropped, releasing the
/// entry's use-count even if the consumer drops the stream early. Rust has
/// no generator-exit hook besides `Drop`.
struct OnDrop<F: FnMut()>(F);

impl<F: FnMut()> Drop for OnDrop<F> {
    fn drop(&mut self) {
        (self.0)();
    }
}

fn clip(begin: u64, end: u64, range: Option<Range<u64>>) -> Option<(u64, u64)> {
    match range {
        None => Some((begin, end)),
        Some(r) => {
            let lo = begin.max(r.start);
            let hi = end.min(r.end);
            if lo < hi {
                Some((lo, hi))
            } else {
                None
            }
        }
    }
}

/// Seeks to `range.start` (or the beginning) and reads the requested span in
/// one chunk under the entry's file lock.
pub fn stream_from_file(
    file: Arc<Mutex<File>>,
    size: u64,
    range: Option<Range<u64>>,
    mut on_start: impl FnMut() + Send + 'static,
    on_finish: impl FnMut() + Send + 'static,
) -> BoxStream<'static, Result<Bytes, CacheError>> {
    let (begin, end) = range
        .map(|r| (r.start.min(size), r.end.min(size)))
        .unwrap_or((0, size));

    let guard = OnDrop(on_finish);

    async_stream::try_stream! {
        let _guard = guard;
        on_start();

        if begin >= end {
            return;
        }

        let mut locked = file.lock().await;
        locked.seek(SeekFrom::Start(begin)).await.map_err(CacheError::Io)?;

        let mut buf = vec![0u8; (end - begin) as usize];
        locked.read_exact(&mut buf).await.map_err(CacheError::Io)?;

        yield Bytes::from(buf);
    }
    .boxed()
}

/// Slices a read-only memory map in `chunk_size` pieces, yielding control
/// between chunks so other readers interleave.
pub fn stream_from_buffer(
    mmap: Arc<Mmap>,
    size: u64,
    range: Option<Range<u64>>,
    chunk_size: usize,
    mut on_start: impl FnMut() + Send + 'static,
    on_finish: impl FnMut() + Send + 'static,
) -> BoxStream<'static, Result<Bytes, CacheError>> {
    let (begin, end) = range
        .map(|r| (r.start.min(size), r.end.min(size)))
        .unwrap_or((0, size));
    let chunk_size = chunk_size.max(1);
    let guard = OnDrop(on_finish);

    async_stream::try_stream! {
        let _guard = guard;
        on_start();

        let mut pos = begin;
        while pos < end {
            let next = (pos + chunk_size as u64).min(end);
            yield Bytes::copy_from_slice(&mmap[pos as usize..next as usize]);
            pos = next;
            tokio::task::yield_now().await;
        }
    }
    .boxed()
}

/// The single-flight downloader: writes `remote` to `target_path.temp` in
/// `chunk_size` pieces while fanning the same bytes out to the streamer.
/// The downloader always drains `remote` to completion and installs the
/// final file, independent of whether the returned stream is ever fully
/// consumed, since a dropped consumer must not abort a download other
/// in-flight readers are waiting on.
pub fn stream_from_remote<R>(
    remote: R,
    target_path: std::path::PathBuf,
    range: Option<Range<u64>>,
    chunk_size: usize,
    on_cache: impl FnOnce(u64) + Send + 'static,
    on_error: impl FnOnce() + Send + 'static,
) -> BoxStream<'static, Result<Bytes, CacheError>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let chunk_size = chunk_size.max(1);
    let (tx, rx) = tokio::sync::mpsc::channel::<(u64, u64, Bytes)>(16);
    let total = Arc::new(AtomicU64::new(0));
    let total_for_task = total.clone();

    tokio::spawn(async move {
        let temp_path = temp_path_for(&target_path);
        let result = run_download(remote, &temp_path, chunk_size, &tx, &total_for_task).await;

        match result {
            Ok(()) => {
                let final_size = total_for_task.load(Ordering::SeqCst);
                if let Err(err) = tokio::fs::rename(&temp_path, &target_path).await {
                    log::error!("failed to install cache file {}: {err}", target_path.display());
                    on_error();
                    return;
                }
                on_cache(final_size);
            }
            Err(err) => {
                log::warn!("download into {} failed: {err}", temp_path.display());
                // Leave `.temp` in place; `target_path` never has a partial payload.
                on_error();
            }
        }
    });

    let rx_stream = tokio_stream::wrappers::ReceiverStream::new(rx);

    async_stream::try_stream! {
        futures::pin_mut!(rx_stream);
        while let Some((begin, end, chunk)) = rx_stream.next().await {
            if let Some((lo, hi)) = clip(begin, end, range.clone()) {
                let offset_in_chunk = (lo - begin) as usize;
                let len = (hi - lo) as usize;
                yield chunk.slice(offset_in_chunk..offset_in_chunk + len);
            }
        }
    }
    .boxed()
}

async fn run_download<R>(
    mut remote: R,
    temp_path: &std::path::Path,
    chunk_size: usize,
    tx: &tokio::sync::mpsc::Sender<(u64, u64, Bytes)>,
    total: &AtomicU64,
) -> Result<(), CacheError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let mut file = File::create(temp_path).await.map_err(CacheError::Io)?;
    let mut buf = vec![0u8; chunk_size];
    let mut pos: u64 = 0;

    loop {
        let n = remote.read(&mut buf).await.map_err(CacheError::RemoteUnavailable)?;
        if n == 0 {
            break;
        }

        file.write_all(&buf[..n]).await.map_err(CacheError::Io)?;
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        let begin = pos;
        let end = pos + n as u64;
        pos = end;
        total.store(end, Ordering::SeqCst);

        // The streamer may have been dropped; keep draining regardless.
        let _ = tx.send((begin, end, chunk)).await;
    }

    file.flush().await.map_err(CacheError::Io)?;
    Ok(())
}

fn temp_path_for(path: &std::path::Path) -> std::path::PathBuf {
    let mut os_string = path.as_os_str().to_owned();
    os_string.push(".temp");
    std::path::PathBuf::from(os_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_narrows_to_requested_range() {
        assert_eq!(clip(0, 100, Some(10..20)), Some((10, 20)));
        assert_eq!(clip(50, 100, Some(0..60)), Some((50, 60)));
        assert_eq!(clip(50, 100, Some(0..10)), None);
        assert_eq!(clip(0, 100, None), Some((0, 100)));
    }

    #[tokio::test]
    async fn stream_from_remote_installs_full_file_even_if_reader_stops_early() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("42");
        let payload = vec![b'X'; 10_000];
        let cursor = std::io::Cursor::new(payload.clone());

        let (tx, rx) = tokio::sync::oneshot::channel::<u64>();
        let tx = std::sync::Mutex::new(Some(tx));

        let mut stream = stream_from_remote(
            cursor,
            target.clone(),
            None,
            256,
            move |size| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(size);
                }
            },
            || {},
        );

        // Consumer reads exactly one chunk then drops the stream.
        let _ = stream.next().await;
        drop(stream);

        let installed_size = rx.await.unwrap();
        assert_eq!(installed_size, payload.len() as u64);

        let on_disk = tokio::fs::read(&target).await.unwrap();
        assert_eq!(on_disk, payload);
        assert!(!temp_path_for(&target).exists());
    }
}
