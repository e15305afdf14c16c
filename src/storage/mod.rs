use crate::error::{Error, Result};
use crate::torrent::{FileInfo, Metainfo};
use async_trait::async_trait;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

/// Destination for verified pieces.
///
/// Pieces arrive in completion order, not index order, and writes for
/// different pieces may run concurrently.
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn write_piece(&self, index: usize, data: &[u8]) -> Result<()>;

    /// Bytes previously written for piece `index`, if the sink can tell
    async fn read_piece(&self, _index: usize, _length: usize) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// Writes pieces into the torrent's file layout on disk
#[derive(Debug)]
pub struct FileStorage {
    files: Vec<FileEntry>,
    piece_length: u64,
}

#[derive(Debug)]
struct FileEntry {
    path: PathBuf,
    length: u64,
    offset: u64, // Global offset in the torrent
}

impl FileStorage {
    /// Lay the torrent out under `download_dir`: a single-file torrent
    /// becomes `download_dir/name`, a multi-file one `download_dir/name/...`
    pub async fn from_metainfo<P: AsRef<Path>>(download_dir: P, metainfo: &Metainfo) -> Result<Self> {
        let download_dir = download_dir.as_ref();
        let single = metainfo.files.len() == 1 && metainfo.files[0].path == [metainfo.name.clone()];
        let root = if single {
            download_dir.to_path_buf()
        } else {
            download_dir.join(safe_component(&metainfo.name)?)
        };

        Self::new(root, &metainfo.files, metainfo.info.piece_length).await
    }

    /// Create the directory tree for `files` below `root`
    pub async fn new<P: AsRef<Path>>(root: P, files: &[FileInfo], piece_length: u64) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        let mut entries = Vec::with_capacity(files.len());
        let mut offset = 0u64;

        for file_info in files {
            let mut file_path = root.clone();
            for component in &file_info.path {
                file_path.push(safe_component(component)?);
            }

            if let Some(parent) = file_path.parent() {
                fs::create_dir_all(parent).await?;
            }
            if file_info.length == 0 {
                // no piece will ever touch it
                File::create(&file_path).await?;
            }

            entries.push(FileEntry {
                path: file_path,
                length: file_info.length,
                offset,
            });
            offset += file_info.length;
        }

        info!(
            "Storage initialized: {} files, {} bytes total under {}",
            entries.len(),
            offset,
            root.display()
        );

        Ok(Self {
            files: entries,
            piece_length,
        })
    }

    /// Files overlapping `[offset, offset + length)`, with the position and
    /// size of the overlap inside each file
    fn spans(&self, offset: u64, length: u64) -> impl Iterator<Item = (&FileEntry, u64, usize)> {
        let end = offset + length;
        self.files
            .iter()
            .filter(move |f| f.length > 0 && f.offset < end && offset < f.offset + f.length)
            .map(move |f| {
                let start = offset.max(f.offset);
                let stop = end.min(f.offset + f.length);
                (f, start - f.offset, (stop - start) as usize)
            })
    }

    /// Write data at a global offset (spans multiple files if needed)
    async fn write_at_offset(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut written = 0;

        for (file_entry, file_offset, len) in self.spans(offset, data.len() as u64) {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&file_entry.path)
                .await?;

            file.seek(SeekFrom::Start(file_offset)).await?;
            file.write_all(&data[written..written + len]).await?;
            file.flush().await?;

            debug!(
                "Wrote {} bytes to {:?} at offset {}",
                len, file_entry.path, file_offset
            );
            written += len;
        }

        if written != data.len() {
            return Err(Error::Storage(format!(
                "Write of {} bytes at offset {} runs past the end of the torrent",
                data.len(),
                offset
            )));
        }
        Ok(())
    }

    /// Read data from a global offset; `None` when any part is not on disk
    async fn read_at_offset(&self, offset: u64, length: usize) -> Result<Option<Vec<u8>>> {
        let mut result = Vec::with_capacity(length);

        for (file_entry, file_offset, len) in self.spans(offset, length as u64) {
            let mut file = match File::open(&file_entry.path).await {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            file.seek(SeekFrom::Start(file_offset)).await?;

            let mut buffer = vec![0u8; len];
            match file.read_exact(&mut buffer).await {
                Ok(_) => result.extend_from_slice(&buffer),
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }

        if result.len() != length {
            return Ok(None);
        }
        Ok(Some(result))
    }
}

#[async_trait]
impl StorageSink for FileStorage {
    async fn write_piece(&self, index: usize, data: &[u8]) -> Result<()> {
        let global_offset = index as u64 * self.piece_length;
        debug!(
            "Writing piece {} at global offset {} ({} bytes)",
            index,
            global_offset,
            data.len()
        );

        self.write_at_offset(global_offset, data).await
    }

    async fn read_piece(&self, index: usize, length: usize) -> Result<Option<Vec<u8>>> {
        self.read_at_offset(index as u64 * self.piece_length, length).await
    }
}

/// A path component from the torrent, refusing anything that would escape
/// the download directory
fn safe_component(component: &str) -> Result<&str> {
    let mut parts = Path::new(component).components();
    match (parts.next(), parts.next()) {
        (Some(Component::Normal(_)), None) => Ok(component),
        _ => Err(Error::Storage(format!(
            "Refusing unsafe path component {:?}",
            component
        ))),
    }
}
