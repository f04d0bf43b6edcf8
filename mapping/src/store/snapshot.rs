//! Snapshots let the in-memory store survive restarts: the full store is
//! loaded at startup and written back periodically and on shutdown.
use super::StoreData;
use crate::config::Compression;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait SnapshotProvider: Send + Sync {
    /// Returns `None` when no snapshot has been written yet.
    fn load(&self) -> Result<Option<StoreData>, SnapshotError>;
    /// Returns the number of uncompressed bytes written.
    fn store(&self, data: &StoreData) -> Result<usize, SnapshotError>;
}

struct Codec {
    compression: Compression,
}

impl Codec {
    fn new(compression: Compression) -> Self {
        Codec { compression }
    }

    fn write<W: Write>(&self, writer: &mut W, data: &StoreData) -> Result<usize, SnapshotError> {
        let encoded = serde_json::to_vec(data)?;

        match self.compression.zstd_level() {
            None => {
                writer.write_all(&encoded)?;
                writer.flush()?;
            }
            Some(level) => {
                let mut encoder = zstd::stream::write::Encoder::new(writer, level)?;
                encoder.write_all(&encoded)?;
                encoder.finish()?.flush()?;
            }
        }

        Ok(encoded.len())
    }

    fn read<R: Read>(&self, reader: R) -> Result<StoreData, SnapshotError> {
        match self.compression.zstd_level() {
            None => Ok(serde_json::from_reader(reader)?),
            Some(_) => {
                let decoder = zstd::stream::read::Decoder::new(reader)?;
                Ok(serde_json::from_reader(decoder)?)
            }
        }
    }
}

pub struct FilesystemSnapshot {
    path: PathBuf,
    codec: Codec,
}

impl FilesystemSnapshot {
    pub fn new(base_dir: &str, filename: &str, compression: Compression) -> Self {
        FilesystemSnapshot {
            path: Path::new(base_dir).join(filename),
            codec: Codec::new(compression),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotProvider for FilesystemSnapshot {
    fn load(&self) -> Result<Option<StoreData>, SnapshotError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let reader = io::BufReader::new(file);
        self.codec.read(reader).map(Some)
    }

    fn store(&self, data: &StoreData) -> Result<usize, SnapshotError> {
        // Write next to the target and rename so a crash never leaves a torn file.
        let tmp_path = self.path.with_extension("tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = io::BufWriter::new(file);
        let size = self.codec.write(&mut writer, data)?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;

        tracing::debug!(path = ?self.path, bytes = size, "Stored store snapshot");
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConfigType, Project, ProjectEnv, Status};

    fn get_store_data() -> StoreData {
        let mut data = StoreData::default();
        data.projects.insert(
            "p1".into(),
            Project {
                project_id: "p1".into(),
                company_id: "c1".into(),
                name: "demo".into(),
                env: ProjectEnv::Dev,
                status: Status::Active,
                owners: vec!["owner@example.com".into()],
                editors: vec![],
                viewers: vec![],
                config_types: ConfigType::builtin(),
                created_at: 1,
                updated_at: 1,
            },
        );
        data
    }

    #[test]
    fn test_codec() {
        for compression in [Compression::None, Compression::Zstd1, Compression::Zstd3] {
            let codec = Codec::new(compression);
            let data = get_store_data();
            let mut buffer: Vec<u8> = Vec::new();
            codec.write(&mut buffer, &data).unwrap();
            let decoded = codec.read(buffer.as_slice()).unwrap();
            assert_eq!(data, decoded);
        }
    }

    #[test]
    fn test_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FilesystemSnapshot::new(
            dir.path().to_str().unwrap(),
            "store.snapshot",
            Compression::Zstd1,
        );

        assert!(provider.load().unwrap().is_none());

        let data = get_store_data();
        provider.store(&data).unwrap();
        assert_eq!(provider.load().unwrap(), Some(data));
        assert!(!provider.path().with_extension("tmp").exists());
    }
}
