//! Append-and-archive file store for keep material.
//!
//! Layout: `<root>/<directory>/<name>`, one directory per keep. Archiving moves
//! the whole directory under `<root>/archived/`. Files are created once and
//! never overwritten.

use crate::error::{KeepError, KeepResult};
use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes128Gcm, Key, KeyInit, Nonce};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;

pub const ARCHIVED_DIR: &str = "archived";
/// Files being written. Never read back.
const STAGING_PREFIX: &str = ".staging-";
const NONCE_LEN: usize = 12;

pub fn encrypt(cipher: &Aes128Gcm, plaintext: &[u8]) -> KeepResult<Vec<u8>> {
    let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| KeepError::Crypto("encryption failed".to_string()))?;
    let mut blob = nonce.to_vec();
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

pub fn decrypt(cipher: &Aes128Gcm, blob: &[u8]) -> KeepResult<Vec<u8>> {
    if blob.len() < NONCE_LEN {
        return Err(KeepError::Crypto("ciphertext too short".to_string()));
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| KeepError::Crypto("decryption failed; wrong key or corrupted blob".to_string()))
}

pub fn cipher(key: &[u8; 16]) -> Aes128Gcm {
    Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key))
}

/// One stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub directory: String,
    pub name: String,
    pub content: Vec<u8>,
}

pub struct KeepStorage {
    root: PathBuf,
}

impl KeepStorage {
    pub async fn new(root: PathBuf) -> KeepResult<Self> {
        tokio::fs::create_dir_all(root.join(ARCHIVED_DIR))
            .await
            .map_err(|err| KeepError::storage("create data directory", err))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Durably writes a new file. Fails if the file already exists.
    ///
    /// The content is written and synced under a staging name first and only
    /// then linked to `name`, so `name` never holds a partial write.
    pub async fn save(&self, blob: &[u8], directory: &str, name: &str) -> KeepResult<()> {
        let dir = self.root.join(directory);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| KeepError::storage("create keep directory", err))?;
        let path = dir.join(name);
        let staging = dir.join(format!(
            "{}{}.{}",
            STAGING_PREFIX,
            name,
            hex::encode(rand::random::<[u8; 4]>())
        ));
        let result = write_and_link(&staging, &path, blob).await;
        if let Err(err) = tokio::fs::remove_file(&staging).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %staging.display(), %err, "cannot remove staging file");
            }
        }
        result?;
        sync_dir(&dir).await
    }

    /// Lazily walks every non-archived directory. Errors are yielded in place
    /// of the entries they affected; iteration continues past them.
    pub fn read_all(&self) -> ReadAll {
        let directories = match std::fs::read_dir(&self.root) {
            Ok(entries) => Some(entries),
            Err(err) => {
                return ReadAll {
                    directories: None,
                    current: None,
                    pending_error: Some(KeepError::storage("list data directory", err)),
                }
            }
        };
        ReadAll {
            directories,
            current: None,
            pending_error: None,
        }
    }

    /// Moves `<root>/<directory>` under `<root>/archived/`. Archiving a missing
    /// or already archived directory succeeds without doing anything.
    pub async fn archive(&self, directory: &str) -> KeepResult<()> {
        let source = self.root.join(directory);
        if !tokio::fs::try_exists(&source)
            .await
            .map_err(|err| KeepError::storage("stat keep directory", err))?
        {
            return Ok(());
        }
        let archived = self.root.join(ARCHIVED_DIR);
        tokio::fs::create_dir_all(&archived)
            .await
            .map_err(|err| KeepError::storage("create archive directory", err))?;
        let mut destination = archived.join(directory);
        if tokio::fs::try_exists(&destination)
            .await
            .map_err(|err| KeepError::storage("stat archive directory", err))?
        {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_nanos())
                .unwrap_or_default();
            destination = archived.join(format!("{}.{}", directory, nanos));
        }
        tokio::fs::rename(&source, &destination)
            .await
            .map_err(|err| KeepError::storage(&format!("archive {}", directory), err))?;
        sync_dir(&archived).await?;
        sync_dir(&self.root).await
    }
}

async fn write_and_link(staging: &Path, path: &Path, blob: &[u8]) -> KeepResult<()> {
    let mut file = tokio::fs::File::create_new(staging)
        .await
        .map_err(|err| KeepError::storage(&format!("create {}", staging.display()), err))?;
    file.write_all(blob)
        .await
        .map_err(|err| KeepError::storage(&format!("write {}", staging.display()), err))?;
    file.sync_all()
        .await
        .map_err(|err| KeepError::storage(&format!("sync {}", staging.display()), err))?;
    drop(file);
    // Linking fails when `path` exists.
    tokio::fs::hard_link(staging, path)
        .await
        .map_err(|err| KeepError::storage(&format!("link {}", path.display()), err))
}

async fn sync_dir(dir: &Path) -> KeepResult<()> {
    tokio::fs::File::open(dir)
        .await
        .map_err(|err| KeepError::storage(&format!("open {}", dir.display()), err))?
        .sync_all()
        .await
        .map_err(|err| KeepError::storage(&format!("sync {}", dir.display()), err))
}

/// Iterator returned by [`KeepStorage::read_all`]. Not restartable.
pub struct ReadAll {
    directories: Option<std::fs::ReadDir>,
    current: Option<(String, std::fs::ReadDir)>,
    pending_error: Option<KeepError>,
}

impl ReadAll {
    /// Splits the walk into the blobs read and the errors met.
    pub fn partition(self) -> (Vec<StoredBlob>, Vec<KeepError>) {
        let mut blobs = Vec::new();
        let mut errors = Vec::new();
        for item in self {
            match item {
                Ok(blob) => blobs.push(blob),
                Err(err) => errors.push(err),
            }
        }
        (blobs, errors)
    }

    fn next_directory(&mut self) -> Option<KeepResult<()>> {
        loop {
            let entry = match self.directories.as_mut()?.next()? {
                Ok(entry) => entry,
                Err(err) => return Some(Err(KeepError::storage("list data directory", err))),
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == ARCHIVED_DIR || !entry.path().is_dir() {
                continue;
            }
            return Some(match std::fs::read_dir(entry.path()) {
                Ok(files) => {
                    self.current = Some((name, files));
                    Ok(())
                }
                Err(err) => Err(KeepError::storage(&format!("list {}", name), err)),
            });
        }
    }
}

impl Iterator for ReadAll {
    type Item = KeepResult<StoredBlob>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending_error.take() {
            return Some(Err(err));
        }
        loop {
            if let Some((directory, files)) = self.current.as_mut() {
                match files.next() {
                    Some(Ok(file)) => {
                        let name = file.file_name().to_string_lossy().into_owned();
                        if name.starts_with(STAGING_PREFIX) {
                            continue;
                        }
                        let result = std::fs::read(file.path())
                            .map(|content| StoredBlob {
                                directory: directory.clone(),
                                name: name.clone(),
                                content,
                            })
                            .map_err(|err| {
                                KeepError::storage(&format!("read {}/{}", directory, name), err)
                            });
                        return Some(result);
                    }
                    Some(Err(err)) => {
                        return Some(Err(KeepError::storage(&format!("list {}", directory), err)))
                    }
                    None => self.current = None,
                }
            }
            match self.next_directory()? {
                Ok(()) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}
