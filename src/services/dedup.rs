//! Deduplication: decide whether a freshly uploaded file attaches to an
//! existing blob or becomes a new one, and release blobs once nothing
//! references them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    blob_store::BlobStore, clock::Clock, fs::FileSystem, hasher, records::FileRecordStore,
};
use crate::{
    config::UploadSettings,
    errors::UploadResult,
    models::{FileRecord, Metadata, file::sanitize_filename},
};

/// A content-specific rewrite applied to a new blob before it is stored
/// (compression, image re-encoding, ...).
#[async_trait]
pub trait ContentTransform: Send + Sync {
    fn applies_to(&self, mime_type: &str) -> bool;

    /// Rewrite the file at `path` in place.
    async fn apply(&self, path: &Path) -> io::Result<()>;
}

/// Everything about an upload except its bytes.
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub original_filename: String,
    pub mime_type: String,
    /// Provisional size; replaced by the stored size.
    pub declared_size: u64,
    pub context: String,
    pub uploader: String,
    pub source: String,
    pub metadata: Metadata,
}

/// Outcome of one retention sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PurgeReport {
    pub files_purged: usize,
    pub blobs_removed: usize,
    pub failures: usize,
}

#[derive(Clone)]
pub struct DedupResolver {
    records: Arc<dyn FileRecordStore>,
    blobs: BlobStore,
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    settings: Arc<UploadSettings>,
    transforms: Vec<Arc<dyn ContentTransform>>,
}

impl DedupResolver {
    pub fn new(
        records: Arc<dyn FileRecordStore>,
        blobs: BlobStore,
        fs: Arc<dyn FileSystem>,
        clock: Arc<dyn Clock>,
        settings: &UploadSettings,
    ) -> Self {
        Self {
            records,
            blobs,
            fs,
            clock,
            settings: Arc::new(settings.clone()),
            transforms: Vec::new(),
        }
    }

    /// Register a transform for new blobs.
    pub fn with_transform(mut self, transform: Arc<dyn ContentTransform>) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Turn the file at `temp` into a new `FileRecord`.
    ///
    /// When live content with the same hash is still on disk the new record
    /// shares that blob and `temp` is discarded; otherwise `temp` is
    /// promoted into the blob tree. Hash equality is treated as content
    /// identity.
    pub async fn resolve(&self, temp: &Path, req: ResolveRequest) -> UploadResult<FileRecord> {
        let (hash, hashed_len) = hasher::hash_reader(self.fs.read(temp).await?).await?;
        debug!(
            content_hash = %hash,
            bytes = hashed_len,
            declared = req.declared_size,
            "hashed upload"
        );

        let _lock = self.blobs.lock(&hash).await;

        if let Some(existing) = self.find_live_blob(&hash).await? {
            let record = self.new_record(
                &req,
                &hash,
                existing.storage_path.clone(),
                existing.file_size,
            );
            self.records.create(&record).await?;
            if let Err(err) = self.fs.delete(temp).await {
                warn!(path = %temp.display(), error = %err, "failed to discard duplicate upload");
            }
            info!(
                file_id = %record.id,
                content_hash = %hash,
                shared_with = %existing.id,
                "deduplicated upload against existing blob"
            );
            return Ok(record);
        }

        for transform in self.transforms.iter().filter(|t| t.applies_to(&req.mime_type)) {
            transform.apply(temp).await?;
        }

        let (blob_path, created) = self.blobs.promote(temp, &hash).await?;
        let size = self.fs.size(&blob_path).await?;
        let record = self.new_record(
            &req,
            &hash,
            blob_path.to_string_lossy().into_owned(),
            size as i64,
        );

        if let Err(err) = self.records.create(&record).await {
            if created {
                if let Err(cleanup) = self.blobs.remove(&blob_path).await {
                    warn!(
                        path = %blob_path.display(),
                        error = %cleanup,
                        "failed to remove blob after insert failure"
                    );
                }
            }
            return Err(err.into());
        }

        info!(
            file_id = %record.id,
            content_hash = %hash,
            size,
            new_blob = created,
            "stored upload"
        );
        Ok(record)
    }

    /// Oldest live record for `hash` whose blob still exists on disk.
    /// Records whose blob went missing are skipped so the upload re-stores it.
    async fn find_live_blob(&self, hash: &str) -> UploadResult<Option<FileRecord>> {
        for candidate in self.records.find_by_hash(hash).await? {
            if self.blobs.exists(Path::new(&candidate.storage_path)).await {
                return Ok(Some(candidate));
            }
            warn!(
                file_id = %candidate.id,
                path = %candidate.storage_path,
                "blob missing for live record, re-storing"
            );
        }
        Ok(None)
    }

    fn new_record(
        &self,
        req: &ResolveRequest,
        hash: &str,
        storage_path: String,
        file_size: i64,
    ) -> FileRecord {
        FileRecord {
            id: Uuid::new_v4(),
            filename: sanitize_filename(&req.original_filename),
            original_name: req.original_filename.clone(),
            storage_path,
            mime_type: req.mime_type.clone(),
            file_size,
            context: req.context.clone(),
            uploader: req.uploader.clone(),
            upload_source: req.source.clone(),
            metadata: Json(req.metadata.clone()),
            is_public: self.settings.is_public_context(&req.context),
            content_hash: hash.to_string(),
            access_count: 0,
            is_suspended: false,
            suspension_reason: None,
            created_at: self.clock.now(),
            deleted_at: None,
            last_accessed_at: None,
        }
    }

    /// Purge records soft-deleted before `cutoff` and delete each blob once
    /// no record references it any more.
    pub async fn purge_deleted(&self, cutoff: DateTime<Utc>) -> UploadResult<PurgeReport> {
        let mut report = PurgeReport::default();
        for record in self.records.list_deleted_before(cutoff).await? {
            match self.purge_one(&record).await {
                Ok(blob_removed) => {
                    report.files_purged += 1;
                    if blob_removed {
                        report.blobs_removed += 1;
                    }
                }
                Err(err) => {
                    report.failures += 1;
                    warn!(file_id = %record.id, error = %err, "failed to purge deleted file");
                }
            }
        }
        Ok(report)
    }

    async fn purge_one(&self, record: &FileRecord) -> UploadResult<bool> {
        let _lock = self.blobs.lock(&record.content_hash).await;
        self.records.hard_delete(record.id).await?;

        let remaining = self.records.count_references(&record.storage_path).await?;
        if remaining > 0 {
            debug!(
                file_id = %record.id,
                references = remaining,
                "blob still referenced, kept"
            );
            return Ok(false);
        }

        let path = PathBuf::from(&record.storage_path);
        self.blobs.remove(&path).await?;
        info!(
            file_id = %record.id,
            content_hash = %record.content_hash,
            "removed unreferenced blob"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db,
        services::{
            clock::ManualClock,
            fs::{LocalFs, bytes_stream},
            records::SqliteFileRecords,
        },
    };
    use chrono::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        fs: Arc<LocalFs>,
        records: Arc<SqliteFileRecords>,
        clock: Arc<ManualClock>,
        resolver: DedupResolver,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let settings = UploadSettings::rooted_at(&root);
        let fs = Arc::new(LocalFs);
        let records = Arc::new(SqliteFileRecords::new(Arc::new(
            db::memory_pool().await.unwrap(),
        )));
        let clock = Arc::new(ManualClock::default());
        let blobs = BlobStore::new(&settings.blob_dir, fs.clone());
        let resolver = DedupResolver::new(
            records.clone(),
            blobs,
            fs.clone(),
            clock.clone(),
            &settings,
        );
        Fixture {
            _dir: dir,
            root,
            fs,
            records,
            clock,
            resolver,
        }
    }

    fn request(context: &str, size: u64) -> ResolveRequest {
        ResolveRequest {
            original_filename: "notes.txt".into(),
            mime_type: "text/plain".into(),
            declared_size: size,
            context: context.into(),
            uploader: "bob".into(),
            source: "direct".into(),
            metadata: Metadata::new(),
        }
    }

    async fn temp_file(f: &Fixture, name: &str, data: &'static [u8]) -> PathBuf {
        let path = f.root.join("tmp").join(name);
        f.fs.write_stream(&path, bytes_stream(data)).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_same_content_shares_blob() {
        let f = fixture().await;
        let first_tmp = temp_file(&f, "one", b"same bytes").await;
        let first = f.resolver.resolve(&first_tmp, request("a", 10)).await.unwrap();

        let second_tmp = temp_file(&f, "two", b"same bytes").await;
        let second = f.resolver.resolve(&second_tmp, request("b", 10)).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.storage_path, second.storage_path);
        assert_eq!(first.file_size, second.file_size);
        assert_eq!(second.context, "b");
        assert!(!f.fs.exists(&first_tmp).await);
        assert!(!f.fs.exists(&second_tmp).await);
    }

    #[tokio::test]
    async fn test_failed_insert_removes_new_blob() {
        let dir = TempDir::new().unwrap();
        let settings = UploadSettings::rooted_at(dir.path());
        let pool = Arc::new(db::memory_pool().await.unwrap());
        sqlx::query(
            "CREATE TRIGGER reject_files BEFORE INSERT ON files \
             BEGIN SELECT RAISE(ABORT, 'read only'); END",
        )
        .execute(&*pool)
        .await
        .unwrap();

        let fs = Arc::new(LocalFs);
        let blobs = BlobStore::new(&settings.blob_dir, fs.clone());
        let resolver = DedupResolver::new(
            Arc::new(SqliteFileRecords::new(pool)),
            blobs.clone(),
            fs.clone(),
            Arc::new(ManualClock::default()),
            &settings,
        );

        let tmp = settings.temp_dir.join("doomed");
        fs.write_stream(&tmp, bytes_stream("never stored")).await.unwrap();
        let err = resolver.resolve(&tmp, request("a", 12)).await.unwrap_err();
        assert!(matches!(err, crate::errors::UploadError::Database(_)));

        let (hash, _) = hasher::hash_reader(&b"never stored"[..]).await.unwrap();
        assert!(!fs.exists(&blobs.path_for(&hash)).await);
    }

    #[tokio::test]
    async fn test_visibility_follows_caller_context() {
        let f = fixture().await;
        let private_tmp = temp_file(&f, "p", b"shared").await;
        let private = f.resolver.resolve(&private_tmp, request("inbox", 6)).await.unwrap();
        let public_tmp = temp_file(&f, "q", b"shared").await;
        let public = f.resolver.resolve(&public_tmp, request("public", 6)).await.unwrap();

        assert!(!private.is_public);
        assert!(public.is_public);
        assert_eq!(private.storage_path, public.storage_path);
    }

    #[tokio::test]
    async fn test_missing_blob_is_restored() {
        let f = fixture().await;
        let tmp = temp_file(&f, "one", b"fragile").await;
        let first = f.resolver.resolve(&tmp, request("a", 7)).await.unwrap();

        f.fs.delete(Path::new(&first.storage_path)).await.unwrap();

        let tmp = temp_file(&f, "two", b"fragile").await;
        let second = f.resolver.resolve(&tmp, request("a", 7)).await.unwrap();
        assert_eq!(second.storage_path, first.storage_path);
        assert!(f.fs.exists(Path::new(&second.storage_path)).await);
    }

    #[tokio::test]
    async fn test_purge_keeps_blob_while_referenced() {
        let f = fixture().await;
        let tmp = temp_file(&f, "one", b"keep me").await;
        let a = f.resolver.resolve(&tmp, request("a", 7)).await.unwrap();
        let tmp = temp_file(&f, "two", b"keep me").await;
        let b = f.resolver.resolve(&tmp, request("b", 7)).await.unwrap();
        let blob = PathBuf::from(&a.storage_path);

        f.records.soft_delete(a.id, f.clock.now()).await.unwrap();
        f.clock.advance(Duration::days(8));
        let report = f
            .resolver
            .purge_deleted(f.clock.now() - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(report.files_purged, 1);
        assert_eq!(report.blobs_removed, 0);
        assert!(f.fs.exists(&blob).await);

        f.records.soft_delete(b.id, f.clock.now()).await.unwrap();
        f.clock.advance(Duration::days(8));
        let report = f
            .resolver
            .purge_deleted(f.clock.now() - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(report.files_purged, 1);
        assert_eq!(report.blobs_removed, 1);
        assert!(!f.fs.exists(&blob).await);
    }

    #[tokio::test]
    async fn test_purge_respects_grace_period() {
        let f = fixture().await;
        let tmp = temp_file(&f, "one", b"recent").await;
        let rec = f.resolver.resolve(&tmp, request("a", 6)).await.unwrap();
        f.records.soft_delete(rec.id, f.clock.now()).await.unwrap();

        let report = f
            .resolver
            .purge_deleted(f.clock.now() - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(report, PurgeReport::default());
        assert!(f.records.get(rec.id).await.unwrap().is_some());
    }

    struct Uppercase;

    #[async_trait]
    impl ContentTransform for Uppercase {
        fn applies_to(&self, mime_type: &str) -> bool {
            mime_type == "text/plain"
        }

        async fn apply(&self, path: &Path) -> io::Result<()> {
            let text = tokio::fs::read_to_string(path).await?;
            tokio::fs::write(path, format!("{}!!", text.to_uppercase())).await
        }
    }

    #[tokio::test]
    async fn test_transform_output_size_wins() {
        let f = fixture().await;
        let resolver = f.resolver.clone().with_transform(Arc::new(Uppercase));
        let tmp = temp_file(&f, "one", b"shout").await;

        let rec = resolver.resolve(&tmp, request("a", 5)).await.unwrap();
        assert_eq!(rec.file_size, 7);
        let stored = tokio::fs::read_to_string(&rec.storage_path).await.unwrap();
        assert_eq!(stored, "SHOUT!!");
    }
}
