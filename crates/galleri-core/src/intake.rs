//! Intake pipeline: date, name, convert, store and register every file of
//! a batch.
//!
//! Files run concurrently on the caller's task (`join_all`), each through
//! its own strictly ordered chain. A failing file never stops its
//! siblings; the report holds one result per input file, in input order.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::convert::{self, FormatDecoder};
use crate::date::exif::{ExifReader, KamadakExif};
use crate::date::{self, Clock, DateSource, ResolvedDate, SystemClock};
use crate::error::{AuthError, IntakeError, IntakeErrorKind, IntakeStep};
use crate::gallery::GalleryEntry;
use crate::gateway::{Identity, MetadataRecord, RecordId};
use crate::media::MediaFile;
use crate::naming::{self, CanonicalName};
use crate::session::Session;
use crate::{CollisionPolicy, Options, ProgressCallback, ThrottledProgress};

/// An image that was stored and registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    pub name: CanonicalName,
    /// Storage key (`<prefix><name>`)
    pub key: String,
    pub url: String,
    /// Wall-clock time of the upload, not the capture date
    pub uploaded_at: DateTime<Utc>,
    pub content_type: String,
    /// SHA-256 of the source file, hex
    pub content_hash: String,
    pub record_id: RecordId,
    pub date_source: DateSource,
}

/// Outcome of one `ingest` call.
#[derive(Debug, Clone)]
pub struct IntakeReport {
    pub results: Vec<Result<StoredImage, IntakeError>>,
}

impl IntakeReport {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &StoredImage> {
        self.results.iter().filter_map(|r| r.as_ref().ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &IntakeError> {
        self.results.iter().filter_map(|r| r.as_ref().err())
    }

    /// Entries for the stored images, ready for `GalleryViewModel::merge_uploaded`.
    pub fn gallery_entries(&self) -> Vec<GalleryEntry> {
        self.succeeded().map(GalleryEntry::from_stored).collect()
    }
}

enum ContentEntry {
    /// A file with this content is being stored; the sender side closes
    /// once it settles
    Pending { file: String, settled: watch::Receiver<()> },
    Stored(String),
}

enum ContentClaim {
    /// This file stores the content; drop the sender after settling
    Owner(watch::Sender<()>),
    /// Wait for the owner, then claim again
    Pending(watch::Receiver<()>),
    Stored(String),
}

/// Names and contents claimed so far in one batch.
#[derive(Default)]
struct Batch {
    names: Mutex<HashSet<CanonicalName>>,
    contents: Mutex<HashMap<String, ContentEntry>>,
}

impl Batch {
    fn reserve(&self, name: &CanonicalName) -> bool {
        self.names.lock().insert(name.clone())
    }

    fn claim_content(&self, hash: &str, file: &str) -> ContentClaim {
        let mut contents = self.contents.lock();
        match contents.get(hash) {
            Some(ContentEntry::Stored(first)) => return ContentClaim::Stored(first.clone()),
            // A closed channel on a pending entry means its owner was dropped
            Some(ContentEntry::Pending { settled, .. }) if settled.has_changed().is_ok() => {
                return ContentClaim::Pending(settled.clone());
            }
            _ => {}
        }
        let (owner, settled) = watch::channel(());
        contents.insert(
            hash.to_string(),
            ContentEntry::Pending {
                file: file.to_string(),
                settled,
            },
        );
        ContentClaim::Owner(owner)
    }

    /// Record the owner's outcome. A failed owner releases the content so a
    /// later copy can be stored in its place.
    fn settle_content(&self, hash: &str, stored: bool) {
        let mut contents = self.contents.lock();
        match contents.remove(hash) {
            Some(ContentEntry::Pending { file, .. }) if stored => {
                contents.insert(hash.to_string(), ContentEntry::Stored(file));
            }
            _ => {}
        }
    }
}

fn no_progress(_stage: &str, _current: u64, _total: u64, _message: &str) {}

pub struct IntakePipeline {
    session: Arc<Session>,
    decoder: Arc<dyn FormatDecoder>,
    exif: Arc<dyn ExifReader>,
    clock: Arc<dyn Clock>,
    options: Options,
}

impl IntakePipeline {
    pub fn new(session: Arc<Session>, decoder: Arc<dyn FormatDecoder>) -> Self {
        Self {
            session,
            decoder,
            exif: Arc::new(KamadakExif),
            clock: Arc::new(SystemClock),
            options: Options::default(),
        }
    }

    pub fn with_exif_reader(mut self, exif: Arc<dyn ExifReader>) -> Self {
        self.exif = exif;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Ingest a batch. Refused as a whole when the session has no identity.
    pub async fn ingest(&self, files: Vec<MediaFile>) -> Result<IntakeReport, AuthError> {
        self.ingest_with_progress(files, &no_progress).await
    }

    /// Like `ingest`, reporting stage `intake` as files finish and stage
    /// `done` exactly once when the whole batch has settled.
    pub async fn ingest_with_progress(
        &self,
        files: Vec<MediaFile>,
        progress: &ProgressCallback<'_>,
    ) -> Result<IntakeReport, AuthError> {
        let identity = self.session.require_identity()?;
        let total = files.len() as u64;
        let tp = ThrottledProgress::new(progress);
        let batch = Batch::default();
        let finished = AtomicU64::new(0);

        let tasks = files.into_iter().map(|file| {
            let identity = &identity;
            let batch = &batch;
            let tp = &tp;
            let finished = &finished;
            async move {
                let original = file.name.clone();
                let result = self.ingest_one(file, identity, batch).await;
                if let Err(e) = &result {
                    warn!(file = %original, step = %e.step, "intake failed: {}", e.kind);
                }
                let current = finished.fetch_add(1, Ordering::Relaxed);
                tp.report("intake", current, total, &original);
                result
            }
        });
        let report = IntakeReport {
            results: join_all(tasks).await,
        };

        let stored = report.succeeded().count();
        let summary = format!("{} stored, {} failed", stored, report.len() - stored);
        info!(total, stored, "intake batch finished");
        progress("done", total, total, &summary);
        Ok(report)
    }

    async fn ingest_one(
        &self,
        file: MediaFile,
        identity: &Identity,
        batch: &Batch,
    ) -> Result<StoredImage, IntakeError> {
        let original = file.name.clone();
        let fail = |step: IntakeStep, kind: IntakeErrorKind| IntakeError::new(original.clone(), step, kind);

        // 1. Date
        let resolved = date::resolve(&file, self.exif.as_ref(), self.clock.as_ref());
        debug!(file = %original, date = %resolved.date, source = ?resolved.source, "resolved capture date");

        // 2. Name
        let content_hash = hex::encode(Sha256::digest(&file.bytes));
        let owner = loop {
            match batch.claim_content(&content_hash, &original) {
                ContentClaim::Owner(owner) => break owner,
                ContentClaim::Stored(first) => {
                    return Err(fail(IntakeStep::Name, IntakeErrorKind::DuplicateContent(first)));
                }
                ContentClaim::Pending(mut settled) => {
                    // Resolves when the owner drops its sender
                    let _ = settled.changed().await;
                }
            }
        };

        let result = self
            .store_unique(file, &original, resolved, &content_hash, identity, batch)
            .await;
        // A failed registration still leaves the object in storage
        let stored = match &result {
            Ok(_) => true,
            Err(e) => e.step == IntakeStep::Register,
        };
        batch.settle_content(&content_hash, stored);
        drop(owner);
        result
    }

    /// Steps 2 to 5 for a file that owns its content in the batch.
    async fn store_unique(
        &self,
        file: MediaFile,
        original: &str,
        resolved: ResolvedDate,
        content_hash: &str,
        identity: &Identity,
        batch: &Batch,
    ) -> Result<StoredImage, IntakeError> {
        let fail = |step: IntakeStep, kind: IntakeErrorKind| IntakeError::new(original, step, kind);

        let mut name = naming::normalize(&resolved, original);
        if let Some(ext) = convert::converted_extension(&file) {
            name = name.with_extension(ext);
        }
        let name = self
            .claim_name(name, batch)
            .await
            .map_err(|kind| fail(IntakeStep::Name, kind))?;
        debug!(file = %original, name = %name, "claimed canonical name");

        // 3. Convert
        let blob = self
            .bounded(convert::convert(file, self.decoder.as_ref()), IntakeErrorKind::Decode)
            .await
            .map_err(|kind| fail(IntakeStep::Convert, kind))?;

        // 4. Store
        let key = name.storage_key(&self.options.storage_prefix);
        let url = self
            .bounded(
                self.session.storage().put(&key, &blob.bytes, &blob.mime_type),
                IntakeErrorKind::Storage,
            )
            .await
            .map_err(|kind| fail(IntakeStep::Store, kind))?;
        debug!(file = %original, key = %key, "stored object");

        // 5. Register
        let uploaded_at = self.clock.now();
        let record = MetadataRecord {
            url: url.clone(),
            name: name.to_string(),
            timestamp: uploaded_at,
            content_type: blob.mime_type.clone(),
            content_hash: content_hash.to_string(),
            owner: identity.uid.clone(),
        };
        let record_id = self
            .bounded(self.session.metadata().insert(record), |reason| IntakeErrorKind::Metadata {
                orphaned_key: key.clone(),
                reason,
            })
            .await
            .map_err(|kind| {
                warn!(key = %key, "stored object has no metadata record");
                fail(IntakeStep::Register, kind)
            })?;

        Ok(StoredImage {
            name,
            key,
            url,
            uploaded_at,
            content_type: blob.mime_type,
            content_hash: content_hash.to_string(),
            record_id,
            date_source: resolved.source,
        })
    }

    /// Reserve `name` for this batch and make sure storage does not hold it
    /// yet, stepping to numbered variants under `CollisionPolicy::Rename`.
    async fn claim_name(&self, name: CanonicalName, batch: &Batch) -> Result<CanonicalName, IntakeErrorKind> {
        let mut candidate = name.clone();
        let mut counter = 0u32;
        loop {
            // Reservation happens before the first await so concurrent files
            // in the batch cannot both take the same name.
            if batch.reserve(&candidate) {
                let key = candidate.storage_key(&self.options.storage_prefix);
                let taken = self
                    .bounded(self.session.storage().exists(&key), IntakeErrorKind::Storage)
                    .await?;
                if !taken {
                    return Ok(candidate);
                }
            }
            match self.options.collision {
                CollisionPolicy::Fail => return Err(IntakeErrorKind::NameCollision(candidate.to_string())),
                CollisionPolicy::Rename => {
                    counter += 1;
                    candidate = name.numbered(counter);
                }
            }
        }
    }

    /// Await an external call under the configured step timeout.
    async fn bounded<T, F>(
        &self,
        fut: F,
        on_error: impl FnOnce(String) -> IntakeErrorKind,
    ) -> Result<T, IntakeErrorKind>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let result = match self.options.step_timeout() {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => return Err(IntakeErrorKind::Timeout { secs: limit.as_secs() }),
            },
            None => fut.await,
        };
        result.map_err(|e| on_error(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date::exif::CaptureTag;
    use crate::date::FixedClock;
    use crate::gateway::{AnonymousIdentity, MemoryMetadata, MemoryStorage, StorageGateway};
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct NoExif;

    impl ExifReader for NoExif {
        fn read_tag(&self, _bytes: &[u8], _tag: CaptureTag) -> Option<String> {
            None
        }
    }

    struct PrefixDecoder;

    #[async_trait]
    impl FormatDecoder for PrefixDecoder {
        async fn decode(&self, bytes: &[u8], _source: &str, _target: &str) -> anyhow::Result<Vec<u8>> {
            let mut out = b"jpeg:".to_vec();
            out.extend_from_slice(bytes);
            Ok(out)
        }
    }

    /// Decoder that never finishes.
    struct HangingDecoder;

    #[async_trait]
    impl FormatDecoder for HangingDecoder {
        async fn decode(&self, _bytes: &[u8], _source: &str, _target: &str) -> anyhow::Result<Vec<u8>> {
            futures::future::pending::<()>().await;
            unreachable!()
        }
    }

    /// Decoder that yields, then fails its first call only.
    #[derive(Default)]
    struct FlakyDecoder {
        failed_once: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl FormatDecoder for FlakyDecoder {
        async fn decode(&self, bytes: &[u8], _source: &str, _target: &str) -> anyhow::Result<Vec<u8>> {
            tokio::task::yield_now().await;
            if !self.failed_once.swap(true, Ordering::SeqCst) {
                anyhow::bail!("truncated HEIF box");
            }
            Ok(bytes.to_vec())
        }
    }

    fn noon(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    async fn signed_in(storage: Arc<MemoryStorage>, metadata: Arc<MemoryMetadata>) -> Arc<Session> {
        let session = Arc::new(Session::new(storage, metadata, Arc::new(AnonymousIdentity)));
        session.sign_in().await.unwrap();
        session
    }

    fn pipeline(session: Arc<Session>, decoder: Arc<dyn FormatDecoder>) -> IntakePipeline {
        IntakePipeline::new(session, decoder)
            .with_exif_reader(Arc::new(NoExif))
            .with_clock(Arc::new(FixedClock(noon(2025, 1, 2))))
    }

    fn png(name: &str, bytes: &[u8], day: u32) -> MediaFile {
        MediaFile::new(name, "image/png", bytes.to_vec()).with_last_modified(noon(2023, 3, day))
    }

    #[tokio::test]
    async fn test_stores_and_registers() {
        let storage = Arc::new(MemoryStorage::new());
        let metadata = Arc::new(MemoryMetadata::new());
        let session = signed_in(storage.clone(), metadata.clone()).await;
        let uid = session.identity().unwrap().uid;

        let report = pipeline(session, Arc::new(PrefixDecoder))
            .ingest(vec![png("photo.png", b"p", 5)])
            .await
            .unwrap();

        let stored = report.results[0].as_ref().unwrap();
        assert_eq!(stored.name.as_str(), "20230305_photo.png");
        assert_eq!(stored.key, "images/20230305_photo.png");
        assert_eq!(stored.url, "memory://images/20230305_photo.png");
        assert_eq!(stored.uploaded_at, noon(2025, 1, 2));
        assert_eq!(stored.date_source, DateSource::LastModified);

        let (bytes, meta) = storage.get("images/20230305_photo.png").unwrap();
        assert_eq!(bytes, b"p");
        assert_eq!(meta.content_type, "image/png");

        let records = metadata.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "20230305_photo.png");
        assert_eq!(records[0].url, stored.url);
        assert_eq!(records[0].timestamp, noon(2025, 1, 2));
        assert_eq!(records[0].owner, uid);
    }

    #[tokio::test]
    async fn test_heic_converted_and_renamed() {
        let storage = Arc::new(MemoryStorage::new());
        let session = signed_in(storage.clone(), Arc::new(MemoryMetadata::new())).await;
        let file = MediaFile::new("IMG_7.HEIC", "image/heic", b"raw".to_vec()).with_last_modified(noon(2022, 6, 1));

        let report = pipeline(session, Arc::new(PrefixDecoder)).ingest(vec![file]).await.unwrap();
        let stored = report.results[0].as_ref().unwrap();
        assert_eq!(stored.name.as_str(), "20220601_IMG_7.jpg");
        assert_eq!(stored.content_type, "image/jpeg");
        assert_eq!(storage.get("images/20220601_IMG_7.jpg").unwrap().0, b"jpeg:raw");
    }

    #[tokio::test]
    async fn test_refused_without_identity() {
        let session = Arc::new(Session::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryMetadata::new()),
            Arc::new(AnonymousIdentity),
        ));
        let err = pipeline(session, Arc::new(PrefixDecoder))
            .ingest(vec![png("photo.png", b"p", 5)])
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::NotSignedIn);
    }

    #[tokio::test]
    async fn test_collision_fails_by_default() {
        let storage = Arc::new(MemoryStorage::new());
        storage.put("images/20230305_photo.png", b"old", "image/png").await.unwrap();
        let session = signed_in(storage.clone(), Arc::new(MemoryMetadata::new())).await;

        let report = pipeline(session, Arc::new(PrefixDecoder))
            .ingest(vec![png("photo.png", b"new", 5), png("photo.png", b"newer", 5)])
            .await
            .unwrap();

        for result in &report.results {
            let err = result.as_ref().unwrap_err();
            assert_eq!(err.step, IntakeStep::Name);
            assert_eq!(err.kind, IntakeErrorKind::NameCollision("20230305_photo.png".to_string()));
        }
        // Existing object untouched
        assert_eq!(storage.get("images/20230305_photo.png").unwrap().0, b"old");
    }

    #[tokio::test]
    async fn test_collision_rename_policy() {
        let storage = Arc::new(MemoryStorage::new());
        storage.put("images/20230305_photo.png", b"old", "image/png").await.unwrap();
        let session = signed_in(storage.clone(), Arc::new(MemoryMetadata::new())).await;
        let options = Options {
            collision: CollisionPolicy::Rename,
            ..Options::default()
        };

        let report = pipeline(session, Arc::new(PrefixDecoder))
            .with_options(options)
            .ingest(vec![png("photo.png", b"a", 5), png("photo.png", b"b", 5)])
            .await
            .unwrap();

        let names: Vec<String> = report.succeeded().map(|s| s.name.to_string()).collect();
        assert_eq!(names, vec!["20230305_photo(1).png", "20230305_photo(2).png"]);
        assert_eq!(storage.len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_content_in_batch() {
        let storage = Arc::new(MemoryStorage::new());
        let session = signed_in(storage.clone(), Arc::new(MemoryMetadata::new())).await;

        let report = pipeline(session, Arc::new(PrefixDecoder))
            .ingest(vec![png("a.png", b"same", 5), png("b.png", b"same", 6)])
            .await
            .unwrap();

        assert!(report.results[0].is_ok());
        let err = report.results[1].as_ref().unwrap_err();
        assert_eq!(err.file, "b.png");
        assert_eq!(err.kind, IntakeErrorKind::DuplicateContent("a.png".to_string()));
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_content_stored_when_first_copy_fails() {
        let storage = Arc::new(MemoryStorage::new());
        storage.put("images/20230305_a.png", b"old", "image/png").await.unwrap();
        let session = signed_in(storage.clone(), Arc::new(MemoryMetadata::new())).await;

        let report = pipeline(session, Arc::new(PrefixDecoder))
            .ingest(vec![png("a.png", b"same", 5), png("b.png", b"same", 5)])
            .await
            .unwrap();

        let err = report.results[0].as_ref().unwrap_err();
        assert_eq!(err.kind, IntakeErrorKind::NameCollision("20230305_a.png".to_string()));
        let stored = report.results[1].as_ref().unwrap();
        assert_eq!(stored.name.as_str(), "20230305_b.png");
        assert_eq!(storage.get("images/20230305_b.png").unwrap().0, b"same");
        assert_eq!(storage.len(), 2);
    }

    #[tokio::test]
    async fn test_waiting_copy_takes_over_from_failed_owner() {
        let storage = Arc::new(MemoryStorage::new());
        let session = signed_in(storage.clone(), Arc::new(MemoryMetadata::new())).await;
        let heic = |name: &str| MediaFile::new(name, "image/heic", b"same".to_vec()).with_last_modified(noon(2023, 3, 5));

        let report = pipeline(session, Arc::new(FlakyDecoder::default()))
            .ingest(vec![heic("a.heic"), heic("b.heic")])
            .await
            .unwrap();

        assert_eq!(report.results[0].as_ref().unwrap_err().step, IntakeStep::Convert);
        assert_eq!(report.results[1].as_ref().unwrap().name.as_str(), "20230305_b.jpg");
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let session = signed_in(Arc::new(MemoryStorage::new()), Arc::new(MemoryMetadata::new())).await;
        let options = Options {
            step_timeout_secs: Some(0),
            ..Options::default()
        };
        let file = MediaFile::new("slow.heic", "image/heic", b"x".to_vec());

        let report = pipeline(session, Arc::new(HangingDecoder))
            .with_options(options)
            .ingest(vec![file, png("fast.png", b"y", 5)])
            .await
            .unwrap();

        let err = report.results[0].as_ref().unwrap_err();
        assert_eq!(err.step, IntakeStep::Convert);
        assert_eq!(err.kind, IntakeErrorKind::Timeout { secs: 0 });
        assert!(report.results[1].is_ok());
    }

    #[tokio::test]
    async fn test_progress_done_reported_once() {
        let session = signed_in(Arc::new(MemoryStorage::new()), Arc::new(MemoryMetadata::new())).await;
        let events = std::sync::Mutex::new(Vec::new());
        let cb = |stage: &str, current: u64, total: u64, _msg: &str| {
            events.lock().unwrap().push((stage.to_string(), current, total));
        };

        let files = vec![png("a.png", b"a", 1), png("b.png", b"b", 2), png("c.png", b"c", 3)];
        pipeline(session, Arc::new(PrefixDecoder))
            .ingest_with_progress(files, &cb)
            .await
            .unwrap();

        let events = events.lock().unwrap();
        let done: Vec<_> = events.iter().filter(|(stage, _, _)| stage == "done").collect();
        assert_eq!(done, vec![&("done".to_string(), 3, 3)]);
        assert_eq!(events.last().map(|e| e.0.as_str()), Some("done"));
    }
}
