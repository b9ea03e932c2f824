//! Library synchronizer - libraries, the client jar and game assets.
//!
//! ## Layout under the game directory
//! ```text
//! libraries/<artifact path>
//! versions/<id>/<id>.jar
//! assets/indexes/<asset index id>.json
//! assets/objects/<xx>/<hash>
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{ensure_artifact, Artifact, ArtifactStatus, SyncReport};
use crate::fetch::{ArtifactSource, FetchError};
use crate::integrity::ExpectedDigest;
use crate::manifest::{self, AssetObjects, VersionManifest};
use crate::task::{Reporter, TaskId};

/// What a library sync produced.
#[derive(Debug, Clone, Default)]
pub struct LibrarySync {
    pub report: SyncReport,
    /// Classpath entries in manifest order, client jar last.
    pub classpath: Vec<PathBuf>,
}

pub struct LibrarySynchronizer {
    source: Arc<dyn ArtifactSource>,
    game_dir: PathBuf,
    asset_base_url: String,
}

impl LibrarySynchronizer {
    pub fn new(source: Arc<dyn ArtifactSource>, game_dir: &Path, asset_base_url: &str) -> Self {
        Self {
            source,
            game_dir: game_dir.to_path_buf(),
            asset_base_url: asset_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn client_jar_path(&self, manifest: &VersionManifest) -> PathBuf {
        self.game_dir
            .join("versions")
            .join(&manifest.id)
            .join(format!("{}.jar", manifest.id))
    }

    /// Library and client artifacts plus the classpath they form.
    pub fn plan(&self, manifest: &VersionManifest) -> (Vec<Artifact>, Vec<PathBuf>) {
        let libraries_dir = self.game_dir.join("libraries");
        let mut artifacts = Vec::with_capacity(manifest.libraries.len() + 1);
        let mut classpath = Vec::new();

        for library in &manifest.libraries {
            let a = &library.downloads.artifact;
            let path = libraries_dir.join(&a.path);
            if library.include_in_classpath {
                classpath.push(path.clone());
            }
            artifacts.push(Artifact {
                path,
                digest: a
                    .sha1
                    .as_deref()
                    .filter(|h| !h.is_empty())
                    .map(ExpectedDigest::sha1),
                url: a.url.clone(),
            });
        }

        let client = self.client_jar_path(manifest);
        classpath.push(client.clone());
        artifacts.push(Artifact {
            path: client,
            digest: Some(ExpectedDigest::sha1(&manifest.downloads.client.sha1)),
            url: manifest.downloads.client.url.clone(),
        });

        (artifacts, classpath)
    }

    /// Bring libraries, client jar and assets up to date.
    pub async fn sync(
        &self,
        manifest: &VersionManifest,
        reporter: &Reporter,
        cancel: &CancellationToken,
    ) -> Result<LibrarySync, FetchError> {
        let (artifacts, classpath) = self.plan(manifest);
        let mut report = SyncReport::default();

        let task = reporter.create("Libraries", &manifest.id);
        let total = artifacts.len();
        for (i, artifact) in artifacts.iter().enumerate() {
            let status = ensure_artifact(self.source.as_ref(), artifact, reporter, cancel).await?;
            report.record(status);
            self.advance(reporter, task, i + 1, total);
        }
        reporter.finish(task);

        self.sync_assets(manifest, reporter, cancel, &mut report)
            .await?;

        tracing::info!(
            "Libraries synced: {} valid, {} fetched, {} failed",
            report.valid,
            report.fetched,
            report.failed
        );
        Ok(LibrarySync { report, classpath })
    }

    async fn sync_assets(
        &self,
        manifest: &VersionManifest,
        reporter: &Reporter,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<(), FetchError> {
        let index = &manifest.asset_index;
        if !is_plain_name(&index.id) {
            tracing::warn!("Skipping assets: bad asset index id '{}'", index.id);
            report.record(ArtifactStatus::Failed);
            return Ok(());
        }
        let index_path = self
            .game_dir
            .join("assets")
            .join("indexes")
            .join(format!("{}.json", index.id));
        let index_artifact = Artifact {
            path: index_path.clone(),
            digest: Some(ExpectedDigest::sha1(&index.sha1)),
            url: index.url.clone(),
        };
        let status = ensure_artifact(self.source.as_ref(), &index_artifact, reporter, cancel).await?;
        report.record(status);
        if status == ArtifactStatus::Failed {
            tracing::warn!("Skipping assets: index {} could not be verified", index.id);
            return Ok(());
        }

        let objects: AssetObjects = match manifest::load_json(&index_path) {
            Ok(objects) => objects,
            Err(e) => {
                tracing::warn!("Skipping assets: {:#}", e);
                return Ok(());
            }
        };

        // several names can share one object
        let mut hashes = BTreeSet::new();
        for object in objects.objects.values() {
            if is_object_hash(&object.hash) {
                hashes.insert(object.hash.as_str());
            } else {
                tracing::warn!("Skipping asset object with bad hash '{}'", object.hash);
                report.record(ArtifactStatus::Failed);
            }
        }
        let objects_dir = self.game_dir.join("assets").join("objects");
        let task = reporter.create("Assets", &index.id);
        let total = hashes.len().max(1);
        for (i, hash) in hashes.into_iter().enumerate() {
            let artifact = self.asset_artifact(&objects_dir, hash);
            let status = ensure_artifact(self.source.as_ref(), &artifact, reporter, cancel).await?;
            report.record(status);
            self.advance(reporter, task, i + 1, total);
        }
        reporter.finish(task);
        Ok(())
    }

    fn asset_artifact(&self, objects_dir: &Path, hash: &str) -> Artifact {
        let relative = manifest::version::AssetObject {
            hash: hash.to_string(),
            size: 0,
        }
        .relative_path();
        Artifact {
            path: objects_dir.join(&relative),
            digest: Some(ExpectedDigest::sha1(hash)),
            url: format!("{}/{}", self.asset_base_url, relative),
        }
    }

    fn advance(&self, reporter: &Reporter, task: TaskId, done: usize, total: usize) {
        // the final update is left to `finish`
        if done < total {
            reporter.update(task, done as f32 / total as f32);
        }
    }
}

/// Object names are bare SHA-1 hex digests.
fn is_object_hash(hash: &str) -> bool {
    hash.len() == 40 && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(std::path::Component::Normal(_)), None)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::{digest, DigestAlgorithm};
    use crate::provision::testing::ScriptedSource;
    use crate::task::TaskBoard;

    fn sha1(bytes: &[u8]) -> String {
        digest(DigestAlgorithm::Sha1, bytes)
    }

    fn manifest_json(index_sha1: &str) -> String {
        format!(
            r#"{{
            "assetIndex": {{ "id": "5", "sha1": "{index_sha1}", "url": "http://cdn/indexes/5.json" }},
            "downloads": {{ "client": {{ "sha1": "{client}", "url": "http://cdn/client.jar" }} }},
            "id": "1.20.1",
            "libraries": [
                {{ "downloads": {{ "artifact": {{ "path": "org/b/b.jar", "sha1": "{b}", "url": "http://cdn/b.jar" }} }} }},
                {{ "downloads": {{ "artifact": {{ "path": "org/n/native.jar", "url": "http://cdn/native.jar" }} }}, "include_in_classpath": false }},
                {{ "downloads": {{ "artifact": {{ "path": "org/a/a.jar", "sha1": "{a}", "url": "http://cdn/a.jar" }} }} }}
            ]
        }}"#,
            index_sha1 = index_sha1,
            client = sha1(b"client"),
            a = sha1(b"a"),
            b = sha1(b"b"),
        )
    }

    const INDEX: &str = r#"{ "objects": {
        "icons/a.png": { "hash": "9040a7d6cdf7a0d6cab1823831c6ceb7d01af97f", "size": 3 },
        "icons/b.png": { "hash": "9040a7d6cdf7a0d6cab1823831c6ceb7d01af97f", "size": 3 }
    } }"#;

    fn source() -> ScriptedSource {
        ScriptedSource::default()
            .serve("http://cdn/client.jar", b"client")
            .serve("http://cdn/a.jar", b"a")
            .serve("http://cdn/b.jar", b"b")
            .serve("http://cdn/native.jar", b"native")
            .serve("http://cdn/indexes/5.json", INDEX.as_bytes())
            .serve(
                "http://assets/90/9040a7d6cdf7a0d6cab1823831c6ceb7d01af97f",
                b"png",
            )
    }

    #[test]
    fn test_classpath_keeps_manifest_order() {
        let dir = tempfile::tempdir().unwrap();
        let manifest: VersionManifest = serde_json::from_str(&manifest_json("x")).unwrap();
        let sync = LibrarySynchronizer::new(Arc::new(ScriptedSource::default()), dir.path(), "http://assets/");
        let (artifacts, classpath) = sync.plan(&manifest);

        assert_eq!(artifacts.len(), 4);
        assert_eq!(
            classpath,
            vec![
                dir.path().join("libraries/org/b/b.jar"),
                dir.path().join("libraries/org/a/a.jar"),
                dir.path().join("versions/1.20.1/1.20.1.jar"),
            ]
        );
        assert!(artifacts[1].digest.is_none());
    }

    #[tokio::test]
    async fn test_sync_fetches_then_skips() {
        let dir = tempfile::tempdir().unwrap();
        let manifest: VersionManifest =
            serde_json::from_str(&manifest_json(&sha1(INDEX.as_bytes()))).unwrap();
        let source = Arc::new(source());
        let board = Arc::new(TaskBoard::new());
        let reporter = Reporter::new(board.clone());
        let sync = LibrarySynchronizer::new(source.clone(), dir.path(), "http://assets/");

        let first = sync.sync(&manifest, &reporter, &CancellationToken::new()).await.unwrap();
        // 3 libraries + client + index + 1 distinct object
        assert_eq!(first.report.fetched, 6);
        assert_eq!(first.report.failed, 0);
        assert_eq!(std::fs::read(dir.path().join("libraries/org/a/a.jar")).unwrap(), b"a");
        assert!(dir
            .path()
            .join("assets/objects/90/9040a7d6cdf7a0d6cab1823831c6ceb7d01af97f")
            .exists());
        assert!(board.is_empty());

        let second = sync.sync(&manifest, &reporter, &CancellationToken::new()).await.unwrap();
        assert_eq!(second.report.valid, 6);
        assert_eq!(second.report.fetched, 0);
        assert_eq!(source.request_count("http://cdn/a.jar"), 1);
    }

    #[tokio::test]
    async fn test_failed_library_does_not_abort() {
        let dir = tempfile::tempdir().unwrap();
        let manifest: VersionManifest =
            serde_json::from_str(&manifest_json(&sha1(INDEX.as_bytes()))).unwrap();
        let source = source().script("http://cdn/b.jar", vec![None]);
        let sync = LibrarySynchronizer::new(Arc::new(source), dir.path(), "http://assets");
        let reporter = Reporter::new(Arc::new(TaskBoard::new()));

        let result = sync.sync(&manifest, &reporter, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.report.failed, 1);
        assert_eq!(result.report.fetched, 5);
        assert_eq!(result.classpath.len(), 3);
    }

    #[tokio::test]
    async fn test_asset_hashes_cannot_escape_game_dir() {
        let root = tempfile::tempdir().unwrap();
        let game_dir = root.path().join("game");
        let index = r#"{ "objects": {
            "icons/a.png": { "hash": "9040a7d6cdf7a0d6cab1823831c6ceb7d01af97f", "size": 3 },
            "evil": { "hash": "../../escaped.txt", "size": 3 }
        } }"#;
        let manifest: VersionManifest =
            serde_json::from_str(&manifest_json(&sha1(index.as_bytes()))).unwrap();
        let source = source()
            .serve("http://cdn/indexes/5.json", index.as_bytes())
            .serve("http://assets/../../escaped.txt", b"pwned");
        let sync = LibrarySynchronizer::new(Arc::new(source), &game_dir, "http://assets");
        let reporter = Reporter::new(Arc::new(TaskBoard::new()));

        let result = sync.sync(&manifest, &reporter, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.report.failed, 1);
        assert!(!root.path().join("escaped.txt").exists());
        assert!(!game_dir.join("escaped.txt").exists());
        assert!(game_dir
            .join("assets/objects/90/9040a7d6cdf7a0d6cab1823831c6ceb7d01af97f")
            .exists());
    }

    #[tokio::test]
    async fn test_unverified_index_is_not_trusted() {
        let dir = tempfile::tempdir().unwrap();
        // declared digest does not match what the server returns
        let manifest: VersionManifest =
            serde_json::from_str(&manifest_json(&sha1(b"another index"))).unwrap();
        let source = Arc::new(source());
        let sync = LibrarySynchronizer::new(source.clone(), dir.path(), "http://assets");
        let reporter = Reporter::new(Arc::new(TaskBoard::new()));

        let result = sync.sync(&manifest, &reporter, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.report.failed, 1);
        assert_eq!(
            source.request_count("http://assets/90/9040a7d6cdf7a0d6cab1823831c6ceb7d01af97f"),
            0
        );
        assert!(!dir.path().join("assets/objects").exists());
    }

    #[test]
    fn test_object_hash_and_index_id_checks() {
        assert!(is_object_hash("9040a7d6cdf7a0d6cab1823831c6ceb7d01af97f"));
        assert!(!is_object_hash("../../escaped.txt"));
        assert!(!is_object_hash("9040a7d6cdf7a0d6cab1823831c6ceb7d01af97"));
        assert!(!is_object_hash("zz40a7d6cdf7a0d6cab1823831c6ceb7d01af97f"));
        assert!(is_plain_name("5"));
        assert!(is_plain_name("1.20"));
        assert!(!is_plain_name("../5"));
        assert!(!is_plain_name("a/b"));
        assert!(!is_plain_name(""));
    }
}
