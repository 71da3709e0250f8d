use super::*;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const COMET_VERSION: &str = "141.0.7390.23964";

/// Serves fixed bytes (or a fixed failure) and counts calls
#[derive(Clone)]
struct MockFetcher {
    response: Result<Vec<u8>, FetchError>,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
}

impl MockFetcher {
    fn serving(bytes: Vec<u8>) -> Self {
        Self {
            response: Ok(bytes),
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn failing(kind: FetchError) -> Self {
        Self {
            response: Err(kind),
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.response.clone()
    }
}

/// tar.gz containing `<bundle>/Contents/Info.plist` with `marker` inside
fn bundle_archive(bundle: &str, marker: &str) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(marker.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, format!("{bundle}/Contents/Info.plist"), marker.as_bytes())
        .unwrap();
    let tar = builder.into_inner().unwrap();

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
}

fn descriptor(version: &str, integrity: &str) -> PackageDescriptor {
    format!(
        r#"
        identifier = "comet"
        version = "{version}"
        url = "https://www.perplexity.ai/rest/browser/binaries/{version}/comet_latest.tar.gz"
        name = "Comet"

        [integrity]
        {integrity}

        [[install]]
        kind = "app"
        bundle = "Comet.app"
        "#
    )
    .parse()
    .unwrap()
}

fn skip_descriptor(version: &str) -> PackageDescriptor {
    descriptor(version, r#"policy = "skip""#)
}

fn verified_descriptor(version: &str, archive: &[u8]) -> PackageDescriptor {
    let digest = integrity::sha256_hex(archive);
    descriptor(version, &format!("policy = \"verify\"\nsha256 = \"{digest}\""))
}

struct Fixture {
    _dir: tempfile::TempDir,
    target: PathBuf,
    context: InstallContext,
}

impl Fixture {
    fn new(allow_unverified: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("Applications");
        let mut context = InstallContext::new(target.clone(), dir.path().join("state"));
        context.allow_unverified = allow_unverified;
        Self {
            _dir: dir,
            target,
            context,
        }
    }

    fn installer(&self, fetcher: MockFetcher) -> Installer<MockFetcher> {
        Installer::new(fetcher, self.context.clone())
    }

    fn marker(&self) -> String {
        std::fs::read_to_string(self.target.join("Comet.app/Contents/Info.plist")).unwrap()
    }

    fn staging_leftovers(&self) -> Vec<String> {
        match std::fs::read_dir(&self.target) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().to_string())
                .filter(|name| paths::staging::is_staging_name(name))
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[tokio::test]
async fn test_install_unverified_descriptor() {
    let fixture = Fixture::new(true);
    let fetcher = MockFetcher::serving(bundle_archive("Comet.app", "v1"));
    let installer = fixture.installer(fetcher.clone());

    let outcome = installer
        .install(skip_descriptor(COMET_VERSION), &InstallOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.status, InstallStatus::Installed);
    assert_eq!(outcome.version, COMET_VERSION);
    assert_eq!(outcome.paths, vec![fixture.target.join("Comet.app")]);
    assert_eq!(outcome.verified_sha256, None);
    assert_eq!(fixture.marker(), "v1");
    assert!(fixture.staging_leftovers().is_empty());

    let receipt = installer.installed("comet").unwrap().unwrap();
    assert_eq!(receipt.version, COMET_VERSION);
    assert_eq!(receipt.source_host, "www.perplexity.ai");
    assert_eq!(receipt.verified_sha256, None);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_install_verified_descriptor() {
    let fixture = Fixture::new(false);
    let archive = bundle_archive("Comet.app", "v1");
    let desc = verified_descriptor(COMET_VERSION, &archive);
    let installer = fixture.installer(MockFetcher::serving(archive.clone()));

    let outcome = installer.install(desc, &InstallOptions::default()).await.unwrap();

    assert_eq!(outcome.verified_sha256, Some(integrity::sha256_hex(&archive)));
    assert_eq!(fixture.marker(), "v1");
}

#[tokio::test]
async fn test_second_install_is_a_no_op() {
    let fixture = Fixture::new(true);
    let fetcher = MockFetcher::serving(bundle_archive("Comet.app", "v1"));
    let installer = fixture.installer(fetcher.clone());

    installer
        .install(skip_descriptor(COMET_VERSION), &InstallOptions::default())
        .await
        .unwrap();
    let outcome = installer
        .install(skip_descriptor(COMET_VERSION), &InstallOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.status, InstallStatus::AlreadyInstalled);
    assert_eq!(outcome.paths, vec![fixture.target.join("Comet.app")]);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_reinstall_fetches_again() {
    let fixture = Fixture::new(true);
    let fetcher = MockFetcher::serving(bundle_archive("Comet.app", "v1"));
    let installer = fixture.installer(fetcher.clone());

    installer
        .install(skip_descriptor(COMET_VERSION), &InstallOptions::default())
        .await
        .unwrap();

    let options = InstallOptions {
        reinstall: true,
        ..Default::default()
    };
    let outcome = installer
        .install(skip_descriptor(COMET_VERSION), &options)
        .await
        .unwrap();

    assert_eq!(outcome.status, InstallStatus::Reinstalled);
    assert_eq!(fetcher.calls(), 2);
    assert!(fixture.staging_leftovers().is_empty());
}

#[tokio::test]
async fn test_deleted_artifact_is_repaired() {
    let fixture = Fixture::new(true);
    let fetcher = MockFetcher::serving(bundle_archive("Comet.app", "v1"));
    let installer = fixture.installer(fetcher.clone());

    installer
        .install(skip_descriptor(COMET_VERSION), &InstallOptions::default())
        .await
        .unwrap();
    std::fs::remove_dir_all(fixture.target.join("Comet.app")).unwrap();

    let outcome = installer
        .install(skip_descriptor(COMET_VERSION), &InstallOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.status, InstallStatus::Reinstalled);
    assert_eq!(fixture.marker(), "v1");
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn test_version_change_replaces_artifact() {
    let fixture = Fixture::new(true);

    fixture
        .installer(MockFetcher::serving(bundle_archive("Comet.app", "old")))
        .install(skip_descriptor("140.0.0.1"), &InstallOptions::default())
        .await
        .unwrap();
    assert_eq!(fixture.marker(), "old");

    let installer = fixture.installer(MockFetcher::serving(bundle_archive("Comet.app", "new")));
    let outcome = installer
        .install(skip_descriptor(COMET_VERSION), &InstallOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.status, InstallStatus::Upgraded);
    assert_eq!(fixture.marker(), "new");
    assert_eq!(installer.installed("comet").unwrap().unwrap().version, COMET_VERSION);
    assert!(fixture.staging_leftovers().is_empty());
}

#[tokio::test]
async fn test_tampered_archive_leaves_target_untouched() {
    let fixture = Fixture::new(false);

    let good = bundle_archive("Comet.app", "good");
    fixture
        .installer(MockFetcher::serving(good.clone()))
        .install(verified_descriptor("1.0", &good), &InstallOptions::default())
        .await
        .unwrap();

    // Descriptor for 2.0 pins a digest the served bytes do not match
    let pinned = bundle_archive("Comet.app", "pinned");
    let fetcher = MockFetcher::serving(bundle_archive("Comet.app", "tampered"));
    let installer = fixture.installer(fetcher.clone());
    let err = installer
        .install(verified_descriptor("2.0", &pinned), &InstallOptions::default())
        .await
        .unwrap_err();

    match err {
        InstallError::IntegrityMismatch {
            package,
            expected,
            actual,
        } => {
            assert_eq!(package.identifier, "comet");
            assert_eq!(package.version, "2.0");
            assert_eq!(expected, integrity::sha256_hex(&pinned));
            assert_ne!(expected, actual);
        }
        other => panic!("Expected IntegrityMismatch, got {other:?}"),
    }

    assert_eq!(fixture.marker(), "good");
    assert_eq!(installer.installed("comet").unwrap().unwrap().version, "1.0");
    assert!(fixture.staging_leftovers().is_empty());
}

#[tokio::test]
async fn test_fetch_failure_creates_nothing() {
    let fixture = Fixture::new(true);
    let installer = fixture.installer(MockFetcher::failing(FetchError::Expired));

    let err = installer
        .install(skip_descriptor(COMET_VERSION), &InstallOptions::default())
        .await
        .unwrap_err();

    match &err {
        InstallError::Fetch { package, kind } => {
            assert_eq!(*kind, FetchError::Expired);
            assert_eq!(package.host, "www.perplexity.ai");
        }
        other => panic!("Expected Fetch error, got {other:?}"),
    }
    assert_eq!(err.exit_code(), 3);
    assert!(!fixture.target.exists());
    assert!(installer.installed("comet").unwrap().is_none());
}

#[tokio::test]
async fn test_missing_bundle_is_artifact_not_found() {
    let fixture = Fixture::new(true);
    let installer = fixture.installer(MockFetcher::serving(bundle_archive("Other.app", "x")));

    let err = installer
        .install(skip_descriptor(COMET_VERSION), &InstallOptions::default())
        .await
        .unwrap_err();

    match err {
        InstallError::ArtifactNotFound { artifact, .. } => assert_eq!(artifact, "Comet.app"),
        other => panic!("Expected ArtifactNotFound, got {other:?}"),
    }
    assert!(!fixture.target.join("Comet.app").exists());
    assert!(!fixture.target.join("Other.app").exists());
    assert!(fixture.staging_leftovers().is_empty());
}

#[tokio::test]
async fn test_unrecognized_archive_is_archive_error() {
    let fixture = Fixture::new(true);
    let installer = fixture.installer(MockFetcher::serving(b"definitely not an archive".to_vec()));

    let err = installer
        .install(skip_descriptor(COMET_VERSION), &InstallOptions::default())
        .await;

    // The URL ends in .tar.gz, so this is treated as a corrupt gzip stream
    match err {
        Err(InstallError::Archive { .. }) => {}
        other => panic!("Expected Archive error, got {other:?}"),
    }
    assert!(fixture.staging_leftovers().is_empty());
}

#[tokio::test]
async fn test_unverified_refused_without_opt_in() {
    let fixture = Fixture::new(false);
    let fetcher = MockFetcher::serving(bundle_archive("Comet.app", "v1"));
    let installer = fixture.installer(fetcher.clone());

    let err = installer
        .install(skip_descriptor(COMET_VERSION), &InstallOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, InstallError::UnverifiedNotAllowed { .. }));
    assert_eq!(err.exit_code(), 7);
    assert_eq!(fetcher.calls(), 0);
    assert!(!fixture.target.exists());
}

#[tokio::test]
async fn test_fetch_timeout() {
    let fixture = Fixture::new(true);
    let fetcher = MockFetcher::serving(bundle_archive("Comet.app", "v1")).slow(Duration::from_secs(30));
    let installer = fixture.installer(fetcher);

    let options = InstallOptions {
        timeout: Some(Duration::from_millis(50)),
        ..Default::default()
    };
    let err = installer
        .install(skip_descriptor(COMET_VERSION), &options)
        .await
        .unwrap_err();

    match err {
        InstallError::Fetch { kind, .. } => {
            assert_eq!(kind, FetchError::Timeout(Duration::from_millis(50)))
        }
        other => panic!("Expected timeout, got {other:?}"),
    }
    assert!(!fixture.target.exists());
}

#[tokio::test]
async fn test_skipped_verification_is_reported_once() {
    let fixture = Fixture::new(true);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let installer = fixture
        .installer(MockFetcher::serving(bundle_archive("Comet.app", "v1")))
        .with_events(tx);

    installer
        .install(skip_descriptor(COMET_VERSION), &InstallOptions::default())
        .await
        .unwrap();
    drop(installer);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    let skipped = events
        .iter()
        .filter(|e| matches!(e, InstallEvent::VerificationSkipped { .. }))
        .count();
    assert_eq!(skipped, 1);
    assert!(!events.iter().any(|e| matches!(e, InstallEvent::DigestVerified { .. })));
    assert!(events.contains(&InstallEvent::Placed {
        path: fixture.target.join("Comet.app")
    }));
}

#[tokio::test]
async fn test_fetch_only_does_not_install() {
    let fixture = Fixture::new(false);
    let archive = bundle_archive("Comet.app", "v1");
    let installer = fixture.installer(MockFetcher::serving(archive.clone()));

    let fetched = installer
        .fetch(&verified_descriptor(COMET_VERSION, &archive), &InstallOptions::default())
        .await
        .unwrap();

    assert_eq!(fetched.bytes, archive);
    assert_eq!(fetched.verified_sha256, Some(integrity::sha256_hex(&archive)));
    assert!(!fixture.target.exists());
}

#[tokio::test]
async fn test_uninstall() {
    let fixture = Fixture::new(true);
    let installer = fixture.installer(MockFetcher::serving(bundle_archive("Comet.app", "v1")));

    installer
        .install(skip_descriptor(COMET_VERSION), &InstallOptions::default())
        .await
        .unwrap();
    assert_eq!(installer.list().unwrap().len(), 1);

    let outcome = installer.uninstall("comet").await.unwrap();
    assert_eq!(outcome.version, COMET_VERSION);
    assert_eq!(outcome.removed, vec![fixture.target.join("Comet.app")]);
    assert!(!fixture.target.join("Comet.app").exists());
    assert!(fixture.target.exists());
    assert!(fixture.staging_leftovers().is_empty());
    assert!(installer.list().unwrap().is_empty());

    let err = installer.uninstall("comet").await.unwrap_err();
    assert!(matches!(err, InstallError::NotInstalled { .. }));
    assert_eq!(err.exit_code(), 8);
}

#[tokio::test]
async fn test_uninstall_refuses_paths_outside_target_root() {
    let fixture = Fixture::new(true);
    let outside = fixture._dir.path().join("Comet.app");
    std::fs::create_dir_all(&outside).unwrap();

    let store = ReceiptStore::new(&fixture.context.state_dir);
    store
        .save(&InstallReceipt {
            identifier: "comet".into(),
            version: COMET_VERSION.into(),
            name: None,
            source_host: "local".into(),
            verified_sha256: None,
            target_root: fixture.target.clone(),
            artifacts: vec![outside.clone()],
            installed_at: receipt::timestamp_now(),
        })
        .unwrap();

    let installer = fixture.installer(MockFetcher::failing(FetchError::NotFound));
    let outcome = installer.uninstall("comet").await.unwrap();

    assert!(outcome.removed.is_empty());
    assert!(outside.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_reinstalls_leave_one_artifact() {
    let fixture = Fixture::new(true);
    let fetcher = MockFetcher::serving(bundle_archive("Comet.app", "v1"));

    fixture
        .installer(fetcher.clone())
        .install(skip_descriptor(COMET_VERSION), &InstallOptions::default())
        .await
        .unwrap();

    let options = InstallOptions {
        reinstall: true,
        ..Default::default()
    };
    let first = fixture.installer(fetcher.clone());
    let second = fixture.installer(fetcher.clone());
    let (a, b) = tokio::join!(
        first.install(skip_descriptor(COMET_VERSION), &options),
        second.install(skip_descriptor(COMET_VERSION), &options),
    );

    assert!(a.is_ok() || b.is_ok(), "both installs failed: {a:?} / {b:?}");
    for result in [&a, &b] {
        if let Err(err) = result {
            assert!(matches!(err, InstallError::Filesystem { .. }), "got {err:?}");
        }
    }
    assert_eq!(fixture.marker(), "v1");
    assert!(fixture.staging_leftovers().is_empty());
    assert!(first.installed("comet").unwrap().is_some());
    assert_eq!(fetcher.calls(), 3);
}

#[tokio::test]
async fn test_missing_second_bundle_places_nothing() {
    let fixture = Fixture::new(true);
    let desc: PackageDescriptor = format!(
        r#"
        identifier = "comet"
        version = "{COMET_VERSION}"
        url = "https://www.perplexity.ai/rest/browser/binaries/comet_latest.tar.gz"

        [integrity]
        policy = "skip"

        [[install]]
        kind = "app"
        bundle = "Comet.app"

        [[install]]
        kind = "app"
        bundle = "Helper.app"
        "#
    )
    .parse()
    .unwrap();
    let installer = fixture.installer(MockFetcher::serving(bundle_archive("Comet.app", "v1")));

    let err = installer.install(desc, &InstallOptions::default()).await.unwrap_err();

    match err {
        InstallError::ArtifactNotFound { artifact, .. } => assert_eq!(artifact, "Helper.app"),
        other => panic!("Expected ArtifactNotFound, got {other:?}"),
    }
    assert!(!fixture.target.join("Comet.app").exists());
    assert!(fixture.staging_leftovers().is_empty());
    assert!(installer.installed("comet").unwrap().is_none());
}

#[tokio::test]
async fn test_roll_back_restores_parked_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("Applications");
    let scratch = dir.path().join("scratch");
    std::fs::create_dir_all(target.join("A.app")).unwrap();
    std::fs::create_dir_all(target.join("B.app")).unwrap();
    std::fs::create_dir_all(scratch.join("previous-0-A.app")).unwrap();
    std::fs::write(target.join("A.app/marker"), "new").unwrap();
    std::fs::write(scratch.join("previous-0-A.app/marker"), "old").unwrap();

    let placements = vec![
        Placement {
            final_path: target.join("A.app"),
            parked: Some(scratch.join("previous-0-A.app")),
        },
        Placement {
            final_path: target.join("B.app"),
            parked: None,
        },
    ];

    assert!(roll_back(&placements, &scratch).await);
    assert_eq!(std::fs::read_to_string(target.join("A.app/marker")).unwrap(), "old");
    assert!(!target.join("B.app").exists());
    assert!(!scratch.join("previous-0-A.app").exists());
}

#[tokio::test]
async fn test_place_parks_previous_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let staged = dir.path().join("staged/Comet.app");
    let final_path = dir.path().join("Comet.app");
    std::fs::create_dir_all(&staged).unwrap();
    std::fs::create_dir_all(&final_path).unwrap();
    std::fs::write(staged.join("marker"), "new").unwrap();
    std::fs::write(final_path.join("marker"), "old").unwrap();

    let parked = place_atomically(&staged, &final_path, dir.path())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(std::fs::read_to_string(final_path.join("marker")).unwrap(), "new");
    assert_eq!(std::fs::read_to_string(parked.join("marker")).unwrap(), "old");
    assert!(!staged.exists());
}

#[test]
fn test_stranded_placement_names_parked_path() {
    let parked = PathBuf::from("/Applications/.appdrop-staging-x/previous-0-Comet.app");
    let err = PlaceError::Stranded {
        source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        parked: parked.clone(),
    }
    .into_install_error(Path::new("/Applications/Comet.app"));

    assert!(matches!(err, InstallError::Filesystem { .. }));
    assert!(err.to_string().contains(&parked.display().to_string()));
    assert_eq!(err.exit_code(), 6);
}
