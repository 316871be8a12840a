//! End-to-end scenarios against a mocked repository server.
//!
//! Each test packs real bundles, generates an index over them, serves
//! both over HTTP, and drives the orchestrator the way the CLI does.

use std::collections::BTreeMap;

use gotya::config::{Config, Repository};
use gotya::core::artifact::{self, PackOptions};
use gotya::core::generator::{self, GenerateOptions};
use gotya::core::index::Index;
use gotya::core::platform;
use gotya::core::resolver::Plan;
use gotya::ops::orchestrator::{CleanupOptions, InstallOptions, UninstallOptions};
use gotya::ops::Error;
use gotya::store::db::{InstallReason, InstalledDb};
use gotya::Orchestrator;
use tempfile::TempDir;
use tokio::sync::mpsc;

struct Artifact<'a> {
    name: &'a str,
    version: &'a str,
    deps: &'a [&'a str],
    hooks: &'a [(&'a str, &'a str)],
}

impl<'a> Artifact<'a> {
    fn new(name: &'a str, version: &'a str, deps: &'a [&'a str]) -> Self {
        Self {
            name,
            version,
            deps,
            hooks: &[],
        }
    }
}

struct Harness {
    root: TempDir,
    server: mockito::ServerGuard,
    config: Config,
}

impl Harness {
    async fn new() -> Self {
        let root = TempDir::new().unwrap();
        let server = mockito::Server::new_async().await;

        let mut config = Config::default();
        config.cache_dir = root.path().join("cache");
        config.install_dir = root.path().join("install");
        config.meta_dir = root.path().join("meta");
        config.state_dir = root.path().join("state");
        config.repositories.push(Repository {
            name: "testrepo".into(),
            url: format!("{}/index.json", server.url()),
            enabled: true,
            priority: 0,
            auth: None,
        });

        Self {
            root,
            server,
            config,
        }
    }

    /// Pack the artifacts, generate an index over them, and serve both
    /// from the mock server.
    async fn serve(&mut self, artifacts: &[Artifact<'_>]) {
        let bundles_dir = self.root.path().join("repo");
        let _ = std::fs::remove_dir_all(&bundles_dir);
        std::fs::create_dir_all(&bundles_dir).unwrap();

        for a in artifacts {
            let src = self
                .root
                .path()
                .join(format!("src-{}-{}", a.name, a.version));
            std::fs::create_dir_all(src.join("meta")).unwrap();
            std::fs::create_dir_all(src.join("data/bin")).unwrap();
            std::fs::write(src.join("data/bin").join(a.name), a.version).unwrap();

            let mut hooks = BTreeMap::new();
            for (hook, body) in a.hooks {
                let script = format!("{hook}.rhai");
                std::fs::write(src.join("meta").join(&script), body).unwrap();
                hooks.insert((*hook).to_string(), script);
            }

            artifact::pack(&PackOptions {
                source_dir: src,
                output_dir: bundles_dir.clone(),
                name: a.name.to_string(),
                version: a.version.to_string(),
                os: platform::current_os().to_string(),
                arch: platform::current_arch().to_string(),
                maintainer: "dev@example.com".to_string(),
                description: format!("{} test artifact", a.name),
                dependencies: a.deps.iter().map(|d| (*d).to_string()).collect(),
                hooks,
            })
            .unwrap();
        }

        let index_path = self.root.path().join("index.json");
        generator::generate(&GenerateOptions {
            artifacts_dir: bundles_dir.clone(),
            output: index_path.clone(),
            base_path: Some("packages".into()),
            force: true,
        })
        .unwrap();

        self.server
            .mock("GET", "/index.json")
            .with_status(200)
            .with_body(std::fs::read(&index_path).unwrap())
            .create_async()
            .await;

        for entry in std::fs::read_dir(&bundles_dir).unwrap() {
            let path = entry.unwrap().path();
            let file_name = path.file_name().unwrap().to_str().unwrap().to_string();
            self.server
                .mock("GET", format!("/packages/{file_name}").as_str())
                .with_status(200)
                .with_body(std::fs::read(&path).unwrap())
                .create_async()
                .await;
        }
    }

    fn orchestrator(&self) -> Orchestrator {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        Orchestrator::new(self.config.clone(), tx).unwrap()
    }

    async fn sync(&self) {
        self.orchestrator().sync().await.unwrap();
    }

    async fn install(&self, requests: &[&str]) -> Result<Plan, Error> {
        self.orchestrator()
            .install(InstallOptions {
                requests: requests.iter().map(|s| (*s).to_string()).collect(),
                dry_run: false,
                concurrency: 0,
            })
            .await
    }

    async fn uninstall(&self, names: &[&str]) -> Result<Plan, Error> {
        self.orchestrator()
            .uninstall(UninstallOptions {
                names: names.iter().map(|s| (*s).to_string()).collect(),
                purge: false,
            })
            .await
    }

    async fn cleanup(&self) -> Result<Plan, Error> {
        self.orchestrator()
            .cleanup(CleanupOptions { dry_run: false })
            .await
    }

    fn db(&self) -> InstalledDb {
        InstalledDb::load(&self.config.db_path()).unwrap()
    }
}

#[tokio::test]
async fn test_sync_downloads_index() {
    let mut h = Harness::new().await;
    h.serve(&[
        Artifact::new("alpha", "1.0.0", &[]),
        Artifact::new("beta", "2.1.0", &[]),
    ])
    .await;

    h.sync().await;

    let index_file = h.config.index_dir().join("testrepo.json");
    assert!(index_file.exists());
    let index = Index::parse_from_file(&index_file).unwrap();
    assert!(index.artifacts.len() >= 2);
}

#[tokio::test]
async fn test_install_with_dependency() {
    let mut h = Harness::new().await;
    h.serve(&[
        Artifact::new("testapp", "1.0.0", &["testlib:1.0.0"]),
        Artifact::new("testlib", "1.0.0", &[]),
    ])
    .await;

    h.sync().await;
    h.install(&["testapp"]).await.unwrap();

    let db = h.db();
    let app = db.get("testapp").expect("testapp installed");
    let lib = db.get("testlib").expect("testlib installed");
    assert_eq!(app.reason, InstallReason::Manual);
    assert_eq!(lib.reason, InstallReason::Automatic);

    // Payload landed.
    assert_eq!(
        std::fs::read_to_string(h.config.install_dir.join("bin/testapp")).unwrap(),
        "1.0.0"
    );
}

#[tokio::test]
async fn test_install_pulls_transitive_upgrade() {
    let mut h = Harness::new().await;
    h.serve(&[
        Artifact::new("packageA", "1.0.0", &[]),
        Artifact::new("packageA", "2.0.0", &[]),
        Artifact::new("packageB", "1.0.0", &["packageA:>= 2.0.0"]),
    ])
    .await;

    h.sync().await;

    // Start from packageA 1.0.0, manual.
    h.install(&["packageA:< 2.0.0"]).await.unwrap();
    assert_eq!(h.db().get("packageA").unwrap().version, "1.0.0");

    // Installing packageB drags packageA to 2.0.0.
    h.install(&["packageB"]).await.unwrap();

    let db = h.db();
    assert_eq!(db.get("packageA").unwrap().version, "2.0.0");
    assert_eq!(db.get("packageA").unwrap().reason, InstallReason::Manual);
    assert!(db.get("packageB").is_some());
    assert_eq!(
        std::fs::read_to_string(h.config.install_dir.join("bin/packageA")).unwrap(),
        "2.0.0"
    );
}

#[tokio::test]
async fn test_dependency_conflict_is_reported() {
    let mut h = Harness::new().await;
    h.serve(&[
        Artifact::new("packageA", "2.0.0", &[]),
        Artifact::new("packageC", "1.0.0", &["packageA:= 2.0.0"]),
        Artifact::new("packageD", "1.0.0", &["packageA:>= 3.0.0"]),
    ])
    .await;

    h.sync().await;
    h.install(&["packageC"]).await.unwrap();

    let err = h.install(&["packageD"]).await.unwrap_err();
    assert!(matches!(err, Error::DependencyConflict(_)));
    let msg = err.to_string();
    assert!(msg.contains("packageA"), "message: {msg}");
    assert!(msg.contains("2.0.0"), "message: {msg}");
    assert!(msg.contains("3.0.0"), "message: {msg}");
}

#[tokio::test]
async fn test_uninstall_keeps_dependency_until_cleanup() {
    let mut h = Harness::new().await;
    h.serve(&[
        Artifact::new("testapp", "1.0.0", &["testlib:1.0.0"]),
        Artifact::new("testlib", "1.0.0", &[]),
    ])
    .await;

    h.sync().await;
    h.install(&["testapp"]).await.unwrap();

    h.uninstall(&["testapp"]).await.unwrap();
    let db = h.db();
    assert!(db.get("testapp").is_none());
    let lib = db.get("testlib").expect("dependency stays installed");
    assert_eq!(lib.reason, InstallReason::Automatic);

    let plan = h.cleanup().await.unwrap();
    assert_eq!(plan.steps.len(), 1);
    assert!(h.db().get("testlib").is_none());
}

#[tokio::test]
async fn test_failing_pre_install_aborts() {
    let mut h = Harness::new().await;
    h.serve(&[Artifact {
        name: "badhook",
        version: "1.0.0",
        deps: &[],
        hooks: &[("pre-install", "this_symbol_does_not_exist")],
    }])
    .await;

    h.sync().await;

    let err = h.install(&["badhook"]).await.unwrap_err();
    assert!(matches!(err, Error::HookFailed(_)), "got: {err:?}");
    assert!(h.db().get("badhook").is_none());
    assert!(!h.config.install_dir.join("bin/badhook").exists());
}

#[tokio::test]
async fn test_second_sync_is_idempotent() {
    let mut h = Harness::new().await;
    h.serve(&[Artifact::new("alpha", "1.0.0", &[])]).await;

    h.sync().await;
    let before = std::fs::read(h.config.index_dir().join("testrepo.json")).unwrap();

    // The mock sends no ETag/Last-Modified, so the second sync
    // refetches; bytes on disk stay identical either way.
    h.sync().await;
    let after = std::fs::read(h.config.index_dir().join("testrepo.json")).unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_dry_run_install_changes_nothing() {
    let mut h = Harness::new().await;
    h.serve(&[Artifact::new("alpha", "1.0.0", &[])]).await;
    h.sync().await;

    let plan = h
        .orchestrator()
        .install(InstallOptions {
            requests: vec!["alpha".into()],
            dry_run: true,
            concurrency: 0,
        })
        .await
        .unwrap();

    assert_eq!(plan.steps.len(), 1);
    assert!(h.db().is_empty());
    assert!(!h.config.install_dir.exists());
}
