//! Full launch pipeline against a local HTTP server and a throwaway game directory.
#![cfg(unix)]

mod common;

use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use packlaunch::config::{BuildSourceConfig, CommandConfig, LauncherConfig, Settings};
use packlaunch::fetch::Fetcher;
use packlaunch::integrity::{digest, DigestAlgorithm};
use packlaunch::pipeline::{hook, steps, StepStatus};
use packlaunch::supervisor::ExitState;
use packlaunch::task::{Reporter, TaskBoard};

fn sha1(bytes: &[u8]) -> String {
    digest(DigestAlgorithm::Sha1, bytes)
}

fn touch(path: &Path, body: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
}

fn asset_index() -> String {
    json!({ "objects": { "icons/icon.png": { "hash": sha1(b"png"), "size": 3 } } }).to_string()
}

/// Serves libraries, assets and a pack archive; returns the base URL.
async fn start_launcher_backend() -> String {
    common::start_mock_server_with(|base| {
        let pack_manifest = json!({
            "formatVersion": 1,
            "game": "minecraft",
            "versionId": "3.1.0",
            "name": "Test Pack",
            "files": [
                {
                    "path": "mods/fabric-api.jar",
                    "hashes": { "sha1": sha1(b"fabric-api") },
                    "downloads": [format!("{}/cdn/fabric-api.jar", base)],
                    "fileSize": 10
                },
                {
                    "path": "resourcepacks/faithful.zip",
                    "hashes": { "sha1": sha1(b"faithful") },
                    "env": { "client": "optional", "server": "unsupported" },
                    "downloads": [format!("{}/cdn/faithful.zip", base)],
                    "fileSize": 8
                }
            ],
            "dependencies": { "minecraft": "1.20.1", "fabric-loader": "0.16.5" }
        })
        .to_string();
        let pack = common::create_test_zip(&[
            ("overrides/mods/bundled.jar", b"bundled"),
            ("overrides/config/options.txt", b"fov:90"),
            ("modrinth.index.json", pack_manifest.as_bytes()),
        ]);

        let png = sha1(b"png");
        HashMap::from([
            ("/libs/guava.jar".to_string(), b"guava".to_vec()),
            ("/libs/lwjgl.jar".to_string(), b"lwjgl".to_vec()),
            ("/client.jar".to_string(), b"client".to_vec()),
            ("/indexes/5.json".to_string(), asset_index().into_bytes()),
            (format!("/assets/{}/{}", &png[..2], png), b"png".to_vec()),
            ("/cdn/fabric-api.jar".to_string(), b"fabric-api".to_vec()),
            ("/cdn/faithful.zip".to_string(), b"faithful".to_vec()),
            ("/packs/pack.mrpack".to_string(), pack),
        ])
    })
    .await
}

fn write_version_manifest(game_dir: &Path, base: &str) {
    let manifest = json!({
        "assetIndex": { "id": "5", "sha1": sha1(asset_index().as_bytes()), "url": format!("{}/indexes/5.json", base) },
        "assets": "5",
        "downloads": { "client": { "sha1": sha1(b"client"), "size": 6, "url": format!("{}/client.jar", base) } },
        "id": "1.20.1-fabric",
        "libraries": [
            { "downloads": { "artifact": { "path": "com/google/guava.jar", "sha1": sha1(b"guava"), "url": format!("{}/libs/guava.jar", base) } } },
            { "downloads": { "artifact": { "path": "org/lwjgl/lwjgl.jar", "sha1": sha1(b"lwjgl"), "url": format!("{}/libs/lwjgl.jar", base) } }, "include_in_classpath": false }
        ],
        "mainClass": "net.fabricmc.loader.impl.launch.knot.KnotClient",
        "type": "release"
    });
    touch(&game_dir.join("files/version.json"), manifest.to_string().as_bytes());
}

fn config(game_dir: &Path, base: &str) -> LauncherConfig {
    let mut config = LauncherConfig {
        game_dir: game_dir.to_path_buf(),
        version_manifest: PathBuf::from("files/version.json"),
        asset_base_url: format!("{}/assets", base),
        build: BuildSourceConfig {
            archive_url: Some(format!("{}/packs/pack.mrpack", base)),
            archive_path: None,
            manifest_path: None,
        },
        setup: Some(CommandConfig {
            program: PathBuf::from("sh"),
            args: vec![
                "-c".into(),
                "echo 1/2; echo Installing loader; echo 2/2".into(),
            ],
            working_dir: None,
        }),
        launch: CommandConfig {
            program: PathBuf::from("sh"),
            args: vec![
                "-c".into(),
                "printf '%s|%s|%s' \"$0\" \"$1\" \"$2\" > launched.txt".into(),
                "${nickname}".into(),
                "${classpath}".into(),
                "${build_version}".into(),
            ],
            working_dir: None,
        },
        ..LauncherConfig::default()
    };
    config.runtime.payload_url = format!("{}/jre.msi", base);
    config.runtime.checksum_url = format!("{}/jre.msi.sha256.txt", base);
    config
}

#[tokio::test]
async fn test_full_pipeline() {
    let base = start_launcher_backend().await;
    let dir = tempfile::tempdir().unwrap();
    let game_dir = dir.path();

    // runtime already installed, one stale mod, one stale resource pack
    touch(&game_dir.join("runtime/bin/java"), b"bin");
    touch(&game_dir.join("mods/old-mod.jar"), b"old");
    touch(&game_dir.join("resourcepacks/retired.zip"), b"old");
    touch(&game_dir.join("mods/keep-me/nested.jar"), b"nested");
    write_version_manifest(game_dir, &base);

    let config = config(game_dir, &base);
    let settings = Settings {
        nick_name: "Steve".into(),
        ..Settings::default()
    };

    let mut pipeline =
        steps::configured_pipeline(&config, &settings, Arc::new(Fetcher::new().unwrap()));
    pipeline.add_post_launch(hook("post", |_reporter| async { Ok(()) }));
    let report = pipeline
        .run(Reporter::new(Arc::new(TaskBoard::new())), CancellationToken::new())
        .await;

    let names: Vec<_> = report.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["runtime", "libraries", "build", "reconcile", "loader-setup", "game", "post"]
    );
    for step in &report.steps {
        assert_eq!(step.status, StepStatus::Ok, "step {} failed", step.name);
    }

    // libraries, client and assets
    assert!(game_dir.join("libraries/com/google/guava.jar").exists());
    assert!(game_dir.join("libraries/org/lwjgl/lwjgl.jar").exists());
    assert!(game_dir.join("versions/1.20.1-fabric/1.20.1-fabric.jar").exists());
    let png = sha1(b"png");
    assert!(game_dir.join(format!("assets/objects/{}/{}", &png[..2], png)).exists());

    // build files and overrides
    assert_eq!(std::fs::read(game_dir.join("mods/fabric-api.jar")).unwrap(), b"fabric-api");
    assert_eq!(std::fs::read(game_dir.join("mods/bundled.jar")).unwrap(), b"bundled");
    assert_eq!(std::fs::read(game_dir.join("config/options.txt")).unwrap(), b"fov:90");
    assert!(game_dir.join("resourcepacks/faithful.zip").exists());
    assert!(!game_dir.join("modrinth.index.json").exists());

    // reconciliation
    assert!(!game_dir.join("mods/old-mod.jar").exists());
    assert!(!game_dir.join("resourcepacks/retired.zip").exists());
    assert!(game_dir.join("mods/keep-me/nested.jar").exists());

    // game saw the templated arguments
    let launched = std::fs::read_to_string(game_dir.join("launched.txt")).unwrap();
    let parts: Vec<_> = launched.split('|').collect();
    assert_eq!(parts[0], "Steve");
    assert_eq!(
        parts[1],
        format!(
            "{}:{}",
            game_dir.join("libraries/com/google/guava.jar").display(),
            game_dir.join("versions/1.20.1-fabric/1.20.1-fabric.jar").display()
        )
    );
    assert_eq!(parts[2], "3.1.0");

    let game = report.state.game.as_ref().unwrap();
    assert_eq!(game.exit, ExitState::Exited { code: 0 });
    assert!(report.state.setup.as_ref().unwrap().success());
}

#[tokio::test]
async fn test_second_run_fetches_nothing_new() {
    let base = start_launcher_backend().await;
    let dir = tempfile::tempdir().unwrap();
    let game_dir = dir.path();
    touch(&game_dir.join("runtime/bin/java"), b"bin");
    write_version_manifest(game_dir, &base);

    let mut config = config(game_dir, &base);
    config.setup = None;
    let settings = Settings::default();

    for _ in 0..2 {
        let mut pipeline =
            steps::configured_pipeline(&config, &settings, Arc::new(Fetcher::new().unwrap()));
        pipeline.clear_launch();
        let report = pipeline
            .run(Reporter::new(Arc::new(TaskBoard::new())), CancellationToken::new())
            .await;
        assert!(report.failures().next().is_none());
        let reconcile = report.state.reconcile.unwrap();
        assert!(reconcile.deleted.is_empty());
    }
    assert!(game_dir.join("mods/bundled.jar").exists());
}
