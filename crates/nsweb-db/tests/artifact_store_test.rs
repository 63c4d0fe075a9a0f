//! Filesystem artifact store behaviour: naming, permissions, cleanup.

use std::path::Path;

use chrono::Utc;
use nsweb_db::{ArtifactStore, Decoding, DecodingIdentity, DecodingResult, DecodingStatus, Error};
use tempfile::TempDir;

struct Dirs {
    _root: TempDir,
    decoded: std::path::PathBuf,
    results: std::path::PathBuf,
    plots: std::path::PathBuf,
}

fn setup() -> (Dirs, ArtifactStore) {
    let root = TempDir::new().unwrap();
    let decoded = root.path().join("decoded");
    let results = root.path().join("results");
    let plots = root.path().join("scatterplots");
    let store = ArtifactStore::new(&decoded, &results, &plots);
    (
        Dirs {
            _root: root,
            decoded,
            results,
            plots,
        },
        store,
    )
}

fn decoding(uuid: &str, filename: &Path) -> Decoding {
    Decoding {
        id: 1,
        uuid: uuid.to_string(),
        identity: DecodingIdentity::Url("http://a.org/map.nii.gz".into()),
        decoding_set: "terms_20k".into(),
        name: "map.nii.gz".into(),
        display: true,
        download: false,
        ip: None,
        image_modified_at: None,
        image_decoded_at: Some(Utc::now()),
        filename: filename.to_string_lossy().into_owned(),
        status: DecodingStatus::Complete,
        error_message: None,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_source_image_named_by_uuid_and_world_writable() {
    let (dirs, store) = setup();
    let uuid = "0123456789abcdef0123456789abcdef";

    let path = store
        .store_source_image(uuid, ".nii.gz", b"nifti-bytes")
        .await
        .unwrap();

    assert_eq!(path, dirs.decoded.join(format!("{}.nii.gz", uuid)));
    assert_eq!(std::fs::read(&path).unwrap(), b"nifti-bytes");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o666);
    }
}

#[tokio::test]
async fn test_results_round_trip_through_table() {
    let (dirs, store) = setup();
    let uuid = "a".repeat(32);

    std::fs::create_dir_all(&dirs.results).unwrap();
    std::fs::write(
        dirs.results.join(format!("{}.txt", uuid)),
        "pain\t0.45678\nnoise\t\nreward\t-0.1234\n",
    )
    .unwrap();

    let rows = store.read_results(&uuid).await.unwrap();
    assert_eq!(
        rows,
        vec![
            DecodingResult {
                analysis: "pain".into(),
                r: 0.457
            },
            DecodingResult {
                analysis: "reward".into(),
                r: -0.123
            },
        ]
    );
    assert!(store.has_results(&uuid).await.unwrap());
}

#[tokio::test]
async fn test_missing_artifacts_are_not_found() {
    let (_dirs, store) = setup();
    let err = store.read_results(&"b".repeat(32)).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let err = store.read_scatterplot(&"b".repeat(32), "pain").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_scatterplot_rejects_traversal() {
    let (_dirs, store) = setup();
    assert!(matches!(
        store.scatterplot_path(&"c".repeat(32), "../../etc/passwd"),
        Err(Error::Validation(_))
    ));
    assert!(store.write_scatterplot(&"c".repeat(32), "a/b", b"png").await.is_err());
}

#[tokio::test]
async fn test_artifact_names_require_a_decoding_uuid() {
    let (dirs, store) = setup();
    std::fs::write(dirs._root.path().join("secret.txt"), "term\tr\n").unwrap();

    assert!(matches!(
        store.read_results("../secret").await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        store.read_scatterplot("../secret", "pain").await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        store.source_image_path("../x", ".nii"),
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        store.source_image_path(&"e".repeat(32), ".exe"),
        Err(Error::Validation(_))
    ));
    assert!(store.result_path(&"E".repeat(32)).is_err());
    assert!(store.result_path(&"e".repeat(32)).is_ok());
}

#[tokio::test]
async fn test_remove_all_deletes_owned_artifacts_only() {
    let (dirs, store) = setup();
    let uuid = "d".repeat(32);
    let other = "e".repeat(32);

    let source = store.store_source_image(&uuid, ".nii", b"img").await.unwrap();
    store
        .write_results(
            &uuid,
            &[DecodingResult {
                analysis: "pain".into(),
                r: 0.5,
            }],
        )
        .await
        .unwrap();
    store.write_scatterplot(&uuid, "pain", b"png1").await.unwrap();
    store.write_scatterplot(&uuid, "reward", b"png2").await.unwrap();
    store.write_scatterplot(&other, "pain", b"png3").await.unwrap();

    store.remove_all(&decoding(&uuid, &source)).await.unwrap();

    assert!(!source.exists());
    assert!(!dirs.results.join(format!("{}.txt", uuid)).exists());
    assert!(!dirs.plots.join(format!("{}_pain.png", uuid)).exists());
    assert!(!dirs.plots.join(format!("{}_reward.png", uuid)).exists());
    assert!(dirs.plots.join(format!("{}_pain.png", other)).exists());
}

#[tokio::test]
async fn test_remove_all_keeps_internal_images() {
    let (_dirs, store) = setup();
    let images = TempDir::new().unwrap();
    let internal = images.path().join("amygdala.nii.gz");
    std::fs::write(&internal, b"internal").unwrap();

    store
        .remove_all(&decoding(&"f".repeat(32), &internal))
        .await
        .unwrap();

    assert!(internal.exists());
}
