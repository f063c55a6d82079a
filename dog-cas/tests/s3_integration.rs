//! Runs against a real bucket. Set TEST_AWS_ACCESS_KEY, TEST_AWS_SECRET_KEY,
//! TEST_AWS_REGION and TEST_AWS_BUCKET (a `.env` file works), optionally
//! TEST_AWS_ENDPOINT_URL for S3-compatible stores, then run with
//! `--ignored`.

use std::env;

use tokio::io::AsyncReadExt;

use dog_cas::{CasStore, ContentDigest, S3Backend, S3Config};

struct TestBucket {
    config: S3Config,
    bucket: String,
}

fn test_bucket() -> Option<TestBucket> {
    dotenvy::dotenv().ok();
    let var = |key: &str| env::var(key).ok().filter(|v| !v.is_empty());

    let mut config = S3Config::default()
        .with_region(var("TEST_AWS_REGION")?)
        .with_credentials(var("TEST_AWS_ACCESS_KEY")?, var("TEST_AWS_SECRET_KEY")?);
    if let Some(endpoint) = var("TEST_AWS_ENDPOINT_URL") {
        config = config.with_endpoint(endpoint).with_path_style();
    }

    Some(TestBucket {
        config,
        bucket: var("TEST_AWS_BUCKET")?,
    })
}

#[tokio::test]
#[ignore = "requires TEST_AWS_* credentials and a bucket"]
async fn foobar_against_s3() {
    let Some(target) = test_bucket() else {
        eprintln!("TEST_AWS_* not set, skipping");
        return;
    };
    let backend = S3Backend::from_config(target.config).await;
    let store = CasStore::new(backend, target.bucket, "store_test").unwrap();

    let id1 = ContentDigest::identify(b"foobar");
    // leftovers from an interrupted run
    store.remove(&id1).await.unwrap();

    let mut writer = store.create(&id1).await.unwrap();
    writer.write(b"foobar").await.unwrap();
    writer.close().await.unwrap();

    assert!(store.create(&id1).await.unwrap_err().is_already_exists());

    let mut reader = store.open(&id1).await.unwrap();
    let mut data = Vec::new();
    reader.read_to_end(&mut data).await.unwrap();
    assert_eq!(data, b"foobar");

    store.remove(&id1).await.unwrap();
    store.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires TEST_AWS_* credentials and a bucket"]
async fn multipart_upload_against_s3() {
    let Some(target) = test_bucket() else {
        eprintln!("TEST_AWS_* not set, skipping");
        return;
    };
    let backend = S3Backend::from_config(target.config.with_part_size(5 * 1024 * 1024)).await;
    let store = CasStore::new(backend, target.bucket, "store_test").unwrap();

    let payload: Vec<u8> = (0..12 * 1024 * 1024).map(|i| (i % 241) as u8).collect();
    let id = ContentDigest::identify(&payload);
    store.remove(&id).await.unwrap();

    let mut writer = store.create(&id).await.unwrap();
    for piece in payload.chunks(64 * 1024) {
        writer.write(piece).await.unwrap();
    }
    writer.close().await.unwrap();

    let mut reader = store.open(&id).await.unwrap();
    assert_eq!(reader.size_bytes(), payload.len() as u64);
    let mut data = Vec::new();
    reader.read_to_end(&mut data).await.unwrap();
    assert!(data == payload);

    store.remove(&id).await.unwrap();
    store.close().await.unwrap();
}
