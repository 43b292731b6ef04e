//! Serialization tests for tarstash-core types.

use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use tarstash_core::ids::*;
use tarstash_core::{CacheObject, ObjectAttrs};

#[test]
fn test_cache_object_roundtrip() {
    let object = CacheObject {
        bucket: "ci-cache".to_string(),
        name: "cargo-linux-0f3a".to_string(),
        updated_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
        size: 4096,
        content_type: Some("application/x-zstd-compressed-tar".to_string()),
        cache_control: Some("public,max-age=600".to_string()),
    };

    let json = serde_json::to_string(&object).expect("serialize");
    let parsed: CacheObject = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(object, parsed);
}

#[test]
fn test_cache_object_without_attributes() {
    let json = r#"{
        "bucket": "b",
        "name": "k",
        "updated_at": "2024-05-01T12:30:00Z",
        "size": 0,
        "content_type": null,
        "cache_control": null
    }"#;
    let parsed: CacheObject = serde_json::from_str(json).expect("deserialize");
    assert_eq!(parsed.content_type, None);
    assert_eq!(parsed.updated_at.timestamp(), 1_714_566_600);
}

#[test]
fn test_object_attrs_roundtrip() {
    let attrs = ObjectAttrs::new("application/x-tar").with_cache_control("no-store");
    let json = serde_json::to_string(&attrs).expect("serialize");
    let parsed: ObjectAttrs = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(attrs, parsed);
}

#[test]
fn test_upload_id_roundtrip() {
    let id = UploadId::new();
    let json = serde_json::to_string(&id).expect("serialize");
    let parsed: UploadId = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(id, parsed);
}
