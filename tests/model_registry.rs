use std::io::Write;

use tempfile::Builder;

use vision_relay::detect::{BackendRegistry, StubBackend};
use vision_relay::models::{load_registry, ModelKind};

#[test]
fn json_registry_skips_bad_and_duplicate_entries() {
    let mut file = Builder::new().suffix(".json").tempfile().expect("temp registry");
    let json = r#"[
        { "id": "airplane-damage", "name": "Airplane damage", "type": "yolo", "path": "damage.onnx",
          "names": ["dent", "crack"] },
        { "id": "fence-detection", "name": "Fence", "type": "unet", "path": "fence.onnx",
          "anchors": [[[10, 13], [16, 30]], [[30, 61], [62, 45]]], "input_size": [320, 320] },
        { "id": "Bad Id", "name": "Bad", "type": "yolo", "path": "bad.onnx" },
        { "id": "no-type", "name": "Missing type", "path": "x.onnx" },
        { "id": "airplane-damage", "name": "Duplicate", "type": "yolo", "path": "other.onnx" }
    ]"#;
    file.write_all(json.as_bytes()).expect("write registry");

    let records = load_registry(file.path()).expect("load registry");
    let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["airplane-damage", "fence-detection"]);

    assert_eq!(records[0].kind, ModelKind::Yolo);
    assert_eq!(records[0].name, "Airplane damage");
    assert_eq!(records[0].label_names().get(&1).map(String::as_str), Some("crack"));

    let fence = &records[1];
    assert_eq!(fence.kind, ModelKind::Unet);
    assert_eq!(fence.input_size(), (320, 320));
    let anchors = fence.anchor_set().expect("anchors");
    assert_eq!(anchors.num_scales(), 2);
    assert_eq!(anchors.anchors_per_scale(), 2);
    assert_eq!(anchors.anchor(1, 0), (30.0, 61.0));
}

#[test]
fn toml_registry_uses_models_tables() {
    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp registry");
    let toml = r#"
        [[models]]
        id = "person"
        name = "Person detector"
        type = "yolo"
        path = "person.onnx"

        [[models]]
        id = "broken"
        name = "Broken"
        type = "transformer"
        path = "broken.onnx"
    "#;
    file.write_all(toml.as_bytes()).expect("write registry");

    let records = load_registry(file.path()).expect("load registry");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "person");
}

#[test]
fn unreadable_registry_is_fatal() {
    let err = load_registry(std::path::Path::new("/nonexistent/models.json")).unwrap_err();
    assert!(format!("{:#}", err).contains("failed to read model registry"));
}

#[cfg(not(feature = "backend-tract"))]
#[test]
fn unloadable_models_leave_the_stub_available() {
    let mut file = Builder::new().suffix(".json").tempfile().expect("temp registry");
    file.write_all(br#"[{ "id": "person", "name": "Person", "type": "yolo", "path": "person.onnx" }]"#)
        .expect("write registry");
    let records = load_registry(file.path()).expect("load registry");

    let mut backends = BackendRegistry::new();
    assert_eq!(backends.load_records(&records, None), 0);
    backends.register(StubBackend::new());

    assert_eq!(backends.list(), ["stub"]);
    assert!(backends.resolve(Some("person")).is_err());
}
