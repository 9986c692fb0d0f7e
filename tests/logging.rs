use butlerdb::{CaptureLogger, LogRecords, Mdc, Registry};
use tempfile::TempDir;

// The global logger can only be installed once per test binary, so this
// file holds a single test.
#[test]
fn test_registry_logs_are_captured_with_context() {
    let records = CaptureLogger::new(log::LevelFilter::Info).install().unwrap();

    {
        let _guard = Mdc::scoped([("LABEL", "isr"), ("RUN", "HSC/run")]);
        let mut registry = Registry::memory().unwrap();
        registry.close().unwrap();
    }
    assert_eq!(Mdc::get("LABEL"), None);
    log::debug!(target: "butlerdb::test", "below the capture level");

    let captured = std::mem::take(&mut *records.lock());
    let opened = captured
        .iter()
        .find(|r| r.message.starts_with("Opened registry"))
        .unwrap();
    assert_eq!(opened.levelname, "INFO");
    assert_eq!(opened.levelno, 20);
    assert!(opened.name.starts_with("butlerdb"));
    assert_eq!(opened.mdc.get("LABEL").map(String::as_str), Some("isr"));
    assert!(captured.iter().any(|r| r.message == "Closed registry"));
    assert!(captured.iter().all(|r| r.message != "below the capture level"));

    let line = opened.format("{levelname} {name} - {message} {MDC[LABEL]}");
    assert!(line.starts_with("INFO butlerdb"));
    assert!(line.ends_with(" isr"));

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("task.log.jsonl");
    std::fs::write(&path, captured.to_json_lines().unwrap()).unwrap();
    let back = LogRecords::from_file(&path).unwrap();
    assert_eq!(back.len(), captured.len());
    assert_eq!(back.get(0), captured.get(0));

    let as_array = LogRecords::from_raw(&captured.to_json().unwrap()).unwrap();
    assert_eq!(as_array.iter().count(), captured.len());
}
