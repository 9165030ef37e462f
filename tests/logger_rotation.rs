//! Integration tests for log file naming and rotation.

use inlinino::logger::product::TIME_FORMAT_MARKER;
use inlinino::logger::{ProductLogger, ProductStream, RawFormat, RawLogger};
use inlinino::record::{Record, Schema, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// 2025-03-31T23:59:59.5Z
const BEFORE_MIDNIGHT: f64 = 1_743_465_599.5;

fn schema() -> Schema {
    Schema::new(&["depth", "temp"], &["m", "degC"], &["%d", "%.2f"])
}

fn record(depth: i64, temp: f64) -> Record {
    Record::new(vec![Value::Int(depth), Value::Float(temp)])
}

/// Files of `dir`, sorted by name.
fn files(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    paths.sort();
    paths
}

fn lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .split("\r\n")
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[test]
fn product_rotates_at_utc_midnight() {
    let dir = tempfile::tempdir().unwrap();
    let mut logger = ProductLogger::new(
        dir.path(),
        "CTD0007",
        3600.0,
        vec![ProductStream::single(schema())],
    );
    assert!(logger.write(&record(1, 10.0), BEFORE_MIDNIGHT, None).unwrap());
    assert!(logger.write(&record(2, 10.5), BEFORE_MIDNIGHT + 0.4, None).unwrap());
    assert!(logger.write(&record(3, 11.0), BEFORE_MIDNIGHT + 0.6, None).unwrap());
    logger.close();

    let paths = files(dir.path());
    assert_eq!(paths.len(), 2);
    assert!(paths[0].ends_with("CTD0007_20250331_235959.csv"));
    assert!(paths[1].ends_with("CTD0007_20250401_000000.csv"));

    let first = lines(&paths[0]);
    assert_eq!(first[0], "time,depth,temp");
    assert_eq!(first[1], format!("{TIME_FORMAT_MARKER},m,degC"));
    assert_eq!(first[2], "2025/03/31 23:59:59.500,1,10.00");
    assert_eq!(first[3], "2025/03/31 23:59:59.900,2,10.50");
    assert_eq!(first.len(), 4);

    let second = lines(&paths[1]);
    assert_eq!(second[0], "time,depth,temp");
    assert_eq!(second[2], "2025/04/01 00:00:00.100,3,11.00");
    assert_eq!(second.len(), 3);
}

#[test]
fn product_rotates_after_period() {
    let dir = tempfile::tempdir().unwrap();
    let mut logger = ProductLogger::new(
        dir.path(),
        "CTD0007",
        10.0,
        vec![ProductStream::single(schema())],
    );
    let t0 = 1_700_000_000.0;
    for dt in [0.0, 5.0, 9.9, 10.0, 15.0] {
        logger.write(&record(0, 0.0), t0 + dt, None).unwrap();
    }
    logger.close();
    let paths = files(dir.path());
    assert_eq!(paths.len(), 2);
    assert_eq!(lines(&paths[0]).len(), 2 + 3);
    assert_eq!(lines(&paths[1]).len(), 2 + 2);
}

#[test]
fn raw_text_log_has_header_and_one_line_per_frame() {
    let dir = tempfile::tempdir().unwrap();
    let mut logger = RawLogger::new(dir.path(), "GPS01", 3600.0, RawFormat::text());
    assert!(logger.write(b"$GPGGA,1", BEFORE_MIDNIGHT - 10.0).unwrap());
    assert!(logger.write(b"$GPGGA,2", BEFORE_MIDNIGHT - 9.0).unwrap());
    let path = logger.path().unwrap().to_path_buf();
    logger.close();

    assert!(path.ends_with("GPS01_20250331_235949.raw"));
    assert_eq!(
        lines(&path),
        vec![
            "time,packet".to_string(),
            "2025/03/31 23:59:49.500,$GPGGA,1".to_string(),
            "2025/03/31 23:59:50.500,$GPGGA,2".to_string(),
        ]
    );
}

#[test]
fn reopening_in_the_same_second_never_overwrites() {
    let dir = tempfile::tempdir().unwrap();
    let t = 1_700_000_000.0;
    for _ in 0..3 {
        let mut logger = RawLogger::new(dir.path(), "GPS01", 3600.0, RawFormat::text());
        logger.write(b"x", t).unwrap();
        logger.close();
    }
    let names: Vec<String> = files(dir.path())
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec![
            "GPS01_20231114_221320.raw",
            "GPS01_20231114_221320_1.raw",
            "GPS01_20231114_221320_2.raw",
        ]
    );
    for path in files(dir.path()) {
        assert_eq!(lines(&path).len(), 2);
    }
}

#[test]
fn product_file_shares_the_raw_name_stamp() {
    let dir = tempfile::tempdir().unwrap();
    let t0 = 1_700_000_000.0;
    let mut raw = RawLogger::new(dir.path(), "CTD0007", 3600.0, RawFormat::text());
    let mut product = ProductLogger::new(
        dir.path(),
        "CTD0007",
        3600.0,
        vec![ProductStream::single(schema())],
    );
    raw.write(b"1,2", t0).unwrap();
    product
        .write(&record(1, 2.0), t0 + 1.7, raw.open_timestamp())
        .unwrap();
    let raw_path = raw.path().unwrap().to_path_buf();
    let product_path = product.path(None).unwrap().to_path_buf();
    assert_eq!(raw_path.file_stem(), product_path.file_stem());
}

#[test]
fn named_streams_get_suffixed_files() {
    let dir = tempfile::tempdir().unwrap();
    let t = 1_700_000_000.0;
    let mut logger = ProductLogger::new(
        dir.path(),
        "HyperSAS",
        3600.0,
        vec![
            ProductStream::named("SATTHS0001", schema()),
            ProductStream::named("SATHED0002", schema()),
        ],
    );
    logger
        .write(&Record::on_stream("SATHED0002", vec![Value::Int(1), Value::Float(0.5)]), t, None)
        .unwrap();
    assert!(!logger
        .write(&Record::on_stream("SATXXX0003", vec![]), t, None)
        .unwrap());
    logger.close();
    let paths = files(dir.path());
    assert_eq!(paths.len(), 1);
    assert!(paths[0].ends_with("HyperSAS_20231114_221320_SATHED0002.csv"));
}
