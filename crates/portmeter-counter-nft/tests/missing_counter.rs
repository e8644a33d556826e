//! Reading counters through a stand-in `nft` executable
#![cfg(unix)]

use chrono::{NaiveDate, Utc};
use portmeter_core::engine::{PollOutcome, StoreRetry};
use portmeter_core::{
    CounterSource, DailyTracker, Direction, Error, MemoryRecordStore, Port, Protocol, Rule,
    StreamKey,
};
use portmeter_counter_nft::NftCounterSource;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A shell script that prints whatever listing the test last wrote
struct FakeNft {
    _dir: TempDir,
    listing: PathBuf,
    binary: PathBuf,
}

impl FakeNft {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let listing = dir.path().join("listing.txt");
        let binary = dir.path().join("nft");

        std::fs::write(&listing, "").unwrap();
        std::fs::write(
            &binary,
            format!("#!/bin/sh\nexec cat '{}'\n", listing.display()),
        )
        .unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        Self {
            _dir: dir,
            listing,
            binary,
        }
    }

    /// Write the input chain; `None` leaves out the rule for 12450
    fn set_bytes(&self, bytes: Option<u64>) {
        let mut listing = String::from("table inet filter {\n\tchain input {\n");
        if let Some(bytes) = bytes {
            listing.push_str(&format!(
                "\t\ttcp dport 12450 counter packets 10 bytes {}\n",
                bytes
            ));
        }
        listing.push_str("\t\ttcp dport 23333 counter packets 1 bytes 64\n\t}\n}\n");
        std::fs::write(&self.listing, listing).unwrap();
    }

    fn source(&self) -> NftCounterSource {
        NftCounterSource::new("inet", "filter").with_binary(self.binary.to_string_lossy())
    }
}

fn input_tcp() -> Rule {
    Rule::new(Direction::Input, Protocol::Tcp)
}

#[tokio::test]
async fn missing_rule_line_is_skipped_not_counted_as_reset() {
    let nft = FakeNft::new();
    let source = nft.source();

    nft.set_bytes(None);
    let err = source.read_counter(Port(12450), input_tcp()).await.unwrap_err();
    assert!(matches!(err, Error::CounterSource(_)), "got {:?}", err);

    let tracker = DailyTracker::new(
        Arc::new(source),
        Arc::new(MemoryRecordStore::new()),
        Duration::from_secs(5),
        StoreRetry::new(0, Duration::from_millis(1)),
    );
    let stream = StreamKey::new(Port(12450), input_tcp());
    let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();

    nft.set_bytes(Some(1000));
    let first = tracker.poll(stream, date, Utc::now()).await.unwrap();
    assert!(matches!(first, PollOutcome::Initialized(_)));

    nft.set_bytes(Some(1500));
    tracker.poll(stream, date, Utc::now()).await.unwrap();

    // Rule temporarily absent from the chain
    nft.set_bytes(None);
    let skipped = tracker.poll(stream, date, Utc::now()).await.unwrap();
    assert!(matches!(skipped, PollOutcome::Skipped { .. }), "got {:?}", skipped);

    nft.set_bytes(Some(1800));
    match tracker.poll(stream, date, Utc::now()).await.unwrap() {
        PollOutcome::Updated {
            record, reconciled, ..
        } => {
            assert!(!reconciled.reset);
            assert_eq!(reconciled.delta, 300);
            assert_eq!(record.net(), 800);
        }
        other => panic!("expected an update, got {:?}", other),
    }
}
