#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use nestdb::{Event, EventBuilder, Kind, ReplaceableKey};

pub const ALICE: &str = "a11ce00000000000000000000000000000000000000000000000000000000000";
pub const BOB: &str = "b0b0000000000000000000000000000000000000000000000000000000000000";

pub fn profile(pubkey: &str, created_at: u64, name: &str) -> Event {
    EventBuilder::new(Kind::METADATA, pubkey)
        .created_at(created_at)
        .content(format!(r#"{{"name":"{name}"}}"#))
        .build()
}

pub fn note(pubkey: &str, created_at: u64, content: &str) -> Event {
    EventBuilder::new(Kind::TEXT_NOTE, pubkey)
        .created_at(created_at)
        .content(content)
        .build()
}

pub fn profile_key(pubkey: &str) -> ReplaceableKey {
    ReplaceableKey::new(Kind::METADATA, pubkey, "")
}

pub fn temp_db_path(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
