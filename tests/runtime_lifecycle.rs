// Process-wide runtime lifecycle; kept alone in its own test binary.
use cabinet::api::{Database, ErrorKind, MemoryEngine, OpenMode, runtime};

#[test]
fn teardown_waits_for_open_handles() {
    runtime::init();
    runtime::init();
    assert!(runtime::is_initialized());

    let db = Database::new(MemoryEngine::new());
    db.open("lifecycle", OpenMode::WRITER | OpenMode::CREATE)
        .expect("open");
    assert_eq!(runtime::open_handles(), 1);
    let err = runtime::teardown().expect_err("handle still open");
    assert_eq!(err.kind(), ErrorKind::Usage);

    db.close().expect("close");
    assert_eq!(runtime::open_handles(), 0);
    runtime::teardown().expect("teardown");
    assert!(!runtime::is_initialized());

    db.open("lifecycle", OpenMode::READER).expect("reopen initializes again");
    assert!(runtime::is_initialized());
    drop(db);
    assert_eq!(runtime::open_handles(), 0);
    runtime::teardown().expect("teardown after drop");
}
