//! Purpose: Hold top-level CLI command dispatch for `cabinet`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Every opened database is closed explicitly so close errors surface.
//! Invariants: Missing keys surface as `KeyNotFound` errors, not empty output.

use super::*;
use cabinet::api::Record;
use db_info_json::{db_info_json, record_json};

pub(super) fn dispatch_command(
    command: Command,
    db_dir: PathBuf,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "cabinet", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_version_output();
            Ok(RunOutcome::ok())
        }
        Command::Get { db, key } => {
            let handle = open_db(&db, &db_dir, OpenMode::READER)?;
            let value = handle.get(key.as_bytes())?;
            handle.close()?;
            let value = value.ok_or_else(|| {
                Error::new(ErrorKind::KeyNotFound)
                    .with_message("no record")
                    .with_key(key.as_bytes())
                    .with_hint(format!("List keys with `cabinet list {db}`."))
            })?;
            emit_json(json!({
                "db": db,
                "key": key,
                "value": value.to_str_lossy(),
            }));
            Ok(RunOutcome::ok())
        }
        Command::Set {
            db,
            key,
            value,
            create,
        } => {
            let mut mode = OpenMode::WRITER;
            if create {
                mode |= OpenMode::CREATE;
            }
            let handle = open_db(&db, &db_dir, mode)?;
            handle.set(key.as_bytes(), value.as_bytes())?;
            handle.close()?;
            emit_json(json!({
                "db": db,
                "key": key,
                "stored": true,
            }));
            Ok(RunOutcome::ok())
        }
        Command::Remove { db, key } => {
            let handle = open_db(&db, &db_dir, OpenMode::WRITER)?;
            let removed = handle.remove(key.as_bytes())?;
            handle.close()?;
            emit_json(json!({
                "db": db,
                "key": key,
                "removed": removed,
            }));
            Ok(RunOutcome::ok())
        }
        Command::List { db, prefix, max } => {
            let handle = open_db(&db, &db_dir, OpenMode::READER)?;
            let records = list_records(&handle, prefix.as_deref().map(str::as_bytes), max)?;
            handle.close()?;
            let values = records.iter().map(record_json).collect::<Vec<_>>();
            emit_json(json!({ "db": db, "records": values }));
            Ok(RunOutcome::ok())
        }
        Command::Count { db } => {
            let handle = open_db(&db, &db_dir, OpenMode::READER)?;
            let count = handle.count()?;
            handle.close()?;
            emit_json(json!({ "db": db, "count": count }));
            Ok(RunOutcome::ok())
        }
        Command::Info { db } => {
            let handle = open_db(&db, &db_dir, OpenMode::READER)?;
            let status = handle.status()?;
            handle.close()?;
            emit_json(db_info_json(&db, &status));
            Ok(RunOutcome::ok())
        }
    }
}

/// Walks records from `prefix` in key order with a cursor.
fn list_records(
    handle: &FileDatabase,
    prefix: Option<&[u8]>,
    max: Option<usize>,
) -> Result<Vec<Record>, Error> {
    let limit = max.unwrap_or(usize::MAX);
    handle.cursor_process(|cursor| {
        cursor.jump(prefix)?;
        let mut records = Vec::new();
        while records.len() < limit {
            let Some(record) = cursor.get(false)? else {
                break;
            };
            if prefix.is_some_and(|prefix| !record.key.starts_with(prefix)) {
                break;
            }
            records.push(record);
            cursor.step()?;
        }
        Ok(records)
    })
}
