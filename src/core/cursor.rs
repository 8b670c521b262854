//! Purpose: Movable position over a database's key order with visitor access.
//! Exports: `Cursor`, `CursorPosition`.
//! Role: Scans and positional edits without copying the dataset into memory.
//! Invariants: The position is a key reference, re-resolved against the engine on every call.
//! Invariants: A cursor is bound to the session epoch it was created in; once the
//! owning database closes (even if reopened later) every operation fails `CursorInvalid`.
//! Invariants: `disable` is idempotent and never fails.
use std::sync::Arc;

use crate::core::bytes::{ByteString, Record};
use crate::core::database::{OpenSession, Session, visit_record};
use crate::core::engine::{RecordChange, StorageEngine};
use crate::core::error::{Error, ErrorKind};
use crate::core::visitor::{NOP, Visitor, VisitorAction, visit_fn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CursorPosition {
    Unset,
    AtKey(ByteString),
    Exhausted,
    Disabled,
}

struct CursorLink<E: StorageEngine> {
    engine: Arc<E>,
    session: Arc<Session<E>>,
    epoch: u64,
}

pub struct Cursor<E: StorageEngine> {
    link: CursorLink<E>,
    position: CursorPosition,
}

static DISABLED: CursorPosition = CursorPosition::Disabled;

fn invalid(message: &str) -> Error {
    Error::new(ErrorKind::CursorInvalid).with_message(message)
}

fn current_key(position: &CursorPosition) -> Result<ByteString, Error> {
    match position {
        CursorPosition::AtKey(key) => Ok(key.clone()),
        _ => Err(invalid("cursor is not positioned on a key")),
    }
}

fn landed(key: Option<ByteString>) -> CursorPosition {
    key.map_or(CursorPosition::Exhausted, CursorPosition::AtKey)
}

/// Resolves the record under the cursor. A key deleted since the last move
/// resolves to the next key still present.
fn resolve<E: StorageEngine>(
    engine: &E,
    open: &OpenSession<E::Handle>,
    position: &mut CursorPosition,
    write_locked: bool,
) -> Result<Option<Record>, Error> {
    let mut key = match position {
        CursorPosition::AtKey(key) => key.clone(),
        _ => return Ok(None),
    };
    loop {
        let value = if write_locked {
            let mut found = None;
            engine.update(&open.handle, &key, &mut |current| {
                found = current.map(ByteString::copy_from_slice);
                Ok(RecordChange::Keep)
            })?;
            found
        } else {
            engine.get(&open.handle, &key)?
        };
        match value {
            Some(value) => {
                *position = CursorPosition::AtKey(key.clone());
                return Ok(Some(Record { key, value }));
            }
            None => match engine.first_key_from(&open.handle, Some(&key))? {
                Some(next) => key = next,
                None => {
                    *position = CursorPosition::Exhausted;
                    return Ok(None);
                }
            },
        }
    }
}

fn advance<E: StorageEngine>(
    engine: &E,
    open: &OpenSession<E::Handle>,
    position: &mut CursorPosition,
    key: &[u8],
) -> Result<(), Error> {
    *position = landed(engine.next_key(&open.handle, key)?);
    Ok(())
}

impl<E: StorageEngine> Cursor<E> {
    pub(crate) fn new(engine: Arc<E>, session: Arc<Session<E>>) -> Self {
        let (epoch, position) = match session.read() {
            Ok(state) if state.open.is_some() => (state.epoch, CursorPosition::Unset),
            Ok(state) => (state.epoch, CursorPosition::Disabled),
            Err(_) => (0, CursorPosition::Disabled),
        };
        Self {
            link: CursorLink {
                engine,
                session,
                epoch,
            },
            position,
        }
    }

    /// Current position; `Disabled` as soon as the owning database closes.
    pub fn position(&self) -> &CursorPosition {
        if self.is_live() {
            &self.position
        } else {
            &DISABLED
        }
    }

    /// Key the cursor references, if positioned.
    pub fn key(&self) -> Option<&ByteString> {
        match self.position() {
            CursorPosition::AtKey(key) => Some(key),
            _ => None,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.position() == &CursorPosition::Disabled
    }

    /// Whether the session this cursor was created in is still open.
    fn is_live(&self) -> bool {
        if self.position == CursorPosition::Disabled {
            return false;
        }
        match self.link.session.read() {
            Ok(state) => state.open.is_some() && state.epoch == self.link.epoch,
            Err(_) => false,
        }
    }

    /// Runs `f` against the session the cursor was created in and records
    /// the outcome on the owning database.
    fn run<T>(
        &mut self,
        f: impl FnOnce(&E, &OpenSession<E::Handle>, &mut CursorPosition) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let result = self.run_inner(f);
        self.link.session.record(result)
    }

    fn run_inner<T>(
        &mut self,
        f: impl FnOnce(&E, &OpenSession<E::Handle>, &mut CursorPosition) -> Result<T, Error>,
    ) -> Result<T, Error> {
        if self.position == CursorPosition::Disabled {
            return Err(invalid("cursor is disabled"));
        }
        let state = self.link.session.read()?;
        match state.open.as_ref() {
            Some(open) if state.epoch == self.link.epoch => {
                f(self.link.engine.as_ref(), open, &mut self.position)
            }
            _ => {
                self.position = CursorPosition::Disabled;
                Err(invalid("owning database was closed"))
            }
        }
    }

    /// Positions at the first key `>= key`, or the first key overall.
    pub fn jump(&mut self, key: Option<&[u8]>) -> Result<(), Error> {
        self.run(|engine, open, position| {
            *position = landed(engine.first_key_from(&open.handle, key)?);
            Ok(())
        })
    }

    /// Positions at the last key `<= key`, or the last key overall.
    pub fn jump_back(&mut self, key: Option<&[u8]>) -> Result<(), Error> {
        self.run(|engine, open, position| {
            *position = landed(engine.last_key_to(&open.handle, key)?);
            Ok(())
        })
    }

    pub fn step(&mut self) -> Result<(), Error> {
        self.run(|engine, open, position| {
            let key = current_key(position)?;
            advance(engine, open, position, &key)
        })
    }

    pub fn step_back(&mut self) -> Result<(), Error> {
        self.run(|engine, open, position| {
            let key = current_key(position)?;
            *position = landed(engine.prev_key(&open.handle, &key)?);
            Ok(())
        })
    }

    /// Visits the record under the cursor. A record deleted since the last
    /// move is shown to `visit_missing`.
    pub fn accept<V: Visitor + ?Sized>(
        &mut self,
        visitor: &mut V,
        allow_write: bool,
        advance_after: bool,
    ) -> Result<(), Error> {
        self.run(|engine, open, position| {
            let key = current_key(position)?;
            visit_record(engine, open, &key, visitor, allow_write, true)?;
            if advance_after {
                advance(engine, open, position, &key)?;
            }
            Ok(())
        })
    }

    /// Current record, or `None` once the cursor has run off the end.
    /// `write_locked` reads through the engine's exclusive update path.
    pub fn get(&mut self, write_locked: bool) -> Result<Option<Record>, Error> {
        self.run(|engine, open, position| resolve(engine, open, position, write_locked))
    }

    pub fn get_key(&mut self, step: bool) -> Result<Option<ByteString>, Error> {
        Ok(self.read(step)?.map(|record| record.key))
    }

    pub fn get_value(&mut self, step: bool) -> Result<Option<ByteString>, Error> {
        Ok(self.read(step)?.map(|record| record.value))
    }

    fn read(&mut self, step: bool) -> Result<Option<Record>, Error> {
        self.run(|engine, open, position| {
            let record = resolve(engine, open, position, false)?;
            if let (true, Some(record)) = (step, &record) {
                advance(engine, open, position, &record.key)?;
            }
            Ok(record)
        })
    }

    /// Overwrites the record under the cursor; `KeyNotFound` if it vanished.
    pub fn set_value(&mut self, value: &[u8], step: bool) -> Result<(), Error> {
        self.run(|engine, open, position| {
            let key = current_key(position)?;
            let mut missing = false;
            let mut visitor = visit_fn(|_key: &[u8], current: Option<&[u8]>| match current {
                Some(_) => VisitorAction::replace(value),
                None => {
                    missing = true;
                    NOP
                }
            });
            visit_record(engine, open, &key, &mut visitor, true, true)?;
            if missing {
                return Err(vanished(&key));
            }
            if step {
                advance(engine, open, position, &key)?;
            }
            Ok(())
        })
    }

    /// Removes the record under the cursor and moves to the next key.
    pub fn remove(&mut self) -> Result<(), Error> {
        self.seize().map(|_| ())
    }

    /// Removes the record under the cursor, returning it, and moves to the
    /// next key.
    pub fn seize(&mut self) -> Result<Record, Error> {
        self.run(|engine, open, position| {
            let key = current_key(position)?;
            let mut taken = None;
            let mut visitor = visit_fn(|_key: &[u8], current: Option<&[u8]>| match current {
                Some(value) => {
                    taken = Some(ByteString::copy_from_slice(value));
                    VisitorAction::Remove
                }
                None => NOP,
            });
            visit_record(engine, open, &key, &mut visitor, true, true)?;
            let value = taken.ok_or_else(|| vanished(&key))?;
            advance(engine, open, position, &key)?;
            Ok(Record { key, value })
        })
    }

    /// Releases the cursor. Every later operation fails `CursorInvalid`.
    pub fn disable(&mut self) {
        self.position = CursorPosition::Disabled;
    }
}

fn vanished(key: &[u8]) -> Error {
    Error::new(ErrorKind::KeyNotFound)
        .with_message("record under cursor no longer exists")
        .with_key(key)
}
