//! Event log persistence.
//!
//! The file is a JSON array written as a stream: the opening bracket on
//! create, one element per append through a buffered writer, the closing
//! bracket on `finish`. Buffered events reach the file on `flush`, which the
//! tracer calls whenever its source runs dry. A log whose writer died before
//! `finish` is still readable with `load`.

use crate::config::types::{ArenaError, Result};
use crate::trace::event::KernelEvent;
use log::warn;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
struct Sink {
    path: PathBuf,
    writer: BufWriter<File>,
    finished: bool,
}

#[derive(Debug, Default)]
pub struct EventLog {
    sink: Option<Sink>,
    events: Vec<KernelEvent>,
}

impl EventLog {
    /// In-memory only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Backed by `path`; the opening bracket is written immediately so readers
    /// never see a missing file once capture has started.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path).map_err(|e| {
            ArenaError::Trace(format!("cannot create event log {}: {}", path.display(), e))
        })?;
        let mut writer = BufWriter::new(file);
        writer.write_all(b"[")?;
        writer.flush()?;
        Ok(Self {
            sink: Some(Sink {
                path,
                writer,
                finished: false,
            }),
            events: Vec::new(),
        })
    }

    pub fn append(&mut self, event: KernelEvent) -> Result<()> {
        if let Some(sink) = &mut self.sink {
            if sink.finished {
                return Err(ArenaError::Trace(format!(
                    "event log {} already finished",
                    sink.path.display()
                )));
            }
            let separator: &[u8] = if self.events.is_empty() { b"\n  " } else { b",\n  " };
            sink.writer.write_all(separator)?;
            serde_json::to_writer(&mut sink.writer, &event)?;
        }
        self.events.push(event);
        Ok(())
    }

    /// Push buffered events to the file.
    pub fn flush(&mut self) -> Result<()> {
        match &mut self.sink {
            Some(sink) if !sink.finished => Ok(sink.writer.flush()?),
            _ => Ok(()),
        }
    }

    /// Close the array and sync the file. Idempotent.
    pub fn finish(&mut self) -> Result<()> {
        let Some(sink) = &mut self.sink else {
            return Ok(());
        };
        if sink.finished {
            return Ok(());
        }
        sink.finished = true;
        sink.writer.write_all(b"\n]\n")?;
        sink.writer.flush()?;
        sink.writer.get_ref().sync_all()?;
        Ok(())
    }

    pub fn events(&self) -> &[KernelEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn path(&self) -> Option<&Path> {
        self.sink.as_ref().map(|s| s.path.as_path())
    }

    /// Read a persisted log, closing the array if the writer never did.
    pub fn load(path: &Path) -> Result<Vec<KernelEvent>> {
        let raw = fs::read_to_string(path).map_err(|e| {
            ArenaError::Analysis(format!("cannot read event log {}: {}", path.display(), e))
        })?;
        match serde_json::from_str(&raw) {
            Ok(events) => Ok(events),
            Err(e) if !raw.trim_end().ends_with(']') => {
                warn!("Event log {} was not finished, reading what was written", path.display());
                let body = raw.trim_end().trim_end_matches(',');
                serde_json::from_str(&format!("{}\n]", body)).map_err(|_| e.into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("Failed to finish event log: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> PathBuf {
        std::env::temp_dir().join(format!("arenabox-events-{}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn finished_log_is_a_json_array() {
        let path = scratch();
        let mut log = EventLog::create(&path).unwrap();
        log.finish().unwrap();
        assert!(EventLog::load(&path).unwrap().is_empty());

        let mut log = EventLog::create(&path).unwrap();
        log.append(KernelEvent::exec("t0".into(), 201, 200, 1001, "sh"))
            .unwrap();
        log.append(KernelEvent::kill("t1".into(), 201, 200, 1001, "sh", 300, Some(9)))
            .unwrap();
        log.finish().unwrap();
        log.finish().unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let parsed: Vec<KernelEvent> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, log.events());
        assert!(log.append(KernelEvent::exit("t2".into(), 201, 200, 1001, "sh")).is_err());
        let _ = fs::remove_file(path);
    }

    #[test]
    fn flushed_but_unfinished_log_is_still_readable() {
        let path = scratch();
        let mut log = EventLog::create(&path).unwrap();
        for pid in 0..500 {
            log.append(KernelEvent::exec(format!("t{}", pid), pid, 1, 1001, "sh"))
                .unwrap();
        }
        log.flush().unwrap();

        let on_disk = EventLog::load(&path).unwrap();
        assert_eq!(on_disk.len(), 500);
        assert_eq!(on_disk, log.events());

        // Dropping closes the array.
        drop(log);
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.trim_end().ends_with(']'));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn in_memory_log_never_touches_disk() {
        let mut log = EventLog::new();
        log.append(KernelEvent::exit("t".into(), 1, 0, 0, "init"))
            .unwrap();
        assert_eq!(log.len(), 1);
        assert!(log.path().is_none());
        log.finish().unwrap();
    }
}
