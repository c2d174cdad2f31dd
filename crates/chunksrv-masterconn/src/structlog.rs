use chunksrv_proto::StructureLogEntry;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Appends incoming `MATOCS_STRUCTURE_LOG` entries directly to
/// `changelog_csback.0.mfs`, the active changelog, and rotates on
/// `MATOCS_STRUCTURE_LOG_ROTATE`: every existing backup shifts up by one
/// index, whatever falls off the end of `back_logs` is dropped, and a
/// fresh `changelog_csback.0.mfs` is opened on the next append.
pub struct ChangelogSink {
    dir: PathBuf,
    back_logs: u32,
    active: Option<File>,
}

impl ChangelogSink {
    pub fn new(dir: impl Into<PathBuf>, back_logs: u32) -> Self {
        Self {
            dir: dir.into(),
            back_logs,
            active: None,
        }
    }

    fn path(&self, n: u32) -> PathBuf {
        self.dir.join(format!("changelog_csback.{n}.mfs"))
    }

    fn active_file(&mut self) -> io::Result<&mut File> {
        if self.active.is_none() {
            let file = OpenOptions::new().create(true).append(true).open(self.path(0))?;
            self.active = Some(file);
        }
        Ok(self.active.as_mut().unwrap())
    }

    /// Validates and appends one entry. Entries that fail
    /// [`StructureLogEntry::validate`] are rejected by the caller before
    /// this is reached (a protocol violation kills the connection instead
    /// of reaching the log).
    pub fn append(&mut self, entry: &StructureLogEntry) -> io::Result<()> {
        let file = self.active_file()?;
        write!(file, "{}: ", entry.version)?;
        file.write_all(&entry.text)?;
        file.write_all(b"\n")?;
        file.flush()
    }

    pub fn rotate(&mut self) -> io::Result<()> {
        self.active = None;
        if self.back_logs == 0 {
            let _ = fs::remove_file(self.path(0));
            return Ok(());
        }
        let oldest = self.path(self.back_logs - 1);
        let _ = fs::remove_file(&oldest);
        let mut n = self.back_logs - 1;
        while n > 0 {
            let from = self.path(n - 1);
            let to = self.path(n);
            if from.exists() {
                fs::rename(&from, &to)?;
            }
            n -= 1;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_creates_active_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sink = ChangelogSink::new(tmp.path(), 3);
        sink.append(&StructureLogEntry {
            version: 1,
            text: b"hello".to_vec(),
        })
        .unwrap();
        let content = fs::read_to_string(tmp.path().join("changelog_csback.0.mfs")).unwrap();
        assert!(content.contains("1: hello"));
    }

    #[test]
    fn rotate_shifts_backups_and_drops_oldest() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sink = ChangelogSink::new(tmp.path(), 2);

        sink.append(&StructureLogEntry {
            version: 1,
            text: b"first".to_vec(),
        })
        .unwrap();
        sink.rotate().unwrap();
        assert!(!tmp.path().join("changelog_csback.0.mfs").exists());
        let backup1 = fs::read_to_string(tmp.path().join("changelog_csback.1.mfs")).unwrap();
        assert!(backup1.contains("first"));

        sink.append(&StructureLogEntry {
            version: 2,
            text: b"second".to_vec(),
        })
        .unwrap();
        sink.rotate().unwrap();
        // back_logs=2 keeps only index 0 (fresh after rotate) and index 1;
        // "first" has aged out of the window entirely.
        let backup1 = fs::read_to_string(tmp.path().join("changelog_csback.1.mfs")).unwrap();
        assert!(backup1.contains("second"));
        assert!(!backup1.contains("first"));

        sink.append(&StructureLogEntry {
            version: 3,
            text: b"third".to_vec(),
        })
        .unwrap();
        let active = fs::read_to_string(tmp.path().join("changelog_csback.0.mfs")).unwrap();
        assert!(active.contains("third"));
    }
}
